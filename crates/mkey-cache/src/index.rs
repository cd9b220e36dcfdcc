//! Global handle index
//!
//! Maps every live hardware handle to the size class it was created
//! for, so collaborators holding only a raw handle (the registration
//! slow path, teardown diagnostics) can resolve it. The index is
//! populated exclusively by the creation completion path and pruned by
//! the destroy paths; a conflicting insert means the device handed out
//! a handle that is already live, which the cache treats as fatal for
//! that key.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use crate::backend::KeyHandle;

/// Metadata tracked per live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    /// Size class the handle was created for.
    pub order: u8,
}

/// Insert rejection: the handle is already present.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Handle {0} already indexed")]
pub struct HandleConflict(pub KeyHandle);

/// Concurrent handle-to-key lookup table.
#[derive(Debug, Default)]
pub struct KeyIndex {
    keys: DashMap<KeyHandle, KeyInfo>,
}

impl KeyIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle, rejecting duplicates.
    pub fn insert(&self, handle: KeyHandle, info: KeyInfo) -> Result<(), HandleConflict> {
        match self.keys.entry(handle) {
            Entry::Occupied(_) => Err(HandleConflict(handle)),
            Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    /// Removes a handle, returning its metadata if it was present.
    pub fn remove(&self, handle: KeyHandle) -> Option<KeyInfo> {
        self.keys.remove(&handle).map(|(_, info)| info)
    }

    /// Looks up the metadata for a handle.
    pub fn lookup(&self, handle: KeyHandle) -> Option<KeyInfo> {
        self.keys.get(&handle).map(|entry| *entry.value())
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no handles are tracked.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u32) -> KeyHandle {
        KeyHandle::new(raw)
    }

    #[test]
    fn insert_then_lookup() {
        let index = KeyIndex::new();
        index
            .insert(handle(1), KeyInfo { order: 4 })
            .expect("First insert should succeed");

        assert_eq!(index.lookup(handle(1)), Some(KeyInfo { order: 4 }));
        assert_eq!(index.lookup(handle(2)), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let index = KeyIndex::new();
        index
            .insert(handle(7), KeyInfo { order: 2 })
            .expect("First insert should succeed");

        let err = index
            .insert(handle(7), KeyInfo { order: 3 })
            .expect_err("Second insert should conflict");
        assert_eq!(err, HandleConflict(handle(7)));

        // The original mapping survives the rejected insert.
        assert_eq!(index.lookup(handle(7)), Some(KeyInfo { order: 2 }));
    }

    #[test]
    fn remove_frees_the_slot() {
        let index = KeyIndex::new();
        index
            .insert(handle(9), KeyInfo { order: 5 })
            .expect("First insert should succeed");

        assert_eq!(index.remove(handle(9)), Some(KeyInfo { order: 5 }));
        assert_eq!(index.remove(handle(9)), None);
        assert!(index.is_empty());

        index
            .insert(handle(9), KeyInfo { order: 6 })
            .expect("Reinsert after remove should succeed");
    }
}
