//! Pooled key value

use crate::backend::KeyHandle;

/// One cached memory-registration key.
///
/// A key lives in exactly one place at a time: an entry's free list, a
/// consumer that checked it out, or a destroy path. Move semantics
/// enforce that; the cache constructs keys and consumers hand them back
/// by value.
#[derive(Debug)]
pub struct CachedKey {
    handle: KeyHandle,
    order: u8,
}

impl CachedKey {
    pub(crate) const fn new(handle: KeyHandle, order: u8) -> Self {
        Self { handle, order }
    }

    /// Hardware handle backing this key.
    pub const fn handle(&self) -> KeyHandle {
        self.handle
    }

    /// Size class the key was created for.
    pub const fn order(&self) -> u8 {
        self.order
    }
}
