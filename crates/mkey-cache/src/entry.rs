//! Per-size-class pool entry
//!
//! All entry state lives behind one `parking_lot` mutex held only for
//! O(1) list and counter updates, so checkout and release stay cheap on
//! latency-sensitive callers. `cur` counts every key the entry owns,
//! idle or checked out; it only moves on creation and destruction.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::key::CachedKey;
use crate::stats::EntryStats;

#[derive(Debug)]
pub(crate) struct EntryState {
    /// Idle keys, most recently released last (LIFO).
    pub free: Vec<CachedKey>,
    /// Keys owned by this entry (idle + checked out).
    pub cur: u32,
    /// Low-water mark; 0 disables background filling.
    pub limit: u32,
    /// Creations in flight against the backend.
    pub pending: u32,
    /// Checkout misses since the last reset.
    pub miss: u64,
}

/// One size-class entry plus its scheduler doorbell.
///
/// The `Notify` permit coalesces immediate work requests the way a
/// pending-work bit would: kicking an entry whose dispatch is already
/// queued is a no-op.
#[derive(Debug)]
pub(crate) struct ClassEntry {
    pub order: u8,
    state: Mutex<EntryState>,
    wakeup: Arc<Notify>,
}

impl ClassEntry {
    pub fn new(order: u8, limit: u32) -> Self {
        Self {
            order,
            state: Mutex::new(EntryState {
                free: Vec::new(),
                cur: 0,
                limit,
                pending: 0,
                miss: 0,
            }),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    /// Doorbell shared with this entry's worker task.
    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Requests an immediate dispatch for this entry.
    pub fn kick(&self) {
        self.wakeup.notify_one();
    }

    /// Pops an idle key; counts a miss when the list is empty.
    ///
    /// The key stays counted in `cur` while checked out.
    pub fn checkout(&self) -> Option<CachedKey> {
        let mut state = self.lock();
        match state.free.pop() {
            Some(key) => Some(key),
            None => {
                state.miss += 1;
                None
            }
        }
    }

    /// Returns a key to the free list.
    ///
    /// Reports whether the entry now sits above its high-water mark,
    /// in which case the caller schedules a trim.
    pub fn release(&self, key: CachedKey) -> bool {
        let mut state = self.lock();
        state.free.push(key);
        state.cur > 2 * state.limit
    }

    /// Removes one idle key from the entry's ownership for destruction.
    pub fn take_idle(&self) -> Option<CachedKey> {
        let mut state = self.lock();
        let key = state.free.pop()?;
        state.cur -= 1;
        Some(key)
    }

    pub fn watermarks(&self) -> (u32, u32) {
        let state = self.lock();
        (state.cur, state.limit)
    }

    /// `(cur, pending, limit)` in one lock acquisition.
    pub fn fill_state(&self) -> (u32, u32, u32) {
        let state = self.lock();
        (state.cur, state.pending, state.limit)
    }

    pub fn stats(&self) -> EntryStats {
        let state = self.lock();
        EntryStats {
            order: self.order,
            limit: state.limit,
            cur: state.cur,
            idle: state.free.len() as u32,
            pending: state.pending,
            miss: state.miss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyHandle;

    fn key(raw: u32, order: u8) -> CachedKey {
        CachedKey::new(KeyHandle::new(raw), order)
    }

    fn entry_with_keys(order: u8, limit: u32, handles: &[u32]) -> ClassEntry {
        let entry = ClassEntry::new(order, limit);
        {
            let mut state = entry.lock();
            for &raw in handles {
                state.free.push(key(raw, order));
                state.cur += 1;
            }
        }
        entry
    }

    #[test]
    fn checkout_is_lifo_and_keeps_cur() {
        let entry = entry_with_keys(4, 2, &[1, 2, 3]);

        let first = entry.checkout().expect("Key should be available");
        assert_eq!(first.handle(), KeyHandle::new(3));

        let state = entry.lock();
        assert_eq!(state.cur, 3, "Checked-out keys stay counted in cur");
        assert_eq!(state.free.len(), 2);
        assert_eq!(state.miss, 0);
    }

    #[test]
    fn empty_checkout_counts_a_miss() {
        let entry = ClassEntry::new(4, 2);
        assert!(entry.checkout().is_none());
        assert!(entry.checkout().is_none());
        assert_eq!(entry.lock().miss, 2);
    }

    #[test]
    fn release_reports_high_water_crossing() {
        // At cur == 2*limit the comparison is strictly greater: no trim.
        let entry = entry_with_keys(4, 1, &[1, 2]);
        let held = entry.checkout().expect("Key should be available");
        assert!(!entry.release(held));

        // One key beyond the high-water mark requests a trim.
        let entry = entry_with_keys(4, 1, &[1, 2, 3]);
        let held = entry.checkout().expect("Key should be available");
        assert!(entry.release(held));
    }

    #[test]
    fn take_idle_decrements_cur() {
        let entry = entry_with_keys(4, 1, &[1, 2]);

        let taken = entry.take_idle().expect("Idle key should be available");
        assert_eq!(taken.handle(), KeyHandle::new(2));
        assert_eq!(entry.lock().cur, 1);

        entry.take_idle().expect("Second idle key should be available");
        assert!(entry.take_idle().is_none());
        assert_eq!(entry.lock().cur, 0);
    }

    #[test]
    fn stats_snapshot_matches_state() {
        let entry = entry_with_keys(6, 4, &[1, 2, 3]);
        {
            let mut state = entry.lock();
            state.pending = 2;
            state.miss = 5;
        }

        let stats = entry.stats();
        assert_eq!(stats.order, 6);
        assert_eq!(stats.limit, 4);
        assert_eq!(stats.cur, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.miss, 5);
    }
}
