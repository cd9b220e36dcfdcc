//! Scriptable in-memory command backend.
//!
//! [`MockBackend`] satisfies [`CommandBackend`] without any hardware
//! behind it: creations mint sequential handles, completions land
//! immediately unless held back, and individual commands can be made
//! to fail. The cache's own tests drive it, and it doubles as a
//! stand-in backend for trying the cache out of tree.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::backend::{CommandBackend, CreateCompletion, KeyHandle};
use crate::error::BackendError;

type PendingReply = oneshot::Sender<std::result::Result<KeyHandle, BackendError>>;

/// Consumes one token from an injection counter.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory [`CommandBackend`] with fault injection.
///
/// By default every asynchronous creation completes successfully
/// before the issuing call even returns. The knobs below change that:
///
/// * [`hold_completions`](Self::hold_completions) parks completions
///   until the test releases them one by one, simulating a slow
///   device.
/// * [`busy_next`](Self::busy_next) makes the next `n` creation
///   submissions fail synchronously with [`BackendError::Busy`].
/// * [`reject_next`](Self::reject_next) makes the next `n` creation
///   submissions fail synchronously with a command error.
/// * [`fail_async_next`](Self::fail_async_next) accepts the next `n`
///   submissions but completes them with a command error.
/// * [`fail_destroys`](Self::fail_destroys) makes every destroy
///   report a command error (the call is still counted).
#[derive(Debug)]
pub struct MockBackend {
    next_handle: AtomicU32,
    hold: AtomicBool,
    busy_next: AtomicUsize,
    reject_next: AtomicUsize,
    fail_async_next: AtomicUsize,
    destroy_fails: AtomicBool,
    held: Mutex<Vec<PendingReply>>,
    async_creates: AtomicUsize,
    sync_creates: AtomicUsize,
    destroys: AtomicUsize,
    destroyed_handles: Mutex<Vec<KeyHandle>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            // Handle 0 is reserved as conspicuously invalid.
            next_handle: AtomicU32::new(1),
            hold: AtomicBool::new(false),
            busy_next: AtomicUsize::new(0),
            reject_next: AtomicUsize::new(0),
            fail_async_next: AtomicUsize::new(0),
            destroy_fails: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            async_creates: AtomicUsize::new(0),
            sync_creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            destroyed_handles: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    /// Creates a backend that completes everything immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_handle(&self) -> KeyHandle {
        KeyHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    /// Parks all following asynchronous completions until released.
    pub fn hold_completions(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Stops parking new completions. Already held ones stay parked.
    pub fn release_holds(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    /// Completes the oldest held creation successfully. Returns `false`
    /// when nothing is held.
    pub fn complete_one(&self) -> bool {
        let Some(reply) = self.pop_held() else {
            return false;
        };
        let _ = reply.send(Ok(self.fresh_handle()));
        true
    }

    /// Completes every held creation successfully.
    pub fn complete_all(&self) {
        while self.complete_one() {}
    }

    /// Completes the oldest held creation with a command error.
    /// Returns `false` when nothing is held.
    pub fn fail_one(&self) -> bool {
        let Some(reply) = self.pop_held() else {
            return false;
        };
        let _ = reply.send(Err(BackendError::Command("injected failure".into())));
        true
    }

    /// Drops the oldest held creation without answering, so the
    /// waiting side observes a lost completion. Returns `false` when
    /// nothing is held.
    pub fn abandon_one(&self) -> bool {
        self.pop_held().is_some()
    }

    fn pop_held(&self) -> Option<PendingReply> {
        let mut held = self.held.lock();
        if held.is_empty() {
            None
        } else {
            Some(held.remove(0))
        }
    }

    /// Number of creations currently held back.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Fails the next `n` creation submissions with
    /// [`BackendError::Busy`].
    pub fn busy_next(&self, n: usize) {
        self.busy_next.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` creation submissions with a command error.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Accepts the next `n` asynchronous creations but completes them
    /// with a command error.
    pub fn fail_async_next(&self, n: usize) {
        self.fail_async_next.store(n, Ordering::SeqCst);
    }

    /// Makes destroys report a command error when `fail` is set.
    pub fn fail_destroys(&self, fail: bool) {
        self.destroy_fails.store(fail, Ordering::SeqCst);
    }

    /// Asynchronous creation submissions accepted so far.
    pub fn async_creates(&self) -> usize {
        self.async_creates.load(Ordering::SeqCst)
    }

    /// Blocking creations performed so far.
    pub fn sync_creates(&self) -> usize {
        self.sync_creates.load(Ordering::SeqCst)
    }

    /// Destroy calls observed so far, successful or not.
    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Handles passed to destroy so far, in call order.
    pub fn destroyed_handles(&self) -> Vec<KeyHandle> {
        self.destroyed_handles.lock().clone()
    }
}

#[async_trait]
impl CommandBackend for MockBackend {
    fn create_key_async(&self, _order: u8) -> std::result::Result<CreateCompletion, BackendError> {
        if take_one(&self.busy_next) {
            return Err(BackendError::Busy);
        }
        if take_one(&self.reject_next) {
            return Err(BackendError::Command("injected reject".into()));
        }
        self.async_creates.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if take_one(&self.fail_async_next) {
            let _ = tx.send(Err(BackendError::Command("injected failure".into())));
        } else if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push(tx);
        } else {
            let _ = tx.send(Ok(self.fresh_handle()));
        }
        Ok(rx)
    }

    async fn create_key_sync(&self, _order: u8) -> std::result::Result<KeyHandle, BackendError> {
        if take_one(&self.busy_next) {
            return Err(BackendError::Busy);
        }
        if take_one(&self.reject_next) {
            return Err(BackendError::Command("injected reject".into()));
        }
        self.sync_creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.fresh_handle())
    }

    async fn destroy_key(&self, handle: KeyHandle) -> std::result::Result<(), BackendError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.destroyed_handles.lock().push(handle);
        if self.destroy_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Command("injected destroy failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn completions_land_immediately_by_default() {
        let backend = MockBackend::new();
        let completion = backend.create_key_async(4).unwrap();
        let handle = completion.await.unwrap().unwrap();
        assert_eq!(handle, KeyHandle::new(1));
        assert_eq!(backend.async_creates(), 1);
    }

    #[tokio::test]
    async fn held_completions_wait_for_the_test() {
        let backend = MockBackend::new();
        backend.hold_completions();
        let mut completion = backend.create_key_async(4).unwrap();
        assert_eq!(backend.held_count(), 1);
        assert!(completion.try_recv().is_err());

        assert!(backend.complete_one());
        let handle = completion.await.unwrap().unwrap();
        assert_eq!(handle, KeyHandle::new(1));
    }

    #[tokio::test]
    async fn injected_busy_is_consumed_per_call() {
        let backend = MockBackend::new();
        backend.busy_next(1);
        assert!(matches!(
            backend.create_key_async(4),
            Err(BackendError::Busy)
        ));
        assert!(backend.create_key_async(4).is_ok());
        assert_eq!(backend.async_creates(), 1);
    }

    #[tokio::test]
    async fn abandoned_completions_surface_as_lost() {
        let backend = MockBackend::new();
        backend.hold_completions();
        let completion = backend.create_key_async(4).unwrap();
        assert!(backend.abandon_one());
        assert!(completion.await.is_err());
    }

    #[tokio::test]
    async fn destroys_are_recorded_in_order() {
        let backend = MockBackend::new();
        backend.destroy_key(KeyHandle::new(3)).await.unwrap();
        backend.destroy_key(KeyHandle::new(5)).await.unwrap();
        assert_eq!(
            backend.destroyed_handles(),
            vec![KeyHandle::new(3), KeyHandle::new(5)]
        );
        assert_eq!(backend.destroys(), 2);

        backend.fail_destroys(true);
        assert!(backend.destroy_key(KeyHandle::new(7)).await.is_err());
        assert_eq!(backend.destroys(), 3);
    }
}
