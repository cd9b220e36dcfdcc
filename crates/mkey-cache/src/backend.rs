//! Hardware command backend interface
//!
//! The cache never talks to the adapter directly. Key creation and
//! destruction go through [`CommandBackend`], which hides the firmware
//! command machinery. Asynchronous creation hands back a
//! [`CreateCompletion`] that resolves once the device answers; the call
//! itself must not block, so it can be issued from the scheduler's
//! non-blocking dispatch path.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::BackendError;

/// Opaque hardware handle identifying one memory-registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHandle(u32);

impl KeyHandle {
    /// Wraps a raw handle value reported by the device.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value as programmed into work requests.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Deferred result of an asynchronous create command.
///
/// Resolves to the new handle, or to the backend's failure. A dropped
/// sender surfaces as [`BackendError::CompletionLost`].
pub type CreateCompletion = oneshot::Receiver<Result<KeyHandle, BackendError>>;

/// Command interface of the adapter, as consumed by the cache.
///
/// `create_key_async` is deliberately synchronous at the call site: it
/// either queues the command and returns a completion, or rejects
/// immediately ([`BackendError::Busy`] when the command queue is full).
/// The blocking variants are reserved for administrative slow paths.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Queues an asynchronous create for one key of the given order.
    fn create_key_async(&self, order: u8) -> Result<CreateCompletion, BackendError>;

    /// Creates one key of the given order, waiting for the device.
    async fn create_key_sync(&self, order: u8) -> Result<KeyHandle, BackendError>;

    /// Destroys a key, waiting for the device.
    async fn destroy_key(&self, handle: KeyHandle) -> Result<(), BackendError>;
}
