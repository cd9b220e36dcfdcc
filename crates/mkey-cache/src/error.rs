//! Error types for the key cache

use thiserror::Error;

use crate::backend::KeyHandle;

/// Errors reported by the hardware command backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The command interface cannot accept another request right now.
    #[error("Command interface busy")]
    Busy,

    /// The device rejected or failed the command.
    #[error("Command failed: {0}")]
    Command(String),

    /// The completion channel was dropped before the command resolved.
    #[error("Completion dropped before the command resolved")]
    CompletionLost,
}

impl BackendError {
    /// Whether this is a transient busy rejection worth a short retry.
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Errors returned by the administrative cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The supplied configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The requested order is outside the cached range.
    #[error("Order {0} is not cached")]
    UnknownOrder(u8),

    /// The cache has been stopped.
    #[error("Cache is stopped")]
    Stopped,

    /// A handle was offered that the index already tracks.
    #[error("Handle {0} is already indexed")]
    DuplicateHandle(KeyHandle),

    /// Pool resize below the entry's low-water mark.
    #[error("Size {new_size} is below the limit {limit} for order {order}")]
    SizeBelowLimit {
        /// Order being resized.
        order: u8,
        /// Requested pool size.
        new_size: u32,
        /// Current low-water mark.
        limit: u32,
    },

    /// Not enough idle keys to shrink the pool to the requested size.
    #[error("{missing} key(s) of order {order} still checked out")]
    KeysBusy {
        /// Order being resized.
        order: u8,
        /// Keys that could not be destroyed.
        missing: u32,
    },

    /// A grow operation ran out of time.
    #[error("Grow for order {order} timed out after {elapsed_ms} ms")]
    GrowTimeout {
        /// Order being grown.
        order: u8,
        /// Time spent before giving up.
        elapsed_ms: u64,
    },

    /// The backend failed a command issued on an administrative path.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Release timeout outside the supported range.
    #[error("Release timeout {0} outside -1..=600 seconds")]
    ReleaseTimeoutRange(i64),

    /// Limit above the supported maximum.
    #[error("Limit {0} is above the supported maximum")]
    LimitRange(u32),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_detected() {
        assert!(BackendError::Busy.is_busy());
        assert!(!BackendError::Command("access denied".to_string()).is_busy());
        assert!(!BackendError::CompletionLost.is_busy());
    }

    #[test]
    fn display_formats() {
        let err = CacheError::SizeBelowLimit {
            order: 5,
            new_size: 3,
            limit: 8,
        };
        assert_eq!(err.to_string(), "Size 3 is below the limit 8 for order 5");

        let err = CacheError::UnknownOrder(42);
        assert_eq!(err.to_string(), "Order 42 is not cached");

        let err = CacheError::Backend(BackendError::Busy);
        assert_eq!(err.to_string(), "Command interface busy");
    }
}
