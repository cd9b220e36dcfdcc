//! Size-classed cache of pre-created memory-registration keys for RDMA adapters
//!
//! Creating a registration key is a firmware round-trip measured in
//! microseconds to milliseconds, far too slow for a data-path that
//! registers memory per I/O. This crate keeps pools of ready-made keys,
//! one pool per power-of-two size class, and refills them in the
//! background so consumers only ever pop a pooled key.
//!
//! # Features
//!
//! - **Non-blocking hot path**: [`KeyCache::get`] pops a pooled key or
//!   returns `None`; it never issues a device command
//! - **Background replenishment**: per-class worker tasks fill each
//!   pool to twice its configured limit using asynchronous creation
//!   commands
//! - **Hysteresis trim**: surplus keys are destroyed only once a pool
//!   exceeds twice its limit, and only after a configurable release
//!   window of inactivity
//! - **Bounded in-flight work**: at most a fixed number of creation
//!   commands per class are outstanding at once
//! - **Failure backoff**: a rejected creation pauses all filling for a
//!   cooldown period instead of hammering a sick device
//! - **Runtime tuning**: per-class limits, exact pool sizes, the
//!   release window, and immediate trimming are all adjustable on a
//!   live cache
//! - **Observability**: [`KeyCache::stats`] snapshots every pool's
//!   watermarks plus lifetime counters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │             Consumers               │  get() / put(): pool pop
//! └──────────────────┬──────────────────┘  and push only
//!                    │
//! ┌──────────────────┴──────────────────┐
//! │              KeyCache               │
//! │  ┌─────────┐ ┌─────────┐            │  one entry per size class:
//! │  │ order n │ │order n+1│   ...      │  free list, cur / limit,
//! │  └────┬────┘ └────┬────┘            │  pending, miss counter
//! └───────┼───────────┼─────────────────┘
//!         │ worker    │ worker             one dispatch round per
//! ┌───────┴───────────┴─────────────────┐  entry at a time
//! │           CommandBackend            │
//! │  async create / sync create /       │
//! │  destroy                            │
//! └─────────────────────────────────────┘
//! ```
//!
//! Each worker sleeps on its entry's doorbell. Checkout misses,
//! releases past the high-water mark, completed creations, and
//! administrative changes all ring it; the worker then issues
//! creations, trims surplus, or arms a deferred-trim deadline.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use mkey_cache::test_utils::MockBackend;
//! use mkey_cache::{CacheConfig, KeyCache};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Two size classes at orders 12 and 13, eight keys each at steady
//! // state (so sixteen pooled per class once filled).
//! let config = CacheConfig::new()
//!     .with_min_order(12)
//!     .with_uniform_limit(8, 2);
//!
//! let backend = Arc::new(MockBackend::new());
//! let cache = KeyCache::new(backend, config)?;
//!
//! // The hot path never waits for the device.
//! if let Some(key) = cache.get(12) {
//!     // ... program key.handle() into a work request ...
//!     cache.put(key).await;
//! }
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
mod entry;
pub mod error;
pub mod index;
pub mod key;
pub mod stats;
pub mod test_utils;

pub use backend::{CommandBackend, CreateCompletion, KeyHandle};
pub use cache::KeyCache;
pub use config::CacheConfig;
pub use error::{BackendError, CacheError, Result};
pub use index::{KeyIndex, KeyInfo};
pub use key::CachedKey;
pub use stats::{CacheStats, EntryStats};

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits

    pub use crate::{
        backend::{CommandBackend, CreateCompletion, KeyHandle},
        cache::KeyCache,
        config::CacheConfig,
        error::{BackendError, CacheError, Result},
        index::{KeyIndex, KeyInfo},
        key::CachedKey,
        stats::{CacheStats, EntryStats},
    };
}
