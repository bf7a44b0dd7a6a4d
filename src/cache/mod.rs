//! Named caches of HTTP responses and the network-first layer on top.
//!
//! This module provides:
//! - Versioned named caches keyed by request method + URL
//! - Atomic bulk population for install-time precaching
//! - Network-first fetching with offline mode (serve cache when network unavailable)

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
pub use traits::{CacheResult, CacheSource, RequestKey};
