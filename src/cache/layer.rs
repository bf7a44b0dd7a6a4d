//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::{CacheResult, RequestKey};
use crate::http::Response;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the controller and the network client,
/// providing network-first caching with offline support.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// Skip `no-store`/`private`/`Vary: *` responses when writing
  respect_no_store: bool,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      respect_no_store: true,
    }
  }

  pub fn with_respect_no_store(mut self, respect_no_store: bool) -> Self {
    self.respect_no_store = respect_no_store;
    self
  }

  /// Fetch with a network-first strategy.
  ///
  /// 1. Try the network
  /// 2. On a storable response, write a copy into `cache_name` (if it still
  ///    exists) and return it
  /// 3. On network failure, return the cached entry for `key` (offline mode)
  ///
  /// Returns `None` only when the network failed and nothing is cached.
  /// Cache errors never fail the call: a failed write still returns the
  /// network response, a failed read counts as a miss.
  pub async fn network_first<F, Fut>(
    &self,
    cache_name: &str,
    key: &RequestKey,
    fetcher: F,
  ) -> Option<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.is_storable(self.respect_no_store) {
          match self.storage.put(cache_name, key, &response) {
            Ok(true) => {}
            Ok(false) => debug!(cache = cache_name, %key, "Cache is gone, response not stored"),
            Err(e) => warn!(cache = cache_name, %key, "Failed to cache response: {}", e),
          }
        } else {
          debug!(%key, status = response.status, "Response not cacheable");
        }
        Some(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(%key, "Network request failed, falling back to cache: {}", e);
        self
          .lookup(cache_name, key)
          .map(|cached| CacheResult::offline(cached.response, cached.cached_at))
      }
    }
  }

  /// Read an entry, treating storage errors as a miss.
  pub fn lookup(&self, cache_name: &str, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.match_request(cache_name, key) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(cache = cache_name, %key, "Cache lookup failed: {}", e);
        None
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      respect_no_store: self.respect_no_store,
    }
  }
}
