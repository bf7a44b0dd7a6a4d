//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Identity of a request inside a named cache: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_uppercase(),
      url: url.to_string(),
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Result of a cache-backed fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Live data straight from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Network unavailable, serving the cached entry for the same request.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable, serving the cached offline document instead.
  pub fn offline_document(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::OfflineDocument,
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable and nothing cached; data was made up locally.
  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Offline mode - cached entry for the request
  Offline,
  /// Offline mode - navigation answered with the offline page
  OfflineDocument,
  /// Offline mode - generated 503
  Synthetic,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Offline => "cache",
      Self::OfflineDocument => "offline-document",
      Self::Synthetic => "synthetic",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_hash_depends_on_method_and_url() {
    let get = RequestKey::new("get", "http://localhost:8000/");
    let same = RequestKey::new("GET", "http://localhost:8000/");
    let head = RequestKey::new("HEAD", "http://localhost:8000/");
    let other = RequestKey::new("GET", "http://localhost:8000/offline/");

    assert_eq!(get, same);
    assert_eq!(get.cache_hash(), same.cache_hash());
    assert_ne!(get.cache_hash(), head.cache_hash());
    assert_ne!(get.cache_hash(), other.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }
}
