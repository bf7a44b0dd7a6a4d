//! The offline cache controller: worker lifecycle, registration and
//! fetch interception.

mod controller;
mod message;
mod registration;
mod state;

pub use controller::{ControllerStatus, FetchOutcome, OfflineCacheController, RegisterOutcome};
pub use message::ControlMessage;
pub use registration::{Registration, RegistrationStore};
pub use state::{Worker, WorkerState};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Assets precached by default, same-origin and CDN.
const DEFAULT_STATIC_ASSETS: &[&str] = &[
  "/",
  "/static/css/custom.css",
  "/static/js/sidebar.js",
  "/static/manifest.json",
  "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css",
  "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/js/bootstrap.bundle.min.js",
  "https://cdn.jsdelivr.net/npm/bootstrap-icons@1.11.2/font/bootstrap-icons.css",
];

/// Everything that identifies one version of the worker.
///
/// Two definitions with the same `version` are the same worker; the version
/// doubles as the name of the cache the worker owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerDefinition {
  /// Version tag, also the name of the current cache
  pub version: String,
  /// Page served to failed navigations with no cached entry
  pub offline_url: String,
  /// Path prefixes never intercepted (admin backend)
  pub excluded_prefixes: Vec<String>,
  /// URLs that must be cached before the worker counts as installed
  pub static_assets: Vec<String>,
}

impl Default for WorkerDefinition {
  fn default() -> Self {
    Self {
      version: "gestto-v1".to_string(),
      offline_url: "/offline/".to_string(),
      excluded_prefixes: vec!["/admin/".to_string()],
      static_assets: DEFAULT_STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
    }
  }
}

impl WorkerDefinition {
  pub fn cache_name(&self) -> &str {
    &self.version
  }

  /// Whether requests to `url` bypass the controller entirely.
  pub fn is_excluded(&self, url: &Url) -> bool {
    self
      .excluded_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()))
  }

  /// Absolute URL of the offline document.
  pub fn offline_document(&self, origin: &Url) -> Result<Url> {
    resolve(origin, &self.offline_url)
  }

  /// Static assets plus the offline document, resolved against `origin`,
  /// in list order and without duplicates.
  pub fn precache_urls(&self, origin: &Url) -> Result<Vec<Url>> {
    let mut urls: Vec<Url> = Vec::with_capacity(self.static_assets.len() + 1);
    let assets = self
      .static_assets
      .iter()
      .chain(std::iter::once(&self.offline_url));

    for asset in assets {
      let url = resolve(origin, asset)?;
      if !urls.contains(&url) {
        urls.push(url);
      }
    }

    Ok(urls)
  }
}

/// Resolve a possibly relative URL against the origin.
pub fn resolve(origin: &Url, input: &str) -> Result<Url> {
  origin
    .join(input)
    .map_err(|e| eyre!("Invalid URL {}: {}", input, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("http://localhost:8000").unwrap()
  }

  #[test]
  fn test_admin_paths_are_excluded() {
    let definition = WorkerDefinition::default();
    let admin = resolve(&origin(), "/admin/login/").unwrap();
    let home = resolve(&origin(), "/").unwrap();
    let lookalike = resolve(&origin(), "/administration/").unwrap();

    assert!(definition.is_excluded(&admin));
    assert!(!definition.is_excluded(&home));
    assert!(!definition.is_excluded(&lookalike));
  }

  #[test]
  fn test_precache_urls_include_offline_document() {
    let definition = WorkerDefinition::default();
    let urls = definition.precache_urls(&origin()).unwrap();

    assert_eq!(urls.len(), DEFAULT_STATIC_ASSETS.len() + 1);
    assert_eq!(urls[0].as_str(), "http://localhost:8000/");
    assert_eq!(urls.last().unwrap().as_str(), "http://localhost:8000/offline/");
    assert!(urls
      .iter()
      .any(|u| u.host_str() == Some("cdn.jsdelivr.net")));
  }

  #[test]
  fn test_precache_urls_are_deduplicated() {
    let definition = WorkerDefinition {
      static_assets: vec!["/".into(), "/offline/".into(), "/".into()],
      ..WorkerDefinition::default()
    };
    let urls = definition.precache_urls(&origin()).unwrap();
    assert_eq!(urls.len(), 2);
  }
}
