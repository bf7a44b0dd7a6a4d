use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::RequestKey;

/// How the controlled page issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Script, style, image, fetch/XHR and everything else
  #[default]
  SubResource,
}

/// An intercepted request
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// A GET for a sub-resource.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::SubResource,
      headers: Vec::new(),
    }
  }

  /// A GET issued by a page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_uppercase();
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Identity of this request inside a named cache.
  pub fn cache_key(&self) -> RequestKey {
    RequestKey::new(&self.method, self.url.as_str())
  }
}

/// Snapshot of an HTTP response: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, status_text: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: status_text.to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Response served when the network is down and nothing is cached.
  pub fn service_unavailable() -> Self {
    Self::new(
      503,
      "Service Unavailable",
      "Offline - resource not available",
    )
    .with_header("Content-Type", "text/plain")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// First value of a header, matched case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// 2xx status.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether a network response may be written into the cache.
  ///
  /// Only plain 200s are stored. With `respect_no_store`, responses marked
  /// `Cache-Control: no-store`/`private` or `Vary: *` are skipped as well.
  pub fn is_storable(&self, respect_no_store: bool) -> bool {
    if self.status != 200 {
      return false;
    }
    if !respect_no_store {
      return true;
    }

    let cache_control = self.header("Cache-Control").unwrap_or_default();
    let forbidden = cache_control.split(',').map(str::trim).any(|directive| {
      directive.eq_ignore_ascii_case("no-store") || directive.eq_ignore_ascii_case("private")
    });

    !forbidden && self.header("Vary").map(str::trim) != Some("*")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_service_unavailable_is_plain_text() {
    let response = Response::service_unavailable();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert!(!response.body.is_empty());
  }

  #[test]
  fn test_only_200_is_storable() {
    assert!(Response::new(200, "OK", "x").is_storable(true));
    assert!(!Response::new(204, "No Content", "").is_storable(true));
    assert!(!Response::new(404, "Not Found", "").is_storable(false));
  }

  #[test]
  fn test_no_store_is_respected() {
    let response = Response::new(200, "OK", "x").with_header("Cache-Control", "max-age=0, no-store");
    assert!(!response.is_storable(true));
    assert!(response.is_storable(false));

    let private = Response::new(200, "OK", "x").with_header("cache-control", "Private");
    assert!(!private.is_storable(true));

    let vary = Response::new(200, "OK", "x").with_header("Vary", "*");
    assert!(!vary.is_storable(true));
  }

  #[test]
  fn test_method_is_normalized() {
    let url = Url::parse("http://localhost:8000/").unwrap();
    let request = Request::get(url).with_method("post");
    assert_eq!(request.method, "POST");
    assert!(!request.is_get());
  }
}
