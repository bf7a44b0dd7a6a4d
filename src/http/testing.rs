//! Scripted network for tests.

use async_trait::async_trait;
use color_eyre::{eyre::bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{Fetch, Request, Response};

/// Answers from a fixed route table. Unknown URLs and requests made while
/// offline fail the way an unreachable host would.
pub struct ScriptedFetch {
  routes: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl ScriptedFetch {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn route(self, url: &str, response: Response) -> Self {
    self.set_route(url, response);
    self
  }

  pub fn set_route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn remove_route(&self, url: &str) {
    self.routes.lock().unwrap().remove(url);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// `METHOD url` of every request seen, in order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Fetch for ScriptedFetch {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self
      .calls
      .lock()
      .unwrap()
      .push(format!("{} {}", request.method, request.url));

    if !self.online.load(Ordering::SeqCst) {
      bail!("network unreachable");
    }

    match self.routes.lock().unwrap().get(request.url.as_str()) {
      Some(response) => Ok(response.clone()),
      None => bail!("connection refused: {}", request.url),
    }
  }
}
