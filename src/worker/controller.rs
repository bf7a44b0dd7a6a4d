//! Offline cache controller.
//!
//! Owns the registration for one scope and answers the four lifecycle
//! events: install, activate, fetch and message.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use color_eyre::{
  eyre::{bail, eyre},
  Result,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use super::message::ControlMessage;
use super::registration::{Registration, RegistrationStore};
use super::state::{Worker, WorkerState};
use super::WorkerDefinition;
use crate::cache::{CacheLayer, CacheResult, CacheStorage, RequestKey};
use crate::http::{Fetch, Request, Response};

/// What the controller did with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not handled; the host performs its default network request
  Passthrough,
  /// Answered by the controller
  Respond(CacheResult<Response>),
}

/// Result of an update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
  /// The active worker already has this version
  UpToDate,
  /// This version is already installed and waiting
  AlreadyWaiting,
  /// Installed; waiting for clients to close or for SKIP_WAITING
  Waiting,
  /// Installed and activated straight away
  Activated,
}

/// Snapshot of the registration for reporting.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
  pub scope: String,
  pub active: Option<String>,
  pub waiting: Option<String>,
  pub installing: Option<String>,
  pub controller: Option<String>,
  pub clients: usize,
  /// Every named cache and its entry count, in creation order
  pub caches: Vec<(String, usize)>,
}

#[derive(Default)]
struct ControllerState {
  installing: Option<Worker>,
  waiting: Option<Worker>,
  active: Option<Worker>,
  controller: Option<String>,
  clients: BTreeSet<String>,
}

impl ControllerState {
  fn restore(registration: Registration) -> Self {
    Self {
      installing: None,
      waiting: registration
        .waiting
        .map(|d| Worker::restored(d, WorkerState::Installed)),
      active: registration
        .active
        .map(|d| Worker::restored(d, WorkerState::Activated)),
      controller: registration.controller,
      clients: BTreeSet::new(),
    }
  }

  fn registration(&self) -> Registration {
    Registration {
      active: self.active.as_ref().map(|w| w.definition.clone()),
      waiting: self.waiting.as_ref().map(|w| w.definition.clone()),
      controller: self.controller.clone(),
    }
  }
}

/// Network-first cache controller for one scope.
pub struct OfflineCacheController<S, F>
where
  S: CacheStorage + RegistrationStore,
  F: Fetch,
{
  storage: Arc<S>,
  network: Arc<F>,
  layer: CacheLayer<S>,
  origin: Url,
  scope: String,
  state: Mutex<ControllerState>,
  controller_tx: watch::Sender<Option<String>>,
}

impl<S, F> OfflineCacheController<S, F>
where
  S: CacheStorage + RegistrationStore,
  F: Fetch,
{
  /// Create a controller, restoring any saved registration for `scope`.
  pub fn new(storage: Arc<S>, network: Arc<F>, origin: Url, scope: &str) -> Result<Self> {
    let registration = storage.load_registration(scope)?.unwrap_or_default();
    let (controller_tx, _) = watch::channel(registration.controller.clone());

    if let Some(active) = &registration.active {
      debug!(scope, version = %active.version, "Restored registration");
    }

    Ok(Self {
      layer: CacheLayer::new(Arc::clone(&storage)),
      storage,
      network,
      origin,
      scope: scope.to_string(),
      state: Mutex::new(ControllerState::restore(registration)),
      controller_tx,
    })
  }

  /// Whether to skip `no-store`/`private` responses when caching.
  pub fn with_respect_no_store(mut self, respect_no_store: bool) -> Self {
    self.layer = self.layer.with_respect_no_store(respect_no_store);
    self
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  fn lock(&self) -> Result<MutexGuard<'_, ControllerState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn persist(&self, state: &ControllerState) -> Result<()> {
    self
      .storage
      .save_registration(&self.scope, &state.registration())
  }

  /// Version currently controlling clients.
  pub fn controller_version(&self) -> Option<String> {
    self.controller_tx.borrow().clone()
  }

  /// Notified every time a new worker claims the clients.
  pub fn controller_changes(&self) -> watch::Receiver<Option<String>> {
    self.controller_tx.subscribe()
  }

  /// Install `definition` unless it is already active or waiting, then
  /// activate it if nothing is holding it back.
  ///
  /// With no active worker, or no attached clients, the new worker
  /// activates immediately. Otherwise it stays waiting.
  pub async fn register(&self, definition: WorkerDefinition) -> Result<RegisterOutcome> {
    {
      let state = self.lock()?;
      if state.active.as_ref().map(Worker::version) == Some(definition.version.as_str()) {
        debug!(version = %definition.version, "Worker is up to date");
        return Ok(RegisterOutcome::UpToDate);
      }
      if state.waiting.as_ref().map(Worker::version) == Some(definition.version.as_str()) {
        return Ok(RegisterOutcome::AlreadyWaiting);
      }
    }

    self.install(definition).await?;

    let activate_now = {
      let state = self.lock()?;
      state.active.is_none() || state.clients.is_empty()
    };

    if activate_now {
      self.activate()?;
      Ok(RegisterOutcome::Activated)
    } else {
      info!("New worker installed and waiting for clients to close");
      Ok(RegisterOutcome::Waiting)
    }
  }

  /// Install transition: precache every static asset into the cache named
  /// after the version, all or nothing.
  ///
  /// On success the worker becomes the waiting worker (replacing any older
  /// waiting one). On failure it is discarded and the active worker is left
  /// untouched.
  pub async fn install(&self, definition: WorkerDefinition) -> Result<()> {
    {
      let mut state = self.lock()?;
      if let Some(installing) = &state.installing {
        bail!(
          "Worker {} is already installing",
          installing.definition.version
        );
      }
      let mut worker = Worker::new(definition.clone());
      worker.transition(WorkerState::Installing)?;
      state.installing = Some(worker);
    }

    info!(version = %definition.version, "Installing worker");
    let result = self.precache(&definition).await;

    let mut state = self.lock()?;
    let mut worker = state
      .installing
      .take()
      .ok_or_else(|| eyre!("Installing worker disappeared"))?;

    if let Err(e) = result {
      worker.transition(WorkerState::Redundant)?;
      error!(version = %definition.version, "Install failed: {}", e);
      return Err(e);
    }

    worker.transition(WorkerState::Installed)?;
    if let Some(mut replaced) = state.waiting.replace(worker) {
      replaced.transition(WorkerState::Redundant)?;
      info!(version = %replaced.version(), "Discarded older waiting worker");
    }
    self.persist(&state)?;

    info!(version = %definition.version, "Worker installed");
    Ok(())
  }

  async fn precache(&self, definition: &WorkerDefinition) -> Result<()> {
    let cache_name = definition.cache_name();
    let created = self.storage.open_cache(cache_name)?;

    let result = match self.fetch_assets(definition).await {
      Ok(entries) => self.storage.put_all(cache_name, &entries),
      Err(e) => Err(e),
    };

    if result.is_err() && created {
      if let Err(e) = self.storage.delete_cache(cache_name) {
        warn!(cache = cache_name, "Failed to discard partial cache: {}", e);
      }
    }

    result
  }

  async fn fetch_assets(&self, definition: &WorkerDefinition) -> Result<Vec<(RequestKey, Response)>> {
    let urls = definition.precache_urls(&self.origin)?;
    let fetches = urls.into_iter().map(|url| self.fetch_asset(url));
    futures::future::try_join_all(fetches).await
  }

  async fn fetch_asset(&self, url: Url) -> Result<(RequestKey, Response)> {
    let request = Request::get(url);
    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;

    if !response.ok() {
      bail!(
        "Failed to precache {}: server returned {}",
        request.url,
        response.status
      );
    }

    debug!(url = %request.url, "Precached");
    Ok((request.cache_key(), response))
  }

  /// Activate transition: promote the waiting worker, delete every cache
  /// not named after it, and claim all clients.
  pub fn activate(&self) -> Result<()> {
    let mut state = self.lock()?;
    let mut worker = state
      .waiting
      .take()
      .ok_or_else(|| eyre!("No waiting worker to activate"))?;

    worker.transition(WorkerState::Activating)?;
    info!(version = %worker.version(), "Activating worker");

    // On failure the worker goes back to waiting, matching what is saved
    if let Err(e) = self.prune_caches(worker.definition.cache_name()) {
      error!(version = %worker.version(), "Activation failed: {}", e);
      state.waiting = Some(Worker::restored(worker.definition, WorkerState::Installed));
      return Err(e);
    }

    let version = worker.version().to_string();
    let claimed = Registration {
      active: Some(worker.definition.clone()),
      waiting: None,
      controller: Some(version.clone()),
    };

    if let Err(e) = self.storage.save_registration(&self.scope, &claimed) {
      state.waiting = Some(Worker::restored(worker.definition, WorkerState::Installed));
      error!(version = %version, "Failed to save activation: {}", e);
      return Err(e);
    }

    worker.transition(WorkerState::Activated)?;
    if let Some(mut previous) = state.active.replace(worker) {
      previous.transition(WorkerState::Redundant)?;
    }

    // Claim every open client right away
    state.controller = Some(version.clone());
    drop(state);

    self.controller_tx.send_replace(Some(version.clone()));
    info!(version = %version, "Worker activated and controlling clients");
    Ok(())
  }

  fn prune_caches(&self, current: &str) -> Result<()> {
    for name in self.storage.cache_names()? {
      if name != current {
        info!(cache = %name, "Removing stale cache");
        self.storage.delete_cache(&name)?;
      }
    }
    Ok(())
  }

  /// Activate the waiting worker now. Returns false if none is waiting.
  pub fn skip_waiting(&self) -> Result<bool> {
    let has_waiting = self.lock()?.waiting.is_some();
    if !has_waiting {
      debug!("skip waiting requested with no waiting worker");
      return Ok(false);
    }

    self.activate()?;
    Ok(true)
  }

  /// Message event.
  pub fn handle_message(&self, data: &Value) -> Result<()> {
    match ControlMessage::parse(data) {
      Some(ControlMessage::SkipWaiting) => {
        self.skip_waiting()?;
      }
      None => debug!(%data, "Ignoring unrecognised message"),
    }
    Ok(())
  }

  /// Fetch event: network first, cache as a side effect, then cache,
  /// offline document or a synthetic 503 when the network is down.
  ///
  /// Never fails; every error ends in one of the fallbacks.
  pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
    if !request.is_get() {
      return FetchOutcome::Passthrough;
    }

    let definition = match self.lock() {
      Ok(state) => state.active.as_ref().map(|w| w.definition.clone()),
      Err(e) => {
        warn!("Controller state unavailable: {}", e);
        None
      }
    };

    // No active worker: the client is not controlled
    let Some(definition) = definition else {
      return FetchOutcome::Passthrough;
    };

    if definition.is_excluded(&request.url) {
      return FetchOutcome::Passthrough;
    }

    let cache_name = definition.cache_name();
    let key = request.cache_key();

    if let Some(result) = self
      .layer
      .network_first(cache_name, &key, || self.network.fetch(&request))
      .await
    {
      return FetchOutcome::Respond(result);
    }

    if request.is_navigation() {
      match definition.offline_document(&self.origin) {
        Ok(url) => {
          if let Some(cached) = self.layer.lookup(cache_name, &Request::get(url).cache_key()) {
            debug!(url = %request.url, "Serving offline document");
            return FetchOutcome::Respond(CacheResult::offline_document(
              cached.response,
              cached.cached_at,
            ));
          }
          warn!(url = %request.url, "Offline document is not cached");
        }
        Err(e) => warn!("Offline document URL is invalid: {}", e),
      }
    }

    debug!(url = %request.url, "Offline with no cached entry");
    FetchOutcome::Respond(CacheResult::synthetic(Response::service_unavailable()))
  }

  /// A page in scope opened.
  pub fn attach_client(&self, client_id: &str) -> Result<()> {
    let mut state = self.lock()?;
    state.clients.insert(client_id.to_string());
    debug!(client = client_id, clients = state.clients.len(), "Client attached");
    Ok(())
  }

  /// A page in scope closed. When the last one goes, a waiting worker is
  /// activated; returns true in that case.
  pub fn detach_client(&self, client_id: &str) -> Result<bool> {
    let promote = {
      let mut state = self.lock()?;
      state.clients.remove(client_id);
      debug!(client = client_id, clients = state.clients.len(), "Client detached");
      state.clients.is_empty() && state.waiting.is_some()
    };

    if promote {
      self.activate()?;
    }
    Ok(promote)
  }

  /// Drop every cache and forget the registration.
  pub fn unregister(&self) -> Result<()> {
    let mut state = self.lock()?;
    if state.installing.is_some() {
      bail!("Cannot unregister while a worker is installing");
    }

    for name in self.storage.cache_names()? {
      self.storage.delete_cache(&name)?;
    }
    self.storage.delete_registration(&self.scope)?;

    let clients = std::mem::take(&mut state.clients);
    *state = ControllerState {
      clients,
      ..ControllerState::default()
    };
    drop(state);

    self.controller_tx.send_replace(None);
    info!(scope = %self.scope, "Registration removed");
    Ok(())
  }

  /// Request keys stored in one named cache.
  pub fn cache_entries(&self, cache_name: &str) -> Result<Vec<RequestKey>> {
    self.storage.entry_keys(cache_name)
  }

  pub fn status(&self) -> Result<ControllerStatus> {
    let state = self.lock()?;

    let mut caches = Vec::new();
    for name in self.storage.cache_names()? {
      let count = self.storage.entry_count(&name)?;
      caches.push((name, count));
    }

    Ok(ControllerStatus {
      scope: self.scope.clone(),
      active: state.active.as_ref().map(|w| w.version().to_string()),
      waiting: state.waiting.as_ref().map(|w| w.version().to_string()),
      installing: state.installing.as_ref().map(|w| w.version().to_string()),
      controller: state.controller.clone(),
      clients: state.clients.len(),
      caches,
    })
  }
}
