//! Page-side update flow: keep a client attached, poll for new worker
//! versions and offer to switch to them.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::CacheStorage;
use crate::event::EventSender;
use crate::http::Fetch;
use crate::worker::{
  ControlMessage, OfflineCacheController, RegisterOutcome, RegistrationStore, WorkerDefinition,
};

const UPDATE_QUESTION: &str = "A new version is available. Update now?";

/// Asks the user a yes/no question.
#[async_trait]
pub trait Prompt: Send + Sync {
  async fn confirm(&self, question: &str) -> bool;
}

/// Prompt on the terminal; anything but `y`/`yes` declines.
pub struct StdinPrompt;

#[async_trait]
impl Prompt for StdinPrompt {
  async fn confirm(&self, question: &str) -> bool {
    let question = question.to_string();
    let answer = tokio::task::spawn_blocking(move || {
      print!("{} [y/N] ", question);
      std::io::stdout().flush().ok()?;
      let mut line = String::new();
      std::io::stdin().read_line(&mut line).ok()?;
      Some(line)
    })
    .await
    .ok()
    .flatten()
    .unwrap_or_default();

    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
  }
}

/// Result of one update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
  UpToDate,
  /// Nothing was controlling clients, so the new version took over
  Activated,
  /// A new version is waiting and nobody was asked
  Waiting,
  /// The user accepted; SKIP_WAITING was sent
  Accepted,
  /// The user declined; the new version keeps waiting
  Declined,
}

/// One page session: an attached client plus the update prompt state.
pub struct UpdateWatcher<S, F, P>
where
  S: CacheStorage + RegistrationStore,
  F: Fetch,
  P: Prompt,
{
  controller: Arc<OfflineCacheController<S, F>>,
  events: EventSender,
  prompt: P,
  client_id: String,
  changes: watch::Receiver<Option<String>>,
  reloads: usize,
}

impl<S, F, P> UpdateWatcher<S, F, P>
where
  S: CacheStorage + RegistrationStore,
  F: Fetch,
  P: Prompt,
{
  /// Attach `client_id` to the controller and start watching.
  pub fn new(
    controller: Arc<OfflineCacheController<S, F>>,
    events: EventSender,
    prompt: P,
    client_id: &str,
  ) -> Result<Self> {
    controller.attach_client(client_id)?;
    let changes = controller.controller_changes();

    Ok(Self {
      controller,
      events,
      prompt,
      client_id: client_id.to_string(),
      changes,
      reloads: 0,
    })
  }

  /// How many times the controller changed under this session.
  #[cfg(test)]
  pub fn reloads(&self) -> usize {
    self.reloads
  }

  /// Register `definition` and, if it ends up freshly waiting behind an
  /// existing controller, ask whether to switch now.
  pub async fn check_for_update(&mut self, definition: WorkerDefinition) -> Result<UpdateCheck> {
    let had_controller = self.controller.controller_version().is_some();

    let check = match self.events.install(definition).await? {
      RegisterOutcome::UpToDate => UpdateCheck::UpToDate,
      RegisterOutcome::Activated => UpdateCheck::Activated,
      RegisterOutcome::AlreadyWaiting => UpdateCheck::Waiting,
      RegisterOutcome::Waiting if !had_controller => UpdateCheck::Waiting,
      RegisterOutcome::Waiting => {
        info!("New version available");
        if self.prompt.confirm(UPDATE_QUESTION).await {
          let message = serde_json::to_value(ControlMessage::SkipWaiting)
            .map_err(|e| eyre!("Failed to encode message: {}", e))?;
          self.events.post_message(message)?;
          UpdateCheck::Accepted
        } else {
          UpdateCheck::Declined
        }
      }
    };

    Ok(check)
  }

  /// Record a controller change if one happened since the last call.
  pub fn observe_controller_change(&mut self) -> Option<String> {
    if !self.changes.has_changed().unwrap_or(false) {
      return None;
    }

    let version = self.changes.borrow_and_update().clone();
    self.reloads += 1;
    match &version {
      Some(v) => info!(version = %v, "Controller changed, reloading"),
      None => info!("Controller removed, reloading"),
    }
    version
  }

  /// Poll every `interval` until `shutdown` resolves, then detach.
  ///
  /// `load_definition` is re-run on every tick so edits to the worker
  /// definition are picked up. Failed checks are logged and retried on the
  /// next tick.
  pub async fn run<L, Sd>(mut self, load_definition: L, interval: Duration, shutdown: Sd) -> Result<()>
  where
    L: Fn() -> Result<WorkerDefinition>,
    Sd: Future<Output = ()>,
  {
    let mut ticker = tokio::time::interval(interval);
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let result = match load_definition() {
            Ok(definition) => self.check_for_update(definition).await,
            Err(e) => Err(e),
          };
          match result {
            Ok(check) => tracing::debug!(?check, "Update check finished"),
            Err(e) => warn!("Update check failed: {}", e),
          }
          self.observe_controller_change();
        }
        _ = &mut shutdown => break,
      }
    }

    self.observe_controller_change();
    info!(reloads = self.reloads, "Stopped watching for updates");
    self.close()
  }

  /// Detach the client; a waiting worker may activate as a result.
  pub fn close(self) -> Result<()> {
    if self.controller.detach_client(&self.client_id)? {
      info!("Waiting worker activated after last client closed");
    }
    Ok(())
  }
}
