//! Worker lifecycle states and the transitions between them.

use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use super::WorkerDefinition;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  /// Known but not yet installing
  #[default]
  Parsed,
  /// Precaching the static assets
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Pruning stale caches
  Activating,
  /// Active and controlling pages
  Activated,
  /// Failed to install, or replaced by a newer worker
  Redundant,
}

impl WorkerState {
  pub fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;

    matches!(
      (self, next),
      (Parsed, Installing)
        | (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Installed, Redundant)
        | (Activating, Activated)
        | (Activating, Redundant)
        | (Activated, Redundant)
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One version of the worker and where it is in its lifecycle.
#[derive(Debug, Clone)]
pub struct Worker {
  pub definition: WorkerDefinition,
  state: WorkerState,
}

impl Worker {
  pub fn new(definition: WorkerDefinition) -> Self {
    Self {
      definition,
      state: WorkerState::Parsed,
    }
  }

  /// A worker loaded back from a saved registration.
  pub fn restored(definition: WorkerDefinition, state: WorkerState) -> Self {
    Self { definition, state }
  }

  #[cfg(test)]
  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn version(&self) -> &str {
    &self.definition.version
  }

  pub fn transition(&mut self, next: WorkerState) -> Result<()> {
    if !self.state.can_transition_to(next) {
      bail!(
        "Invalid state transition for worker {}: {} -> {}",
        self.definition.version,
        self.state,
        next
      );
    }
    self.state = next;
    Ok(())
  }
}
