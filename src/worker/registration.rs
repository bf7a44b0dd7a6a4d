//! Persisted registration record for a scope.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::WorkerDefinition;
use crate::cache::SqliteStorage;

/// What survives between sessions: the active and waiting workers and the
/// version currently controlling clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
  pub active: Option<WorkerDefinition>,
  pub waiting: Option<WorkerDefinition>,
  pub controller: Option<String>,
}

/// Trait for registration storage backends.
pub trait RegistrationStore: Send + Sync {
  fn load_registration(&self, scope: &str) -> Result<Option<Registration>>;

  fn save_registration(&self, scope: &str, registration: &Registration) -> Result<()>;

  /// Returns true if a registration existed.
  fn delete_registration(&self, scope: &str) -> Result<bool>;
}

impl RegistrationStore for SqliteStorage {
  fn load_registration(&self, scope: &str) -> Result<Option<Registration>> {
    self.with_conn(|conn| {
      let record: Option<String> = conn
        .query_row(
          "SELECT record FROM registrations WHERE scope = ?",
          params![scope],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to load registration for {}: {}", scope, e))?;

      record
        .map(|json| {
          serde_json::from_str(&json)
            .map_err(|e| eyre!("Failed to parse registration for {}: {}", scope, e))
        })
        .transpose()
    })
  }

  fn save_registration(&self, scope: &str, registration: &Registration) -> Result<()> {
    let record = serde_json::to_string(registration)
      .map_err(|e| eyre!("Failed to serialize registration: {}", e))?;

    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO registrations (scope, record, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![scope, record],
        )
        .map_err(|e| eyre!("Failed to save registration for {}: {}", scope, e))?;
      Ok(())
    })
  }

  fn delete_registration(&self, scope: &str) -> Result<bool> {
    self.with_conn(|conn| {
      let deleted = conn
        .execute("DELETE FROM registrations WHERE scope = ?", params![scope])
        .map_err(|e| eyre!("Failed to delete registration for {}: {}", scope, e))?;
      Ok(deleted > 0)
    })
  }
}
