//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::RequestKey;
use crate::db::Database;
use crate::http::Response;

/// A response snapshot read back from a named cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Named caches of HTTP responses.
///
/// Only `open_cache` and `put_all` create caches. A single `put` into a cache
/// that does not exist (or was deleted meanwhile) stores nothing.
pub trait CacheStorage: Send + Sync {
  /// Open a named cache, creating it if absent. Returns true if created.
  fn open_cache(&self, name: &str) -> Result<bool>;

  /// Whether a named cache exists.
  fn has_cache(&self, name: &str) -> Result<bool>;

  /// Names of all caches in creation order.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a named cache and everything in it. Returns true if it existed.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Store one response, replacing any entry with the same key. Returns
  /// false if the cache does not exist.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<bool>;

  /// Store a batch of responses atomically: either all land or none do.
  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up the entry stored under a request key.
  fn match_request(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Keys of every entry in a cache.
  fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>>;

  /// Number of entries in a cache.
  fn entry_count(&self, name: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  /// A throwaway store that lives as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  /// Run `f` with the locked connection.
  pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&mut conn)
  }
}

fn insert_cache(conn: &Connection, name: &str) -> Result<bool> {
  let inserted = conn
    .execute(
      "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, datetime('now'))",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
  Ok(inserted > 0)
}

fn cache_exists(conn: &Connection, name: &str) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row("SELECT 1 FROM caches WHERE name = ?", params![name], |row| {
      row.get(0)
    })
    .optional()
    .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;
  Ok(found.is_some())
}

fn insert_entry(conn: &Connection, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, key_hash, method, url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.method,
        key.url,
        response.status,
        response.status_text,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in cache {}: {}", key, name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<bool> {
    self.with_conn(|conn| insert_cache(conn, name))
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    self.with_conn(|conn| cache_exists(conn, name))
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT name FROM caches ORDER BY rowid")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list caches: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

      Ok(names)
    })
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;

      let deleted = tx
        .execute("DELETE FROM caches WHERE name = ?", params![name])
        .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(deleted > 0)
    })
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<bool> {
    // The lock is held across check and insert, so a concurrent delete
    // lands either before (nothing stored) or after (entry removed too)
    self.with_conn(|conn| {
      if !cache_exists(conn, name)? {
        return Ok(false);
      }
      insert_entry(conn, name, key, response)?;
      Ok(true)
    })
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      insert_cache(&tx, name)?;
      for (key, response) in entries {
        insert_entry(&tx, name, key, response)?;
      }

      // Dropping `tx` on an early return rolls everything back
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(())
    })
  }

  fn match_request(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.with_conn(|conn| {
      let row: Option<(u16, String, String, Vec<u8>, String)> = conn
        .query_row(
          "SELECT status, status_text, headers, body, cached_at FROM cache_entries
           WHERE cache_name = ? AND key_hash = ?",
          params![name, key.cache_hash()],
          |row| {
            Ok((
              row.get(0)?,
              row.get(1)?,
              row.get(2)?,
              row.get(3)?,
              row.get(4)?,
            ))
          },
        )
        .optional()
        .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", key, name, e))?;

      let Some((status, status_text, headers, body, cached_at)) = row else {
        return Ok(None);
      };

      let headers: Vec<(String, String)> = serde_json::from_str(&headers)
        .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;

      Ok(Some(CachedResponse {
        response: Response {
          status,
          status_text,
          headers,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      }))
    })
  }

  fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT method, url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let keys = stmt
        .query_map(params![name], |row| {
          let method: String = row.get(0)?;
          let url: String = row.get(1)?;
          Ok(RequestKey::new(&method, &url))
        })
        .map_err(|e| eyre!("Failed to list entries of cache {}: {}", name, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

      Ok(keys)
    })
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    self.with_conn(|conn| {
      let count: i64 = conn
        .query_row(
          "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
          params![name],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count entries of cache {}: {}", name, e))?;
      Ok(count as usize)
    })
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(url: &str) -> RequestKey {
    RequestKey::new("GET", url)
  }

  #[test]
  fn test_open_cache_reports_creation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.open_cache("gestto-v1").unwrap());
    assert!(!storage.open_cache("gestto-v1").unwrap());
    assert!(storage.has_cache("gestto-v1").unwrap());
    assert!(!storage.has_cache("gestto-v0").unwrap());
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = Response::new(200, "OK", "<html>home</html>").with_header("Content-Type", "text/html");
    storage.open_cache("gestto-v1").unwrap();

    assert!(storage
      .put("gestto-v1", &key("http://localhost:8000/"), &response)
      .unwrap());

    let cached = storage
      .match_request("gestto-v1", &key("http://localhost:8000/"))
      .unwrap()
      .expect("entry should be cached");
    assert_eq!(cached.response, response);

    // Same URL, different method is a different entry
    let head = RequestKey::new("HEAD", "http://localhost:8000/");
    assert!(storage.match_request("gestto-v1", &head).unwrap().is_none());
    // Same key, different cache
    assert!(storage
      .match_request("gestto-v2", &key("http://localhost:8000/"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_put_overwrites_existing_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let k = key("http://localhost:8000/");
    storage.open_cache("gestto-v1").unwrap();

    storage.put("gestto-v1", &k, &Response::new(200, "OK", "old")).unwrap();
    storage.put("gestto-v1", &k, &Response::new(200, "OK", "new")).unwrap();

    assert_eq!(storage.entry_count("gestto-v1").unwrap(), 1);
    let cached = storage.match_request("gestto-v1", &k).unwrap().unwrap();
    assert_eq!(cached.response.body, b"new");
  }

  #[test]
  fn test_put_all_stores_every_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (key("http://localhost:8000/"), Response::new(200, "OK", "home")),
      (key("http://localhost:8000/offline/"), Response::new(200, "OK", "offline")),
    ];

    storage.put_all("gestto-v1", &entries).unwrap();

    let keys = storage.entry_keys("gestto-v1").unwrap();
    assert_eq!(keys, vec![entries[0].0.clone(), entries[1].0.clone()]);
  }

  #[test]
  fn test_delete_cache_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all(
        "gestto-v0",
        &[(key("http://localhost:8000/"), Response::new(200, "OK", "x"))],
      )
      .unwrap();
    storage.open_cache("gestto-v1").unwrap();

    assert!(storage.delete_cache("gestto-v0").unwrap());
    assert!(!storage.delete_cache("gestto-v0").unwrap());
    assert_eq!(storage.cache_names().unwrap(), vec!["gestto-v1".to_string()]);
    assert_eq!(storage.entry_count("gestto-v0").unwrap(), 0);
  }

  #[test]
  fn test_put_does_not_create_missing_cache() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_cache("gestto-v1").unwrap();
    storage.delete_cache("gestto-v1").unwrap();

    let stored = storage
      .put("gestto-v1", &key("http://localhost:8000/"), &Response::new(200, "OK", "x"))
      .unwrap();

    assert!(!stored);
    assert!(storage.cache_names().unwrap().is_empty());
    assert_eq!(storage.entry_count("gestto-v1").unwrap(), 0);
  }

  #[test]
  fn test_cache_names_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_cache("b").unwrap();
    storage.open_cache("a").unwrap();
    storage.open_cache("c").unwrap();
    assert_eq!(storage.cache_names().unwrap(), vec!["b", "a", "c"]);
  }

  #[test]
  fn test_open_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.open_cache("gestto-v1").unwrap();
      storage
        .put("gestto-v1", &key("http://localhost:8000/"), &Response::new(200, "OK", "x"))
        .unwrap();
    }

    let reopened = SqliteStorage::open(&path).unwrap();
    assert_eq!(reopened.entry_count("gestto-v1").unwrap(), 1);
  }
}
