//! SQLite implementation of the cache store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::http::{Response, ResponseKind};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A private database that lives as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq doubles as insertion order for FIFO trimming
CREATE TABLE IF NOT EXISTS entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_generation_seq ON entries(generation, seq);
"#;

fn ensure_generation(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", name, e))?;
  Ok(())
}

/// Replace the snapshot under `key`. Delete + insert so the entry moves to the newest slot.
fn write_entry(
  tx: &Transaction<'_>,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let digest = key.digest();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  tx.execute(
    "DELETE FROM entries WHERE generation = ? AND request_key = ?",
    params![generation, digest],
  )
  .map_err(|e| eyre!("Failed to replace entry: {}", e))?;

  tx.execute(
    "INSERT INTO entries (generation, request_key, method, url, status, kind, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      generation,
      digest,
      key.method().as_str(),
      key.url().as_str(),
      response.status,
      response.kind.as_str(),
      headers,
      response.body,
    ],
  )
  .map_err(|e| eyre!("Failed to store entry: {}", e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    ensure_generation(&conn, name)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn has_generation(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.put_all(generation, &[(key.clone(), response.clone())])
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, generation)?;
    for (key, response) in entries {
      write_entry(&tx, generation, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;

    let row: Option<(i64, u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT seq, status, kind, headers, body, cached_at FROM entries
         WHERE generation = ? AND request_key = ?",
        params![generation, key.digest()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry: {}", e))?;

    let Some((seq, status, kind, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let kind =
      ResponseKind::parse(&kind).ok_or_else(|| eyre!("Unknown response kind '{}'", kind))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        headers,
        body,
        kind,
      },
      cached_at: parse_datetime(&cached_at)?,
      seq,
    }))
  }

  fn delete(&self, generation: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM entries WHERE generation = ? AND request_key = ?",
        params![generation, key.digest()],
      )
      .map_err(|e| eyre!("Failed to delete entry: {}", e))?;
    Ok(removed > 0)
  }

  fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE generation = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![generation], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url)| {
        let method = Method::from_bytes(method.as_bytes())
          .map_err(|e| eyre!("Invalid stored method '{}': {}", method, e))?;
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid stored url '{}': {}", url, e))?;
        Ok(RequestKey::new(method, &url))
      })
      .collect()
  }

  fn len(&self, generation: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  fn evict_oldest(&self, generation: &str, keep: usize) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let count: i64 = tx
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE generation = ? AND url LIKE 'http%'",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    let excess = (count as usize).saturating_sub(keep);
    if excess == 0 {
      return Ok(0);
    }

    let evicted = tx
      .execute(
        "DELETE FROM entries WHERE seq IN (
           SELECT seq FROM entries WHERE generation = ? AND url LIKE 'http%'
           ORDER BY seq LIMIT ?
         )",
        params![generation, excess as i64],
      )
      .map_err(|e| eyre!("Failed to evict entries: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(evicted)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
