//! Table helpers shared by every resource schema.
//!
//! Values are stored as JSON text. Two table shapes exist: tables keyed by an arbitrary
//! string (`metadata`, `ranges`, key/value entries) and tables keyed by revision, which
//! are scanned in revision order and merged field by field on write.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::range::Range;

/// A JSON object: one row of column → value pairs.
pub type Fields = Map<String, Value>;

/// Copy every field of `source` into `target`. Fields absent from `source` keep their
/// previous value; fields present in both take the value from `source`.
pub fn shallow_merge(target: &mut Fields, source: &Fields) {
  for (key, value) in source {
    target.insert(key.clone(), value.clone());
  }
}

/// A table of JSON values keyed by string.
#[derive(Debug, Clone, Copy)]
pub struct KeyedTable {
  name: &'static str,
}

impl KeyedTable {
  pub const fn new(name: &'static str) -> Self {
    Self { name }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn create(&self, conn: &Connection) -> Result<()> {
    conn
      .execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        self.name
      ))
      .map_err(|e| eyre!("Failed to create table {}: {}", self.name, e))
  }

  pub fn get<T: DeserializeOwned>(&self, conn: &Connection, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = conn
      .query_row(
        &format!("SELECT value FROM {} WHERE key = ?", self.name),
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}/{}: {}", self.name, key, e))?;

    match raw {
      Some(raw) => {
        let value = serde_json::from_str(&raw)
          .map_err(|e| eyre!("Failed to deserialize {}/{}: {}", self.name, key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  pub fn put<T: Serialize + ?Sized>(&self, conn: &Connection, key: &str, value: &T) -> Result<()> {
    let raw =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;
    conn
      .execute(
        &format!(
          "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
          self.name
        ),
        params![key, raw],
      )
      .map_err(|e| eyre!("Failed to write {}/{}: {}", self.name, key, e))?;
    Ok(())
  }

  pub fn delete(&self, conn: &Connection, key: &str) -> Result<()> {
    conn
      .execute(
        &format!("DELETE FROM {} WHERE key = ?", self.name),
        params![key],
      )
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", self.name, key, e))?;
    Ok(())
  }

  pub fn clear(&self, conn: &Connection) -> Result<()> {
    conn
      .execute(&format!("DELETE FROM {}", self.name), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", self.name, e))?;
    Ok(())
  }

  /// All keys in ascending order.
  pub fn keys(&self, conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
      .prepare(&format!("SELECT key FROM {} ORDER BY key", self.name))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list {}: {}", self.name, e))?;
    Ok(keys)
  }
}

/// A table of JSON objects keyed by revision.
#[derive(Debug, Clone, Copy)]
pub struct RevisionTable {
  name: &'static str,
}

impl RevisionTable {
  pub const fn new(name: &'static str) -> Self {
    Self { name }
  }

  pub fn create(&self, conn: &Connection) -> Result<()> {
    conn
      .execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (revision INTEGER PRIMARY KEY, value TEXT NOT NULL);",
        self.name
      ))
      .map_err(|e| eyre!("Failed to create table {}: {}", self.name, e))
  }

  pub fn get(&self, conn: &Connection, revision: u64) -> Result<Option<Fields>> {
    let raw: Option<String> = conn
      .query_row(
        &format!("SELECT value FROM {} WHERE revision = ?", self.name),
        params![to_sql_revision(revision)?],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}/{}: {}", self.name, revision, e))?;

    raw
      .map(|raw| {
        serde_json::from_str(&raw)
          .map_err(|e| eyre!("Failed to deserialize {}/{}: {}", self.name, revision, e))
      })
      .transpose()
  }

  /// Merge `fields` into the stored row for `revision` (creating it if absent) and
  /// return the merged row.
  pub fn merge(&self, conn: &Connection, revision: u64, fields: &Fields) -> Result<Fields> {
    let mut row = self.get(conn, revision)?.unwrap_or_default();
    shallow_merge(&mut row, fields);
    let raw = serde_json::to_string(&row).map_err(|e| eyre!("Failed to serialize row: {}", e))?;
    conn
      .execute(
        &format!(
          "INSERT OR REPLACE INTO {} (revision, value) VALUES (?, ?)",
          self.name
        ),
        params![to_sql_revision(revision)?, raw],
      )
      .map_err(|e| eyre!("Failed to write {}/{}: {}", self.name, revision, e))?;
    Ok(row)
  }

  /// Rows whose revision falls in `range`, in ascending revision order.
  pub fn scan(&self, conn: &Connection, range: &Range) -> Result<Vec<Fields>> {
    if range.is_empty() {
      return Ok(Vec::new());
    }
    let mut stmt = conn
      .prepare(&format!(
        "SELECT value FROM {} WHERE revision >= ? AND revision < ? ORDER BY revision",
        self.name
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raws = stmt
      .query_map(
        params![
          to_sql_revision(range.start())?,
          to_sql_revision(range.end())?
        ],
        |row| row.get::<_, String>(0),
      )
      .map_err(|e| eyre!("Failed to scan {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to scan {}: {}", self.name, e))?;

    raws
      .iter()
      .map(|raw| {
        serde_json::from_str(raw).map_err(|e| eyre!("Failed to deserialize row in {}: {}", self.name, e))
      })
      .collect()
  }

  pub fn count(&self, conn: &Connection) -> Result<u64> {
    let count: i64 = conn
      .query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count {}: {}", self.name, e))?;
    Ok(count.max(0) as u64)
  }

  pub fn clear(&self, conn: &Connection) -> Result<()> {
    conn
      .execute(&format!("DELETE FROM {}", self.name), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", self.name, e))?;
    Ok(())
  }
}

fn to_sql_revision(revision: u64) -> Result<i64> {
  i64::try_from(revision).map_err(|_| eyre!("Revision {} is out of range", revision))
}
