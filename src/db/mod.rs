//! Persisted stores and the pool of open connections to them.
//!
//! Every store name maps to one SQLite database. The schema of a store belongs to the
//! resource that owns it and is versioned with `PRAGMA user_version`.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::timing::Timing;

/// Schema upgrade hook: receives the open connection (inside a transaction) and the
/// version found on disk, 0 for a brand new store.
pub type UpgradeFn<'a> = &'a (dyn Fn(&Connection, u32) -> Result<()> + Send + Sync);

/// Where stores are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
  /// Private in-memory database per store; contents die with the connection
  Memory,
  /// One file per store inside this directory
  Directory(PathBuf),
}

/// A long-lived handle to one persisted store.
pub struct StoreConnection {
  name: String,
  path: Option<PathBuf>,
  version: Mutex<u32>,
  conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for StoreConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StoreConnection")
      .field("name", &self.name)
      .field("path", &self.path)
      .finish()
  }
}

impl StoreConnection {
  fn new(name: &str, path: Option<PathBuf>, conn: Connection) -> Self {
    Self {
      name: name.to_string(),
      path,
      version: Mutex::new(0),
      conn: Mutex::new(Some(conn)),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Backing file, `None` for in-memory stores.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Schema version the store was last opened or upgraded with.
  pub fn version(&self) -> u32 {
    *self.version.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Run `f` against the open connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let conn = guard
      .as_ref()
      .ok_or_else(|| eyre!("Store {} is closed", self.name))?;
    f(conn)
  }

  /// Run `f` inside a transaction; commits when `f` succeeds, rolls back otherwise.
  pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let conn = guard
      .as_mut()
      .ok_or_else(|| eyre!("Store {} is closed", self.name))?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction on {}: {}", self.name, e))?;
    let value = f(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction on {}: {}", self.name, e))?;
    Ok(value)
  }

  /// Bring the on-disk schema up to `version`.
  fn ensure_version(&self, version: u32, upgrade: UpgradeFn<'_>) -> Result<()> {
    let mut current = self
      .version
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if *current >= version {
      return Ok(());
    }

    let on_disk = self.transaction(|conn| {
      let on_disk: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| eyre!("Failed to read schema version: {}", e))?;
      if on_disk > version {
        return Err(eyre!(
          "Schema version {} of {} is newer than supported version {}",
          on_disk,
          self.name,
          version
        ));
      }
      if on_disk < version {
        upgrade(conn, on_disk)?;
        conn
          .pragma_update(None, "user_version", version)
          .map_err(|e| eyre!("Failed to stamp schema version: {}", e))?;
      }
      Ok(on_disk)
    })?;

    if on_disk < version {
      tracing::info!(store = %self.name, from = on_disk, to = version, "upgraded store schema");
    }
    *current = version;
    Ok(())
  }

  /// Release the underlying connection. Later calls on this handle fail.
  pub fn close(&self) -> Result<()> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(conn) = guard.take() {
      conn
        .close()
        .map_err(|(_, e)| eyre!("Failed to close store {}: {}", self.name, e))?;
    }
    Ok(())
  }
}

/// Process-wide map from store name to an open connection, opened lazily and reused.
///
/// There is no eviction: connections stay open until closed explicitly or the pool
/// is shut down.
pub struct ConnectionPool {
  location: StoreLocation,
  connections: Mutex<HashMap<String, Arc<StoreConnection>>>,
}

impl ConnectionPool {
  pub fn new(location: StoreLocation) -> Self {
    Self {
      location,
      connections: Mutex::new(HashMap::new()),
    }
  }

  pub fn location(&self) -> &StoreLocation {
    &self.location
  }

  /// Return the pooled connection for `name`, opening (and upgrading) it first if needed.
  pub fn open(
    &self,
    name: &str,
    version: u32,
    upgrade: UpgradeFn<'_>,
  ) -> Result<Arc<StoreConnection>> {
    // Held across the open so two callers never race to create the same store.
    let mut connections = self
      .connections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(existing) = connections.get(name) {
      let existing = Arc::clone(existing);
      drop(connections);
      existing.ensure_version(version, upgrade)?;
      return Ok(existing);
    }

    let timing = Timing::start("Store", "Open", name);
    let (conn, path) = self.open_connection(name)?;
    let store = Arc::new(StoreConnection::new(name, path, conn));
    store.ensure_version(version, upgrade)?;
    connections.insert(name.to_string(), Arc::clone(&store));
    timing.end();

    tracing::debug!(store = name, pool_size = connections.len(), "opened store");
    Ok(store)
  }

  fn open_connection(&self, name: &str) -> Result<(Connection, Option<PathBuf>)> {
    match &self.location {
      StoreLocation::Memory => {
        let conn = Connection::open_in_memory()
          .map_err(|e| eyre!("Failed to open in-memory store {}: {}", name, e))?;
        Ok((conn, None))
      }
      StoreLocation::Directory(dir) => {
        std::fs::create_dir_all(dir)
          .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
        let path = dir.join(store_file_name(name));
        let conn = Connection::open(&path)
          .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
        conn
          .busy_timeout(Duration::from_secs(5))
          .map_err(|e| eyre!("Failed to configure store {}: {}", name, e))?;
        Ok((conn, Some(path)))
      }
    }
  }

  /// Whether a connection for `name` is currently pooled.
  pub fn contains(&self, name: &str) -> bool {
    self
      .connections
      .lock()
      .map(|c| c.contains_key(name))
      .unwrap_or(false)
  }

  /// Number of pooled connections.
  pub fn len(&self) -> usize {
    self.connections.lock().map(|c| c.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove and release the connection for `name`. The next `open` reopens it.
  pub fn close(&self, name: &str) -> Result<()> {
    let removed = self
      .connections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(name);
    match removed {
      Some(store) => store.close(),
      None => Ok(()),
    }
  }

  /// Close every pooled connection.
  pub fn close_all(&self) -> Result<()> {
    let drained: Vec<Arc<StoreConnection>> = self
      .connections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .drain()
      .map(|(_, store)| store)
      .collect();
    for store in drained {
      store.close()?;
    }
    Ok(())
  }

  /// Close the store and delete its backing file. Test-only in practice.
  pub fn delete(&self, name: &str) -> Result<()> {
    self.close(name)?;
    if let StoreLocation::Directory(dir) = &self.location {
      let path = dir.join(store_file_name(name));
      if path.exists() {
        std::fs::remove_file(&path)
          .map_err(|e| eyre!("Failed to delete store {}: {}", path.display(), e))?;
      }
    }
    Ok(())
  }
}

/// Stable, fixed-length file name for a store name.
pub fn store_file_name(name: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(name.as_bytes());
  format!("{}.sqlite", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn create_kv(conn: &Connection, old_version: u32) -> Result<()> {
    if old_version < 1 {
      conn.execute_batch("CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT NOT NULL);")?;
    }
    Ok(())
  }

  #[test]
  fn open_reuses_pooled_connection() {
    let pool = ConnectionPool::new(StoreLocation::Memory);
    let a = pool.open("alpha", 1, &create_kv).unwrap();
    let b = pool.open("alpha", 1, &create_kv).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(pool.len(), 1);
  }

  #[test]
  fn upgrade_runs_once_per_version() {
    let calls = AtomicUsize::new(0);
    let upgrade = |conn: &Connection, old: u32| -> Result<()> {
      calls.fetch_add(1, Ordering::SeqCst);
      create_kv(conn, old)
    };
    let dir = tempfile::tempdir().unwrap();
    let pool = ConnectionPool::new(StoreLocation::Directory(dir.path().to_path_buf()));

    pool.open("beta", 1, &upgrade).unwrap();
    pool.close("beta").unwrap();
    assert!(!pool.contains("beta"));
    let store = pool.open("beta", 1, &upgrade).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.version(), 1);
  }

  #[test]
  fn newer_on_disk_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ConnectionPool::new(StoreLocation::Directory(dir.path().to_path_buf()));
    pool.open("gamma", 2, &create_kv).unwrap();
    pool.close("gamma").unwrap();

    let err = pool.open("gamma", 1, &create_kv).unwrap_err();
    assert!(err.to_string().contains("newer than supported"));
    assert!(!pool.contains("gamma"));
  }

  #[test]
  fn data_survives_reopen_but_not_delete() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ConnectionPool::new(StoreLocation::Directory(dir.path().to_path_buf()));
    let store = pool.open("delta", 1, &create_kv).unwrap();
    store
      .transaction(|conn| {
        conn.execute("INSERT INTO kv (key, value) VALUES ('k', 'v')", [])?;
        Ok(())
      })
      .unwrap();
    pool.close("delta").unwrap();
    assert!(store.with_conn(|_| Ok(())).is_err());

    let count = |store: &StoreConnection| {
      store
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get::<_, i64>(0))?))
        .unwrap()
    };
    let reopened = pool.open("delta", 1, &create_kv).unwrap();
    assert_eq!(count(reopened.as_ref()), 1);

    pool.delete("delta").unwrap();
    let fresh = pool.open("delta", 1, &create_kv).unwrap();
    assert_eq!(count(fresh.as_ref()), 0);
  }

  #[test]
  fn file_names_are_hashed() {
    let name = store_file_name("timeseries/a/b/c//");
    assert_eq!(name.len(), 64 + ".sqlite".len());
    assert!(!name.contains('/'));
  }
}
