//! Core traits and types for the caching system.

use color_eyre::Result;
use rusqlite::Connection;
use serde_json::Value;

use crate::db::StoreConnection;

/// Capability interface a resource kind hands to the generic engine.
///
/// The engine only orchestrates: it opens the store through the connection pool, races
/// `read` against the network, and queues `write` with the network result. It never looks
/// inside the payloads.
pub trait ResourceStore: Send + Sync + 'static {
  /// Category used for timings and logs (e.g. "Timeseries", "Reports")
  fn timing_category(&self) -> &'static str;

  /// Name of the persisted store this resource lives in (e.g. "report/42")
  fn store_name(&self) -> String;

  /// Schema version of the store
  fn store_version(&self) -> u32;

  /// Create or migrate tables. `old_version` is 0 for a brand new store.
  fn upgrade_schema(&self, conn: &Connection, old_version: u32) -> Result<()>;

  /// Read the persisted value. `Ok(None)` is a cache miss.
  fn read(&self, store: &StoreConnection) -> Result<Option<Value>>;

  /// Persist a network result.
  fn write(&self, store: &StoreConnection, network: &Value) -> Result<()>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from persisted data.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Whether this result reflects the network, i.e. callers can stop showing progress
  /// once the stream ends on it.
  pub fn is_reconciled(&self) -> bool {
    self.source == CacheSource::Network
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
    }
  }
}

/// Indicates where a yielded result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Persisted data, possibly partial or stale
  Cache,
  /// Data reconciled with a network response
  Network,
}
