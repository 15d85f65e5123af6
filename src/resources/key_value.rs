//! Expiring key/value cache.
//!
//! Unlike the other resources this one does not race: a fresh entry is returned without
//! touching the network. Concurrent misses for the same key share one network fetch.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::{with_store, KeyedTable, PendingWrite, ResourceStore};
use crate::db::StoreConnection;
use crate::error::CacheError;
use crate::fetch::{fetch_json, FetchRequest};
use crate::runtime::CacheRuntime;
use crate::timing::Timing;

const CATEGORY: &str = "KeyValue";
const STORE_NAME: &str = "keyvalue";
const STORE_VERSION: u32 = 1;

const DATA: KeyedTable = KeyedTable::new("data");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
  value: Value,
  expires_at: DateTime<Utc>,
}

impl Entry {
  fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    self.expires_at > now
  }
}

/// One key of the shared `keyvalue` store.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
  key: String,
  expiration: Duration,
}

impl KeyValueStore {
  pub fn new(key: impl Into<String>, expiration: Duration) -> Self {
    Self {
      key: key.into(),
      expiration,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }
}

impl ResourceStore for KeyValueStore {
  fn timing_category(&self) -> &'static str {
    CATEGORY
  }

  fn store_name(&self) -> String {
    STORE_NAME.to_string()
  }

  fn store_version(&self) -> u32 {
    STORE_VERSION
  }

  fn upgrade_schema(&self, conn: &Connection, old_version: u32) -> Result<()> {
    if old_version < 1 {
      DATA.create(conn)?;
    }
    Ok(())
  }

  /// The stored value, unless it has expired.
  fn read(&self, store: &StoreConnection) -> Result<Option<Value>> {
    let entry: Option<Entry> = store.with_conn(|conn| DATA.get(conn, &self.key))?;
    let now = Utc::now();
    Ok(entry.filter(|e| e.is_fresh(now)).map(|e| e.value))
  }

  fn write(&self, store: &StoreConnection, network: &Value) -> Result<()> {
    let now = Utc::now();
    let entry = Entry {
      value: network.clone(),
      expires_at: now
        .checked_add_signed(self.expiration)
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
    };
    store.transaction(|conn| DATA.put(conn, &self.key, &entry))
  }
}

type SharedValue = Shared<BoxFuture<'static, Result<Value, CacheError>>>;

/// Key/value fetches that have not been written back yet, by key.
#[derive(Default)]
pub struct KeyValueFetches {
  by_key: Mutex<HashMap<String, SharedValue>>,
}

impl KeyValueFetches {
  fn join_or_start<F>(&self, key: &str, start: F) -> (SharedValue, bool)
  where
    F: FnOnce() -> BoxFuture<'static, Result<Value, CacheError>>,
  {
    let mut by_key = self.by_key.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = by_key.get(key) {
      return (existing.clone(), false);
    }
    let fetch = start().shared();
    by_key.insert(key.to_string(), fetch.clone());
    (fetch, true)
  }

  fn finish(&self, key: &str) {
    self
      .by_key
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(key);
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self
      .by_key
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains_key(key)
  }
}

/// Key of a `/api/describe` response: per test suite, separated by whether the request
/// was authorized (internal data may be visible).
pub fn describe_key(request: &FetchRequest) -> Result<String, CacheError> {
  let suite = request
    .param("test_suite")
    .filter(|s| !s.is_empty())
    .ok_or_else(|| CacheError::InvalidRequest("test_suite is not specified".to_string()))?;
  let mut key = format!("describe_{}", suite);
  if request.has_header("Authorization") {
    key.push_str("_internal");
  }
  Ok(key)
}

/// Key/value reads against one runtime.
#[derive(Clone)]
pub struct KeyValueCache {
  runtime: CacheRuntime,
}

impl KeyValueCache {
  pub fn new(runtime: CacheRuntime) -> Self {
    Self { runtime }
  }

  /// The value stored under `key`, fetching it with `request` when it is missing or stale.
  pub async fn get(&self, key: &str, request: FetchRequest) -> Result<Value, CacheError> {
    if self.runtime.is_shut_down() {
      return Err(CacheError::Runtime);
    }

    let store = Arc::new(KeyValueStore::new(key, self.expiration()));
    if let Some(value) = self.read_fresh(Arc::clone(&store)).await {
      return Ok(value);
    }

    let (fetch, started) = self
      .runtime
      .key_value_fetches()
      .join_or_start(key, || self.start_fetch(store, request));
    if !started {
      tracing::debug!(%key, "sharing in-flight key/value fetch");
    }
    fetch.await
  }

  /// The value for a `/api/describe` request.
  pub async fn describe(&self, request: FetchRequest) -> Result<Value, CacheError> {
    let key = describe_key(&request)?;
    self.get(&key, request).await
  }

  fn expiration(&self) -> Duration {
    let secs = self.runtime.config().key_value.expiration_secs;
    i64::try_from(secs)
      .ok()
      .and_then(Duration::try_seconds)
      .unwrap_or(Duration::MAX)
  }

  async fn read_fresh(&self, store: Arc<KeyValueStore>) -> Option<Value> {
    let key = store.key().to_string();
    let result = with_store(Arc::clone(self.runtime.pool()), store, |store, conn| {
      let timing = Timing::start(CATEGORY, "Read", store.key().to_string());
      let value = store.read(conn)?;
      if value.is_some() {
        timing.end();
      } else {
        timing.discard();
      }
      Ok(value)
    })
    .await;

    match result {
      Ok(value) => value,
      Err(err) => {
        tracing::warn!(%key, error = %err, "key/value read failed, fetching instead");
        None
      }
    }
  }

  /// The fetch stays registered until its value is written, so requests arriving in the
  /// meantime share it instead of reading a store that does not have it yet.
  fn start_fetch(&self, store: Arc<KeyValueStore>, request: FetchRequest) -> BoxFuture<'static, Result<Value, CacheError>> {
    let runtime = self.runtime.clone();
    async move {
      let key = store.key().to_string();
      let result = fetch_json(runtime.fetcher().as_ref(), &request, CATEGORY).await;
      match &result {
        Ok(value) => enqueue_entry_write(&runtime, store, value.clone()),
        Err(err) => {
          tracing::warn!(%key, error = %err, "key/value fetch failed");
          runtime.key_value_fetches().finish(&key);
        }
      }
      result
    }
    .boxed()
  }
}

fn enqueue_entry_write(runtime: &CacheRuntime, store: Arc<KeyValueStore>, value: Value) {
  let pool = Arc::clone(runtime.pool());
  let fetches = Arc::clone(runtime.key_value_fetches());
  let label = format!("{}:{}", CATEGORY, store.key());
  runtime.writer().enqueue(PendingWrite::new(label, move || async move {
    let key = store.key().to_string();
    let result = with_store(pool, store, move |store, conn| store.write(conn, &value)).await;
    fetches.finish(&key);
    result
  }));
}
