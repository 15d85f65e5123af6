//! Session ids for `/short_uri`.
//!
//! A session id is derived from the page state, so the caller gets it back before the
//! server has been asked. The server is only told about ids it has not seen from us yet.

use chrono::Utc;
use color_eyre::Result;
use reqwest::Method;
use rusqlite::Connection;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::cache::{with_store, CacheResult, KeyedTable, PendingWrite, ResourceStore, ResultStream};
use crate::db::StoreConnection;
use crate::error::CacheError;
use crate::fetch::{fetch_json, FetchRequest};
use crate::runtime::CacheRuntime;

const CATEGORY: &str = "SessionId";
const STORE_NAME: &str = "short_uri";
const STORE_VERSION: u32 = 1;

const SIDS: KeyedTable = KeyedTable::new("sids");

/// Hex SHA-256 of the page state.
pub fn session_id(page_state: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(page_state.as_bytes());
  hex::encode(hasher.finalize())
}

/// One session id in the `short_uri` store. Stored values are the time the id was last
/// used.
#[derive(Debug, Clone)]
pub struct SessionIdStore {
  sid: String,
}

impl SessionIdStore {
  pub fn new(sid: impl Into<String>) -> Self {
    Self { sid: sid.into() }
  }

  pub fn sid(&self) -> &str {
    &self.sid
  }
}

impl ResourceStore for SessionIdStore {
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
      SIDS.create(conn)?;
    }
    Ok(())
  }

  fn read(&self, store: &StoreConnection) -> Result<Option<Value>> {
    let used: Option<String> = store.with_conn(|conn| SIDS.get(conn, &self.sid))?;
    Ok(used.map(|_| json!({ "sid": self.sid })))
  }

  fn write(&self, store: &StoreConnection, _network: &Value) -> Result<()> {
    store.transaction(|conn| SIDS.put(conn, &self.sid, &Utc::now().to_rfc3339()))
  }
}

/// Session id requests against one runtime.
#[derive(Clone)]
pub struct SessionIdCache {
  runtime: CacheRuntime,
}

impl SessionIdCache {
  pub fn new(runtime: CacheRuntime) -> Self {
    Self { runtime }
  }

  /// Compute the session id of a `POST /short_uri` request and start making sure the
  /// server knows it.
  ///
  /// The stream yields `{"sid": ...}` once: from the cache when the id is already known
  /// (stored or being registered), otherwise from the network after the server confirmed
  /// the same id. A server disagreeing about the id is a [`CacheError::Payload`].
  pub fn respond_to(&self, fetch: FetchRequest) -> Result<(String, ResultStream), CacheError> {
    if *fetch.method() != Method::POST {
      return Err(CacheError::InvalidRequest(format!(
        "session ids are only created by POST, not {}",
        fetch.method()
      )));
    }
    let page_state = fetch
      .param("page_state")
      .ok_or_else(|| CacheError::InvalidRequest("page_state is not specified".to_string()))?;
    let sid = session_id(&page_state);

    let (tx, stream) = ResultStream::channel();
    let runtime = self.runtime.clone();
    let store = Arc::new(SessionIdStore::new(sid.clone()));
    tokio::spawn(async move {
      if runtime.is_shut_down() {
        let _ = tx.send(Err(CacheError::Runtime));
        return;
      }
      let _ = tx.send(register(&runtime, store, &fetch).await);
    });
    Ok((sid, stream))
  }
}

async fn register(
  runtime: &CacheRuntime,
  store: Arc<SessionIdStore>,
  fetch: &FetchRequest,
) -> Result<CacheResult<Value>, CacheError> {
  let sid = store.sid().to_string();
  let placeholder = json!({ "sid": sid });

  // Claiming the sid as pending is the check: only the first request for it goes out.
  let known = runtime.is_pending_sid(&sid)
    || is_stored(runtime, Arc::clone(&store)).await
    || !runtime.add_pending_sid(&sid);
  if known {
    tracing::debug!(%sid, "session id already known");
    enqueue_touch(runtime, store);
    return Ok(CacheResult::from_cache(placeholder));
  }

  let confirmed = fetch_json(runtime.fetcher().as_ref(), fetch, CATEGORY)
    .await
    .and_then(|response| match response.get("sid").and_then(Value::as_str) {
      Some(server) if server == sid => Ok(()),
      other => Err(CacheError::payload(
        fetch.url().as_str(),
        format!("server session id {:?} does not match {}", other, sid),
      )),
    });

  match confirmed {
    Ok(()) => {
      enqueue_touch(runtime, store);
      Ok(CacheResult::from_network(placeholder))
    }
    Err(err) => {
      tracing::warn!(%sid, error = %err, "session id was not registered");
      runtime.remove_pending_sid(&sid);
      Err(err)
    }
  }
}

async fn is_stored(runtime: &CacheRuntime, store: Arc<SessionIdStore>) -> bool {
  let result = with_store(Arc::clone(runtime.pool()), store, |store, conn| store.read(conn)).await;
  match result {
    Ok(value) => value.is_some(),
    Err(err) => {
      tracing::warn!(error = %err, "session id lookup failed");
      false
    }
  }
}

/// Record that the sid was used. It stops being pending once written.
fn enqueue_touch(runtime: &CacheRuntime, store: Arc<SessionIdStore>) {
  let pool = Arc::clone(runtime.pool());
  let owner = runtime.clone();
  let label = format!("{}:{}", CATEGORY, store.sid());
  runtime.writer().enqueue(PendingWrite::new(label, move || async move {
    let sid = store.sid().to_string();
    let result = with_store(pool, store, |store, conn| store.write(conn, &Value::Null)).await;
    owner.remove_pending_sid(&sid);
    result
  }));
}
