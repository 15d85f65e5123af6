//! Cache layer that races the persisted store against the network.

use color_eyre::{eyre::eyre, Result};
use futures::Stream;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::traits::{CacheResult, ResourceStore};
use super::writer::PendingWrite;
use crate::db::{ConnectionPool, StoreConnection};
use crate::error::CacheError;
use crate::fetch::{fetch_json, FetchRequest};
use crate::runtime::CacheRuntime;
use crate::timing::Timing;

/// One item of a result stream.
pub type ResultItem = Result<CacheResult<Value>, CacheError>;

/// Incremental results of one request.
///
/// Dropping the stream only stops delivery: fetches already started run to completion and
/// their results are still written back.
pub struct ResultStream {
  rx: mpsc::UnboundedReceiver<ResultItem>,
}

impl ResultStream {
  pub(crate) fn channel() -> (mpsc::UnboundedSender<ResultItem>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Wire payloads for the result channel. Failures become `{"error": message}`.
  pub fn payloads(self) -> impl Stream<Item = Value> + Send {
    futures::StreamExt::map(self, |item| match item {
      Ok(result) => result.data,
      Err(err) => json!({"error": err.to_string()}),
    })
  }
}

impl Stream for ResultStream {
  type Item = ResultItem;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}

/// Open (creating or upgrading if needed) the store a resource lives in.
pub(crate) fn open_store<R>(pool: &ConnectionPool, resource: &R) -> Result<Arc<StoreConnection>>
where
  R: ResourceStore + ?Sized,
{
  pool.open(
    &resource.store_name(),
    resource.store_version(),
    &|conn: &Connection, old_version: u32| resource.upgrade_schema(conn, old_version),
  )
}

/// Run `f` against the resource's store on the blocking pool.
pub(crate) async fn with_store<R, T, F>(pool: Arc<ConnectionPool>, resource: Arc<R>, f: F) -> Result<T>
where
  R: ResourceStore,
  T: Send + 'static,
  F: FnOnce(&R, &StoreConnection) -> Result<T> + Send + 'static,
{
  tokio::task::spawn_blocking(move || {
    let store = open_store(&pool, resource.as_ref())?;
    f(resource.as_ref(), store.as_ref())
  })
  .await
  .map_err(|e| eyre!("Store task failed: {}", e))?
}

/// Queue a write of `network` into the resource's store.
pub(crate) fn enqueue_write<R: ResourceStore>(runtime: &CacheRuntime, resource: Arc<R>, network: Value) {
  let pool = Arc::clone(runtime.pool());
  let label = format!("{}:{}", resource.timing_category(), resource.store_name());
  runtime.writer().enqueue(PendingWrite::new(label, move || {
    with_store(pool, resource, move |resource, store| {
      let timing = Timing::start(resource.timing_category(), "Write", store.name());
      resource.write(store, &network)?;
      timing.end();
      Ok(())
    })
  }));
}

/// The generic engine: yields the persisted value (if any), then the network value, then
/// queues the network value for write-back.
#[derive(Clone)]
pub struct CacheLayer {
  runtime: CacheRuntime,
}

impl CacheLayer {
  pub fn new(runtime: CacheRuntime) -> Self {
    Self { runtime }
  }

  /// Start racing `resource`'s store against `request`.
  ///
  /// At most one network fetch is issued. A cached value, when present, is always yielded
  /// before the network value even if the network answered first. The network value is
  /// always yielded and written back exactly once; a network failure ends the stream with
  /// an error and writes nothing. Store faults only turn the read into a miss.
  pub fn respond<R: ResourceStore>(&self, resource: R, request: FetchRequest) -> ResultStream {
    let (tx, stream) = ResultStream::channel();
    let runtime = self.runtime.clone();
    let resource = Arc::new(resource);

    tokio::spawn(async move {
      if runtime.is_shut_down() {
        let _ = tx.send(Err(CacheError::Runtime));
        return;
      }

      let category = resource.timing_category();
      let fetcher = Arc::clone(runtime.fetcher());
      let network_request = request.clone();
      let network = tokio::spawn(async move {
        fetch_json(fetcher.as_ref(), &network_request, category).await
      });

      if let Some(cached) = read_cache(&runtime, Arc::clone(&resource)).await {
        // A closed receiver just means nobody is listening anymore.
        let _ = tx.send(Ok(CacheResult::from_cache(cached)));
      }

      let result = network.await.unwrap_or_else(|e| {
        Err(CacheError::Network {
          url: request.url().to_string(),
          message: e.to_string(),
        })
      });

      match result {
        Ok(value) => {
          let _ = tx.send(Ok(CacheResult::from_network(value.clone())));
          enqueue_write(&runtime, resource, value);
        }
        Err(err) => {
          tracing::warn!(url = %request.url(), error = %err, "network fetch failed");
          let _ = tx.send(Err(err));
        }
      }
    });

    stream
  }
}

async fn read_cache<R: ResourceStore>(runtime: &CacheRuntime, resource: Arc<R>) -> Option<Value> {
  let name = resource.store_name();
  let result = with_store(Arc::clone(runtime.pool()), resource, |resource, store| {
    let timing = Timing::start(resource.timing_category(), "Read", store.name());
    let value = resource.read(store)?;
    if value.is_some() {
      timing.end();
    } else {
      timing.discard();
    }
    Ok(value)
  })
  .await;

  match result {
    Ok(Some(value)) => {
      tracing::debug!(store = %name, "cache hit");
      Some(value)
    }
    Ok(None) => {
      tracing::debug!(store = %name, "cache miss");
      None
    }
    Err(err) => {
      tracing::warn!(store = %name, error = %err, "cache read failed, continuing with network only");
      None
    }
  }
}
