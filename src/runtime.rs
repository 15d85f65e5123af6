//! The explicitly constructed owner of everything the cache shares across requests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{CacheLayer, FlushHandle, FlushReport, WritingQueue};
use crate::channel::{ChannelHub, ResultListener};
use crate::config::Config;
use crate::db::{ConnectionPool, StoreLocation};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::resources::key_value::KeyValueFetches;
use crate::resources::timeseries::TimeseriesFetches;

struct RuntimeInner {
  config: Config,
  base_url: Option<Url>,
  pool: Arc<ConnectionPool>,
  writer: WritingQueue,
  hub: Arc<ChannelHub>,
  fetcher: Arc<dyn Fetcher>,
  timeseries_fetches: Arc<TimeseriesFetches>,
  key_value_fetches: Arc<KeyValueFetches>,
  pending_sids: Mutex<HashSet<String>>,
  shut_down: AtomicBool,
}

/// Connection pool, writing queue, channel hub, network primitive and in-flight request
/// bookkeeping for one cache instance. Cloning shares the instance.
#[derive(Clone)]
pub struct CacheRuntime {
  inner: Arc<RuntimeInner>,
}

impl CacheRuntime {
  /// Build a runtime from configuration and the network primitive to use.
  pub fn init(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
    let location = if config.store.in_memory {
      StoreLocation::Memory
    } else {
      StoreLocation::Directory(config.data_dir()?)
    };

    let base_url = config
      .http
      .base_url
      .as_deref()
      .map(Url::parse)
      .transpose()
      .map_err(|e| eyre!("Invalid http.base_url: {}", e))?;

    let writer = WritingQueue::new(config.writer.delay());
    writer.set_automatic(config.writer.automatic);

    tracing::info!(location = ?location, automatic_writes = config.writer.automatic, "cache runtime started");

    Ok(Self {
      inner: Arc::new(RuntimeInner {
        base_url,
        pool: Arc::new(ConnectionPool::new(location)),
        writer,
        hub: Arc::new(ChannelHub::new()),
        fetcher,
        timeseries_fetches: Arc::new(TimeseriesFetches::default()),
        key_value_fetches: Arc::new(KeyValueFetches::default()),
        pending_sids: Mutex::new(HashSet::new()),
        shut_down: AtomicBool::new(false),
        config,
      }),
    })
  }

  /// Build a runtime that talks to the network over HTTP.
  pub fn with_http(config: Config) -> Result<Self> {
    let fetcher = HttpFetcher::new()?;
    Self::init(config, Arc::new(fetcher))
  }

  /// Flush every queued write, then close all pooled connections.
  ///
  /// Requests started after this return [`CacheError::Runtime`](crate::CacheError::Runtime).
  pub async fn shutdown(&self) -> Result<FlushReport> {
    self.inner.shut_down.store(true, Ordering::SeqCst);
    let report = self.inner.writer.flush().await;
    self.inner.pool.close_all()?;
    tracing::info!(
      writes = report.executed,
      failed = report.failed,
      "cache runtime shut down"
    );
    Ok(report)
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.shut_down.load(Ordering::SeqCst)
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  /// Origin relative request urls are resolved against.
  pub fn base_url(&self) -> Option<&Url> {
    self.inner.base_url.as_ref()
  }

  pub fn pool(&self) -> &Arc<ConnectionPool> {
    &self.inner.pool
  }

  pub fn writer(&self) -> &WritingQueue {
    &self.inner.writer
  }

  pub fn hub(&self) -> &Arc<ChannelHub> {
    &self.inner.hub
  }

  pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
    &self.inner.fetcher
  }

  /// The generic race-and-write-back engine bound to this runtime.
  pub fn layer(&self) -> CacheLayer {
    CacheLayer::new(self.clone())
  }

  /// Subscribe to a result channel of this runtime.
  pub fn listen(&self, channel: &str) -> ResultListener {
    ResultListener::new(Some(&self.inner.hub), channel)
  }

  /// Run every queued write now.
  pub fn flush(&self) -> FlushHandle {
    self.inner.writer.flush()
  }

  /// Close the pooled connection for `name` and delete the store. Test-only in practice.
  pub fn delete_store(&self, name: &str) -> Result<()> {
    self.inner.pool.delete(name)
  }

  pub(crate) fn timeseries_fetches(&self) -> &Arc<TimeseriesFetches> {
    &self.inner.timeseries_fetches
  }

  pub(crate) fn key_value_fetches(&self) -> &Arc<KeyValueFetches> {
    &self.inner.key_value_fetches
  }

  /// Mark `sid` as waiting for the server. Returns false if it already was.
  pub(crate) fn add_pending_sid(&self, sid: &str) -> bool {
    self
      .inner
      .pending_sids
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(sid.to_string())
  }

  pub(crate) fn is_pending_sid(&self, sid: &str) -> bool {
    self
      .inner
      .pending_sids
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains(sid)
  }

  pub(crate) fn remove_pending_sid(&self, sid: &str) {
    self
      .inner
      .pending_sids
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(sid);
  }
}
