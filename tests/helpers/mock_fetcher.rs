#![allow(dead_code)]
#![allow(clippy::type_complexity)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rangecache::{CacheError, FetchRequest, FetchResponse, Fetcher};
use serde_json::Value;

type Responder = Arc<dyn Fn(&FetchRequest) -> Result<FetchResponse, CacheError> + Send + Sync>;

/// Scripted network used by integration tests.
///
/// Responses are chosen by request path. Every request is recorded before the optional
/// latency, so tests can inspect what went out while it is still in flight.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<Vec<(String, Responder)>>,
  calls: Mutex<Vec<FetchRequest>>,
  latency: Mutex<Duration>,
}

impl MockFetcher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Answer requests for `path` with `responder`. Later routes for the same path win.
  pub fn route<F>(self: &Arc<Self>, path: &str, responder: F) -> Arc<Self>
  where
    F: Fn(&FetchRequest) -> Result<FetchResponse, CacheError> + Send + Sync + 'static,
  {
    self
      .routes
      .lock()
      .unwrap()
      .insert(0, (path.to_string(), Arc::new(responder)));
    Arc::clone(self)
  }

  /// Always answer `path` with `value`.
  pub fn json(self: &Arc<Self>, path: &str, value: Value) -> Arc<Self> {
    self.route(path, move |_| Ok(FetchResponse::ok_json(&value)))
  }

  pub fn with_latency(self: &Arc<Self>, latency: Duration) -> Arc<Self> {
    *self.latency.lock().unwrap() = latency;
    Arc::clone(self)
  }

  pub fn calls(&self) -> Vec<FetchRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, path: &str) -> Vec<FetchRequest> {
    self
      .calls()
      .into_iter()
      .filter(|r| r.path() == path)
      .collect()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError> {
    self.calls.lock().unwrap().push(request.clone());
    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    let responder = self
      .routes
      .lock()
      .unwrap()
      .iter()
      .find(|(path, _)| path == request.path())
      .map(|(_, responder)| Arc::clone(responder));
    match responder {
      Some(responder) => responder(request),
      None => Ok(FetchResponse::new(404, "not found")),
    }
  }
}
