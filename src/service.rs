//! Request interception: decides which outgoing requests the cache answers and starts
//! streaming their results to the request's channel.

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::ResultStream;
use crate::channel::{ChannelHub, ResultSender};
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::resources::{describe_key, KeyValueCache, ReportCache, SessionIdCache, TimeseriesCache};
use crate::runtime::CacheRuntime;

pub const DESCRIBE_PATH: &str = "/api/describe";
pub const REPORT_PATH: &str = "/api/report/generate";
pub const TIMESERIES_PATH: &str = "/api/timeseries2";
pub const SESSION_ID_PATH: &str = "/short_uri";

/// A request the cache took over.
pub struct Intercepted {
  /// Channel the results are published to
  pub channel: String,
  /// Immediate answer to the requester. Results arrive on the channel.
  pub response: BoxFuture<'static, Result<Value, CacheError>>,
  /// Background task publishing to the channel
  pub task: JoinHandle<()>,
}

/// Routes intercepted requests to the resource caches of one runtime.
#[derive(Clone)]
pub struct FetchRouter {
  runtime: CacheRuntime,
  timeseries: TimeseriesCache,
  reports: ReportCache,
  key_values: KeyValueCache,
  sessions: SessionIdCache,
}

impl FetchRouter {
  pub fn new(runtime: CacheRuntime) -> Self {
    Self {
      timeseries: TimeseriesCache::new(runtime.clone()),
      reports: ReportCache::new(runtime.clone()),
      key_values: KeyValueCache::new(runtime.clone()),
      sessions: SessionIdCache::new(runtime.clone()),
      runtime,
    }
  }

  pub fn runtime(&self) -> &CacheRuntime {
    &self.runtime
  }

  /// Take over `request` if its path is one the cache handles. `Ok(None)` means the
  /// request should go to the network untouched.
  pub fn intercept(&self, request: FetchRequest) -> Result<Option<Intercepted>, CacheError> {
    let channel = request.channel_name();
    let path = request.path().to_string();
    let intercepted = match path.as_str() {
      TIMESERIES_PATH => {
        let stream = self.timeseries.respond_to(request)?;
        self.streamed(channel, stream, Value::Null)
      }
      REPORT_PATH => {
        let stream = self.reports.respond_to(request)?;
        self.streamed(channel, stream, Value::Null)
      }
      SESSION_ID_PATH => {
        let (sid, stream) = self.sessions.respond_to(request)?;
        self.streamed(channel, stream, json!({ "sid": sid }))
      }
      DESCRIBE_PATH => {
        describe_key(&request)?;
        self.describe(channel, request)
      }
      path => {
        tracing::trace!(%path, "not intercepted");
        return Ok(None);
      }
    };
    tracing::debug!(channel = %intercepted.channel, "intercepted request");
    Ok(Some(intercepted))
  }

  fn streamed(&self, channel: String, stream: ResultStream, placeholder: Value) -> Intercepted {
    let task = tokio::spawn(broadcast(
      Arc::clone(self.runtime.hub()),
      channel.clone(),
      stream,
    ));
    Intercepted {
      channel,
      response: future::ready(Ok(placeholder)).boxed(),
      task,
    }
  }

  /// Describe answers directly with the value; the channel gets it too.
  fn describe(&self, channel: String, request: FetchRequest) -> Intercepted {
    let key_values = self.key_values.clone();
    let value = async move { key_values.describe(request).await }.boxed().shared();

    let hub = Arc::clone(self.runtime.hub());
    let name = channel.clone();
    let published = value.clone();
    let task = tokio::spawn(async move {
      let payload = match published.await {
        Ok(value) => value,
        Err(err) => json!({ "error": err.to_string() }),
      };
      ResultSender::new(&hub, name)
        .send(futures::stream::iter([payload]))
        .await;
    });

    Intercepted {
      channel,
      response: value.boxed(),
      task,
    }
  }
}

async fn broadcast(hub: Arc<ChannelHub>, channel: String, stream: ResultStream) {
  ResultSender::new(&hub, channel).send(stream.payloads()).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::fetch::{FetchResponse, Fetcher};
  use async_trait::async_trait;
  use url::Url;

  struct Unreachable;

  #[async_trait]
  impl Fetcher for Unreachable {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError> {
      Err(CacheError::Network {
        url: request.url().to_string(),
        message: "unreachable".to_string(),
      })
    }
  }

  fn router() -> FetchRouter {
    FetchRouter::new(CacheRuntime::init(Config::ephemeral(), Arc::new(Unreachable)).unwrap())
  }

  #[tokio::test]
  async fn unknown_paths_are_not_intercepted() {
    let request = FetchRequest::get(Url::parse("https://perf.example.com/api/alerts").unwrap());
    assert!(router().intercept(request).unwrap().is_none());
  }

  #[tokio::test]
  async fn invalid_requests_are_rejected_up_front() {
    let request = FetchRequest::get(Url::parse("https://perf.example.com/api/timeseries2").unwrap());
    assert!(matches!(
      router().intercept(request),
      Err(CacheError::InvalidRequest(_))
    ));
  }

  #[tokio::test]
  async fn describe_failures_reach_the_requester() {
    let request = FetchRequest::post_form(
      Url::parse("https://perf.example.com/api/describe").unwrap(),
      [("test_suite", "speedometer")],
    );
    let intercepted = router().intercept(request).unwrap().unwrap();
    assert!(matches!(
      intercepted.response.await,
      Err(CacheError::Network { .. })
    ));
    intercepted.task.await.unwrap();
  }
}
