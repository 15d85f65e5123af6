#![allow(dead_code)]

// Re-export helpers so tests can `use helpers::*;`
pub mod mock_fetcher;

pub use mock_fetcher::MockFetcher;

use std::sync::Arc;

use futures::StreamExt;
use rangecache::resources::TimeseriesDescriptor;
use rangecache::{CacheResult, CacheRuntime, Config, FetchRequest, FetchResponse, ResultItem, ResultStream};
use serde_json::{json, Value};
use url::Url;

pub const ORIGIN: &str = "https://perf.example.com";
pub const TIMESERIES: &str = "/api/timeseries2";

/// Runtime over in-memory stores with manual flushing and `ORIGIN` as base url.
pub fn runtime(fetcher: Arc<MockFetcher>) -> CacheRuntime {
  let mut config = Config::ephemeral();
  config.http.base_url = Some(ORIGIN.to_string());
  CacheRuntime::init(config, fetcher).unwrap()
}

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn descriptor() -> TimeseriesDescriptor {
  TimeseriesDescriptor::new("speedometer", "RunsPerMinute", "linux-perf")
}

/// Form POST for `columns` of [`descriptor`] over the inclusive bounds.
pub fn timeseries_request(columns: &str, min: Option<u64>, max: Option<u64>) -> FetchRequest {
  let d = descriptor();
  let mut form = vec![
    ("test_suite", d.test_suite),
    ("measurement", d.measurement),
    ("bot", d.bot),
    ("columns", columns.to_string()),
  ];
  if let Some(min) = min {
    form.push(("min_revision", min.to_string()));
  }
  if let Some(max) = max {
    form.push(("max_revision", max.to_string()));
  }
  FetchRequest::post_form(url(TIMESERIES), form)
}

/// Value of `column` at `revision` in the synthetic backend.
pub fn cell(column: &str, revision: u64) -> Value {
  match column {
    "revision" => json!(revision),
    "timestamp" => json!(format!("2020-01-01T00:00:{:02}Z", revision % 60)),
    "count" => json!(1),
    "alert" => json!(format!("alert-{}", revision)),
    _ => json!(revision as f64 / 10.0),
  }
}

/// A timeseries backend with one row every `step` revisions from 0 to `last`: answers
/// `/api/timeseries2` with positional rows for the requested columns and bounds.
pub fn timeseries_backend(step: u64, last: u64) -> impl Fn(&FetchRequest) -> Result<FetchResponse, rangecache::CacheError> {
  move |request| {
    let columns: Vec<String> = request
      .param("columns")
      .unwrap_or_default()
      .split(',')
      .map(str::to_string)
      .collect();
    let min = request.param("min_revision").and_then(|v| v.parse().ok()).unwrap_or(0);
    let max = request.param("max_revision").and_then(|v| v.parse().ok()).unwrap_or(last);
    let data: Vec<Value> = (0..=last)
      .step_by(step as usize)
      .filter(|r| *r >= min && *r <= max)
      .map(|r| Value::Array(columns.iter().map(|c| cell(c, r)).collect()))
      .collect();
    Ok(FetchResponse::ok_json(&json!({
      "units": "ms_smallerIsBetter",
      "improvement_direction": "down",
      "data": data,
    })))
  }
}

/// Collect a result stream to the end.
pub async fn collect(stream: ResultStream) -> Vec<ResultItem> {
  stream.collect().await
}

/// Successful results of a stream, panicking on errors.
pub fn values(items: Vec<ResultItem>) -> Vec<CacheResult<Value>> {
  items.into_iter().map(|item| item.unwrap()).collect()
}

/// Revisions of a snapshot payload's rows.
pub fn revisions(snapshot: &Value) -> Vec<u64> {
  snapshot["data"]
    .as_array()
    .unwrap()
    .iter()
    .map(|row| row["revision"].as_u64().unwrap())
    .collect()
}
