mod helpers;

use std::time::Duration;

use rangecache::db::store_file_name;
use rangecache::resources::ReportCache;
use rangecache::{CacheError, CacheRuntime, CacheSource, Config, FetchRequest, ReportQuery};
use serde_json::{json, Value};
use url::Url;

use crate::helpers::*;

const REPORT: &str = "/api/report/generate";

fn report_payload(avg: f64) -> Value {
  json!({
    "name": "Speed",
    "owners": ["owner@example.com"],
    "editable": true,
    "internal": false,
    "report": {
      "statistics": ["avg", "std"],
      "rows": [
        {"label": "Loading", "units": "ms", "data": {"100": {"avg": avg}, "200": {"avg": avg * 2.0}}},
      ],
    },
  })
}

fn report_request(revisions: &[&str]) -> FetchRequest {
  ReportQuery::new(7, 1_600_000_000_000, revisions.iter().copied())
    .request(&Url::parse(ORIGIN).unwrap())
    .unwrap()
}

#[tokio::test]
async fn cached_value_comes_first_even_when_network_is_faster() {
  let fetcher = MockFetcher::new().json(REPORT, report_payload(1.0));
  let runtime = runtime(fetcher.clone());
  let reports = ReportCache::new(runtime.clone());

  let first = values(collect(reports.respond_to(report_request(&["100"])).unwrap()).await);
  assert_eq!(first.len(), 1);
  assert_eq!(first[0].source, CacheSource::Network);
  assert_eq!(runtime.flush().await.executed, 1);

  fetcher.json(REPORT, report_payload(5.0));
  let second = values(collect(reports.respond_to(report_request(&["100"])).unwrap()).await);
  let sources: Vec<CacheSource> = second.iter().map(|r| r.source).collect();
  assert_eq!(sources, vec![CacheSource::Cache, CacheSource::Network]);
  assert_eq!(second[0].data["report"]["rows"][0]["data"]["100"]["avg"], 1.0);
  assert_eq!(second[1].data["report"]["rows"][0]["data"]["100"]["avg"], 5.0);
  assert_eq!(fetcher.call_count(), 2);
}

#[tokio::test]
async fn every_network_result_is_written_back_once() {
  let fetcher = MockFetcher::new()
    .json(REPORT, report_payload(1.0))
    .with_latency(Duration::from_millis(30));
  let runtime = runtime(fetcher);
  let reports = ReportCache::new(runtime.clone());

  collect(reports.respond_to(report_request(&["100"])).unwrap()).await;
  collect(reports.respond_to(report_request(&["200"])).unwrap()).await;
  assert_eq!(runtime.writer().len(), 2);
  let report = runtime.flush().await;
  assert_eq!((report.executed, report.failed), (2, 0));
  assert!(runtime.writer().is_empty());
}

#[tokio::test]
async fn network_failure_after_cache_hit_ends_with_error() {
  let fetcher = MockFetcher::new().json(REPORT, report_payload(1.0));
  let runtime = runtime(fetcher.clone());
  let reports = ReportCache::new(runtime.clone());
  collect(reports.respond_to(report_request(&["200"])).unwrap()).await;
  runtime.flush().await;

  fetcher.route(REPORT, |request| {
    Err(CacheError::Network {
      url: request.url().to_string(),
      message: "connection reset".to_string(),
    })
  });
  let items = collect(reports.respond_to(report_request(&["200"])).unwrap()).await;
  assert_eq!(items.len(), 2);
  assert_eq!(items[0].as_ref().unwrap().source, CacheSource::Cache);
  assert!(matches!(&items[1], Err(err) if err.is_network()));
  assert!(runtime.writer().is_empty());
}

#[tokio::test]
async fn missing_report_parameters_are_rejected() {
  let runtime = runtime(MockFetcher::new());
  let reports = ReportCache::new(runtime);
  let request = FetchRequest::post_form(url(REPORT), [("id", "7")]);
  assert!(matches!(
    reports.respond_to(request),
    Err(CacheError::InvalidRequest(_))
  ));
}

#[tokio::test]
async fn requests_after_shutdown_fail() {
  let fetcher = MockFetcher::new().json(REPORT, report_payload(1.0));
  let runtime = runtime(fetcher.clone());
  runtime.shutdown().await.unwrap();

  let items = collect(ReportCache::new(runtime).respond_to(report_request(&["100"])).unwrap()).await;
  assert_eq!(items, vec![Err(CacheError::Runtime)]);
  assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn unreadable_store_falls_back_to_network() {
  let dir = tempfile::tempdir().unwrap();
  let conn = rusqlite::Connection::open(dir.path().join(store_file_name("report/7"))).unwrap();
  conn.pragma_update(None, "user_version", 99).unwrap();
  drop(conn);

  let mut config = Config::ephemeral();
  config.store.in_memory = false;
  config.store.data_dir = Some(dir.path().to_path_buf());
  config.http.base_url = Some(ORIGIN.to_string());
  let fetcher = MockFetcher::new().json(REPORT, report_payload(1.0));
  let runtime = CacheRuntime::init(config, fetcher.clone()).unwrap();

  let items = values(collect(ReportCache::new(runtime.clone()).respond_to(report_request(&["100"])).unwrap()).await);
  let sources: Vec<CacheSource> = items.iter().map(|item| item.source).collect();
  assert_eq!(sources, vec![CacheSource::Network]);
  assert_eq!(items[0].data["report"]["rows"][0]["data"]["100"]["avg"], 1.0);
  assert_eq!(fetcher.call_count(), 1);
  assert_eq!(runtime.writer().len(), 1);
}
