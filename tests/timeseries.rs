mod helpers;

use std::time::Duration;

use rangecache::range::Range;
use rangecache::resources::TimeseriesCache;
use rangecache::{CacheError, CacheSource, FetchResponse};
use serde_json::json;

use crate::helpers::*;

#[tokio::test]
async fn covered_request_is_served_without_fetching() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  let request = timeseries_request("revision,avg", Some(0), Some(100));
  let first = values(collect(cache.respond_to(request.clone()).unwrap()).await);
  assert_eq!(first.len(), 1);
  assert_eq!(first[0].source, CacheSource::Network);
  assert_eq!(revisions(&first[0].data), (0..=100).step_by(10).collect::<Vec<_>>());
  assert_eq!(first[0].data["units"], "ms_smallerIsBetter");
  runtime.flush().await;

  let second = values(collect(cache.respond_to(request).unwrap()).await);
  assert_eq!(second.len(), 1);
  assert_eq!(second[0].source, CacheSource::Cache);
  assert_eq!(second[0].data, first[0].data);
  assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test]
async fn only_missing_outer_ranges_are_fetched() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 300));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  collect(cache.respond_to(timeseries_request("avg", Some(100), Some(200))).unwrap()).await;
  runtime.flush().await;

  let items = values(collect(cache.respond_to(timeseries_request("avg", Some(0), Some(300))).unwrap()).await);
  assert_eq!(items.len(), 3);
  assert_eq!(items[0].source, CacheSource::Cache);
  assert_eq!(revisions(&items[0].data), (100..=200).step_by(10).collect::<Vec<_>>());
  assert!(items[1..].iter().all(|item| item.source == CacheSource::Network));
  assert_eq!(revisions(&items[2].data), (0..=300).step_by(10).collect::<Vec<_>>());

  let mut bounds: Vec<(Option<String>, Option<String>)> = fetcher.calls_to(TIMESERIES)[1..]
    .iter()
    .map(|r| (r.param("min_revision"), r.param("max_revision")))
    .collect();
  bounds.sort();
  assert_eq!(
    bounds,
    vec![
      (None, Some("99".to_string())),
      (Some("201".to_string()), Some("300".to_string())),
    ]
  );
}

#[tokio::test]
async fn only_uncovered_columns_are_fetched_and_rows_are_merged() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 50));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  collect(cache.respond_to(timeseries_request("avg", Some(0), Some(50))).unwrap()).await;
  runtime.flush().await;

  let items = values(collect(cache.respond_to(timeseries_request("avg,count", Some(0), Some(50))).unwrap()).await);
  let calls = fetcher.calls_to(TIMESERIES);
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[1].param("columns").as_deref(), Some("revision,count"));

  let last = &items.last().unwrap().data;
  assert_eq!(last["data"][2], json!({"revision": 20, "avg": 2.0, "count": 1}));

  runtime.flush().await;
  let snapshot = cache
    .read_range(descriptor(), &["avg", "count"], Range::new(0, 51))
    .await
    .unwrap();
  assert_eq!(snapshot.coverage["count"], vec![Range::new(0, 51)]);
  assert_eq!(snapshot.coverage["avg"], vec![Range::new(0, 51)]);
}

#[tokio::test]
async fn failed_range_is_reported_and_not_persisted() {
  let fetcher = MockFetcher::new().route(TIMESERIES, |_| Ok(FetchResponse::new(500, "boom")));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  let items = collect(cache.respond_to(timeseries_request("avg", Some(0), Some(100))).unwrap()).await;
  assert!(matches!(
    items.as_slice(),
    [Err(CacheError::Status { status: 500, .. })]
  ));
  runtime.flush().await;

  let snapshot = cache
    .read_range(descriptor(), &["avg"], Range::new(0, 101))
    .await
    .unwrap();
  assert!(snapshot.coverage.is_empty());
  assert!(snapshot.data.is_empty());
}

#[tokio::test]
async fn error_payload_is_a_failed_range() {
  let fetcher = MockFetcher::new().json(TIMESERIES, json!({"error": "no such timeseries"}));
  let runtime = runtime(fetcher);
  let cache = TimeseriesCache::new(runtime);

  let items = collect(cache.respond_to(timeseries_request("avg", None, None)).unwrap()).await;
  assert!(matches!(
    items.as_slice(),
    [Err(CacheError::Payload { message, .. })] if message == "no such timeseries"
  ));
}

#[tokio::test]
async fn unbounded_request_covers_up_to_last_row() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  collect(cache.respond_to(timeseries_request("avg", None, None)).unwrap()).await;
  runtime.flush().await;

  let call = &fetcher.calls_to(TIMESERIES)[0];
  assert_eq!(call.param("min_revision"), None);
  assert_eq!(call.param("max_revision"), None);

  let snapshot = cache
    .read_range(descriptor(), &["avg"], Range::from_start(0))
    .await
    .unwrap();
  assert_eq!(snapshot.coverage["avg"], vec![Range::new(0, 101)]);
  assert_eq!(snapshot.metadata["improvement_direction"], "down");
}

#[tokio::test]
async fn inverted_window_yields_one_empty_snapshot() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime);

  let items = values(collect(cache.respond_to(timeseries_request("avg", Some(50), Some(10))).unwrap()).await);
  assert_eq!(items.len(), 1);
  assert_eq!(items[0].source, CacheSource::Cache);
  assert_eq!(items[0].data["data"], json!([]));
  assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_fetch() {
  let fetcher = MockFetcher::new()
    .route(TIMESERIES, timeseries_backend(10, 100))
    .with_latency(Duration::from_millis(100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  let request = timeseries_request("avg,count", Some(0), Some(100));
  let (a, b) = tokio::join!(
    collect(cache.respond_to(request.clone()).unwrap()),
    collect(cache.respond_to(request).unwrap()),
  );
  let (a, b) = (values(a), values(b));
  assert_eq!(fetcher.call_count(), 1);
  assert_eq!(a.last().unwrap().data, b.last().unwrap().data);
}

#[tokio::test]
async fn narrower_request_joins_outstanding_fetch() {
  let fetcher = MockFetcher::new()
    .route(TIMESERIES, timeseries_backend(10, 100))
    .with_latency(Duration::from_millis(100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  let wide = cache
    .respond_to(timeseries_request("avg,count", Some(0), Some(100)))
    .unwrap();
  tokio::time::sleep(Duration::from_millis(20)).await;
  let narrow = cache
    .respond_to(timeseries_request("avg", Some(20), Some(40)))
    .unwrap();

  let (_, narrow) = tokio::join!(collect(wide), collect(narrow));
  let narrow = values(narrow);
  assert_eq!(fetcher.call_count(), 1);
  assert_eq!(revisions(&narrow.last().unwrap().data), vec![20, 30, 40]);
}

#[tokio::test]
async fn repeated_writes_of_the_same_range_are_idempotent() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  // Both reads miss, so both fetch and both queue the same rows.
  collect(cache.respond_to(timeseries_request("avg", Some(0), Some(100))).unwrap()).await;
  collect(cache.respond_to(timeseries_request("avg", Some(0), Some(100))).unwrap()).await;
  assert_eq!(fetcher.call_count(), 2);
  runtime.flush().await;

  let snapshot = cache
    .read_range(descriptor(), &["avg"], Range::new(0, 101))
    .await
    .unwrap();
  assert_eq!(snapshot.revisions(), (0..=100).step_by(10).collect::<Vec<_>>());
  assert_eq!(snapshot.coverage["avg"], vec![Range::new(0, 101)]);
}

#[tokio::test]
async fn refresh_with_no_new_rows_ends_on_a_network_snapshot() {
  let fetcher = MockFetcher::new().route(TIMESERIES, timeseries_backend(10, 100));
  let runtime = runtime(fetcher.clone());
  let cache = TimeseriesCache::new(runtime.clone());

  collect(cache.respond_to(timeseries_request("avg", None, None)).unwrap()).await;
  runtime.flush().await;

  let items = values(collect(cache.respond_to(timeseries_request("avg", None, None)).unwrap()).await);
  let sources: Vec<CacheSource> = items.iter().map(|item| item.source).collect();
  assert_eq!(sources, vec![CacheSource::Cache, CacheSource::Network]);
  assert_eq!(items[1].data, items[0].data);
  assert_eq!(fetcher.call_count(), 2);
  assert_eq!(fetcher.calls_to(TIMESERIES)[1].param("min_revision").as_deref(), Some("101"));
  runtime.flush().await;

  let snapshot = cache
    .read_range(descriptor(), &["avg"], Range::from_start(0))
    .await
    .unwrap();
  assert_eq!(snapshot.coverage["avg"], vec![Range::new(0, 101)]);
}
