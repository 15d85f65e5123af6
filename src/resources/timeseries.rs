//! Range-aware reconciliation of timeseries.
//!
//! A timeseries store keeps three tables:
//!
//! - `data`: one row per revision, a JSON object of column → value. Writes merge fields
//!   into the existing row instead of replacing it.
//! - `ranges`: per column, the sorted and coalesced list of revision ranges for which that
//!   column is fully known.
//! - `metadata`: values that do not vary by revision (`units`, `improvement_direction`,
//!   the last access time).
//!
//! A request for columns C over a window only fetches the sub-ranges of the window that are
//! not covered for every column of C, one fetch per missing sub-range, all concurrently.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Method;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::cache::{
  enqueue_write, shallow_merge, with_store, CacheResult, Fields, KeyedTable, PendingWrite,
  ResourceStore, ResultItem, ResultStream, RevisionTable,
};
use crate::db::StoreConnection;
use crate::error::CacheError;
use crate::fetch::{fetch_json, FetchRequest};
use crate::range::{self, Range};
use crate::runtime::CacheRuntime;
use crate::timing::Timing;

const CATEGORY: &str = "Timeseries";
const STORE_VERSION: u32 = 1;

const DATA: RevisionTable = RevisionTable::new("data");
const RANGES: KeyedTable = KeyedTable::new("ranges");
const METADATA: KeyedTable = KeyedTable::new("metadata");

/// Column every row is keyed by. It is always requested and never gets a range entry.
pub const REVISION: &str = "revision";

/// Metadata key holding the last time the timeseries was requested (RFC 3339).
pub const ACCESS_TIME_KEY: &str = "_accessTime";

/// Key of the row array in payloads and snapshots.
const DATA_KEY: &str = "data";

/// Identity of one timeseries. Only used to name its store, never as a row key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TimeseriesDescriptor {
  pub test_suite: String,
  pub measurement: String,
  pub bot: String,
  pub test_case: String,
  pub build_type: String,
}

impl TimeseriesDescriptor {
  pub fn new(
    test_suite: impl Into<String>,
    measurement: impl Into<String>,
    bot: impl Into<String>,
  ) -> Self {
    Self {
      test_suite: test_suite.into(),
      measurement: measurement.into(),
      bot: bot.into(),
      ..Self::default()
    }
  }

  pub fn with_test_case(mut self, test_case: impl Into<String>) -> Self {
    self.test_case = test_case.into();
    self
  }

  pub fn with_build_type(mut self, build_type: impl Into<String>) -> Self {
    self.build_type = build_type.into();
    self
  }

  pub fn store_name(&self) -> String {
    format!(
      "timeseries/{}/{}/{}/{}/{}",
      self.test_suite, self.measurement, self.bot, self.test_case, self.build_type
    )
  }
}

/// Columns of one timeseries over an inclusive revision window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeseriesRequest {
  pub descriptor: TimeseriesDescriptor,
  pub statistic: Option<String>,
  /// Requested columns; `revision` always comes first.
  pub columns: Vec<String>,
  pub min_revision: Option<u64>,
  pub max_revision: Option<u64>,
}

impl TimeseriesRequest {
  pub fn new<I, S>(descriptor: TimeseriesDescriptor, columns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      descriptor,
      statistic: None,
      columns: normalize_columns(columns.into_iter().map(Into::into)),
      min_revision: None,
      max_revision: None,
    }
  }

  pub fn with_statistic(mut self, statistic: impl Into<String>) -> Self {
    self.statistic = Some(statistic.into());
    self
  }

  pub fn with_min_revision(mut self, min_revision: u64) -> Self {
    self.min_revision = Some(min_revision);
    self
  }

  pub fn with_max_revision(mut self, max_revision: u64) -> Self {
    self.max_revision = Some(max_revision);
    self
  }

  /// Parse the parameters of an intercepted request (query string or form body).
  pub fn from_fetch(request: &FetchRequest) -> Result<Self, CacheError> {
    let columns = request
      .param("columns")
      .filter(|c| !c.trim().is_empty())
      .ok_or_else(|| CacheError::InvalidRequest("columns was not specified".to_string()))?;
    let text = |name: &str| request.param(name).unwrap_or_default();
    // Unparsable bounds are treated as absent.
    let revision = |name: &str| request.param(name).and_then(|v| v.trim().parse::<u64>().ok());

    Ok(Self {
      descriptor: TimeseriesDescriptor {
        test_suite: text("test_suite"),
        measurement: text("measurement"),
        bot: text("bot"),
        test_case: text("test_case"),
        build_type: text("build_type"),
      },
      statistic: request.param("statistic").filter(|s| !s.is_empty()),
      columns: normalize_columns(columns.split(',').map(|c| c.trim().to_string())),
      min_revision: revision("min_revision"),
      max_revision: revision("max_revision"),
    })
  }

  /// Half-open revision window of the request.
  pub fn window(&self) -> Range {
    Range::from_inclusive(self.min_revision, self.max_revision)
  }

  fn value_columns(&self) -> impl Iterator<Item = &String> {
    self.columns.iter().filter(|c| c.as_str() != REVISION)
  }

  /// Columns that still need the network: every column not covered for the whole window,
  /// plus `revision`.
  fn columns_to_fetch(&self, coverage: &BTreeMap<String, Vec<Range>>) -> Vec<String> {
    let window = self.window();
    self
      .columns
      .iter()
      .filter(|column| {
        column.as_str() == REVISION
          || !coverage
            .get(column.as_str())
            .is_some_and(|ranges| range::covers(ranges, &window))
      })
      .cloned()
      .collect()
  }

  /// The network request for `columns` over `range`, shaped like `original`.
  fn range_request(&self, original: &FetchRequest, columns: &[String], range: Range) -> FetchRequest {
    let descriptor = &self.descriptor;
    let mut params = vec![
      ("test_suite".to_string(), descriptor.test_suite.clone()),
      ("measurement".to_string(), descriptor.measurement.clone()),
      ("bot".to_string(), descriptor.bot.clone()),
      ("build_type".to_string(), descriptor.build_type.clone()),
      ("columns".to_string(), columns.join(",")),
    ];
    if !descriptor.test_case.is_empty() {
      params.push(("test_case".to_string(), descriptor.test_case.clone()));
    }
    if let Some(statistic) = &self.statistic {
      params.push(("statistic".to_string(), statistic.clone()));
    }
    if range.start() > 0 {
      params.push(("min_revision".to_string(), range.start().to_string()));
    }
    if let (false, Some(last)) = (range.is_unbounded(), range.last()) {
      params.push(("max_revision".to_string(), last.to_string()));
    }

    let mut url = original.url().clone();
    url.set_query(None);
    url.set_fragment(None);
    let mut request = if *original.method() == Method::POST {
      FetchRequest::post_form(url, params)
    } else {
      url.query_pairs_mut().extend_pairs(&params);
      FetchRequest::new(original.method().clone(), url)
    };
    for (name, value) in original.headers() {
      request = request.with_header(name.clone(), value.clone());
    }
    request
  }
}

/// Deduplicate columns and put `revision` first.
fn normalize_columns(columns: impl Iterator<Item = String>) -> Vec<String> {
  let mut out = vec![REVISION.to_string()];
  for column in columns {
    if !column.is_empty() && !out.contains(&column) {
      out.push(column);
    }
  }
  out
}

/// Persisted state of a timeseries restricted to a window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeseriesSnapshot {
  /// Rows in the window, in revision order
  pub data: Vec<Fields>,
  /// Whole-resource fields
  pub metadata: Fields,
  /// Covered sub-ranges of the window, per requested column that has any
  pub coverage: BTreeMap<String, Vec<Range>>,
}

impl TimeseriesSnapshot {
  /// Revisions of the rows, in order.
  pub fn revisions(&self) -> Vec<u64> {
    self.data.iter().filter_map(row_revision).collect()
  }

  /// Result payload: metadata fields plus `data`. Coverage and access time stay internal.
  pub fn to_value(&self) -> Value {
    snapshot_value(&self.metadata, &self.data)
  }
}

fn snapshot_value(metadata: &Fields, data: &[Fields]) -> Value {
  let mut object = metadata.clone();
  object.remove(ACCESS_TIME_KEY);
  object.insert(
    DATA_KEY.to_string(),
    Value::Array(data.iter().cloned().map(Value::Object).collect()),
  );
  Value::Object(object)
}

/// Revision of a row, if it has a valid one.
pub fn row_revision(row: &Fields) -> Option<u64> {
  row.get(REVISION)?.as_u64()
}

/// Merge `rows` into `merged`, which is sorted by revision without duplicates.
///
/// Each row is placed by binary search. A row whose revision is already present has its
/// fields merged into the existing row; fields missing from the new row are kept.
pub fn merge_rows<'a>(merged: &mut Vec<Fields>, rows: impl IntoIterator<Item = &'a Fields>) {
  for row in rows {
    let Some(revision) = row_revision(row) else {
      continue;
    };
    match merged.binary_search_by_key(&revision, |entry| row_revision(entry).unwrap_or(0)) {
      Ok(index) => shallow_merge(&mut merged[index], row),
      Err(index) => merged.insert(index, row.clone()),
    }
  }
}

fn payload_rows(payload: &Fields) -> impl Iterator<Item = &Fields> {
  payload
    .get(DATA_KEY)
    .and_then(Value::as_array)
    .into_iter()
    .flatten()
    .filter_map(Value::as_object)
}

/// Turn a network payload into a mergeable one: rows become column → value objects
/// sorted by revision. Error payloads and payloads without a `data` array are failures.
fn normalize_payload(payload: Value, columns: &[String], url: &str) -> Result<Fields, CacheError> {
  let Value::Object(mut fields) = payload else {
    return Err(CacheError::payload(url, "expected a JSON object"));
  };
  if let Some(error) = fields.get("error") {
    let message = error
      .as_str()
      .map(str::to_string)
      .unwrap_or_else(|| error.to_string());
    return Err(CacheError::payload(url, message));
  }
  let rows = match fields.remove(DATA_KEY) {
    Some(Value::Array(rows)) => rows,
    _ => return Err(CacheError::payload(url, "missing data")),
  };

  let mut rows: Vec<Fields> = rows
    .into_iter()
    .filter_map(|row| match row {
      Value::Array(values) => Some(columns.iter().cloned().zip(values).collect::<Fields>()),
      Value::Object(fields) => Some(fields),
      _ => None,
    })
    .filter(|row| row_revision(row).is_some())
    .collect();
  rows.sort_by_key(|row| row_revision(row).unwrap_or(0));

  fields.insert(
    DATA_KEY.to_string(),
    Value::Array(rows.into_iter().map(Value::Object).collect()),
  );
  Ok(fields)
}

/// Keep only the rows of `payload` inside `range`.
fn restrict(mut payload: Fields, range: &Range) -> Fields {
  if let Some(Value::Array(rows)) = payload.get_mut(DATA_KEY) {
    rows.retain(|row| {
      row
        .as_object()
        .and_then(row_revision)
        .is_some_and(|revision| range.contains(revision))
    });
  }
  payload
}

/// One successful fetch, as queued for write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FetchedRange {
  range: Range,
  columns: Vec<String>,
  result: Fields,
}

impl FetchedRange {
  /// Range to record as known for the fetched columns. An unbounded fetch only vouches
  /// for revisions up to the last row it returned.
  fn coverage(&self) -> Option<Range> {
    if !self.range.is_unbounded() {
      return Some(self.range);
    }
    let last = payload_rows(&self.result).filter_map(row_revision).max()?;
    Some(Range::new(self.range.start(), last.saturating_add(1)))
  }
}

/// Store of one timeseries, bound to the request reading it.
#[derive(Debug, Clone)]
pub struct TimeseriesStore {
  request: TimeseriesRequest,
}

impl TimeseriesStore {
  pub fn new(request: TimeseriesRequest) -> Self {
    Self { request }
  }

  pub fn request(&self) -> &TimeseriesRequest {
    &self.request
  }

  /// Rows, metadata and per-column coverage inside `window`.
  pub fn read_window(&self, store: &StoreConnection, window: &Range) -> Result<TimeseriesSnapshot> {
    store.with_conn(|conn| {
      let mut coverage = BTreeMap::new();
      for column in self.request.value_columns() {
        let ranges: Vec<Range> = RANGES.get(conn, column)?.unwrap_or_default();
        let clipped = range::clip(&ranges, window);
        if !clipped.is_empty() {
          coverage.insert(column.clone(), clipped);
        }
      }

      let data = DATA.scan(conn, window)?;

      let mut metadata = Fields::new();
      for key in METADATA.keys(conn)? {
        if let Some(value) = METADATA.get::<Value>(conn, &key)? {
          metadata.insert(key, value);
        }
      }

      Ok(TimeseriesSnapshot {
        data,
        metadata,
        coverage,
      })
    })
  }

  fn write_fetched(&self, conn: &Connection, fetched: &[FetchedRange]) -> Result<()> {
    for entry in fetched {
      for row in payload_rows(&entry.result) {
        let revision = row_revision(row).ok_or_else(|| eyre!("Row without revision: {:?}", row))?;
        DATA.merge(conn, revision, row)?;
      }

      if let Some(coverage) = entry.coverage() {
        for column in entry.columns.iter().filter(|c| c.as_str() != REVISION) {
          let mut ranges: Vec<Range> = RANGES.get(conn, column)?.unwrap_or_default();
          range::merge_into_sorted(&mut ranges, coverage);
          RANGES.put(conn, column, &ranges)?;
        }
      }

      for (key, value) in entry.result.iter().filter(|(k, _)| k.as_str() != DATA_KEY) {
        METADATA.put(conn, key, value)?;
      }
    }
    Ok(())
  }
}

impl ResourceStore for TimeseriesStore {
  fn timing_category(&self) -> &'static str {
    CATEGORY
  }

  fn store_name(&self) -> String {
    self.request.descriptor.store_name()
  }

  fn store_version(&self) -> u32 {
    STORE_VERSION
  }

  fn upgrade_schema(&self, conn: &Connection, old_version: u32) -> Result<()> {
    if old_version < 1 {
      DATA.create(conn)?;
      RANGES.create(conn)?;
      METADATA.create(conn)?;
    }
    Ok(())
  }

  /// The cached snapshot of the request window, `None` when no requested column has any
  /// coverage in it.
  fn read(&self, store: &StoreConnection) -> Result<Option<Value>> {
    let snapshot = self.read_window(store, &self.request.window())?;
    if snapshot.coverage.is_empty() {
      return Ok(None);
    }
    Ok(Some(snapshot.to_value()))
  }

  /// `network` is the list of successful fetches of one reconciliation:
  /// `[{"range": {..}, "columns": [..], "result": {..}}, ..]`.
  fn write(&self, store: &StoreConnection, network: &Value) -> Result<()> {
    let fetched: Vec<FetchedRange> = serde_json::from_value(network.clone())
      .map_err(|e| eyre!("Malformed timeseries write: {}", e))?;
    store.transaction(|conn| self.write_fetched(conn, &fetched))
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Fields, CacheError>>>;

struct Outstanding {
  id: u64,
  columns: Vec<String>,
  range: Range,
  fetch: SharedFetch,
}

/// Timeseries network fetches that have not completed yet, by store name.
///
/// A fetch for a subset of the columns of an outstanding fetch, over a range that fetch
/// contains, awaits the outstanding one instead of going to the network again.
#[derive(Default)]
pub struct TimeseriesFetches {
  next_id: AtomicU64,
  by_store: Mutex<HashMap<String, Vec<Outstanding>>>,
}

impl TimeseriesFetches {
  fn join_or_start<F>(&self, store: &str, columns: &[String], range: Range, start: F) -> (SharedFetch, bool)
  where
    F: FnOnce(u64) -> BoxFuture<'static, Result<Fields, CacheError>>,
  {
    let mut by_store = self.by_store.lock().unwrap_or_else(|e| e.into_inner());
    let outstanding = by_store.entry(store.to_string()).or_default();

    let existing = outstanding.iter().find(|o| {
      o.range.contains_range(&range) && columns.iter().all(|c| o.columns.contains(c))
    });
    if let Some(existing) = existing {
      return (existing.fetch.clone(), false);
    }

    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let fetch = start(id).shared();
    outstanding.push(Outstanding {
      id,
      columns: columns.to_vec(),
      range,
      fetch: fetch.clone(),
    });
    (fetch, true)
  }

  fn finish(&self, store: &str, id: u64) {
    let mut by_store = self.by_store.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(outstanding) = by_store.get_mut(store) {
      outstanding.retain(|o| o.id != id);
      if outstanding.is_empty() {
        by_store.remove(store);
      }
    }
  }

  /// Number of outstanding fetches for `store`.
  pub fn outstanding(&self, store: &str) -> usize {
    self
      .by_store
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get(store)
      .map_or(0, Vec::len)
  }
}

/// Timeseries reads against one runtime.
#[derive(Clone)]
pub struct TimeseriesCache {
  runtime: CacheRuntime,
}

impl TimeseriesCache {
  pub fn new(runtime: CacheRuntime) -> Self {
    Self { runtime }
  }

  /// Reconcile an intercepted request.
  pub fn respond_to(&self, fetch: FetchRequest) -> Result<ResultStream, CacheError> {
    let request = TimeseriesRequest::from_fetch(&fetch)?;
    Ok(self.respond(request, fetch))
  }

  /// Stream progressively more complete snapshots of `request`.
  ///
  /// The cached snapshot comes first when any requested column has coverage in the
  /// window. Then one snapshot follows per successful missing-range fetch, in completion
  /// order; a failed fetch yields an error and leaves its range uncovered. When every
  /// column is covered no fetch is made and the cached snapshot is the only item.
  /// `fetch` supplies the url, method and headers of the network requests.
  pub fn respond(&self, request: TimeseriesRequest, fetch: FetchRequest) -> ResultStream {
    let (tx, stream) = ResultStream::channel();
    let runtime = self.runtime.clone();
    tokio::spawn(async move {
      if runtime.is_shut_down() {
        let _ = tx.send(Err(CacheError::Runtime));
        return;
      }
      reconcile(runtime, Arc::new(TimeseriesStore::new(request)), fetch, tx).await;
    });
    stream
  }

  /// Persisted rows, coverage and metadata of `columns` inside `window`. Never touches
  /// the network.
  pub async fn read_range(
    &self,
    descriptor: TimeseriesDescriptor,
    columns: &[&str],
    window: Range,
  ) -> Result<TimeseriesSnapshot, CacheError> {
    let store = Arc::new(TimeseriesStore::new(TimeseriesRequest::new(
      descriptor,
      columns.iter().copied(),
    )));
    let name = store.store_name();
    with_store(Arc::clone(self.runtime.pool()), store, move |store, conn| {
      store.read_window(conn, &window)
    })
    .await
    .map_err(|e| CacheError::store(name, e))
  }
}

async fn reconcile(
  runtime: CacheRuntime,
  store: Arc<TimeseriesStore>,
  original: FetchRequest,
  tx: mpsc::UnboundedSender<ResultItem>,
) {
  let name = store.store_name();
  let request = store.request().clone();
  let window = request.window();
  touch_access_time(&runtime, Arc::clone(&store));

  let timing = Timing::start(CATEGORY, "Read", name.clone());
  let cached = with_store(Arc::clone(runtime.pool()), Arc::clone(&store), move |store, conn| {
    store.read_window(conn, &window)
  })
  .await;
  let cached = match cached {
    Ok(snapshot) => {
      timing.end();
      snapshot
    }
    Err(err) => {
      timing.discard();
      tracing::warn!(store = %name, error = %err, "cache read failed, continuing with network only");
      TimeseriesSnapshot::default()
    }
  };

  let has_cache = !cached.coverage.is_empty();
  if has_cache {
    let _ = tx.send(Ok(CacheResult::from_cache(cached.to_value())));
  }

  let columns = request.columns_to_fetch(&cached.coverage);
  if window.is_empty() || columns.len() <= 1 {
    tracing::debug!(store = %name, "request fully covered by cache");
    if !has_cache {
      let _ = tx.send(Ok(CacheResult::from_cache(cached.to_value())));
    }
    return;
  }

  let mut available = vec![window];
  for column in columns.iter().filter(|c| c.as_str() != REVISION) {
    match cached.coverage.get(column) {
      Some(ranges) => available = range::intersect_sorted(&available, ranges),
      None => {
        available.clear();
        break;
      }
    }
  }
  let missing = range::difference(window, &available);
  tracing::debug!(store = %name, ?missing, columns = ?columns, "fetching missing ranges");

  let mut pending = FuturesUnordered::new();
  for range in missing {
    let fetch = start_or_join(&runtime, &store, &original, &columns, range);
    pending.push(async move { (range, fetch.await) });
  }

  let mut merged = cached.data;
  let mut metadata = cached.metadata;
  let mut fetched = Vec::new();
  while let Some((range, result)) = pending.next().await {
    match result {
      Ok(payload) => {
        let payload = restrict(payload, &range);
        if payload_rows(&payload).next().is_none() {
          // Nothing new in this range; it stays uncovered so a later request asks again.
          tracing::debug!(store = %name, ?range, "range fetch returned no rows");
          let _ = tx.send(Ok(CacheResult::from_network(snapshot_value(&metadata, &merged))));
          continue;
        }
        merge_rows(&mut merged, payload_rows(&payload));
        for (key, value) in payload.iter().filter(|(k, _)| k.as_str() != DATA_KEY) {
          metadata.insert(key.clone(), value.clone());
        }
        let _ = tx.send(Ok(CacheResult::from_network(snapshot_value(&metadata, &merged))));
        fetched.push(FetchedRange {
          range,
          columns: columns.clone(),
          result: payload,
        });
      }
      Err(err) => {
        tracing::warn!(store = %name, ?range, error = %err, "range fetch failed");
        let _ = tx.send(Err(err));
      }
    }
  }

  if fetched.is_empty() {
    return;
  }
  match serde_json::to_value(&fetched) {
    Ok(batch) => enqueue_write(&runtime, store, batch),
    Err(err) => tracing::error!(store = %name, error = %err, "could not queue timeseries write"),
  }
}

fn start_or_join(
  runtime: &CacheRuntime,
  store: &TimeseriesStore,
  original: &FetchRequest,
  columns: &[String],
  range: Range,
) -> SharedFetch {
  let name = store.store_name();
  let registry = Arc::clone(runtime.timeseries_fetches());
  let fetcher = Arc::clone(runtime.fetcher());
  let request = store.request().range_request(original, columns, range);
  let payload_columns = columns.to_vec();

  let (fetch, started) = runtime
    .timeseries_fetches()
    .join_or_start(&name, columns, range, |id| {
      let name = name.clone();
      async move {
        let url = request.url().to_string();
        let result = fetch_json(fetcher.as_ref(), &request, CATEGORY)
          .await
          .and_then(|json| normalize_payload(json, &payload_columns, &url));
        registry.finish(&name, id);
        result
      }
      .boxed()
    });
  if !started {
    tracing::debug!(store = %name, ?range, "sharing outstanding fetch");
  }
  fetch
}

fn touch_access_time(runtime: &CacheRuntime, store: Arc<TimeseriesStore>) {
  let pool = Arc::clone(runtime.pool());
  let label = format!("{}:{}:access", CATEGORY, store.store_name());
  runtime.writer().enqueue(PendingWrite::new(label, move || {
    with_store(pool, store, |_, conn| {
      conn.transaction(|conn| METADATA.put(conn, ACCESS_TIME_KEY, &Utc::now().to_rfc3339()))
    })
  }));
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use url::Url;

  fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
  }

  fn descriptor() -> TimeseriesDescriptor {
    TimeseriesDescriptor::new("suite", "ms", "linux").with_test_case("load")
  }

  #[test]
  fn store_name_includes_every_identity_field() {
    assert_eq!(descriptor().store_name(), "timeseries/suite/ms/linux/load/");
  }

  #[test]
  fn parses_form_requests() {
    let fetch = FetchRequest::post_form(
      Url::parse("https://perf.example.com/api/timeseries2").unwrap(),
      [
        ("test_suite", "suite"),
        ("measurement", "ms"),
        ("bot", "linux"),
        ("columns", "avg,revision,avg"),
        ("min_revision", "10"),
        ("max_revision", "junk"),
      ],
    );
    let request = TimeseriesRequest::from_fetch(&fetch).unwrap();
    assert_eq!(request.columns, vec!["revision", "avg"]);
    assert_eq!(request.min_revision, Some(10));
    assert_eq!(request.max_revision, None);
    assert_eq!(request.window(), Range::from_start(10));
    assert_eq!(request.descriptor.build_type, "");
  }

  #[test]
  fn missing_columns_is_invalid() {
    let fetch = FetchRequest::get(Url::parse("https://h/api/timeseries2?bot=b").unwrap());
    assert!(matches!(
      TimeseriesRequest::from_fetch(&fetch),
      Err(CacheError::InvalidRequest(_))
    ));
  }

  #[test]
  fn merge_keeps_revision_order_and_unions_fields() {
    let mut merged: Vec<Fields> = (0..=4)
      .map(|i| fields(json!({"revision": i * 10, "avg": i})))
      .collect();
    let fetched = vec![
      fields(json!({"revision": 60, "avg": 6})),
      fields(json!({"revision": 50, "avg": 5})),
      fields(json!({"revision": 40, "alert": "a"})),
    ];
    merge_rows(&mut merged, &fetched);

    let revisions: Vec<u64> = merged.iter().filter_map(row_revision).collect();
    assert_eq!(revisions, vec![0, 10, 20, 30, 40, 50, 60]);
    assert_eq!(merged[4], fields(json!({"revision": 40, "avg": 4, "alert": "a"})));
  }

  #[test]
  fn positional_rows_are_normalized() {
    let columns = vec!["revision".to_string(), "avg".to_string()];
    let payload = normalize_payload(
      json!({"units": "ms", "data": [[20, 2.0], [10, 1.0]]}),
      &columns,
      "u",
    )
    .unwrap();
    assert_eq!(payload["units"], "ms");
    assert_eq!(
      payload["data"],
      json!([{"revision": 10, "avg": 1.0}, {"revision": 20, "avg": 2.0}])
    );
  }

  #[test]
  fn failed_payloads_are_rejected() {
    let columns = vec!["revision".to_string()];
    for payload in [json!({"error": "nope"}), json!({"units": "ms"}), json!({"data": "rows"})] {
      assert!(matches!(
        normalize_payload(payload, &columns, "u"),
        Err(CacheError::Payload { .. })
      ));
    }
  }

  #[test]
  fn empty_data_is_not_a_failure() {
    let columns = vec!["revision".to_string()];
    let payload = normalize_payload(json!({"units": "ms", "data": []}), &columns, "u").unwrap();
    assert_eq!(payload["data"], json!([]));
  }

  #[test]
  fn unbounded_fetch_covers_up_to_last_row() {
    let fetched = FetchedRange {
      range: Range::from_start(100),
      columns: vec!["revision".to_string(), "avg".to_string()],
      result: fields(json!({"data": [{"revision": 120}, {"revision": 150}]})),
    };
    assert_eq!(fetched.coverage(), Some(Range::new(100, 151)));

    let bounded = FetchedRange {
      range: Range::new(0, 50),
      ..fetched
    };
    assert_eq!(bounded.coverage(), Some(Range::new(0, 50)));
  }

  #[test]
  fn range_requests_use_inclusive_bounds() {
    let original = FetchRequest::post_form(
      Url::parse("https://perf.example.com/api/timeseries2").unwrap(),
      [("columns", "revision,avg")],
    )
    .with_header("Authorization", "Bearer t");
    let request = TimeseriesRequest::new(descriptor(), ["avg"]);
    let columns = vec!["revision".to_string(), "avg".to_string()];

    let bounded = request.range_request(&original, &columns, Range::new(200, 301));
    assert_eq!(bounded.param("min_revision").as_deref(), Some("200"));
    assert_eq!(bounded.param("max_revision").as_deref(), Some("300"));
    assert_eq!(bounded.param("test_case").as_deref(), Some("load"));
    assert_eq!(bounded.header("authorization"), Some("Bearer t"));

    let open = request.range_request(&original, &columns, Range::from_start(0));
    assert_eq!(open.param("min_revision"), None);
    assert_eq!(open.param("max_revision"), None);
  }

  #[test]
  fn outstanding_fetches_are_shared_for_narrower_requests() {
    let registry = TimeseriesFetches::default();
    let wide: Vec<String> = vec!["revision".into(), "avg".into(), "count".into()];
    let narrow: Vec<String> = vec!["revision".into(), "avg".into()];
    let start = |_: u64| futures::future::ready(Ok::<_, CacheError>(Fields::new())).boxed();

    let (_, started) = registry.join_or_start("s", &wide, Range::new(0, 100), start);
    assert!(started);
    let (_, started) = registry.join_or_start("s", &narrow, Range::new(10, 20), start);
    assert!(!started, "subset of columns and range joins");
    let (_, started) = registry.join_or_start("s", &narrow, Range::new(50, 150), start);
    assert!(started, "wider range starts its own fetch");
    assert_eq!(registry.outstanding("s"), 2);

    registry.finish("s", 0);
    registry.finish("s", 1);
    assert_eq!(registry.outstanding("s"), 0);
  }
}
