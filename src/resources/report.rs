//! Report template cache.
//!
//! Reports are stored by revision so a read for a handful of revisions does not load the
//! whole template history. Row descriptions and template-wide fields live in `metadata`.
//! A change of the template's `modified` stamp invalidates everything stored for it.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::cache::{KeyedTable, ResourceStore, ResultStream};
use crate::db::StoreConnection;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::runtime::CacheRuntime;

const STORE_VERSION: u32 = 1;

const REPORTS: KeyedTable = KeyedTable::new("reports");
const METADATA: KeyedTable = KeyedTable::new("metadata");

/// Template-wide fields returned alongside the report rows.
const TEMPLATE_FIELDS: [&str; 4] = ["editable", "internal", "name", "owners"];

/// One report template at one modification stamp, for a set of revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
  pub id: i64,
  /// Template modification time in milliseconds
  pub modified: i64,
  pub revisions: Vec<String>,
}

impl ReportRequest {
  pub fn from_fetch(request: &FetchRequest) -> Result<Self, CacheError> {
    let required = |name: &str| {
      request
        .param(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CacheError::InvalidRequest(format!("{} is not specified for this report", name)))
    };
    let number = |name: &str| -> Result<i64, CacheError> {
      let raw = required(name)?;
      raw
        .trim()
        .parse()
        .map_err(|_| CacheError::InvalidRequest(format!("{} is not a valid number: {}", name, raw)))
    };

    Ok(Self {
      id: number("id")?,
      modified: number("modified")?,
      revisions: required("revisions")?
        .split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect(),
    })
  }

  pub fn store_name(&self) -> String {
    format!("report/{}", self.id)
  }
}

/// Store of one report template.
#[derive(Debug, Clone)]
pub struct ReportStore {
  request: ReportRequest,
}

impl ReportStore {
  pub fn new(request: ReportRequest) -> Self {
    Self { request }
  }

  fn stored_modified(&self, conn: &Connection) -> Result<Option<i64>> {
    METADATA.get(conn, "modified")
  }

  /// Attach to each row the reports of the requested revisions.
  fn merge_rows_with_reports(&self, rows: Vec<Value>, by_revision: &BTreeMap<String, Vec<Value>>) -> Vec<Value> {
    rows
      .into_iter()
      .enumerate()
      .map(|(index, row)| {
        let mut data = Map::new();
        for revision in &self.request.revisions {
          let report = by_revision
            .get(revision)
            .and_then(|reports| reports.get(index))
            .filter(|report| !report.is_null());
          if let Some(report) = report {
            data.insert(revision.clone(), report.clone());
          }
        }
        let mut row = match row {
          Value::Object(row) => row,
          _ => Map::new(),
        };
        row.insert("data".to_string(), Value::Object(data));
        Value::Object(row)
      })
      .collect()
  }
}

/// Re-key reports from row → revision → report to revision → [report per row].
fn reports_by_revision(rows: &[Value]) -> BTreeMap<String, Vec<Value>> {
  let mut by_revision: BTreeMap<String, Vec<Value>> = BTreeMap::new();
  for (index, row) in rows.iter().enumerate() {
    let Some(data) = row.get("data").and_then(Value::as_object) else {
      continue;
    };
    for (revision, report) in data {
      let reports = by_revision.entry(revision.clone()).or_default();
      if reports.len() <= index {
        reports.resize(index + 1, Value::Null);
      }
      reports[index] = report.clone();
    }
  }
  by_revision
}

impl ResourceStore for ReportStore {
  fn timing_category(&self) -> &'static str {
    "Reports"
  }

  fn store_name(&self) -> String {
    self.request.store_name()
  }

  fn store_version(&self) -> u32 {
    STORE_VERSION
  }

  fn upgrade_schema(&self, conn: &Connection, old_version: u32) -> Result<()> {
    if old_version < 1 {
      REPORTS.create(conn)?;
      METADATA.create(conn)?;
    }
    Ok(())
  }

  fn read(&self, store: &StoreConnection) -> Result<Option<Value>> {
    store.with_conn(|conn| {
      // Data stored under another modification stamp belongs to another template.
      if self.stored_modified(conn)? != Some(self.request.modified) {
        return Ok(None);
      }

      let Some(rows) = METADATA.get::<Vec<Value>>(conn, "rows")? else {
        return Ok(None);
      };

      let mut by_revision = BTreeMap::new();
      for revision in &self.request.revisions {
        if let Some(reports) = REPORTS.get::<Vec<Value>>(conn, revision)? {
          by_revision.insert(revision.clone(), reports);
        }
      }
      if by_revision.is_empty() {
        return Ok(None);
      }

      let mut result = Map::new();
      for field in TEMPLATE_FIELDS {
        let value = METADATA.get::<Value>(conn, field)?.unwrap_or(Value::Null);
        result.insert(field.to_string(), value);
      }
      result.insert("id".to_string(), json!(self.request.id));
      let statistics = METADATA.get::<Value>(conn, "statistics")?.unwrap_or(Value::Null);
      result.insert(
        "report".to_string(),
        json!({
          "rows": self.merge_rows_with_reports(rows, &by_revision),
          "statistics": statistics,
        }),
      );
      Ok(Some(Value::Object(result)))
    })
  }

  fn write(&self, store: &StoreConnection, network: &Value) -> Result<()> {
    let object = network
      .as_object()
      .ok_or_else(|| eyre!("Report response is not an object"))?;
    let report = object
      .get("report")
      .ok_or_else(|| eyre!("Report response has no report"))?;
    let rows = report
      .get("rows")
      .and_then(Value::as_array)
      .ok_or_else(|| eyre!("Report response has no rows"))?;

    store.transaction(|conn| {
      // When the template changes, reports and metadata may describe different benchmarks.
      if self.stored_modified(conn)?.is_some_and(|m| m != self.request.modified) {
        REPORTS.clear(conn)?;
        METADATA.clear(conn)?;
      }

      for (revision, reports) in reports_by_revision(rows) {
        REPORTS.put(conn, &revision, &reports)?;
      }

      let row_metadata: Vec<Value> = rows
        .iter()
        .map(|row| {
          let mut row = row.as_object().cloned().unwrap_or_default();
          row.remove("data");
          Value::Object(row)
        })
        .collect();
      METADATA.put(conn, "rows", &row_metadata)?;
      METADATA.put(
        conn,
        "statistics",
        report.get("statistics").unwrap_or(&Value::Null),
      )?;
      METADATA.put(conn, "modified", &self.request.modified)?;

      for (key, value) in object.iter().filter(|(k, _)| k.as_str() != "report") {
        METADATA.put(conn, key, value)?;
      }
      Ok(())
    })
  }
}

/// Report reads against one runtime, through the generic engine.
#[derive(Clone)]
pub struct ReportCache {
  runtime: CacheRuntime,
}

impl ReportCache {
  pub fn new(runtime: CacheRuntime) -> Self {
    Self { runtime }
  }

  pub fn respond_to(&self, fetch: FetchRequest) -> Result<ResultStream, CacheError> {
    let request = ReportRequest::from_fetch(&fetch)?;
    Ok(self.runtime.layer().respond(ReportStore::new(request), fetch))
  }
}
