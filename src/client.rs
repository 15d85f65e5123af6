//! Listener-side readers: build the request a page would send, subscribe to its channel,
//! then hand the request to the router.

use serde_json::Value;
use url::Url;

use crate::channel::ResultListener;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::resources::TimeseriesDescriptor;
use crate::service::{FetchRouter, REPORT_PATH, TIMESERIES_PATH};

/// Statistic plotted when none is given.
pub const DEFAULT_STATISTIC: &str = "avg";

/// How much of a timeseries a view needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelOfDetail {
  /// Points of a line chart
  Xy,
  /// Alerts and diagnostics only
  AnnotationsOnly,
  /// Points plus everything shown in tooltips
  Annotations,
  Histogram,
}

impl LevelOfDetail {
  /// Columns to request, `revision` first and without duplicates.
  pub fn columns(&self, statistic: &str) -> Vec<String> {
    let names: Vec<&str> = match self {
      LevelOfDetail::Xy => vec!["revision", "timestamp", statistic, "count"],
      LevelOfDetail::AnnotationsOnly => vec!["revision", "alert", "diagnostics"],
      LevelOfDetail::Annotations => {
        let mut names = vec!["revision", "timestamp", statistic, "count"];
        names.extend(["alert", "diagnostics", "revisions"]);
        names
      }
      LevelOfDetail::Histogram => vec!["revision", "histogram"],
    };

    let mut columns: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
      if !columns.iter().any(|c| c == name) {
        columns.push(name.to_string());
      }
    }
    columns
  }
}

/// A timeseries read as a page would issue it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeseriesQuery {
  pub descriptor: TimeseriesDescriptor,
  pub level_of_detail: LevelOfDetail,
  pub statistic: Option<String>,
  pub min_revision: Option<u64>,
  pub max_revision: Option<u64>,
}

impl TimeseriesQuery {
  pub fn new(descriptor: TimeseriesDescriptor, level_of_detail: LevelOfDetail) -> Self {
    Self {
      descriptor,
      level_of_detail,
      statistic: None,
      min_revision: None,
      max_revision: None,
    }
  }

  pub fn with_statistic(mut self, statistic: impl Into<String>) -> Self {
    self.statistic = Some(statistic.into());
    self
  }

  pub fn with_revisions(mut self, min_revision: Option<u64>, max_revision: Option<u64>) -> Self {
    self.min_revision = min_revision;
    self.max_revision = max_revision;
    self
  }

  pub fn columns(&self) -> Vec<String> {
    self
      .level_of_detail
      .columns(self.statistic.as_deref().unwrap_or(DEFAULT_STATISTIC))
  }

  /// Form `POST` to `/api/timeseries2` on `origin`.
  pub fn request(&self, origin: &Url) -> Result<FetchRequest, CacheError> {
    let d = &self.descriptor;
    let mut form = vec![
      ("test_suite", d.test_suite.clone()),
      ("measurement", d.measurement.clone()),
      ("bot", d.bot.clone()),
    ];
    if !d.test_case.is_empty() {
      form.push(("test_case", d.test_case.clone()));
    }
    if let Some(statistic) = &self.statistic {
      form.push(("statistic", statistic.clone()));
    }
    if !d.build_type.is_empty() {
      form.push(("build_type", d.build_type.clone()));
    }
    form.push(("columns", self.columns().join(",")));
    if let Some(min) = self.min_revision {
      form.push(("min_revision", min.to_string()));
    }
    if let Some(max) = self.max_revision {
      form.push(("max_revision", max.to_string()));
    }
    Ok(FetchRequest::post_form(join(origin, TIMESERIES_PATH)?, form))
  }

  pub fn channel_name(&self, origin: &Url) -> Result<String, CacheError> {
    Ok(self.request(origin)?.channel_name())
  }

  /// Dispatch through `router` and listen to every snapshot it publishes.
  pub fn read(&self, router: &FetchRouter) -> Result<ResultListener, CacheError> {
    let request = self.request(origin(router)?)?;
    dispatch(router, request)
  }
}

/// A report read as a page would issue it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
  pub id: i64,
  /// Template modification time in milliseconds
  pub modified: i64,
  pub revisions: Vec<String>,
}

impl ReportQuery {
  pub fn new<I, S>(id: i64, modified: i64, revisions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      id,
      modified,
      revisions: revisions.into_iter().map(Into::into).collect(),
    }
  }

  /// Form `POST` to `/api/report/generate` on `origin`.
  pub fn request(&self, origin: &Url) -> Result<FetchRequest, CacheError> {
    Ok(FetchRequest::post_form(
      join(origin, REPORT_PATH)?,
      [
        ("id", self.id.to_string()),
        ("modified", self.modified.to_string()),
        ("revisions", self.revisions.join(",")),
      ],
    ))
  }

  pub fn channel_name(&self, origin: &Url) -> Result<String, CacheError> {
    Ok(self.request(origin)?.channel_name())
  }

  pub fn read(&self, router: &FetchRouter) -> Result<ResultListener, CacheError> {
    let request = self.request(origin(router)?)?;
    dispatch(router, request)
  }
}

/// Subscribe to `request`'s channel, then let `router` take it over.
///
/// Subscribing first is what guarantees the listener sees the first result.
pub fn dispatch(router: &FetchRouter, request: FetchRequest) -> Result<ResultListener, CacheError> {
  let listener = router.runtime().listen(&request.channel_name());
  match router.intercept(request)? {
    Some(intercepted) => {
      tracing::debug!(channel = %intercepted.channel, "reader dispatched");
      Ok(listener)
    }
    None => Err(CacheError::InvalidRequest(
      "request is not handled by the cache".to_string(),
    )),
  }
}

/// Error payloads published on a channel, as sent by the router for failed fetches.
pub fn channel_error(payload: &Value) -> Option<&str> {
  payload.get("error").and_then(Value::as_str)
}

fn origin(router: &FetchRouter) -> Result<&Url, CacheError> {
  router
    .runtime()
    .base_url()
    .ok_or_else(|| CacheError::InvalidRequest("http.base_url is not configured".to_string()))
}

fn join(origin: &Url, path: &str) -> Result<Url, CacheError> {
  origin
    .join(path)
    .map_err(|e| CacheError::InvalidRequest(format!("bad url {}{}: {}", origin, path, e)))
}
