//! Action timings per resource category, reported as debug events.

use std::time::Instant;

/// Measures one action of one resource category ("Timeseries", "Open") and reports the
/// elapsed time as a debug event when ended.
#[derive(Debug)]
pub struct Timing {
  category: &'static str,
  action: &'static str,
  label: String,
  started: Instant,
}

impl Timing {
  pub fn start(category: &'static str, action: &'static str, label: impl Into<String>) -> Self {
    Self {
      category,
      action,
      label: label.into(),
      started: Instant::now(),
    }
  }

  /// Report the measurement.
  pub fn end(self) {
    tracing::debug!(
      category = self.category,
      action = self.action,
      label = %self.label,
      elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0,
      "timing"
    );
  }

  /// Drop the measurement without reporting it (e.g. a read that found nothing).
  pub fn discard(self) {}
}
