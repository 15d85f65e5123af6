//! Resource kinds the cache knows how to persist.

pub mod key_value;
pub mod report;
pub mod session_id;
pub mod timeseries;

pub use key_value::{describe_key, KeyValueCache, KeyValueStore};
pub use report::{ReportCache, ReportRequest, ReportStore};
pub use session_id::{session_id, SessionIdCache, SessionIdStore};
pub use timeseries::{
  merge_rows, row_revision, TimeseriesCache, TimeseriesDescriptor, TimeseriesRequest,
  TimeseriesSnapshot, TimeseriesStore,
};
