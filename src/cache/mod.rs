//! Generic caching layer shared by every resource kind.
//!
//! This module provides a resource-agnostic mechanism that:
//! - Races a persisted store against a network fetch and streams both results
//! - Defers write-back of network results into a debounced writing queue
//! - Offers typed table helpers (keyed JSON values, revision-ordered rows)

mod layer;
pub mod storage;
mod traits;
mod writer;

pub use layer::{CacheLayer, ResultItem, ResultStream};
pub(crate) use layer::{enqueue_write, with_store};
pub use storage::{shallow_merge, Fields, KeyedTable, RevisionTable};
pub use traits::{CacheResult, CacheSource, ResourceStore};
pub use writer::{ErrorSink, FlushHandle, FlushReport, PendingWrite, WritingQueue};
