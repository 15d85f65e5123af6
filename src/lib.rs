//! Client-side resource cache with partial-range reconciliation.
//!
//! Requests for timeseries, reports, key/value data and session ids are answered from
//! per-resource SQLite stores while the network is consulted, and results stream to the
//! requester as they improve. Timeseries requests only fetch the revision ranges and
//! columns the store does not already cover.
//!
//! Everything hangs off a [`CacheRuntime`]; [`FetchRouter`] is the entry point for
//! intercepted requests and [`client`] builds requests the way a page would.

pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod range;
pub mod resources;
pub mod runtime;
pub mod service;
pub mod timing;

pub use cache::{CacheResult, CacheSource, FlushReport, ResultItem, ResultStream, WritingQueue};
pub use channel::{ChannelHub, Message, ResultListener, ResultSender};
pub use client::{LevelOfDetail, ReportQuery, TimeseriesQuery};
pub use config::Config;
pub use error::CacheError;
pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use range::Range;
pub use runtime::CacheRuntime;
pub use service::{FetchRouter, Intercepted};
