use thiserror::Error;

/// Errors surfaced by the cache engine to its callers.
///
/// Cache-layer faults never reach callers of a read: they are logged and turned into a
/// cache miss. They only appear here when a caller touches the store directly (range
/// reads, test-only deletion).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
  /// The persisted store could not be opened, read or written.
  #[error("store {store}: {message}")]
  Store {
    /// Store name, e.g. `timeseries/suite/measurement/bot//`.
    store: String,
    message: String,
  },

  /// The request never produced a response (connection refused, DNS, TLS, ...).
  #[error("network request to {url} failed: {message}")]
  Network { url: String, message: String },

  /// The server answered with a non-2xx status.
  #[error("network request to {url} returned status {status}")]
  Status { url: String, status: u16 },

  /// The response body was not usable: invalid JSON, an `error` field, missing data.
  #[error("unusable payload from {url}: {message}")]
  Payload { url: String, message: String },

  /// A broadcast message with an unknown `type` was received.
  #[error("unknown result channel message type: {0}")]
  Protocol(String),

  /// A required request parameter is missing or malformed.
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// The runtime was shut down while the operation was pending.
  #[error("cache runtime is shut down")]
  Runtime,
}

impl CacheError {
  /// Helper: wrap any displayable failure as a store fault.
  pub fn store(store: impl Into<String>, err: impl std::fmt::Display) -> Self {
    Self::Store {
      store: store.into(),
      message: err.to_string(),
    }
  }

  /// Helper: build a `Payload` error for the given url.
  pub fn payload(url: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Payload {
      url: url.into(),
      message: message.into(),
    }
  }

  /// Whether this error came from the network side of a request.
  pub fn is_network(&self) -> bool {
    matches!(
      self,
      Self::Network { .. } | Self::Status { .. } | Self::Payload { .. }
    )
  }
}
