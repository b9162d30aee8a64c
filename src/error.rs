//! Error taxonomy for the caching layer.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the cache, store adapters and paginator.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced by the caching layer.
///
/// Every variant is `Clone` because a single failed fetch is handed to every
/// caller that was coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The underlying document-store call failed. Nothing was cached.
  #[error("fetch failed for {key}: {reason}")]
  Fetch {
    key: String,
    reason: Arc<color_eyre::Report>,
  },

  /// A pagination cursor does not belong to the query it was used with,
  /// or an exported cursor token could not be decoded.
  #[error("invalid cursor: {0}")]
  InvalidCursor(String),

  /// A background stale-while-revalidate refresh failed. Only ever logged.
  #[error("background refresh failed for {key}: {reason}")]
  StaleRefresh { key: String, reason: Box<CacheError> },

  /// The pending request was cancelled by `clear()` before it settled.
  #[error("pending request for {0} was cancelled")]
  Cancelled(String),

  /// The key holds a value of a different type than the caller asked for.
  #[error("cached value for {key} is not a {expected}")]
  TypeMismatch { key: String, expected: &'static str },
}

impl CacheError {
  pub(crate) fn fetch(key: impl Into<String>, report: color_eyre::Report) -> Self {
    Self::Fetch {
      key: key.into(),
      reason: Arc::new(report),
    }
  }

  /// Whether retrying the same call may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Fetch { .. } | Self::Cancelled(_))
  }
}
