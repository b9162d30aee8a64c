//! Core traits and types for the caching system.

use std::any::Any;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// Values the cache can hold.
///
/// Stored values are shared read-only behind an `Arc`; `Serialize` is only
/// used to estimate their footprint for `stats()`.
pub trait CacheValue: Any + Send + Sync + Serialize {}

impl<T> CacheValue for T where T: Any + Send + Sync + Serialize {}

/// Type-erased stored value.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: Arc<T>,
  /// Where the data came from
  pub source: CacheSource,
  /// Age of the cached entry (if served from cache)
  pub age: Option<Duration>,
}

impl<T> CacheResult<T> {
  pub(crate) fn from_network(data: Arc<T>, source: CacheSource) -> Self {
    Self {
      data,
      source,
      age: None,
    }
  }

  pub(crate) fn from_cache(data: Arc<T>, age: Duration, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      age: Some(age),
    }
  }
}

impl<T> Clone for CacheResult<T> {
  fn clone(&self) -> Self {
    Self {
      data: Arc::clone(&self.data),
      source: self.source,
      age: self.age,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This call ran the underlying fetch
  Network,
  /// This call joined a fetch another caller had already started
  Coalesced,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its staleness threshold; a refresh was triggered
  CacheStale,
}

impl CacheSource {
  pub fn is_cached(&self) -> bool {
    matches!(self, Self::CacheFresh | Self::CacheStale)
  }
}

/// Approximate serialized size of a value in bytes.
pub(crate) fn approx_size<T: Serialize + ?Sized>(value: &T) -> usize {
  let mut counter = ByteCounter(0);
  match serde_json::to_writer(&mut counter, value) {
    Ok(()) => counter.0,
    Err(_) => std::mem::size_of_val(value),
  }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0 += buf.len();
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}
