//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for entities that can be cached.
///
/// Implementors provide a stable key and a type name used to namespace
/// entries in shared storage.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (the server-assigned id)
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "resource")
  fn entity_type() -> &'static str;
}

/// A single cached entity with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity<T> {
  pub entity: T,
  pub fetched_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl<T> CachedEntity<T> {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }
}

/// Outcome of diffing cached ids against an authoritative id set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
  /// Number of entries deleted
  pub removed: usize,
  /// Ids that were cached but absent from the authoritative set
  pub inconsistencies: Vec<String>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache; a background reconciliation was scheduled
  CacheFresh,
  /// Network unavailable, serving the last data we managed to read
  Offline,
}
