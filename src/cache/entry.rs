//! Cache entries and fetch results.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::key::QueryKey;

/// Lifecycle state of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
  /// Data reflects the last successful fetch or a settled mutation
  Idle,
  /// A fetch or an optimistic mutation is in flight
  Fetching,
  /// Data is servable but known to be out of date
  Stale,
  /// The last foreground fetch failed; data is from before the failure
  Error,
}

/// Latest known value for one query key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  pub data: T,
  /// When `data` was last written
  pub fetched_at: DateTime<Utc>,
  pub state: EntryState,
}

impl<T> CacheEntry<T> {
  pub fn new(key: QueryKey, data: T, state: EntryState) -> Self {
    Self {
      key,
      data,
      fetched_at: Utc::now(),
      state,
    }
  }

  /// Fresh entries are idle and younger than `stale_time`.
  pub fn is_fresh(&self, stale_time: Duration) -> bool {
    self.state == EntryState::Idle && Utc::now() - self.fetched_at <= stale_time
  }

  pub fn is_stale(&self) -> bool {
    self.state == EntryState::Stale
  }
}

/// Result of a cache-first fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct FetchOutcome<T> {
  pub entry: CacheEntry<T>,
  pub source: CacheSource,
}

impl<T> FetchOutcome<T> {
  pub fn from_network(entry: CacheEntry<T>) -> Self {
    Self {
      entry,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(entry: CacheEntry<T>) -> Self {
    Self {
      entry,
      source: CacheSource::CacheFresh,
    }
  }

  /// Network failed, serving what the cache still holds.
  pub fn offline(entry: CacheEntry<T>) -> Self {
    Self {
      entry,
      source: CacheSource::Offline,
    }
  }

  pub fn into_data(self) -> T {
    self.entry.data
  }
}

/// Indicates where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the query function
  Network,
  /// Cached data still within its stale time
  CacheFresh,
  /// Query function failed; serving cached data
  Offline,
}
