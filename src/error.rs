//! Error taxonomy for the cache and the mutation coordinator.

use crate::cache::QueryKey;

/// Boxed error used at the remote-call boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The remote call of a mutation rejected; the optimistic patch was rolled back.
  #[error("mutation against {key} failed: {source}")]
  MutationFailed {
    key: QueryKey,
    #[source]
    source: BoxError,
  },

  /// The mutation was aborted through its cancel token before the remote call settled.
  #[error("mutation against {key} was cancelled")]
  Cancelled { key: QueryKey },

  /// A background reconciliation fetch failed. Only logged; the entry is marked stale.
  #[error("refetch of {key} failed: {message}")]
  RefetchFailed { key: QueryKey, message: String },

  /// A foreground fetch failed and nothing was cached to fall back on.
  #[error("fetch of {key} failed: {message}")]
  FetchFailed { key: QueryKey, message: String },

  #[error("no query function registered for {key}")]
  NoQueryFn { key: QueryKey },
}

impl CacheError {
  /// The key the failing operation targeted.
  pub fn key(&self) -> &QueryKey {
    match self {
      Self::MutationFailed { key, .. }
      | Self::Cancelled { key }
      | Self::RefetchFailed { key, .. }
      | Self::FetchFailed { key, .. }
      | Self::NoQueryFn { key } => key,
    }
  }

  pub fn is_mutation_failure(&self) -> bool {
    matches!(self, Self::MutationFailed { .. })
  }
}
