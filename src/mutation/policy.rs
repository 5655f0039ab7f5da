//! Post-settlement reconciliation policies.

use std::fmt;

use super::record::MutationStatus;
use crate::cache::QueryKey;

/// What the coordinator knows once a mutation's remote call settled.
#[derive(Debug, Clone, Copy)]
pub struct Settlement<'a> {
  pub key: &'a QueryKey,
  /// `Committed` or `RolledBack`
  pub status: MutationStatus,
  /// Someone invalidated the key while the mutation was pending
  pub invalidated_while_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
  /// Keep displaying the settled value; the entry returns to idle
  Keep,
  /// Replace the value with a fresh fetch when it arrives
  Refetch,
}

/// Decides how a settled mutation is aligned with the remote source.
pub trait ReconcilePolicy: Send + Sync + fmt::Debug {
  fn reconcile(&self, settlement: &Settlement<'_>) -> Reconciliation;
}

/// Refetch after every settlement, commit or rollback.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRefetch;

impl ReconcilePolicy for AlwaysRefetch {
  fn reconcile(&self, _settlement: &Settlement<'_>) -> Reconciliation {
    Reconciliation::Refetch
  }
}

/// Trust an exact optimistic patch (e.g. a boolean toggle) once committed.
///
/// Rollbacks and keys invalidated mid-flight still refetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustOnCommit;

impl ReconcilePolicy for TrustOnCommit {
  fn reconcile(&self, settlement: &Settlement<'_>) -> Reconciliation {
    match settlement.status {
      MutationStatus::Committed if !settlement.invalidated_while_pending => Reconciliation::Keep,
      _ => Reconciliation::Refetch,
    }
  }
}
