//! Per-call bookkeeping for one optimistic mutation.

use std::fmt;

use crate::cache::{CacheEntry, EntryState, QueryKey};

/// Local transformation applied before the remote call settles.
pub type Patch<T> = Box<dyn FnOnce(&T) -> T + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Pending,
  Committed,
  RolledBack,
  /// Abandoned through its cancel token
  Cancelled,
}

/// Snapshot and status of one mutation, alive until it settles.
pub struct MutationRecord<T> {
  target_key: QueryKey,
  previous_snapshot: Option<(T, EntryState)>,
  optimistic_patch: Option<Patch<T>>,
  status: MutationStatus,
}

impl<T: Clone> MutationRecord<T> {
  pub fn new(target_key: QueryKey, optimistic_patch: Option<Patch<T>>) -> Self {
    Self {
      target_key,
      previous_snapshot: None,
      optimistic_patch,
      status: MutationStatus::Pending,
    }
  }

  pub fn target_key(&self) -> &QueryKey {
    &self.target_key
  }

  pub fn status(&self) -> MutationStatus {
    self.status
  }

  /// Whether an optimistic value was written and may need rolling back.
  pub fn has_snapshot(&self) -> bool {
    self.previous_snapshot.is_some()
  }

  /// Snapshot `current` and return the patched data.
  ///
  /// Returns `None` when the mutation carries no patch. The patch runs at
  /// most once.
  pub fn apply(&mut self, current: &CacheEntry<T>) -> Option<T> {
    let patch = self.optimistic_patch.take()?;
    self.previous_snapshot = Some((current.data.clone(), current.state));
    Some(patch(&current.data))
  }

  pub fn commit(&mut self) {
    self.status = MutationStatus::Committed;
    self.previous_snapshot = None;
  }

  /// Mark rolled back and hand out the snapshot to restore, if any.
  pub fn roll_back(&mut self) -> Option<(T, EntryState)> {
    self.status = MutationStatus::RolledBack;
    self.previous_snapshot.take()
  }

  /// Mark cancelled and hand out the snapshot; the caller decides whether
  /// to restore it.
  pub fn cancel(&mut self) -> Option<(T, EntryState)> {
    self.status = MutationStatus::Cancelled;
    self.previous_snapshot.take()
  }

  pub fn is_settled(&self) -> bool {
    self.status != MutationStatus::Pending
  }
}

impl<T> fmt::Debug for MutationRecord<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationRecord")
      .field("target_key", &self.target_key)
      .field("has_snapshot", &self.previous_snapshot.is_some())
      .field("status", &self.status)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;

  #[test]
  fn test_apply_snapshots_before_patching() {
    let key = query_key!("likes");
    let mut record = MutationRecord::new(key.clone(), Some(Box::new(|n: &i32| n + 1) as Patch<i32>));
    let entry = CacheEntry::new(key, 5, EntryState::Idle);

    assert_eq!(record.apply(&entry), Some(6));
    assert!(record.has_snapshot());
    // Patch is consumed
    assert_eq!(record.apply(&entry), None);

    assert_eq!(record.roll_back(), Some((5, EntryState::Idle)));
    assert_eq!(record.status(), MutationStatus::RolledBack);
    assert_eq!(record.roll_back(), None);
  }

  #[test]
  fn test_commit_drops_snapshot() {
    let key = query_key!("likes");
    let mut record = MutationRecord::new(key.clone(), Some(Box::new(|n: &i32| n * 2) as Patch<i32>));
    record.apply(&CacheEntry::new(key, 3, EntryState::Stale));

    record.commit();
    assert_eq!(record.status(), MutationStatus::Committed);
    assert!(!record.has_snapshot());
  }

  #[test]
  fn test_cancel_hands_out_snapshot_once() {
    let key = query_key!("likes");
    let mut record = MutationRecord::new(key.clone(), Some(Box::new(|n: &i32| n + 1) as Patch<i32>));
    record.apply(&CacheEntry::new(key, 1, EntryState::Idle));
    assert!(!record.is_settled());

    assert_eq!(record.cancel(), Some((1, EntryState::Idle)));
    assert_eq!(record.status(), MutationStatus::Cancelled);
    assert!(record.is_settled());
    assert_eq!(record.cancel(), None);
  }

  #[test]
  fn test_without_patch_nothing_is_snapshotted() {
    let key = query_key!("likes");
    let mut record: MutationRecord<i32> = MutationRecord::new(key.clone(), None);
    assert_eq!(record.apply(&CacheEntry::new(key, 3, EntryState::Idle)), None);
    assert!(!record.has_snapshot());
    assert_eq!(record.status(), MutationStatus::Pending);
  }
}
