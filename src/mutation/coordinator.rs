//! Optimistic writes against a remote service.
//!
//! A mutation runs in four steps:
//! 1. Wait for the key's lane; mutations on one key run one at a time, FIFO
//! 2. Snapshot the cached entry and write the optimistic patch (`Fetching`)
//! 3. Await the caller's remote call
//! 4. Commit or restore the snapshot, then reconcile per policy
//!
//! The next queued mutation snapshots the state the previous one settled
//! on, so a rollback always restores a value the cache actually held.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as LaneLock, OwnedMutexGuard};
use tracing::{debug, debug_span, warn, Instrument};

use super::cancel::CancelToken;
use super::policy::{AlwaysRefetch, ReconcilePolicy, Reconciliation, Settlement, TrustOnCommit};
use super::record::{MutationRecord, Patch};
use crate::cache::{CacheStore, EntryState, PendingMutation, QueryKey};
use crate::error::{BoxError, CacheError};

/// What to do with the optimistic value when the remote call is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelBehavior {
  /// Restore the snapshot
  #[default]
  RollBack,
  /// Leave the optimistic value in place, marked stale
  KeepOptimistic,
}

/// One mutation call, built up before handing it to
/// [`MutationCoordinator::run`].
pub struct Mutation<T> {
  key: QueryKey,
  patch: Option<Patch<T>>,
  policy: Arc<dyn ReconcilePolicy>,
  cancel: Option<CancelToken>,
  on_cancel: CancelBehavior,
}

impl<T> Mutation<T> {
  /// A mutation of `key` with no optimistic patch and the default
  /// [`AlwaysRefetch`] policy.
  pub fn new(key: QueryKey) -> Self {
    Self {
      key,
      patch: None,
      policy: Arc::new(AlwaysRefetch),
      cancel: None,
      on_cancel: CancelBehavior::default(),
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn optimistic<F>(mut self, patch: F) -> Self
  where
    F: FnOnce(&T) -> T + Send + 'static,
  {
    self.patch = Some(Box::new(patch));
    self
  }

  pub fn policy<P: ReconcilePolicy + 'static>(mut self, policy: P) -> Self {
    self.policy = Arc::new(policy);
    self
  }

  /// Declare the patch exact: skip the post-commit refetch.
  pub fn exact(self) -> Self {
    self.policy(TrustOnCommit)
  }

  pub fn cancel_with(mut self, token: CancelToken) -> Self {
    self.cancel = Some(token);
    self
  }

  pub fn keep_on_cancel(mut self) -> Self {
    self.on_cancel = CancelBehavior::KeepOptimistic;
    self
  }
}

impl<T> fmt::Debug for Mutation<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("key", &self.key)
      .field("optimistic", &self.patch.is_some())
      .field("policy", &self.policy)
      .field("on_cancel", &self.on_cancel)
      .finish_non_exhaustive()
  }
}

type Lanes = Arc<Mutex<HashMap<QueryKey, Arc<LaneLock<()>>>>>;

/// Exclusive turn on one key's lane. Dropping it lets the next mutation in.
struct LaneGuard {
  lanes: Lanes,
  key: QueryKey,
  lane: Arc<LaneLock<()>>,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard {
  fn drop(&mut self) {
    drop(self.guard.take());
    let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
    // Only the map and this guard still point at the lane: nobody is queued
    if Arc::strong_count(&self.lane) == 2 {
      lanes.remove(&self.key);
    }
  }
}

/// A mutation between its optimistic write and its settlement.
///
/// Dropped unsettled (the caller's future was dropped, timed out or
/// aborted), it restores the snapshot marked stale.
struct InFlight<'a, T: Clone + Send + Sync + 'static> {
  store: &'a CacheStore<T>,
  record: MutationRecord<T>,
  pending: Option<PendingMutation<T>>,
}

impl<T: Clone + Send + Sync + 'static> InFlight<'_, T> {
  /// Release the key's pending marker. Returns whether the key was
  /// invalidated meanwhile.
  fn finish(&mut self) -> bool {
    self.pending.take().is_some_and(PendingMutation::finish)
  }
}

impl<T: Clone + Send + Sync + 'static> Drop for InFlight<'_, T> {
  fn drop(&mut self) {
    if self.record.is_settled() {
      return;
    }
    let invalidated = self.finish();
    let key = self.record.target_key().clone();
    match self.record.roll_back() {
      Some((data, _)) => {
        warn!(key = %key, "mutation dropped before settling, optimistic update rolled back");
        self.store.set(&key, data, EntryState::Stale);
      }
      None if invalidated => {
        self.store.set_state(&key, EntryState::Stale);
      }
      None => {}
    }
  }
}

/// Runs mutations against one [`CacheStore`].
pub struct MutationCoordinator<T> {
  store: CacheStore<T>,
  lanes: Lanes,
}

impl<T> Clone for MutationCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      lanes: Arc::clone(&self.lanes),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> MutationCoordinator<T> {
  pub fn new(store: CacheStore<T>) -> Self {
    Self {
      store,
      lanes: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn store(&self) -> &CacheStore<T> {
    &self.store
  }

  /// Apply `patch` to `key` optimistically while `remote_call` runs.
  ///
  /// A rejected remote call restores the previous value and surfaces as
  /// [`CacheError::MutationFailed`]. Either way a background refetch of
  /// `key` follows.
  pub async fn mutate<P, F, Fut, R, E>(
    &self,
    key: &QueryKey,
    patch: P,
    remote_call: F,
  ) -> Result<R, CacheError>
  where
    P: FnOnce(&T) -> T + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<BoxError>,
  {
    self
      .run(Mutation::new(key.clone()).optimistic(patch), remote_call)
      .await
  }

  /// Run a fully configured [`Mutation`].
  pub async fn run<F, Fut, R, E>(&self, mutation: Mutation<T>, remote_call: F) -> Result<R, CacheError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<BoxError>,
  {
    let span = debug_span!(
      "mutation",
      key = %mutation.key,
      fingerprint = %mutation.key.fingerprint()
    );
    self.run_in_lane(mutation, remote_call).instrument(span).await
  }

  async fn run_in_lane<F, Fut, R, E>(
    &self,
    mutation: Mutation<T>,
    remote_call: F,
  ) -> Result<R, CacheError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<BoxError>,
  {
    let Mutation {
      key,
      patch,
      policy,
      cancel,
      on_cancel,
    } = mutation;

    let _lane = self.enter_lane(&key).await;
    let mut flight = InFlight {
      store: &self.store,
      record: MutationRecord::new(key.clone(), patch),
      pending: Some(self.store.begin_mutation(&key)),
    };
    // An in-flight fetch must not land on top of the optimistic value
    self.store.cancel_fetch(&key);

    match self.store.get(&key) {
      Some(entry) => {
        if let Some(optimistic) = flight.record.apply(&entry) {
          self.store.set(&key, optimistic, EntryState::Fetching);
        }
      }
      None => debug!("no cached entry, skipping optimistic update"),
    }

    let settled = match &cancel {
      Some(token) => tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = remote_call() => Some(result),
      },
      None => Some(remote_call().await),
    };

    match settled {
      Some(Ok(value)) => {
        flight.record.commit();
        let invalidated = flight.finish();
        debug!("mutation committed");
        self.reconcile(&flight.record, policy.as_ref(), invalidated);
        Ok(value)
      }
      Some(Err(err)) => {
        let source: BoxError = err.into();
        let invalidated = flight.finish();
        let snapshot = flight.record.roll_back();
        self.restore(&key, snapshot, invalidated);
        warn!(error = %source, "remote call failed, optimistic update rolled back");
        self.reconcile(&flight.record, policy.as_ref(), invalidated);
        Err(CacheError::MutationFailed { key, source })
      }
      None => {
        let invalidated = flight.finish();
        let snapshot = flight.record.cancel();
        match on_cancel {
          CancelBehavior::RollBack => self.restore(&key, snapshot, false),
          CancelBehavior::KeepOptimistic => {
            if snapshot.is_some() {
              self.store.set_state(&key, EntryState::Stale);
            }
          }
        }
        if invalidated {
          // The deferred invalidation is still owed: stale, refetch if observed
          self.store.invalidate(&key);
        }
        debug!(?on_cancel, invalidated, "mutation cancelled");
        Err(CacheError::Cancelled { key })
      }
    }
  }

  async fn enter_lane(&self, key: &QueryKey) -> LaneGuard {
    let lane = {
      let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
      Arc::clone(lanes.entry(key.clone()).or_default())
    };

    let guard = match Arc::clone(&lane).try_lock_owned() {
      Ok(guard) => guard,
      Err(_) => {
        debug!("queued behind in-flight mutation");
        Arc::clone(&lane).lock_owned().await
      }
    };

    LaneGuard {
      lanes: Arc::clone(&self.lanes),
      key: key.clone(),
      lane,
      guard: Some(guard),
    }
  }

  /// Put the snapshot back. An invalidation that arrived while the mutation
  /// was pending applies to the restored value too.
  fn restore(&self, key: &QueryKey, snapshot: Option<(T, EntryState)>, invalidated: bool) {
    if let Some((data, state)) = snapshot {
      let state = if invalidated { EntryState::Stale } else { state };
      self.store.set(key, data, state);
    }
  }

  fn reconcile(
    &self,
    record: &MutationRecord<T>,
    policy: &dyn ReconcilePolicy,
    invalidated_while_pending: bool,
  ) {
    let key = record.target_key();
    let settlement = Settlement {
      key,
      status: record.status(),
      invalidated_while_pending,
    };

    match policy.reconcile(&settlement) {
      Reconciliation::Refetch => {
        if !self.store.refetch(key) {
          debug!("no query function to reconcile with, marking stale");
          self.store.set_state(key, EntryState::Stale);
        }
      }
      Reconciliation::Keep => {
        self.store.set_state(key, EntryState::Idle);
      }
    }
  }
}
