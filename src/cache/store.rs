//! Keyed in-memory cache with synchronous subscriber notification.
//!
//! The store owns every [`CacheEntry`]. Writes notify the key's subscribers
//! before returning; callbacks always run after the internal lock is
//! released, so a callback may read (or write) the store.
//!
//! Fetches run as background Tokio tasks. Each fetch gets a generation
//! number and its result only lands if it is still the key's in-flight
//! fetch, so a cancelled or superseded fetch never overwrites the cache.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, EntryState, FetchOutcome};
use super::key::QueryKey;
use super::subscription::Subscription;
use crate::error::{BoxError, CacheError};

/// Fetcher registered for a key, called for every (re)fetch.
pub type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&CacheEntry<T>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchStatus {
  Done,
  Failed(String),
  /// Cancelled, or replaced by a newer fetch of the same key
  Superseded,
}

type FetchHandle = Shared<BoxFuture<'static, FetchStatus>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
  /// A caller awaits the result (`fetch`)
  Foreground,
  /// Invalidation or reconciliation (`refetch`)
  Background,
}

/// Timing knobs for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
  /// How long fetched data counts as fresh for `fetch`
  pub stale_time: chrono::Duration,
  /// How long an entry may sit without subscribers before eviction
  pub gc_time: Duration,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      stale_time: chrono::Duration::minutes(5),
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

struct InflightFetch {
  generation: u64,
  handle: FetchHandle,
  abort: AbortHandle,
}

struct Slot<T> {
  entry: Option<CacheEntry<T>>,
  listeners: BTreeMap<u64, Listener<T>>,
  query_fn: Option<QueryFn<T>>,
  /// Set while nobody is subscribed; start of the eviction clock
  idle_since: Option<Instant>,
  inflight: Option<InflightFetch>,
  pending_mutations: usize,
  invalidated_while_pending: bool,
}

impl<T> Slot<T> {
  fn new(now: Instant) -> Self {
    Self {
      entry: None,
      listeners: BTreeMap::new(),
      query_fn: None,
      idle_since: Some(now),
      inflight: None,
      pending_mutations: 0,
      invalidated_while_pending: false,
    }
  }

  /// Restart the eviction clock after a write to an unsubscribed entry.
  fn touch(&mut self, now: Instant) {
    if self.listeners.is_empty() {
      self.idle_since = Some(now);
    }
  }

  fn is_expired(&self, now: Instant, gc_time: Duration) -> bool {
    self.listeners.is_empty()
      && self.inflight.is_none()
      && self.pending_mutations == 0
      && self
        .idle_since
        .is_some_and(|since| now.duration_since(since) > gc_time)
  }
}

pub(super) struct Inner<T> {
  slots: HashMap<QueryKey, Slot<T>>,
  next_listener: u64,
  next_generation: u64,
}

impl<T> Inner<T> {
  fn slot_mut(&mut self, key: &QueryKey) -> &mut Slot<T> {
    self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(Instant::now()))
  }

  pub(super) fn remove_listener(&mut self, key: &QueryKey, id: u64) {
    if let Some(slot) = self.slots.get_mut(key) {
      if slot.listeners.remove(&id).is_some() && slot.listeners.is_empty() {
        slot.idle_since = Some(Instant::now());
        trace!(key = %key, "last subscriber left");
      }
    }
  }
}

fn collect_listeners<T>(listeners: &BTreeMap<u64, Listener<T>>) -> Vec<Listener<T>> {
  listeners.values().cloned().collect()
}

fn notify<T>(entry: &CacheEntry<T>, listeners: &[Listener<T>]) {
  for listener in listeners {
    listener(entry);
  }
}

/// Shared handle to the cache. Cloning is cheap and clones share state.
pub struct CacheStore<T> {
  inner: Arc<Mutex<Inner<T>>>,
  config: StoreConfig,
}

impl<T> Clone for CacheStore<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      config: self.config.clone(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Default for CacheStore<T> {
  fn default() -> Self {
    Self::new(StoreConfig::default())
  }
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
  pub fn new(config: StoreConfig) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        slots: HashMap::new(),
        next_listener: 0,
        next_generation: 0,
      })),
      config,
    }
  }

  pub fn config(&self) -> &StoreConfig {
    &self.config
  }

  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    // A panicking subscriber never holds this lock, so the data is consistent
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Latest entry for `key`, or `None` on a miss.
  ///
  /// An entry whose eviction TTL already elapsed is dropped here and
  /// reported as absent.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    let mut inner = self.lock();
    let expired = inner
      .slots
      .get(key)
      .is_some_and(|slot| slot.is_expired(Instant::now(), self.config.gc_time));
    if expired {
      inner.slots.remove(key);
      debug!(key = %key, "evicted expired entry on access");
      return None;
    }
    inner.slots.get(key).and_then(|slot| slot.entry.clone())
  }

  /// Read without the lazy eviction check.
  fn peek(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self
      .lock()
      .slots
      .get(key)
      .and_then(|slot| slot.entry.clone())
  }

  /// Replace the entry's data and state, then notify every subscriber.
  pub fn set(&self, key: &QueryKey, data: T, state: EntryState) -> CacheEntry<T> {
    let (entry, listeners) = {
      let mut inner = self.lock();
      let slot = inner.slot_mut(key);
      let entry = CacheEntry::new(key.clone(), data, state);
      slot.entry = Some(entry.clone());
      slot.touch(Instant::now());
      (entry, collect_listeners(&slot.listeners))
    };
    trace!(key = %key, ?state, subscribers = listeners.len(), "entry set");
    notify(&entry, &listeners);
    entry
  }

  /// Set the result of `f` applied to the current data, keeping the state.
  /// A miss is a no-op.
  pub fn update<F>(&self, key: &QueryKey, f: F) -> Option<CacheEntry<T>>
  where
    F: FnOnce(&T) -> T,
  {
    let current = self.get(key)?;
    Some(self.set(key, f(&current.data), current.state))
  }

  /// Change only the state of an existing entry. Notifies on change.
  pub(crate) fn set_state(&self, key: &QueryKey, state: EntryState) -> Option<CacheEntry<T>> {
    let (entry, listeners) = {
      let mut inner = self.lock();
      let slot = inner.slots.get_mut(key)?;
      let entry = slot.entry.as_mut()?;
      if entry.state == state {
        return Some(entry.clone());
      }
      entry.state = state;
      (entry.clone(), collect_listeners(&slot.listeners))
    };
    notify(&entry, &listeners);
    Some(entry)
  }

  /// Register `callback` for every write to `key`.
  pub fn subscribe<F>(&self, key: &QueryKey, callback: F) -> Subscription<T>
  where
    F: Fn(&CacheEntry<T>) + Send + Sync + 'static,
  {
    let mut inner = self.lock();
    let id = inner.next_listener;
    inner.next_listener += 1;

    let slot = inner.slot_mut(key);
    slot.listeners.insert(id, Arc::new(callback));
    slot.idle_since = None;
    trace!(key = %key, subscribers = slot.listeners.len(), "subscribed");

    Subscription::new(Arc::downgrade(&self.inner), key.clone(), id)
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self
      .lock()
      .slots
      .get(key)
      .map_or(0, |slot| slot.listeners.len())
  }

  /// Register the fetcher used whenever `key` is (re)fetched.
  pub fn set_query_fn<F, Fut, E>(&self, key: &QueryKey, query_fn: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
  {
    let query_fn: QueryFn<T> = Arc::new(move || {
      let fut = query_fn();
      async move { fut.await.map_err(Into::into) }.boxed()
    });
    self.lock().slot_mut(key).query_fn = Some(query_fn);
  }

  pub fn has_query_fn(&self, key: &QueryKey) -> bool {
    self
      .lock()
      .slots
      .get(key)
      .is_some_and(|slot| slot.query_fn.is_some())
  }

  /// Mark `key` stale, keeping its data servable.
  ///
  /// Schedules a background refetch if the key has subscribers and a query
  /// function. While a mutation is pending on the key the refetch is
  /// deferred to the mutation's settlement. Returns whether a refetch
  /// started.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    let (notice, should_refetch) = {
      let mut inner = self.lock();
      let Some(slot) = inner.slots.get_mut(key) else {
        return false;
      };

      if slot.pending_mutations > 0 {
        slot.invalidated_while_pending = true;
        debug!(key = %key, "invalidation deferred until pending mutation settles");
        return false;
      }

      let should_refetch = !slot.listeners.is_empty() && slot.query_fn.is_some();
      let notice = slot.entry.as_mut().map(|entry| {
        entry.state = EntryState::Stale;
        (entry.clone(), collect_listeners(&slot.listeners))
      });
      (notice, should_refetch)
    };

    if let Some((entry, listeners)) = notice {
      notify(&entry, &listeners);
    }

    should_refetch && self.start_fetch(key, FetchKind::Background).is_some()
  }

  /// Invalidate every key that starts with `prefix`. Returns how many matched.
  pub fn invalidate_matching(&self, prefix: &QueryKey) -> usize {
    let keys: Vec<QueryKey> = self
      .lock()
      .slots
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();

    for key in &keys {
      self.invalidate(key);
    }
    debug!(prefix = %prefix, matched = keys.len(), "invalidated matching keys");
    keys.len()
  }

  /// Start a background fetch of `key`, replacing any in-flight one.
  ///
  /// Returns `false` when no query function is registered. A failure keeps
  /// the cached data and marks the entry stale.
  pub fn refetch(&self, key: &QueryKey) -> bool {
    self.start_fetch(key, FetchKind::Background).is_some()
  }

  /// Cache-first read of `key` through its registered query function.
  ///
  /// 1. Fresh entry: returned immediately
  /// 2. Missing or stale: fetched (joining an in-flight fetch if any)
  /// 3. Fetch failed: cached data is served in offline mode
  pub async fn fetch(&self, key: &QueryKey) -> Result<FetchOutcome<T>, CacheError> {
    if let Some(entry) = self.get(key) {
      if entry.is_fresh(self.config.stale_time) {
        trace!(key = %key, "serving fresh entry");
        return Ok(FetchOutcome::from_cache(entry));
      }
    }

    let mut handle = match self.inflight_handle(key) {
      Some((_, handle)) => handle,
      None => self
        .start_fetch(key, FetchKind::Foreground)
        .ok_or_else(|| CacheError::NoQueryFn { key: key.clone() })?,
    };

    loop {
      match handle.await {
        FetchStatus::Done => {
          return self
            .peek(key)
            .map(FetchOutcome::from_network)
            .ok_or_else(|| CacheError::FetchFailed {
              key: key.clone(),
              message: "entry removed before it could be read".to_string(),
            });
        }
        FetchStatus::Failed(message) => {
          return match self.peek(key) {
            Some(entry) => {
              debug!(key = %key, error = %message, "serving cached data offline");
              Ok(FetchOutcome::offline(entry))
            }
            None => Err(CacheError::FetchFailed {
              key: key.clone(),
              message,
            }),
          };
        }
        FetchStatus::Superseded => match self.inflight_handle(key) {
          Some((_, next)) => handle = next,
          None => {
            return self
              .peek(key)
              .map(FetchOutcome::from_cache)
              .ok_or_else(|| CacheError::FetchFailed {
                key: key.clone(),
                message: "fetch was cancelled".to_string(),
              });
          }
        },
      }
    }
  }

  /// Register `query_fn` for `key`, then [`fetch`](Self::fetch) it.
  pub async fn fetch_with<F, Fut, E>(
    &self,
    key: &QueryKey,
    query_fn: F,
  ) -> Result<FetchOutcome<T>, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
  {
    self.set_query_fn(key, query_fn);
    self.fetch(key).await
  }

  /// Abort the in-flight fetch of `key`; its result will be discarded.
  pub fn cancel_fetch(&self, key: &QueryKey) -> bool {
    let notice = {
      let mut inner = self.lock();
      let Some(slot) = inner.slots.get_mut(key) else {
        return false;
      };
      let Some(inflight) = slot.inflight.take() else {
        return false;
      };
      inflight.abort.abort();
      debug!(key = %key, generation = inflight.generation, "cancelled in-flight fetch");

      slot
        .entry
        .as_mut()
        .filter(|entry| entry.state == EntryState::Fetching)
        .map(|entry| {
          entry.state = EntryState::Stale;
          (entry.clone(), collect_listeners(&slot.listeners))
        })
    };

    if let Some((entry, listeners)) = notice {
      notify(&entry, &listeners);
    }
    true
  }

  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self.inflight_handle(key).is_some()
  }

  /// Resolve once no fetch of `key` is in flight.
  pub async fn wait_idle(&self, key: &QueryKey) {
    while let Some((generation, handle)) = self.inflight_handle(key) {
      handle.await;
      let mut inner = self.lock();
      // A task that died without reporting leaves its record behind
      if let Some(slot) = inner.slots.get_mut(key) {
        if slot
          .inflight
          .as_ref()
          .is_some_and(|inflight| inflight.generation == generation)
        {
          slot.inflight = None;
        }
      }
    }
  }

  /// Forget the entry for `key`. Subscribers stay registered.
  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    let mut inner = self.lock();
    let slot = inner.slots.get_mut(key)?;
    if let Some(inflight) = slot.inflight.take() {
      inflight.abort.abort();
    }
    if slot.listeners.is_empty() && slot.pending_mutations == 0 {
      inner.slots.remove(key).and_then(|slot| slot.entry)
    } else {
      slot.entry.take()
    }
  }

  /// Drop every entry and abort every fetch.
  pub fn clear(&self) {
    let slots = std::mem::take(&mut self.lock().slots);
    for slot in slots.values() {
      if let Some(inflight) = &slot.inflight {
        inflight.abort.abort();
      }
    }
    debug!(cleared = slots.len(), "cache cleared");
  }

  /// Remove entries that have had no subscriber for longer than `gc_time`.
  pub fn evict_expired(&self) -> usize {
    let now = Instant::now();
    let gc_time = self.config.gc_time;
    let mut inner = self.lock();
    let before = inner.slots.len();
    inner.slots.retain(|_, slot| !slot.is_expired(now, gc_time));
    let evicted = before - inner.slots.len();
    if evicted > 0 {
      debug!(evicted, remaining = inner.slots.len(), "evicted unused entries");
    }
    evicted
  }

  /// Keys that currently hold data.
  pub fn keys(&self) -> Vec<QueryKey> {
    self
      .lock()
      .slots
      .iter()
      .filter(|(_, slot)| slot.entry.is_some())
      .map(|(key, _)| key.clone())
      .collect()
  }

  pub fn len(&self) -> usize {
    self
      .lock()
      .slots
      .values()
      .filter(|slot| slot.entry.is_some())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub(crate) fn begin_mutation(&self, key: &QueryKey) -> PendingMutation<T> {
    self.lock().slot_mut(key).pending_mutations += 1;
    PendingMutation {
      store: self.clone(),
      key: key.clone(),
      finished: false,
    }
  }

  /// Returns whether the key was invalidated while the mutation was pending.
  fn end_mutation(&self, key: &QueryKey) -> bool {
    let mut inner = self.lock();
    let Some(slot) = inner.slots.get_mut(key) else {
      return false;
    };
    slot.pending_mutations = slot.pending_mutations.saturating_sub(1);
    slot.touch(Instant::now());
    if slot.pending_mutations == 0 {
      std::mem::take(&mut slot.invalidated_while_pending)
    } else {
      slot.invalidated_while_pending
    }
  }

  fn inflight_handle(&self, key: &QueryKey) -> Option<(u64, FetchHandle)> {
    self
      .lock()
      .slots
      .get(key)
      .and_then(|slot| slot.inflight.as_ref())
      .map(|inflight| (inflight.generation, inflight.handle.clone()))
  }

  fn start_fetch(&self, key: &QueryKey, kind: FetchKind) -> Option<FetchHandle> {
    let (go, handle, generation, notice) = {
      let mut inner = self.lock();
      inner.next_generation += 1;
      let generation = inner.next_generation;

      let slot = inner.slots.get_mut(key)?;
      let query_fn = slot.query_fn.clone()?;
      if let Some(previous) = slot.inflight.take() {
        previous.abort.abort();
        debug!(key = %key, generation = previous.generation, "superseding in-flight fetch");
      }

      // The task waits for `go` so subscribers see `Fetching` before any result
      let (go, wait_for_go) = oneshot::channel::<()>();
      let store = self.clone();
      let task_key = key.clone();
      let task = tokio::spawn(async move {
        let _ = wait_for_go.await;
        let result = query_fn().await;
        store.complete_fetch(&task_key, generation, kind, result)
      });
      let abort = task.abort_handle();
      let handle: FetchHandle = task
        .map(|joined| match joined {
          Ok(status) => status,
          Err(err) if err.is_cancelled() => FetchStatus::Superseded,
          Err(err) => FetchStatus::Failed(err.to_string()),
        })
        .boxed()
        .shared();
      slot.inflight = Some(InflightFetch {
        generation,
        handle: handle.clone(),
        abort,
      });

      let notice = slot
        .entry
        .as_mut()
        .filter(|entry| entry.state != EntryState::Fetching)
        .map(|entry| {
          entry.state = EntryState::Fetching;
          (entry.clone(), collect_listeners(&slot.listeners))
        });
      (go, handle, generation, notice)
    };

    trace!(key = %key, generation, ?kind, "fetch started");
    if let Some((entry, listeners)) = notice {
      notify(&entry, &listeners);
    }
    let _ = go.send(());
    Some(handle)
  }

  fn complete_fetch(
    &self,
    key: &QueryKey,
    generation: u64,
    kind: FetchKind,
    result: Result<T, BoxError>,
  ) -> FetchStatus {
    let (status, notice) = {
      let mut inner = self.lock();
      let Some(slot) = inner.slots.get_mut(key) else {
        debug!(key = %key, generation, "entry removed while fetching; dropping result");
        return FetchStatus::Superseded;
      };
      let current = slot
        .inflight
        .as_ref()
        .is_some_and(|inflight| inflight.generation == generation);
      if !current {
        debug!(key = %key, generation, "discarding superseded fetch result");
        return FetchStatus::Superseded;
      }
      slot.inflight = None;
      slot.touch(Instant::now());

      match result {
        Ok(data) => {
          let entry = CacheEntry::new(key.clone(), data, EntryState::Idle);
          slot.entry = Some(entry.clone());
          (
            FetchStatus::Done,
            Some((entry, collect_listeners(&slot.listeners))),
          )
        }
        Err(err) => {
          let message = err.to_string();
          let failed_state = match kind {
            FetchKind::Background => {
              let error = CacheError::RefetchFailed {
                key: key.clone(),
                message: message.clone(),
              };
              warn!(fingerprint = %key.fingerprint(), %error, "keeping cached value");
              EntryState::Stale
            }
            FetchKind::Foreground => {
              warn!(key = %key, error = %message, "fetch failed");
              EntryState::Error
            }
          };
          let notice = slot.entry.as_mut().map(|entry| {
            entry.state = failed_state;
            (entry.clone(), collect_listeners(&slot.listeners))
          });
          (FetchStatus::Failed(message), notice)
        }
      }
    };

    if let Some((entry, listeners)) = notice {
      notify(&entry, &listeners);
    }
    status
  }
}

/// Marks a key as having a pending mutation until finished or dropped.
pub(crate) struct PendingMutation<T: Clone + Send + Sync + 'static> {
  store: CacheStore<T>,
  key: QueryKey,
  finished: bool,
}

impl<T: Clone + Send + Sync + 'static> PendingMutation<T> {
  /// Returns whether the key was invalidated while the mutation was pending.
  pub(crate) fn finish(mut self) -> bool {
    self.finished = true;
    self.store.end_mutation(&self.key)
  }
}

impl<T: Clone + Send + Sync + 'static> Drop for PendingMutation<T> {
  fn drop(&mut self) {
    if !self.finished {
      self.store.end_mutation(&self.key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

  fn store() -> CacheStore<i32> {
    CacheStore::new(StoreConfig {
      stale_time: chrono::Duration::minutes(5),
      gc_time: Duration::from_secs(60),
    })
  }

  #[test]
  fn test_get_absent_is_none() {
    let store = store();
    assert!(store.get(&query_key!("missing")).is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_set_replaces_entry() {
    let store = store();
    let key = query_key!("product", "p1");

    store.set(&key, 1, EntryState::Idle);
    let entry = store.set(&key, 2, EntryState::Stale);

    assert_eq!(entry.data, 2);
    let cached = store.get(&key).unwrap();
    assert_eq!(cached.data, 2);
    assert_eq!(cached.state, EntryState::Stale);
    assert_eq!(cached.key, key);
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_set_notifies_every_subscriber_before_returning() {
    let store = store();
    let key = query_key!("product", "p1");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let seen = seen.clone();
      store.subscribe(&key, move |entry| seen.lock().unwrap().push(("a", entry.data)))
    };
    let second = {
      let seen = seen.clone();
      store.subscribe(&key, move |entry| seen.lock().unwrap().push(("b", entry.data)))
    };
    let other = store.subscribe(&query_key!("product", "p2"), |_| panic!("wrong key"));

    store.set(&key, 5, EntryState::Idle);

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![("a", 5), ("b", 5)]);
    assert_eq!(store.subscriber_count(&key), 2);
    drop((first, second, other));
  }

  #[test]
  fn test_subscriber_may_read_store() {
    let store = store();
    let key = query_key!("product", "p1");
    let observed = Arc::new(AtomicUsize::new(0));

    let reader = store.clone();
    let reader_key = key.clone();
    let seen = observed.clone();
    let _sub = store.subscribe(&key, move |_| {
      let data = reader.get(&reader_key).map(|e| e.data).unwrap_or_default();
      seen.store(data as usize, Ordering::SeqCst);
    });

    store.set(&key, 9, EntryState::Idle);
    assert_eq!(observed.load(Ordering::SeqCst), 9);
  }

  #[test]
  fn test_unsubscribe_twice_is_noop() {
    let store = store();
    let key = query_key!("product", "p1");
    let calls = Arc::new(AtomicUsize::new(0));

    let mut sub = {
      let calls = calls.clone();
      store.subscribe(&key, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
      })
    };
    store.set(&key, 1, EntryState::Idle);

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());

    store.set(&key, 2, EntryState::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.subscriber_count(&key), 0);
  }

  #[test]
  fn test_dropping_subscription_unsubscribes() {
    let store = store();
    let key = query_key!("product", "p1");
    let sub = store.subscribe(&key, |_| {});
    assert_eq!(store.subscriber_count(&key), 1);
    drop(sub);
    assert_eq!(store.subscriber_count(&key), 0);
  }

  #[test]
  fn test_update_keeps_state() {
    let store = store();
    let key = query_key!("count");
    assert!(store.update(&key, |n| n + 1).is_none());

    store.set(&key, 1, EntryState::Stale);
    let entry = store.update(&key, |n| n + 1).unwrap();
    assert_eq!(entry.data, 2);
    assert_eq!(entry.state, EntryState::Stale);
  }

  #[tokio::test]
  async fn test_invalidate_without_subscriber_only_marks_stale() {
    let store = store();
    let key = query_key!("count");
    store.set_query_fn(&key, || async { Ok::<_, String>(99) });
    store.set(&key, 1, EntryState::Idle);

    assert!(!store.invalidate(&key));

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.data, 1);
    assert_eq!(entry.state, EntryState::Stale);
    assert!(!store.is_fetching(&key));
  }

  #[tokio::test]
  async fn test_invalidate_with_subscriber_refetches() {
    let store = store();
    let key = query_key!("count");
    store.set_query_fn(&key, || async { Ok::<_, String>(99) });
    store.set(&key, 1, EntryState::Idle);
    let states = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
      let states = states.clone();
      store.subscribe(&key, move |entry| states.lock().unwrap().push(entry.state))
    };

    assert!(store.invalidate(&key));
    // Still servable while the refetch runs
    assert_eq!(store.get(&key).unwrap().data, 1);

    store.wait_idle(&key).await;

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.data, 99);
    assert_eq!(entry.state, EntryState::Idle);
    assert_eq!(
      *states.lock().unwrap(),
      vec![EntryState::Stale, EntryState::Fetching, EntryState::Idle]
    );
  }

  #[tokio::test]
  async fn test_invalidate_matching_prefix() {
    let store = store();
    store.set(&query_key!("products", "u1"), 1, EntryState::Idle);
    store.set(&query_key!("products", "u2"), 2, EntryState::Idle);
    store.set(&query_key!("product", "p1"), 3, EntryState::Idle);

    assert_eq!(store.invalidate_matching(&query_key!("products")), 2);

    assert!(store.get(&query_key!("products", "u1")).unwrap().is_stale());
    assert!(store.get(&query_key!("products", "u2")).unwrap().is_stale());
    assert!(!store.get(&query_key!("product", "p1")).unwrap().is_stale());
  }

  #[tokio::test]
  async fn test_fetch_without_query_fn() {
    let store = store();
    let err = store.fetch(&query_key!("nothing")).await.unwrap_err();
    assert!(matches!(err, CacheError::NoQueryFn { .. }));
  }

  #[tokio::test]
  async fn test_fetch_is_cache_first() {
    let store = store();
    let key = query_key!("count");
    let calls = Arc::new(AtomicU32::new(0));

    let fetcher = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move { Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst) as i32 + 10) }
      }
    };

    let first = store.fetch_with(&key, fetcher).await.unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Network);
    assert_eq!(first.entry.data, 10);

    let second = store.fetch(&key).await.unwrap();
    assert_eq!(second.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(second.entry.data, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fetch_serves_stale_cache_when_offline() {
    let store = store();
    let key = query_key!("count");
    store.set(&key, 4, EntryState::Stale);
    store.set_query_fn(&key, || async { Err::<i32, _>("network down") });

    let outcome = store.fetch(&key).await.unwrap();
    assert_eq!(outcome.source, crate::cache::CacheSource::Offline);
    assert_eq!(outcome.entry.data, 4);
    assert_eq!(store.get(&key).unwrap().state, EntryState::Error);
  }

  #[tokio::test]
  async fn test_fetch_failure_with_empty_cache() {
    let store = store();
    let key = query_key!("count");
    let err = store
      .fetch_with(&key, || async { Err::<i32, _>("network down") })
      .await
      .unwrap_err();

    match err {
      CacheError::FetchFailed { message, .. } => assert_eq!(message, "network down"),
      other => panic!("unexpected error: {other:?}"),
    }
    assert!(store.get(&key).is_none());
  }

  #[tokio::test]
  async fn test_refetch_failure_keeps_data_and_marks_stale() {
    let store = store();
    let key = query_key!("count");
    store.set(&key, 4, EntryState::Idle);
    store.set_query_fn(&key, || async { Err::<i32, _>("boom") });

    assert!(store.refetch(&key));
    store.wait_idle(&key).await;

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.data, 4);
    assert_eq!(entry.state, EntryState::Stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_fetch_never_lands() {
    let store = store();
    let key = query_key!("count");
    store.set(&key, 1, EntryState::Idle);
    store.set_query_fn(&key, || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok::<_, String>(2)
    });

    assert!(store.refetch(&key));
    tokio::task::yield_now().await;
    assert!(store.cancel_fetch(&key));
    assert!(!store.cancel_fetch(&key));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.data, 1);
    assert_eq!(entry.state, EntryState::Stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_supersedes_pending() {
    let store = store();
    let key = query_key!("count");
    let counter = Arc::new(AtomicU32::new(0));
    store.set(&key, -1, EntryState::Idle);
    {
      let counter = counter.clone();
      store.set_query_fn(&key, move || {
        let counter = counter.clone();
        async move {
          let n = counter.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok::<_, String>(n as i32)
        }
      });
    }

    store.refetch(&key);
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.refetch(&key);
    store.wait_idle(&key).await;

    // Only the second fetch was allowed to land
    assert_eq!(store.get(&key).unwrap().data, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribed_entry_evicted_after_ttl() {
    let store = store();
    let key = query_key!("product", "p1");
    store.set(&key, 1, EntryState::Idle);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(store.get(&key).is_some());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(store.get(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribed_entry_is_not_evicted() {
    let store = store();
    let key = query_key!("product", "p1");
    store.set(&key, 1, EntryState::Idle);
    let mut sub = store.subscribe(&key, |_| {});

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(store.evict_expired(), 0);
    assert!(store.get(&key).is_some());

    sub.unsubscribe();
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(store.evict_expired(), 1);
    assert!(store.get(&key).is_none());
  }

  #[test]
  fn test_remove_keeps_subscribers() {
    let store = store();
    let key = query_key!("product", "p1");
    let sub = store.subscribe(&key, |_| {});
    store.set(&key, 1, EntryState::Idle);

    assert_eq!(store.remove(&key).map(|e| e.data), Some(1));
    assert!(store.get(&key).is_none());
    assert_eq!(store.subscriber_count(&key), 1);
    drop(sub);

    store.clear();
    assert!(store.keys().is_empty());
  }
}
