//! Poll-based view of one cached query, for render loops.
//!
//! Inspired by TanStack Query's observers: a `QueryObserver<T>` subscribes
//! to one key of a [`CacheStore`] and forwards every write through a channel,
//! so the store callback never blocks. The owner drains updates with
//! [`QueryObserver::poll`] from its event loop tick.
//!
//! # Example
//!
//! ```ignore
//! let mut listings = QueryObserver::new(client.listings().clone(), key);
//! listings.fetch();
//!
//! // In event loop tick
//! if listings.poll() {
//!     // State changed, re-render
//! }
//!
//! match listings.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Ready(entry) => render_products(&entry.data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use tokio::sync::mpsc;

use super::entry::{CacheEntry, EntryState};
use super::key::QueryKey;
use super::store::CacheStore;
use super::subscription::Subscription;

/// The state of an observed query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Nothing cached and no fetch started
  Idle,
  /// First fetch in flight, nothing to show yet
  Loading,
  /// Cached data is available (it may itself be fetching or stale)
  Ready(CacheEntry<T>),
  /// First fetch failed with nothing cached
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, QueryState::Ready(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn entry(&self) -> Option<&CacheEntry<T>> {
    match self {
      QueryState::Ready(entry) => Some(entry),
      _ => None,
    }
  }

  pub fn data(&self) -> Option<&T> {
    self.entry().map(|entry| &entry.data)
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

#[derive(Debug)]
enum ObserverEvent<T> {
  Entry(CacheEntry<T>),
  Failed(String),
}

/// Subscribed, poll-driven view of one query key.
pub struct QueryObserver<T: Clone + Send + Sync + 'static> {
  store: CacheStore<T>,
  key: QueryKey,
  state: QueryState<T>,
  sender: mpsc::UnboundedSender<ObserverEvent<T>>,
  receiver: mpsc::UnboundedReceiver<ObserverEvent<T>>,
  _subscription: Subscription<T>,
}

impl<T: Clone + Send + Sync + 'static> QueryObserver<T> {
  pub fn new(store: CacheStore<T>, key: QueryKey) -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();

    let forward = sender.clone();
    let subscription = store.subscribe(&key, move |entry| {
      // Receiver lives as long as the observer
      let _ = forward.send(ObserverEvent::Entry(entry.clone()));
    });
    let state = store.get(&key).map_or(QueryState::Idle, QueryState::Ready);

    Self {
      store,
      key,
      state,
      sender,
      receiver,
      _subscription: subscription,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Loading, or showing data while a fetch or mutation is in flight.
  pub fn is_fetching(&self) -> bool {
    match &self.state {
      QueryState::Loading => true,
      QueryState::Ready(entry) => entry.state == EntryState::Fetching,
      _ => false,
    }
  }

  pub fn is_stale(&self) -> bool {
    self
      .state
      .entry()
      .is_some_and(|entry| entry.state == EntryState::Stale)
  }

  /// Start a cache-first fetch unless one is already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    if self.state.entry().is_none() {
      self.state = QueryState::Loading;
    }

    let store = self.store.clone();
    let key = self.key.clone();
    let tx = self.sender.clone();
    tokio::spawn(async move {
      let event = match store.fetch(&key).await {
        Ok(outcome) => ObserverEvent::Entry(outcome.entry),
        Err(err) => ObserverEvent::Failed(err.to_string()),
      };
      // Ignore send errors - observer may have been dropped
      let _ = tx.send(event);
    });
  }

  /// Force a background refetch, cancelling any pending one.
  ///
  /// Returns `false` when the key has no query function.
  pub fn refetch(&mut self) -> bool {
    if !self.store.refetch(&self.key) {
      return false;
    }
    if self.state.entry().is_none() {
      self.state = QueryState::Loading;
    }
    true
  }

  /// Apply updates delivered since the last poll.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok(event) = self.receiver.try_recv() {
      match event {
        ObserverEvent::Entry(entry) => self.state = QueryState::Ready(entry),
        ObserverEvent::Failed(error) => {
          // A write that raced the failure wins
          if self.state.entry().is_none() {
            self.state = QueryState::Error(error);
          }
        }
      }
      changed = true;
    }
    changed
  }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
