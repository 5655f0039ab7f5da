//! Disposer handle returned by [`CacheStore::subscribe`](super::CacheStore::subscribe).

use std::fmt;
use std::sync::{Mutex, PoisonError, Weak};

use super::key::QueryKey;
use super::store::Inner;

/// Registration of one subscriber callback.
///
/// The callback stays registered until [`Subscription::unsubscribe`] is
/// called or the handle is dropped, whichever comes first.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<T> {
  inner: Weak<Mutex<Inner<T>>>,
  key: QueryKey,
  id: u64,
  active: bool,
}

impl<T> Subscription<T> {
  pub(super) fn new(inner: Weak<Mutex<Inner<T>>>, key: QueryKey, id: u64) -> Self {
    Self {
      inner,
      key,
      id,
      active: true,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn is_active(&self) -> bool {
    self.active
  }

  /// Remove the callback. Calling this again is a no-op.
  pub fn unsubscribe(&mut self) {
    if !std::mem::replace(&mut self.active, false) {
      return;
    }
    // Store already gone: nothing left to notify us
    if let Some(inner) = self.inner.upgrade() {
      let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
      inner.remove_listener(&self.key, self.id);
    }
  }
}

impl<T> Drop for Subscription<T> {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl<T> fmt::Debug for Subscription<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("active", &self.active)
      .finish()
  }
}
