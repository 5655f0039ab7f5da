//! Caller-side cancellation for pending remote calls.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation flag. All clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self {
      tx: Arc::new(tx),
      rx,
    }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    // The sender lives in `self`, so `changed` cannot fail here
    while !*rx.borrow_and_update() {
      if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}
