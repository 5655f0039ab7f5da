//! Background eviction sweep.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::store::CacheStore;

/// Run [`CacheStore::evict_expired`] every `every` until `shutdown` flips to
/// `true` (or its sender is dropped). The task returns the total number of
/// evicted entries.
pub fn spawn_sweeper<T>(
  store: CacheStore<T>,
  every: Duration,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<usize>
where
  T: Clone + Send + Sync + 'static,
{
  tokio::spawn(async move {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut total = 0;

    debug!(interval_ms = every.as_millis() as u64, "eviction sweeper started");

    loop {
      tokio::select! {
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
        _ = ticker.tick() => {
          total += store.evict_expired();
        }
      }
    }

    info!(evicted = total, "eviction sweeper stopped");
    total
  })
}
