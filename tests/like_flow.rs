//! End-to-end: a listing screen liking products against a flaky backend.

use qcache::cache::gc::spawn_sweeper;
use qcache::market::{demo_catalog, InMemoryBackend, MarketClient, Product};
use qcache::{EntryState, StoreConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

fn p1(products: &[Product]) -> (u32, bool) {
  let product = products.iter().find(|product| product.id == "P1").unwrap();
  (product.likes_count, product.is_liked)
}

#[tokio::test(start_paused = true)]
async fn test_like_rollback_then_commit() {
  let backend = InMemoryBackend::new(demo_catalog()).with_latency(Duration::from_millis(50));
  let client = MarketClient::new(
    Arc::new(backend.clone()),
    Some("u1".to_string()),
    StoreConfig::default(),
  );
  let key = client.listings_key();

  let seen = Arc::new(Mutex::new(Vec::new()));
  let _screen = {
    let seen = seen.clone();
    client.listings().subscribe(&key, move |entry| {
      seen.lock().unwrap().push((entry.state, p1(&entry.data)));
    })
  };

  assert_eq!(p1(&client.products().await.unwrap()), (5, false));

  // Rejected write: optimistic flip, then rollback and a confirming refetch
  backend.fail_next_writes(1);
  assert!(client.toggle_like("P1").await.is_err());
  client.listings().wait_idle(&key).await;

  // Accepted write: optimistic flip, then the refetch agrees
  assert!(client.toggle_like("P1").await.unwrap());
  client.listings().wait_idle(&key).await;

  let seen = seen.lock().unwrap().clone();
  let values: Vec<(u32, bool)> = seen.iter().map(|(_, value)| *value).collect();
  assert!(values.contains(&(6, true)));

  let rollback = seen
    .iter()
    .position(|(_, value)| *value == (6, true))
    .unwrap();
  assert_eq!(seen[rollback + 1].1, (5, false));

  let (state, last) = *seen.last().unwrap();
  assert_eq!(state, EntryState::Idle);
  assert_eq!(last, (6, true));
  assert_eq!(backend.likes_count("P1"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_listing_is_swept() {
  let backend = InMemoryBackend::new(demo_catalog());
  let config = StoreConfig {
    gc_time: Duration::from_secs(30),
    ..StoreConfig::default()
  };
  let client = MarketClient::new(Arc::new(backend), Some("u1".to_string()), config);
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let sweeper = spawn_sweeper(client.listings().clone(), Duration::from_secs(10), shutdown_rx);

  let subscription = {
    client.products().await.unwrap();
    client.listings().subscribe(&client.listings_key(), |_| {})
  };

  tokio::time::sleep(Duration::from_secs(60)).await;
  assert!(client.listings().get(&client.listings_key()).is_some());

  drop(subscription);
  tokio::time::sleep(Duration::from_secs(45)).await;
  assert!(client.listings().is_empty());

  shutdown_tx.send(true).unwrap();
  assert!(sweeper.await.unwrap() >= 1);
}
