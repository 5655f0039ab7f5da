//! Cached marketplace client with optimistic likes, edits and deletes.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::backend::{BackendError, MarketBackend};
use super::types::{Category, NewProduct, Product, ProductUpdate};
use crate::cache::{CacheStore, QueryKey, StoreConfig};
use crate::error::CacheError;
use crate::mutation::{Mutation, MutationCoordinator};
use crate::query_key;

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
  #[error("sign in first")]
  NotAuthenticated,

  #[error("product {0} not found")]
  ProductNotFound(String),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Backend(#[from] BackendError),
}

impl MarketError {
  /// Unwrap backend failures carried inside a mutation error.
  fn from_mutation(err: CacheError, id: &str) -> Self {
    if let CacheError::MutationFailed { source, .. } = &err {
      if let Some(BackendError::NotFound(_)) = source.downcast_ref::<BackendError>() {
        return Self::ProductNotFound(id.to_string());
      }
    }
    Self::Cache(err)
  }
}

/// Marketplace client for one viewer.
///
/// Listings are cached under `["products", viewer]`, details under
/// `["product", id]` and the category list under `["categories"]`. Clients created with [`for_viewer`](Self::for_viewer)
/// share their caches, so an edit invalidates every viewer's listing.
#[derive(Clone)]
pub struct MarketClient {
  backend: Arc<dyn MarketBackend>,
  viewer: Option<String>,
  listings: MutationCoordinator<Vec<Product>>,
  details: MutationCoordinator<Product>,
  categories: CacheStore<Vec<Category>>,
}

impl MarketClient {
  pub fn new(backend: Arc<dyn MarketBackend>, viewer: Option<String>, config: StoreConfig) -> Self {
    Self {
      backend,
      viewer,
      listings: MutationCoordinator::new(CacheStore::new(config.clone())),
      details: MutationCoordinator::new(CacheStore::new(config.clone())),
      categories: CacheStore::new(config),
    }
  }

  /// Same caches and backend, different viewer.
  pub fn for_viewer(&self, viewer: Option<String>) -> Self {
    Self {
      viewer,
      ..self.clone()
    }
  }

  pub fn viewer(&self) -> Option<&str> {
    self.viewer.as_deref()
  }

  pub fn listings(&self) -> &CacheStore<Vec<Product>> {
    self.listings.store()
  }

  pub fn details(&self) -> &CacheStore<Product> {
    self.details.store()
  }

  pub fn category_store(&self) -> &CacheStore<Vec<Category>> {
    &self.categories
  }

  pub fn categories_key() -> QueryKey {
    query_key!("categories")
  }

  pub fn listings_key(&self) -> QueryKey {
    query_key!("products", self.viewer.clone())
  }

  pub fn detail_key(id: &str) -> QueryKey {
    query_key!("product", id)
  }

  // Eviction drops the query function with the entry; re-register when missing
  fn register_listing_fn(&self) -> QueryKey {
    let key = self.listings_key();
    if self.listings().has_query_fn(&key) {
      return key;
    }
    let backend = Arc::clone(&self.backend);
    let viewer = self.viewer.clone();
    self.listings().set_query_fn(&key, move || {
      let backend = Arc::clone(&backend);
      let viewer = viewer.clone();
      async move { backend.list_products(viewer.as_deref()).await }
    });
    key
  }

  fn register_detail_fn(&self, id: &str) -> QueryKey {
    let key = Self::detail_key(id);
    if self.details().has_query_fn(&key) {
      return key;
    }
    let backend = Arc::clone(&self.backend);
    let viewer = self.viewer.clone();
    let id = id.to_string();
    self.details().set_query_fn(&key, move || {
      let backend = Arc::clone(&backend);
      let viewer = viewer.clone();
      let id = id.clone();
      async move { backend.product(&id, viewer.as_deref()).await }
    });
    key
  }

  /// All listings, served from cache while fresh.
  pub async fn products(&self) -> Result<Vec<Product>, MarketError> {
    let key = self.register_listing_fn();
    let outcome = self.listings().fetch(&key).await?;
    debug!(source = ?outcome.source, "loaded listings");
    Ok(outcome.into_data())
  }

  pub async fn product(&self, id: &str) -> Result<Product, MarketError> {
    let key = self.register_detail_fn(id);
    let outcome = self.details().fetch(&key).await?;
    Ok(outcome.into_data())
  }

  /// Categories a listing can be filed under, served from cache while fresh.
  pub async fn categories(&self) -> Result<Vec<Category>, MarketError> {
    let key = Self::categories_key();
    if !self.categories.has_query_fn(&key) {
      let backend = Arc::clone(&self.backend);
      self.categories.set_query_fn(&key, move || {
        let backend = Arc::clone(&backend);
        async move { backend.categories().await }
      });
    }
    let outcome = self.categories.fetch(&key).await?;
    Ok(outcome.into_data())
  }

  /// Like or unlike `id` for the current viewer. Returns the new liked state.
  ///
  /// The listing flips immediately. Whether the backend sees a like or an
  /// unlike follows the value the optimistic patch saw, so queued toggles
  /// alternate. A like the backend already has counts as success.
  pub async fn toggle_like(&self, id: &str) -> Result<bool, MarketError> {
    let viewer = self.viewer.clone().ok_or(MarketError::NotAuthenticated)?;
    let key = self.register_listing_fn();
    let seen: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));

    let patch = {
      let seen = Arc::clone(&seen);
      let target = id.to_string();
      move |products: &Vec<Product>| {
        products
          .iter()
          .map(|product| {
            if product.id == target {
              *seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(product.is_liked);
              product.with_like_toggled()
            } else {
              product.clone()
            }
          })
          .collect::<Vec<_>>()
      }
    };

    let remote = {
      let backend = Arc::clone(&self.backend);
      let id = id.to_string();
      move || {
        let observed = seen.lock().unwrap_or_else(PoisonError::into_inner).take();
        send_toggle(backend, id, viewer, observed)
      }
    };

    let liked = self
      .listings
      .run(Mutation::new(key).optimistic(patch), remote)
      .await
      .map_err(|err| MarketError::from_mutation(err, id))?;

    self.details().invalidate(&Self::detail_key(id));
    info!(product = %id, liked, "like toggled");
    Ok(liked)
  }

  /// Apply a seller edit. The detail view updates immediately; on success
  /// every viewer's listing is invalidated.
  pub async fn update_product(&self, id: &str, update: ProductUpdate) -> Result<Product, MarketError> {
    let key = self.register_detail_fn(id);
    let patch_update = update.clone();

    let remote = {
      let backend = Arc::clone(&self.backend);
      let id = id.to_string();
      move || async move { backend.update_product(&id, &update).await }
    };

    let product = self
      .details
      .mutate(&key, move |product| patch_update.apply_to(product), remote)
      .await
      .map_err(|err| MarketError::from_mutation(err, id))?;

    let invalidated = self.listings().invalidate_matching(&query_key!("products"));
    info!(product = %id, invalidated, "product updated");
    Ok(product)
  }

  /// List a new product for sale as the current viewer.
  ///
  /// The id comes from the backend, so there is no optimistic entry. The
  /// viewer's listing is refetched once the backend accepts, and every other
  /// viewer's listing is invalidated.
  pub async fn create_product(&self, new: NewProduct) -> Result<Product, MarketError> {
    let seller = self.viewer.clone().ok_or(MarketError::NotAuthenticated)?;
    let key = self.register_listing_fn();

    let remote = {
      let backend = Arc::clone(&self.backend);
      move || async move { backend.create_product(&seller, &new).await }
    };

    let product = self
      .listings
      .run(Mutation::new(key), remote)
      .await?;

    let invalidated = self.listings().invalidate_matching(&query_key!("products"));
    info!(product = %product.id, invalidated, "product created");
    Ok(product)
  }

  /// Delete `id` as its seller. The product leaves the viewer's listing
  /// immediately and comes back if the backend refuses.
  pub async fn delete_product(&self, id: &str) -> Result<(), MarketError> {
    if self.viewer.is_none() {
      return Err(MarketError::NotAuthenticated);
    }
    let key = self.register_listing_fn();

    let patch = {
      let target = id.to_string();
      move |products: &Vec<Product>| {
        products
          .iter()
          .filter(|product| product.id != target)
          .cloned()
          .collect::<Vec<_>>()
      }
    };

    let remote = {
      let backend = Arc::clone(&self.backend);
      let id = id.to_string();
      move || async move { backend.delete_product(&id).await }
    };

    self
      .listings
      .run(Mutation::new(key).optimistic(patch), remote)
      .await
      .map_err(|err| MarketError::from_mutation(err, id))?;

    self.details().remove(&Self::detail_key(id));
    let invalidated = self.listings().invalidate_matching(&query_key!("products"));
    info!(product = %id, invalidated, "product deleted");
    Ok(())
  }
}

/// Like or unlike depending on `observed`, asking the backend when the
/// listing was not cached.
async fn send_toggle(
  backend: Arc<dyn MarketBackend>,
  id: String,
  viewer: String,
  observed: Option<bool>,
) -> Result<bool, BackendError> {
  let was_liked = match observed {
    Some(liked) => liked,
    None => backend.product(&id, Some(viewer.as_str())).await?.is_liked,
  };
  let outcome = if was_liked {
    backend.unlike(&id, &viewer).await
  } else {
    backend.like(&id, &viewer).await
  };
  match outcome {
    Ok(()) => Ok(!was_liked),
    Err(BackendError::DuplicateLike { .. }) => {
      debug!(product = %id, "like already recorded");
      Ok(true)
    }
    Err(err) => Err(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryState;
  use crate::market::{demo_catalog, InMemoryBackend, ProductStatus};
  use futures::poll;
  use std::time::Duration;

  fn setup(viewer: Option<&str>) -> (InMemoryBackend, MarketClient) {
    let backend = InMemoryBackend::new(demo_catalog());
    let client = MarketClient::new(
      Arc::new(backend.clone()),
      viewer.map(str::to_string),
      StoreConfig::default(),
    );
    (backend, client)
  }

  fn listed(client: &MarketClient, id: &str) -> Product {
    client
      .listings()
      .get(&client.listings_key())
      .unwrap()
      .data
      .into_iter()
      .find(|product| product.id == id)
      .unwrap()
  }

  #[tokio::test]
  async fn test_toggle_like_requires_viewer() {
    let (_, client) = setup(None);
    assert!(matches!(
      client.toggle_like("P1").await,
      Err(MarketError::NotAuthenticated)
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_toggle_like_is_optimistic() {
    let backend = InMemoryBackend::new(demo_catalog()).with_latency(Duration::from_millis(200));
    let client = MarketClient::new(
      Arc::new(backend.clone()),
      Some("u1".to_string()),
      StoreConfig::default(),
    );
    client.products().await.unwrap();

    let toggle = client.toggle_like("P1");
    tokio::pin!(toggle);
    assert!(poll!(toggle.as_mut()).is_pending());

    // Visible before the backend has answered
    let product = listed(&client, "P1");
    assert!(product.is_liked);
    assert_eq!(product.likes_count, 6);
    assert!(!backend.is_liked_by("P1", "u1"));

    assert!(toggle.await.unwrap());
    assert!(backend.is_liked_by("P1", "u1"));

    client.listings().wait_idle(&client.listings_key()).await;
    let entry = client.listings().get(&client.listings_key()).unwrap();
    assert_eq!(entry.state, EntryState::Idle);
    assert_eq!(listed(&client, "P1").likes_count, 6);
  }

  #[tokio::test]
  async fn test_failed_like_rolls_back() {
    let (backend, client) = setup(Some("u1"));
    client.products().await.unwrap();
    backend.fail_next_writes(1);

    let err = client.toggle_like("P1").await.unwrap_err();
    assert!(matches!(err, MarketError::Cache(ref e) if e.is_mutation_failure()));

    let product = listed(&client, "P1");
    assert!(!product.is_liked);
    assert_eq!(product.likes_count, 5);
    assert_eq!(backend.likes_count("P1"), 5);
  }

  #[tokio::test]
  async fn test_queued_toggles_alternate() {
    let (backend, client) = setup(Some("u1"));
    client.products().await.unwrap();

    let (first, second) = tokio::join!(client.toggle_like("P3"), client.toggle_like("P3"));
    assert!(first.unwrap());
    assert!(!second.unwrap());

    assert_eq!(
      backend.writes(),
      vec!["like P3 u1".to_string(), "unlike P3 u1".to_string()]
    );
    assert_eq!(backend.likes_count("P3"), 11);
  }

  #[tokio::test]
  async fn test_like_without_cached_listing_asks_backend() {
    let (backend, client) = setup(Some("u1"));
    backend.seed_like("P2", "u1");

    assert!(!client.toggle_like("P2").await.unwrap());
    assert!(!backend.is_liked_by("P2", "u1"));
  }

  #[tokio::test]
  async fn test_duplicate_like_counts_as_success() {
    let (backend, client) = setup(Some("u1"));
    client.products().await.unwrap();
    // Liked elsewhere after our listing was cached
    backend.seed_like("P4", "u1");

    assert!(client.toggle_like("P4").await.unwrap());
    assert!(backend.is_liked_by("P4", "u1"));
  }

  #[tokio::test]
  async fn test_unknown_product_maps_to_not_found() {
    let (_, client) = setup(Some("u1"));
    let err = client
      .update_product("missing", ProductUpdate::default())
      .await
      .unwrap_err();
    assert!(matches!(err, MarketError::ProductNotFound(id) if id == "missing"));
  }

  #[tokio::test]
  async fn test_update_invalidates_every_listing() {
    let (_, alice) = setup(Some("alice"));
    let bob = alice.for_viewer(Some("bob".to_string()));
    alice.products().await.unwrap();
    bob.products().await.unwrap();
    alice.product("P2").await.unwrap();

    let update = ProductUpdate {
      status: Some(ProductStatus::Sold),
      ..Default::default()
    };
    let updated = alice.update_product("P2", update).await.unwrap();
    assert_eq!(updated.status, ProductStatus::Sold);

    for client in [&alice, &bob] {
      let entry = client.listings().get(&client.listings_key()).unwrap();
      assert_eq!(entry.state, EntryState::Stale);
    }

    // Stale listings are refetched on the next read
    let listing = bob.products().await.unwrap();
    let p2 = listing.iter().find(|product| product.id == "P2").unwrap();
    assert_eq!(p2.status, ProductStatus::Sold);
  }

  #[tokio::test]
  async fn test_failed_edit_restores_detail() {
    let (backend, client) = setup(Some("u1"));
    let before = client.product("P1").await.unwrap();
    backend.fail_next_writes(1);

    let update = ProductUpdate {
      title: Some("Broken lamp".to_string()),
      ..Default::default()
    };
    assert!(client.update_product("P1", update).await.is_err());

    let entry = client.details().get(&MarketClient::detail_key("P1")).unwrap();
    assert_eq!(entry.data.title, before.title);
  }

  fn kettle() -> NewProduct {
    NewProduct {
      title: "Kettle".to_string(),
      price: 9.0,
      category: Some("Home".to_string()),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_create_requires_viewer() {
    let (backend, client) = setup(None);
    assert!(matches!(
      client.create_product(kettle()).await,
      Err(MarketError::NotAuthenticated)
    ));
    assert!(backend.writes().is_empty());
  }

  #[tokio::test]
  async fn test_create_invalidates_every_listing() {
    let (_, alice) = setup(Some("alice"));
    let bob = alice.for_viewer(Some("bob".to_string()));
    alice.products().await.unwrap();
    bob.products().await.unwrap();

    let created = alice.create_product(kettle()).await.unwrap();
    assert_eq!(created.seller, "alice");

    let entry = bob.listings().get(&bob.listings_key()).unwrap();
    assert_eq!(entry.state, EntryState::Stale);

    for client in [&alice, &bob] {
      client.listings().wait_idle(&client.listings_key()).await;
      let listing = client.products().await.unwrap();
      // Newest first
      assert_eq!(listing[0].id, created.id);
      assert_eq!(listing.len(), 5);
    }
  }

  #[tokio::test]
  async fn test_create_with_unknown_category_fails() {
    let (_, client) = setup(Some("u1"));
    client.products().await.unwrap();
    let new = NewProduct {
      category: Some("Furniture".to_string()),
      ..kettle()
    };

    let err = client.create_product(new).await.unwrap_err();
    assert!(matches!(err, MarketError::Cache(ref e) if e.is_mutation_failure()));
    assert!(err.to_string().contains("unknown category Furniture"));

    client.listings().wait_idle(&client.listings_key()).await;
    assert_eq!(client.products().await.unwrap().len(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_is_optimistic() {
    let backend = InMemoryBackend::new(demo_catalog()).with_latency(Duration::from_millis(200));
    let client = MarketClient::new(
      Arc::new(backend.clone()),
      Some("seller-1".to_string()),
      StoreConfig::default(),
    );
    client.products().await.unwrap();
    client.product("P2").await.unwrap();

    let delete = client.delete_product("P2");
    tokio::pin!(delete);
    assert!(poll!(delete.as_mut()).is_pending());

    let listing = client.listings().get(&client.listings_key()).unwrap().data;
    assert!(listing.iter().all(|product| product.id != "P2"));

    delete.await.unwrap();
    assert!(client.details().get(&MarketClient::detail_key("P2")).is_none());
    assert_eq!(backend.writes(), vec!["delete P2".to_string()]);
  }

  #[tokio::test]
  async fn test_failed_delete_restores_listing() {
    let (backend, client) = setup(Some("seller-1"));
    client.products().await.unwrap();
    backend.fail_next_writes(1);

    assert!(client.delete_product("P4").await.is_err());
    assert_eq!(listed(&client, "P4").title, "Mini fridge");

    let err = client.delete_product("nope").await.unwrap_err();
    assert!(matches!(err, MarketError::ProductNotFound(id) if id == "nope"));
  }

  #[tokio::test]
  async fn test_categories_are_cached() {
    let (backend, client) = setup(None);
    let first = client.categories().await.unwrap();
    assert_eq!(first.len(), 3);

    backend.set_offline(true);
    assert_eq!(client.categories().await.unwrap(), first);
    assert_eq!(
      client
        .category_store()
        .get(&MarketClient::categories_key())
        .unwrap()
        .state,
      EntryState::Idle
    );
  }
}
