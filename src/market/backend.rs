//! Remote marketplace boundary and an in-process implementation of it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use super::types::{Category, NewProduct, Product, ProductStatus, ProductUpdate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
  #[error("product {0} not found")]
  NotFound(String),

  /// The like row already exists. Callers treat this as success.
  #[error("product {product} is already liked by {user}")]
  DuplicateLike { product: String, user: String },

  #[error("unknown category {0}")]
  UnknownCategory(String),

  #[error("backend unavailable: {0}")]
  Unavailable(String),
}

/// The remote source of truth for products and likes.
#[async_trait]
pub trait MarketBackend: Send + Sync {
  /// All products, newest first, with like fields derived for `viewer`.
  async fn list_products(&self, viewer: Option<&str>) -> Result<Vec<Product>, BackendError>;

  async fn product(&self, id: &str, viewer: Option<&str>) -> Result<Product, BackendError>;

  async fn like(&self, id: &str, user: &str) -> Result<(), BackendError>;

  async fn unlike(&self, id: &str, user: &str) -> Result<(), BackendError>;

  async fn update_product(&self, id: &str, update: &ProductUpdate) -> Result<Product, BackendError>;

  /// List `new` for sale by `seller`. The backend assigns the id.
  async fn create_product(&self, seller: &str, new: &NewProduct) -> Result<Product, BackendError>;

  /// Remove a product along with its likes.
  async fn delete_product(&self, id: &str) -> Result<(), BackendError>;

  /// All categories, sorted by name.
  async fn categories(&self) -> Result<Vec<Category>, BackendError>;
}

#[derive(Default)]
struct State {
  products: BTreeMap<String, Product>,
  likes: HashSet<(String, String)>,
  /// Keyed by name
  categories: BTreeMap<String, Category>,
  next_id: usize,
  fail_writes: u32,
  offline: bool,
  writes: Vec<String>,
}

impl State {
  fn view(&self, product: &Product, viewer: Option<&str>) -> Product {
    let mut view = product.clone();
    view.likes_count = self.likes.iter().filter(|(id, _)| *id == product.id).count() as u32;
    view.is_liked = viewer.is_some_and(|user| self.likes.contains(&(product.id.clone(), user.to_string())));
    view
  }

  fn check_online(&self) -> Result<(), BackendError> {
    if self.offline {
      return Err(BackendError::Unavailable("offline".to_string()));
    }
    Ok(())
  }

  fn check_write(&mut self, op: String) -> Result<(), BackendError> {
    self.check_online()?;
    if self.fail_writes > 0 {
      self.fail_writes -= 1;
      debug!(op = %op, remaining = self.fail_writes, "injected write failure");
      return Err(BackendError::Unavailable(format!("{op} rejected")));
    }
    self.writes.push(op);
    Ok(())
  }

  fn add_category(&mut self, name: &str) {
    self
      .categories
      .entry(name.to_string())
      .or_insert_with(|| Category {
        id: name.to_lowercase(),
        name: name.to_string(),
      });
  }

  fn next_product_id(&mut self) -> String {
    loop {
      self.next_id += 1;
      let id = format!("P{}", self.next_id);
      if !self.products.contains_key(&id) {
        return id;
      }
    }
  }
}

/// In-memory marketplace with simulated latency and fault injection.
///
/// Likes are stored as (product, user) pairs; `likes_count` and `is_liked`
/// are derived from them on every read.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
  state: Arc<Mutex<State>>,
  latency: Duration,
}

impl InMemoryBackend {
  /// Seed the backend. Each product's `likes_count` becomes that many likes
  /// from anonymous users, and each category it names becomes known.
  pub fn new(products: impl IntoIterator<Item = Product>) -> Self {
    let mut state = State::default();
    for product in products {
      for n in 0..product.likes_count {
        state.likes.insert((product.id.clone(), format!("seed-{n}")));
      }
      if let Some(category) = &product.category {
        state.add_category(category);
      }
      state.products.insert(product.id.clone(), product);
    }
    Self {
      state: Arc::new(Mutex::new(state)),
      latency: Duration::ZERO,
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn delay(&self) {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
  }

  /// Reject the next `n` writes with [`BackendError::Unavailable`].
  pub fn fail_next_writes(&self, n: u32) {
    self.lock().fail_writes = n;
  }

  pub fn set_offline(&self, offline: bool) {
    self.lock().offline = offline;
  }

  /// Record a like without going through the async API.
  pub fn seed_like(&self, id: &str, user: &str) {
    self.lock().likes.insert((id.to_string(), user.to_string()));
  }

  pub fn likes_count(&self, id: &str) -> u32 {
    self.lock().likes.iter().filter(|(product, _)| product == id).count() as u32
  }

  pub fn is_liked_by(&self, id: &str, user: &str) -> bool {
    self.lock().likes.contains(&(id.to_string(), user.to_string()))
  }

  /// Accepted writes in arrival order, e.g. `like p1 u1`.
  pub fn writes(&self) -> Vec<String> {
    self.lock().writes.clone()
  }
}

#[async_trait]
impl MarketBackend for InMemoryBackend {
  async fn list_products(&self, viewer: Option<&str>) -> Result<Vec<Product>, BackendError> {
    self.delay().await;
    let state = self.lock();
    state.check_online()?;
    let mut products: Vec<Product> = state
      .products
      .values()
      .map(|product| state.view(product, viewer))
      .collect();
    products.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    trace!(count = products.len(), "listed products");
    Ok(products)
  }

  async fn product(&self, id: &str, viewer: Option<&str>) -> Result<Product, BackendError> {
    self.delay().await;
    let state = self.lock();
    state.check_online()?;
    state
      .products
      .get(id)
      .map(|product| state.view(product, viewer))
      .ok_or_else(|| BackendError::NotFound(id.to_string()))
  }

  async fn like(&self, id: &str, user: &str) -> Result<(), BackendError> {
    self.delay().await;
    let mut state = self.lock();
    if !state.products.contains_key(id) {
      return Err(BackendError::NotFound(id.to_string()));
    }
    let row = (id.to_string(), user.to_string());
    if state.likes.contains(&row) {
      return Err(BackendError::DuplicateLike {
        product: id.to_string(),
        user: user.to_string(),
      });
    }
    state.check_write(format!("like {id} {user}"))?;
    state.likes.insert(row);
    Ok(())
  }

  async fn unlike(&self, id: &str, user: &str) -> Result<(), BackendError> {
    self.delay().await;
    let mut state = self.lock();
    if !state.products.contains_key(id) {
      return Err(BackendError::NotFound(id.to_string()));
    }
    state.check_write(format!("unlike {id} {user}"))?;
    state.likes.remove(&(id.to_string(), user.to_string()));
    Ok(())
  }

  async fn update_product(&self, id: &str, update: &ProductUpdate) -> Result<Product, BackendError> {
    self.delay().await;
    let mut state = self.lock();
    let current = state
      .products
      .get(id)
      .cloned()
      .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
    state.check_write(format!("update {id}"))?;
    let updated = update.apply_to(&current);
    state.products.insert(id.to_string(), updated.clone());
    Ok(state.view(&updated, None))
  }

  async fn create_product(&self, seller: &str, new: &NewProduct) -> Result<Product, BackendError> {
    self.delay().await;
    let mut state = self.lock();
    if let Some(category) = &new.category {
      if !state.categories.contains_key(category) {
        return Err(BackendError::UnknownCategory(category.clone()));
      }
    }
    state.check_write(format!("create {seller}"))?;
    let id = state.next_product_id();
    let product = new.clone().into_product(id.clone(), seller);
    state.products.insert(id, product.clone());
    debug!(product = %product.id, "product created");
    Ok(product)
  }

  async fn delete_product(&self, id: &str) -> Result<(), BackendError> {
    self.delay().await;
    let mut state = self.lock();
    if !state.products.contains_key(id) {
      return Err(BackendError::NotFound(id.to_string()));
    }
    state.check_write(format!("delete {id}"))?;
    state.products.remove(id);
    state.likes.retain(|(product, _)| product != id);
    Ok(())
  }

  async fn categories(&self) -> Result<Vec<Category>, BackendError> {
    self.delay().await;
    let state = self.lock();
    state.check_online()?;
    Ok(state.categories.values().cloned().collect())
  }
}

/// A handful of listings for the demo binary and default configuration.
pub fn demo_catalog() -> Vec<Product> {
  let now = Utc::now();
  let item = |id: &str, title: &str, price: f64, category: &str, likes: u32, age_hours: i64| Product {
    id: id.to_string(),
    title: title.to_string(),
    price,
    condition: Some("used".to_string()),
    location: Some("Campus".to_string()),
    category: Some(category.to_string()),
    seller: "seller-1".to_string(),
    status: ProductStatus::Available,
    likes_count: likes,
    is_liked: false,
    created_at: now - ChronoDuration::hours(age_hours),
  };

  vec![
    item("P1", "Desk lamp", 15.0, "Home", 5, 1),
    item("P2", "Calculus textbook", 40.0, "Books", 2, 5),
    item("P3", "Road bike", 180.0, "Sports", 11, 24),
    item("P4", "Mini fridge", 65.0, "Home", 0, 48),
  ]
}
