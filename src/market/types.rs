use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
  #[default]
  Available,
  Sold,
}

impl std::fmt::Display for ProductStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Available => write!(f, "available"),
      Self::Sold => write!(f, "sold"),
    }
  }
}

/// A listing as seen by one viewer.
///
/// `likes_count` and `is_liked` are derived per viewer by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  pub title: String,
  pub price: f64,
  #[serde(default)]
  pub condition: Option<String>,
  #[serde(default)]
  pub location: Option<String>,
  #[serde(default)]
  pub category: Option<String>,
  pub seller: String,
  #[serde(default)]
  pub status: ProductStatus,
  #[serde(default)]
  pub likes_count: u32,
  #[serde(default)]
  pub is_liked: bool,
  #[serde(default = "Utc::now")]
  pub created_at: DateTime<Utc>,
}

impl Product {
  /// The optimistic view of a like toggle: flips `is_liked` and moves the
  /// count by one.
  pub fn with_like_toggled(&self) -> Self {
    let mut next = self.clone();
    if self.is_liked {
      next.is_liked = false;
      next.likes_count = self.likes_count.saturating_sub(1);
    } else {
      next.is_liked = true;
      next.likes_count = self.likes_count + 1;
    }
    next
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub name: String,
}

/// A listing as submitted by its seller, before the backend assigns an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
  pub title: String,
  pub price: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  /// Category name; must be one the backend knows
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

impl NewProduct {
  pub fn into_product(self, id: String, seller: &str) -> Product {
    Product {
      id,
      title: self.title,
      price: self.price,
      condition: self.condition,
      location: self.location,
      category: self.category,
      seller: seller.to_string(),
      status: ProductStatus::Available,
      likes_count: 0,
      is_liked: false,
      created_at: Utc::now(),
    }
  }
}

/// Seller edits to a listing. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub price: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<ProductStatus>,
}

impl ProductUpdate {
  pub fn is_empty(&self) -> bool {
    self.title.is_none() && self.price.is_none() && self.status.is_none()
  }

  pub fn apply_to(&self, product: &Product) -> Product {
    let mut next = product.clone();
    if let Some(title) = &self.title {
      next.title = title.clone();
    }
    if let Some(price) = self.price {
      next.price = price;
    }
    if let Some(status) = self.status {
      next.status = status;
    }
    next
  }
}
