//! Marketplace listings on top of the query cache.
//!
//! The backend is the source of truth for products and likes; the client
//! keeps listings and details cached and runs likes and edits as optimistic
//! mutations.

mod backend;
mod client;
mod types;

pub use backend::{demo_catalog, BackendError, InMemoryBackend, MarketBackend};
pub use client::{MarketClient, MarketError};
pub use types::{Category, NewProduct, Product, ProductStatus, ProductUpdate};
