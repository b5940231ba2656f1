//! Query keys for marketplace resources.

use crate::cache::{KeyMatcher, KeyPart, QueryKey};

use super::types::ProductFilters;

/// Every cacheable marketplace read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarketKey {
  /// Catalog feed; one entry per distinct filter set
  Products(ProductFilters),
  Product { id: String },
  /// The signed-in seller's own listings
  MyProducts,
  Cart,
  Orders,
  Order { id: String },
}

impl MarketKey {
  pub fn query_key(&self) -> QueryKey {
    match self {
      Self::Products(filters) => QueryKey::new("products").with(KeyPart::map([
        ("q", filters.q.clone().map(KeyPart::from)),
        ("category", filters.category.clone().map(KeyPart::from)),
        ("page", filters.page.map(|p| KeyPart::Int(i64::from(p)))),
      ])),
      Self::Product { id } => QueryKey::new("product").with(id.as_str()),
      Self::MyProducts => QueryKey::new("my-products"),
      Self::Cart => QueryKey::new("cart"),
      Self::Orders => QueryKey::new("orders"),
      Self::Order { id } => QueryKey::new("order").with(id.as_str()),
    }
  }
}

impl From<MarketKey> for QueryKey {
  fn from(key: MarketKey) -> Self {
    key.query_key()
  }
}

pub fn cart_key() -> QueryKey {
  MarketKey::Cart.query_key()
}

pub fn products_key(filters: &ProductFilters) -> QueryKey {
  MarketKey::Products(filters.clone()).query_key()
}

pub fn product_key(id: &str) -> QueryKey {
  MarketKey::Product { id: id.to_string() }.query_key()
}

pub fn my_products_key() -> QueryKey {
  MarketKey::MyProducts.query_key()
}

pub fn orders_key() -> QueryKey {
  MarketKey::Orders.query_key()
}

pub fn order_key(id: &str) -> QueryKey {
  MarketKey::Order { id: id.to_string() }.query_key()
}

/// Matches every catalog page regardless of filters.
pub fn all_products() -> KeyMatcher {
  KeyMatcher::Prefix(QueryKey::new("products"))
}
