use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// A listing's seller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seller {
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub email: Option<String>,
}

/// A marketplace listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  // Optimistic cart lines only carry the product id
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub price: f64,
  #[serde(default)]
  pub category: String,
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub seller: Option<Seller>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
  pub id: String,
  pub product: Product,
  pub quantity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
  #[serde(default)]
  pub items: Vec<CartItem>,
  #[serde(default)]
  pub total: f64,
}

impl Cart {
  /// Number of units across all lines (the cart badge)
  pub fn item_count(&self) -> u32 {
    self.items.iter().map(|i| i.quantity).sum()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
  pub product: Product,
  pub quantity: u32,
  /// Unit price at the time of purchase
  pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub id: String,
  pub date: NaiveDate,
  pub total: f64,
  pub status: String, // "pending", "shipped", "delivered", ...
  #[serde(default)]
  pub items: Vec<OrderItem>,
}

/// Catalog search parameters. Absent fields are left out of both the query
/// string and the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilters {
  pub q: Option<String>,
  pub category: Option<String>,
  pub page: Option<u32>,
}

/// Body of a create or update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInput {
  pub title: String,
  pub description: String,
  pub price: f64,
  pub category: String,
  pub image: Option<String>,
}

impl ProductInput {
  /// Check the listing form before anything is sent.
  pub fn validate(&self) -> Result<(), QueryError> {
    if self.title.trim().is_empty() {
      return Err(QueryError::validation("Product title is required."));
    }
    if self.description.trim().is_empty() {
      return Err(QueryError::validation("Product description is required."));
    }
    if !self.price.is_finite() || self.price <= 0.0 {
      return Err(QueryError::validation("Please enter a valid price."));
    }
    if self.category.is_empty() {
      return Err(QueryError::validation("Please select a category."));
    }
    Ok(())
  }

  /// Trimmed copy, as submitted to the server.
  pub fn normalized(&self) -> Self {
    Self {
      title: self.title.trim().to_string(),
      description: self.description.trim().to_string(),
      price: self.price,
      category: self.category.clone(),
      image: self.image.clone().filter(|s| !s.is_empty()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProduct {
  pub product_id: String,
  pub product: ProductInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToCart {
  pub product_id: String,
  #[serde(default = "default_quantity")]
  pub quantity: u32,
}

fn default_quantity() -> u32 {
  1
}

impl AddToCart {
  pub fn new(product_id: impl Into<String>) -> Self {
    Self {
      product_id: product_id.into(),
      quantity: 1,
    }
  }

  pub fn quantity(mut self, quantity: u32) -> Self {
    self.quantity = quantity;
    self
  }
}
