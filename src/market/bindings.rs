//! Query and mutation bindings for every marketplace page.
//!
//! Each read has a `use_*` method for views that stay subscribed and a plain
//! async method for one-shot reads; each write has a method returning its
//! [`MutationDescriptor`].

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::ViewId;
use crate::cache::{KeyMatcher, OptimisticPatch, PatchOp};
use crate::client::{QueryClient, QueryHandle};
use crate::error::QueryError;
use crate::mutation::MutationDescriptor;
use crate::notify::Notification;
use crate::query::{fetcher, Fetcher, QueryOptions, QueryResult};

use super::api::MarketApi;
use super::keys::{
  all_products, cart_key, my_products_key, order_key, orders_key, product_key, products_key,
};
use super::types::{AddToCart, Cart, Order, Product, ProductFilters, ProductInput, UpdateProduct};

/// Id given to a cart line added optimistically, until the server assigns one.
pub fn optimistic_line_id(product_id: &str) -> String {
  format!("optimistic:{}", product_id)
}

#[derive(Clone)]
pub struct Market {
  client: QueryClient,
  api: Arc<dyn MarketApi>,
  products_stale_time: Duration,
}

impl Market {
  pub fn new(client: QueryClient, api: Arc<dyn MarketApi>) -> Self {
    Self {
      client,
      api,
      products_stale_time: Duration::from_secs(5 * 60),
    }
  }

  /// Override how long catalog pages stay fresh.
  pub fn with_products_stale_time(mut self, stale_time: Duration) -> Self {
    self.products_stale_time = stale_time;
    self
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  fn api_fetcher<F, Fut, T>(&self, f: F) -> Fetcher
  where
    F: Fn(Arc<dyn MarketApi>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    T: serde::Serialize,
  {
    let api = Arc::clone(&self.api);
    fetcher(move || f(Arc::clone(&api)))
  }

  fn products_options(&self) -> QueryOptions {
    self.client.query_options().with_stale_time(self.products_stale_time)
  }

  fn products_fetcher(&self, filters: &ProductFilters) -> Fetcher {
    let filters = filters.clone();
    self.api_fetcher(move |api| {
      let filters = filters.clone();
      async move { api.products(&filters).await }
    })
  }

  fn product_fetcher(&self, id: &str) -> Fetcher {
    let id = id.to_string();
    self.api_fetcher(move |api| {
      let id = id.clone();
      async move { api.product(&id).await }
    })
  }

  fn my_products_fetcher(&self) -> Fetcher {
    self.api_fetcher(|api| async move { api.my_products().await })
  }

  fn cart_fetcher(&self) -> Fetcher {
    self.api_fetcher(|api| async move { api.cart().await })
  }

  fn orders_fetcher(&self) -> Fetcher {
    self.api_fetcher(|api| async move { api.orders().await })
  }

  fn order_fetcher(&self, id: &str) -> Fetcher {
    let id = id.to_string();
    self.api_fetcher(move |api| {
      let id = id.clone();
      async move { api.order(&id).await }
    })
  }

  pub fn use_products<F>(&self, view: ViewId, filters: &ProductFilters, on_change: F) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    self.client.use_query(
      view,
      products_key(filters),
      self.products_fetcher(filters),
      self.products_options(),
      on_change,
    )
  }

  /// Disabled until `id` is non-empty.
  pub fn use_product<F>(&self, view: ViewId, id: &str, on_change: F) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    let options = self.client.query_options().enabled(!id.is_empty());
    self
      .client
      .use_query(view, product_key(id), self.product_fetcher(id), options, on_change)
  }

  pub fn use_my_products<F>(&self, view: ViewId, on_change: F) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    self.client.use_query(
      view,
      my_products_key(),
      self.my_products_fetcher(),
      self.client.query_options(),
      on_change,
    )
  }

  pub fn use_cart<F>(&self, view: ViewId, on_change: F) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    self.client.use_query(
      view,
      cart_key(),
      self.cart_fetcher(),
      self.client.query_options(),
      on_change,
    )
  }

  pub fn use_orders<F>(&self, view: ViewId, on_change: F) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    self.client.use_query(
      view,
      orders_key(),
      self.orders_fetcher(),
      self.client.query_options(),
      on_change,
    )
  }

  /// Disabled until `id` is non-empty.
  pub fn use_order<F>(&self, view: ViewId, id: &str, on_change: F) -> QueryHandle
  where
    F: Fn(&QueryResult) + Send + Sync + 'static,
  {
    let options = self.client.query_options().enabled(!id.is_empty());
    self
      .client
      .use_query(view, order_key(id), self.order_fetcher(id), options, on_change)
  }

  pub async fn products(&self, filters: &ProductFilters) -> Result<Vec<Product>, QueryError> {
    let data = self
      .client
      .query(&products_key(filters), self.products_fetcher(filters), self.products_options())
      .await?;
    decode(&data)
  }

  pub async fn product(&self, id: &str) -> Result<Product, QueryError> {
    let options = self.client.query_options().enabled(!id.is_empty());
    let data = self
      .client
      .query(&product_key(id), self.product_fetcher(id), options)
      .await?;
    decode(&data)
  }

  pub async fn my_products(&self) -> Result<Vec<Product>, QueryError> {
    let data = self
      .client
      .query(&my_products_key(), self.my_products_fetcher(), self.client.query_options())
      .await?;
    decode(&data)
  }

  pub async fn cart(&self) -> Result<Cart, QueryError> {
    let data = self
      .client
      .query(&cart_key(), self.cart_fetcher(), self.client.query_options())
      .await?;
    decode(&data)
  }

  pub async fn orders(&self) -> Result<Vec<Order>, QueryError> {
    let data = self
      .client
      .query(&orders_key(), self.orders_fetcher(), self.client.query_options())
      .await?;
    decode(&data)
  }

  pub async fn order(&self, id: &str) -> Result<Order, QueryError> {
    let options = self.client.query_options().enabled(!id.is_empty());
    let data = self
      .client
      .query(&order_key(id), self.order_fetcher(id), options)
      .await?;
    decode(&data)
  }

  /// Adds a line (or bumps an existing one) in the cached cart right away.
  pub fn add_to_cart(&self) -> MutationDescriptor<AddToCart> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("add_to_cart", move |item: AddToCart| {
      let api = Arc::clone(&api);
      async move { api.add_to_cart(&item).await }
    })
    .optimistic(|item| {
      let item = item.clone();
      vec![OptimisticPatch::new(
        KeyMatcher::Exact(cart_key()),
        vec![PatchOp::update("/items", move |items| add_line(items, &item))],
      )]
    })
    .invalidates(vec![KeyMatcher::Exact(cart_key())])
    .on_success(|_, _| {
      Notification::success("Added to cart!", "Item added to your cart successfully.")
    })
    .on_error(|_, err| failure(err, "Failed to add item to cart."))
  }

  pub fn remove_from_cart(&self) -> MutationDescriptor<String> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("remove_from_cart", move |item_id: String| {
      let api = Arc::clone(&api);
      async move { api.remove_from_cart(&item_id).await }
    })
    .optimistic(|item_id| {
      vec![OptimisticPatch::new(
        KeyMatcher::Exact(cart_key()),
        vec![PatchOp::remove_where("/items", "/id", json!(item_id))],
      )]
    })
    .invalidates(vec![KeyMatcher::Exact(cart_key())])
    .on_success(|_, _| Notification::success("Removed from cart", "Item removed from your cart."))
    .on_error(|_, err| failure(err, "Failed to remove item from cart."))
  }

  pub fn clear_cart(&self) -> MutationDescriptor<()> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("clear_cart", move |_: ()| {
      let api = Arc::clone(&api);
      async move { api.clear_cart().await }
    })
    .optimistic(|_| {
      vec![OptimisticPatch::new(
        KeyMatcher::Exact(cart_key()),
        vec![PatchOp::set("/items", json!([])), PatchOp::set("/total", json!(0))],
      )]
    })
    .invalidates(vec![KeyMatcher::Exact(cart_key())])
    .on_success(|_, _| Notification::success("Cart cleared", "All items removed from your cart."))
    .on_error(|_, err| failure(err, "Failed to clear cart."))
  }

  pub fn checkout(&self) -> MutationDescriptor<()> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("checkout", move |_: ()| {
      let api = Arc::clone(&api);
      async move { api.checkout().await }
    })
    .invalidates(vec![
      KeyMatcher::Exact(cart_key()),
      KeyMatcher::Exact(orders_key()),
    ])
    .on_success(|_, _| Notification::success("Order placed!", "Your order has been placed successfully."))
    .on_error(|_, err| failure(err, "Failed to process checkout."))
  }

  pub fn create_product(&self) -> MutationDescriptor<ProductInput> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("create_product", move |input: ProductInput| {
      let api = Arc::clone(&api);
      async move { api.create_product(&input.normalized()).await }
    })
    .validate(ProductInput::validate)
    .invalidates(vec![all_products(), KeyMatcher::Exact(my_products_key())])
    .on_success(|_, _| Notification::success("Success!", "Product created successfully."))
    .on_error(|_, err| failure(err, "Failed to create product."))
  }

  pub fn update_product(&self) -> MutationDescriptor<UpdateProduct> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("update_product", move |update: UpdateProduct| {
      let api = Arc::clone(&api);
      async move {
        api
          .update_product(&update.product_id, &update.product.normalized())
          .await
      }
    })
    .validate(|update| update.product.validate())
    .invalidates_with(|update| {
      vec![
        all_products(),
        KeyMatcher::Exact(product_key(&update.product_id)),
        KeyMatcher::Exact(my_products_key()),
      ]
    })
    .on_success(|_, _| Notification::success("Success!", "Product updated successfully."))
    .on_error(|_, err| failure(err, "Failed to update product."))
  }

  /// Drops the listing from the seller dashboard right away.
  pub fn delete_product(&self) -> MutationDescriptor<String> {
    let api = Arc::clone(&self.api);
    MutationDescriptor::new("delete_product", move |product_id: String| {
      let api = Arc::clone(&api);
      async move { api.delete_product(&product_id).await }
    })
    .optimistic(|product_id| {
      vec![OptimisticPatch::new(
        KeyMatcher::Exact(my_products_key()),
        vec![PatchOp::remove_where("", "/id", json!(product_id))],
      )]
    })
    .invalidates(vec![all_products(), KeyMatcher::Exact(my_products_key())])
    .on_success(|_, _| Notification::success("Success!", "Product deleted successfully."))
    .on_error(|_, err| failure(err, "Failed to delete product."))
  }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, QueryError> {
  Ok(T::deserialize(value)?)
}

fn failure(err: &QueryError, fallback: &str) -> Notification {
  Notification::error("Error", err.user_message(fallback).to_string())
}

/// The cart's `items` array with `item` merged in.
fn add_line(items: Option<&Value>, item: &AddToCart) -> Value {
  let mut lines = match items {
    Some(Value::Array(lines)) => lines.clone(),
    _ => Vec::new(),
  };
  let existing = lines
    .iter_mut()
    .find(|line| line.pointer("/product/id").and_then(Value::as_str) == Some(item.product_id.as_str()));
  match existing {
    Some(line) => {
      let quantity = line.get("quantity").and_then(Value::as_u64).unwrap_or(0);
      line["quantity"] = json!(quantity + u64::from(item.quantity));
    }
    None => lines.push(json!({
      "id": optimistic_line_id(&item.product_id),
      "product": { "id": item.product_id },
      "quantity": item.quantity,
    })),
  }
  Value::Array(lines)
}
