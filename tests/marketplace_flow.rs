//! End-to-end flows through the marketplace bindings against an in-memory API.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use ecofinds::market::{
  cart_key, my_products_key, product_key, AddToCart, Cart, CartItem, Market, MarketApi, Order,
  OrderItem, Product, ProductFilters, ProductInput, Seller,
};
use ecofinds::{ClientOptions, ErrorKind, QueryClient, QueryError, QueryResult, Severity, ToastQueue, ViewId};

fn bamboo_charger() -> Product {
  Product {
    id: "1".to_string(),
    title: "Bamboo Charger".to_string(),
    description: "Eco-friendly wireless charging pad".to_string(),
    price: 29.99,
    category: "electronics".to_string(),
    image: None,
    seller: Some(Seller {
      id: "2".to_string(),
      username: "ecotech_store".to_string(),
      email: None,
    }),
  }
}

fn water_bottle() -> Product {
  Product {
    id: "3".to_string(),
    title: "Reusable Stainless Steel Water Bottle".to_string(),
    description: "Double-walled insulated bottle".to_string(),
    price: 19.99,
    category: "home".to_string(),
    image: None,
    seller: None,
  }
}

#[derive(Default)]
struct Server {
  products: Vec<Product>,
  cart: Cart,
  orders: Vec<Order>,
  next_line: u32,
  /// Error returned by the next write, if set
  fail_next_write: Option<QueryError>,
  /// Held by the next add-to-cart until released
  gate: Option<oneshot::Receiver<()>>,
}

/// In-memory stand-in for the HTTP API.
#[derive(Default)]
struct FakeApi {
  server: Mutex<Server>,
  product_reads: AtomicU32,
  cart_reads: AtomicU32,
  writes: AtomicU32,
}

impl FakeApi {
  fn seeded() -> Arc<Self> {
    let api = Self::default();
    api.server.lock().unwrap().products = vec![bamboo_charger(), water_bottle()];
    Arc::new(api)
  }

  fn fail_next_write(&self, err: QueryError) {
    self.server.lock().unwrap().fail_next_write = Some(err);
  }

  fn gate_next_write(&self) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel();
    self.server.lock().unwrap().gate = Some(rx);
    tx
  }

  /// Count the write and return the injected failure, if any.
  fn begin_write(&self) -> Result<(), QueryError> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    match self.server.lock().unwrap().fail_next_write.take() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn find(&self, id: &str) -> Result<Product, QueryError> {
    self
      .server
      .lock()
      .unwrap()
      .products
      .iter()
      .find(|p| p.id == id)
      .cloned()
      .ok_or_else(|| QueryError::server(Some(404), "Product not found"))
  }
}

fn recompute_total(cart: &mut Cart) {
  cart.total = cart
    .items
    .iter()
    .map(|i| i.product.price * f64::from(i.quantity))
    .sum();
}

#[async_trait]
impl MarketApi for FakeApi {
  async fn products(&self, filters: &ProductFilters) -> Result<Vec<Product>, QueryError> {
    let server = self.server.lock().unwrap();
    Ok(
      server
        .products
        .iter()
        .filter(|p| filters.category.as_ref().map_or(true, |c| &p.category == c))
        .filter(|p| {
          filters
            .q
            .as_ref()
            .map_or(true, |q| p.title.to_lowercase().contains(&q.to_lowercase()))
        })
        .cloned()
        .collect(),
    )
  }

  async fn product(&self, id: &str) -> Result<Product, QueryError> {
    self.product_reads.fetch_add(1, Ordering::SeqCst);
    self.find(id)
  }

  async fn my_products(&self) -> Result<Vec<Product>, QueryError> {
    Ok(self.server.lock().unwrap().products.clone())
  }

  async fn create_product(&self, input: &ProductInput) -> Result<Product, QueryError> {
    self.begin_write()?;
    let mut server = self.server.lock().unwrap();
    let product = Product {
      id: (server.products.len() + 10).to_string(),
      title: input.title.clone(),
      description: input.description.clone(),
      price: input.price,
      category: input.category.clone(),
      image: input.image.clone(),
      seller: None,
    };
    server.products.push(product.clone());
    Ok(product)
  }

  async fn update_product(&self, id: &str, input: &ProductInput) -> Result<Product, QueryError> {
    self.begin_write()?;
    let mut server = self.server.lock().unwrap();
    let product = server
      .products
      .iter_mut()
      .find(|p| p.id == id)
      .ok_or_else(|| QueryError::server(Some(404), "Product not found"))?;
    product.title = input.title.clone();
    product.price = input.price;
    Ok(product.clone())
  }

  async fn delete_product(&self, id: &str) -> Result<(), QueryError> {
    self.begin_write()?;
    self.server.lock().unwrap().products.retain(|p| p.id != id);
    Ok(())
  }

  async fn cart(&self) -> Result<Cart, QueryError> {
    self.cart_reads.fetch_add(1, Ordering::SeqCst);
    Ok(self.server.lock().unwrap().cart.clone())
  }

  async fn add_to_cart(&self, item: &AddToCart) -> Result<Value, QueryError> {
    let gate = self.server.lock().unwrap().gate.take();
    if let Some(gate) = gate {
      let _ = gate.await;
    }
    self.begin_write()?;
    let product = self.find(&item.product_id)?;
    let mut server = self.server.lock().unwrap();
    server.next_line += 1;
    let line = CartItem {
      id: format!("line-{}", server.next_line),
      product,
      quantity: item.quantity,
    };
    server.cart.items.push(line.clone());
    recompute_total(&mut server.cart);
    Ok(serde_json::to_value(line)?)
  }

  async fn remove_from_cart(&self, item_id: &str) -> Result<(), QueryError> {
    self.begin_write()?;
    let mut server = self.server.lock().unwrap();
    server.cart.items.retain(|i| i.id != item_id);
    recompute_total(&mut server.cart);
    Ok(())
  }

  async fn clear_cart(&self) -> Result<(), QueryError> {
    self.begin_write()?;
    self.server.lock().unwrap().cart = Cart::default();
    Ok(())
  }

  async fn checkout(&self) -> Result<Value, QueryError> {
    self.begin_write()?;
    let mut server = self.server.lock().unwrap();
    let cart = std::mem::take(&mut server.cart);
    let order = Order {
      id: (server.orders.len() + 1).to_string(),
      date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
      total: cart.total,
      status: "pending".to_string(),
      items: cart
        .items
        .into_iter()
        .map(|i| OrderItem {
          price: i.product.price,
          product: i.product,
          quantity: i.quantity,
        })
        .collect(),
    };
    server.orders.push(order.clone());
    Ok(serde_json::to_value(order)?)
  }

  async fn orders(&self) -> Result<Vec<Order>, QueryError> {
    Ok(self.server.lock().unwrap().orders.clone())
  }

  async fn order(&self, id: &str) -> Result<Order, QueryError> {
    self
      .server
      .lock()
      .unwrap()
      .orders
      .iter()
      .find(|o| o.id == id)
      .cloned()
      .ok_or_else(|| QueryError::server(Some(404), "Order not found"))
  }
}

struct Harness {
  api: Arc<FakeApi>,
  market: Market,
  client: QueryClient,
  toasts: Arc<ToastQueue>,
}

fn harness(default_stale_time: Duration) -> Harness {
  let api = FakeApi::seeded();
  let toasts = Arc::new(ToastQueue::new());
  let client = QueryClient::new(
    ClientOptions {
      gc_time: Duration::from_secs(300),
      default_stale_time,
    },
    toasts.clone(),
  );
  let market = Market::new(client.clone(), api.clone());
  Harness {
    api,
    market,
    client,
    toasts,
  }
}

fn cached_cart(h: &Harness) -> Cart {
  let data = h.client.get_query_data(&cart_key()).expect("cart cached");
  serde_json::from_value(data.as_ref().clone()).expect("cart decodes")
}

/// Records every cart item count a view is shown.
fn cart_counts() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&QueryResult) + Send + Sync + 'static) {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();
  let on_change = move |r: &QueryResult| {
    if let Some(Ok(cart)) = r.data_as::<Cart>() {
      sink.lock().unwrap().push(cart.item_count());
    }
  };
  (seen, on_change)
}

#[tokio::test]
async fn test_product_detail_is_cached() {
  let h = harness(Duration::from_secs(60));

  let product = h.market.product("1").await.unwrap();
  assert_eq!(product.title, "Bamboo Charger");
  assert_eq!(product.price, 29.99);

  let first = h.client.get_query_data(&product_key("1")).unwrap();
  h.market.product("1").await.unwrap();
  let second = h.client.get_query_data(&product_key("1")).unwrap();

  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(h.api.product_reads.load(Ordering::SeqCst), 1);
  assert_eq!(
    h.client.entry(&product_key("1")).unwrap().status,
    ecofinds::QueryStatus::Success
  );
}

#[tokio::test]
async fn test_product_with_empty_id_is_not_fetched() {
  let h = harness(Duration::ZERO);
  let err = h.market.product("").await.unwrap_err();
  assert_eq!(err.kind, ErrorKind::ValidationError);
  assert_eq!(h.api.product_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_add_to_cart_is_optimistic_then_matches_server() {
  let h = harness(Duration::ZERO);
  let (seen, on_change) = cart_counts();
  let _badge = h.market.use_cart(ViewId::next(), on_change);
  assert_eq!(h.market.cart().await.unwrap().item_count(), 0);

  let release = h.api.gate_next_write();
  let add = Arc::new(h.client.use_mutation(h.market.add_to_cart()));
  let running = {
    let add = add.clone();
    tokio::spawn(async move { add.run(AddToCart::new("1")).await })
  };
  tokio::task::yield_now().await;

  // Optimistic line is visible before the server answers
  let pending = cached_cart(&h);
  assert_eq!(pending.item_count(), 1);
  assert_eq!(pending.items[0].id, "optimistic:1");
  assert!(add.is_pending());

  release.send(()).unwrap();
  running.await.unwrap().unwrap();

  let settled = cached_cart(&h);
  assert_eq!(settled, h.api.server.lock().unwrap().cart);
  assert_eq!(settled.items[0].id, "line-1");
  assert_eq!(settled.items[0].product.title, "Bamboo Charger");

  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.first(), Some(&0));
  assert_eq!(seen.last(), Some(&1));

  let toasts = h.toasts.drain();
  assert_eq!(toasts.len(), 1);
  assert_eq!(toasts[0].title, "Added to cart!");
  assert_eq!(toasts[0].description, "Item added to your cart successfully.");
}

#[tokio::test]
async fn test_failed_add_to_cart_rolls_back() {
  let h = harness(Duration::ZERO);
  let _badge = h.market.use_cart(ViewId::next(), |_| {});
  let before = h.market.cart().await.unwrap();

  h.api.fail_next_write(QueryError::server(Some(409), "Out of stock"));
  let add = h.client.use_mutation(h.market.add_to_cart());
  let err = add.run(AddToCart::new("3")).await.unwrap_err();

  assert_eq!(err.status, Some(409));
  assert_eq!(cached_cart(&h), before);
  assert!(!add.is_pending());

  let toasts = h.toasts.drain();
  assert_eq!(toasts.len(), 1);
  assert_eq!(toasts[0].severity, Severity::Error);
  assert_eq!(toasts[0].description, "Out of stock");
}

#[tokio::test]
async fn test_network_failure_uses_default_message() {
  let h = harness(Duration::ZERO);
  h.api.fail_next_write(QueryError::network("connection refused"));

  let clear = h.client.use_mutation(h.market.clear_cart());
  clear.run(()).await.unwrap_err();

  let toasts = h.toasts.drain();
  assert_eq!(toasts[0].title, "Error");
  assert_eq!(toasts[0].description, "Failed to clear cart.");
}

#[tokio::test]
async fn test_checkout_refreshes_cart_and_orders_views() {
  let h = harness(Duration::ZERO);
  let (cart_seen, on_cart) = cart_counts();
  let _cart_view = h.market.use_cart(ViewId::next(), on_cart);

  let orders_seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = orders_seen.clone();
  let _orders_view = h.market.use_orders(ViewId::next(), move |r| {
    if let Some(Ok(orders)) = r.data_as::<Vec<Order>>() {
      sink.lock().unwrap().push(orders.len());
    }
  });
  h.market.orders().await.unwrap();

  let add = h.client.use_mutation(h.market.add_to_cart());
  add.run(AddToCart::new("1").quantity(2)).await.unwrap();
  assert_eq!(*cart_seen.lock().unwrap().last().unwrap(), 2);

  let checkout = h.client.use_mutation(h.market.checkout());
  let response = checkout.run(()).await.unwrap();
  assert_eq!(response["status"], "pending");

  // Both views were refreshed without querying again themselves
  assert_eq!(*cart_seen.lock().unwrap().last().unwrap(), 0);
  assert_eq!(*orders_seen.lock().unwrap().last().unwrap(), 1);
  assert_eq!(h.toasts.drain().last().unwrap().title, "Order placed!");
}

#[tokio::test]
async fn test_remove_from_cart() {
  let h = harness(Duration::ZERO);
  let _view = h.market.use_cart(ViewId::next(), |_| {});
  h.market.cart().await.unwrap();

  let add = h.client.use_mutation(h.market.add_to_cart());
  add.run(AddToCart::new("1")).await.unwrap();
  add.run(AddToCart::new("3")).await.unwrap();
  assert_eq!(cached_cart(&h).items.len(), 2);

  let remove = h.client.use_mutation(h.market.remove_from_cart());
  remove.run("line-1".to_string()).await.unwrap();

  let cart = cached_cart(&h);
  assert_eq!(cart.items.len(), 1);
  assert_eq!(cart.items[0].product.id, "3");
  assert_eq!(cart.total, 19.99);
}

#[tokio::test]
async fn test_invalid_listing_is_rejected_without_a_request() {
  let h = harness(Duration::ZERO);
  let create = h.client.use_mutation(h.market.create_product());

  let input = ProductInput {
    title: "Solar Garden Lights".to_string(),
    description: "Turns on at dusk".to_string(),
    price: -1.0,
    category: "home".to_string(),
    image: None,
  };
  let err = create.run(input).await.unwrap_err();

  assert_eq!(err.kind, ErrorKind::ValidationError);
  assert_eq!(h.api.writes.load(Ordering::SeqCst), 0);
  let toasts = h.toasts.drain();
  assert_eq!(toasts.len(), 1);
  assert_eq!(toasts[0].title, "Validation Error");
  assert_eq!(toasts[0].description, "Please enter a valid price.");
}

#[tokio::test]
async fn test_create_product_refreshes_catalog_and_dashboard() {
  let h = harness(Duration::ZERO);
  let listings: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = listings.clone();
  let _dashboard = h.market.use_my_products(ViewId::next(), move |r| {
    if let Some(Ok(products)) = r.data_as::<Vec<Product>>() {
      sink.lock().unwrap().push(products.len());
    }
  });
  h.market.my_products().await.unwrap();
  let catalog = h.market.products(&ProductFilters::default()).await.unwrap();
  assert_eq!(catalog.len(), 2);

  let create = h.client.use_mutation(h.market.create_product());
  let input = ProductInput {
    title: " Recycled Plastic Backpack ".to_string(),
    description: "Made from ocean plastic".to_string(),
    price: 49.99,
    category: "accessories".to_string(),
    image: Some(String::new()),
  };
  let created: Product = serde_json::from_value(create.run(input).await.unwrap()).unwrap();
  assert_eq!(created.title, "Recycled Plastic Backpack");
  assert_eq!(created.image, None);

  assert_eq!(*listings.lock().unwrap().last().unwrap(), 3);
  // The unsubscribed catalog page was marked stale, not refetched
  let key = ecofinds::market::products_key(&ProductFilters::default());
  assert!(h.client.entry(&key).unwrap().invalidated);
  assert_eq!(h.market.products(&ProductFilters::default()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_delete_restores_dashboard() {
  let h = harness(Duration::ZERO);
  let _dashboard = h.market.use_my_products(ViewId::next(), |_| {});
  h.market.my_products().await.unwrap();

  h.api.fail_next_write(QueryError::server(Some(403), "Not your listing"));

  let delete = h.client.use_mutation(h.market.delete_product());
  let err = delete.run("1".to_string()).await.unwrap_err();
  assert_eq!(err.message, "Not your listing");

  let data = h.client.get_query_data(&my_products_key()).unwrap();
  assert_eq!(data.as_array().map(Vec::len), Some(2));
  assert_eq!(data[0]["id"], json!("1"));
}

#[tokio::test]
async fn test_unsubscribed_view_stops_receiving_updates() {
  let h = harness(Duration::ZERO);
  let (seen, on_change) = cart_counts();
  let view = h.market.use_cart(ViewId::next(), on_change);
  h.market.cart().await.unwrap();

  view.unsubscribe();
  view.unsubscribe();
  let delivered = seen.lock().unwrap().len();

  let add = h.client.use_mutation(h.market.add_to_cart());
  add.run(AddToCart::new("1")).await.unwrap();

  assert_eq!(seen.lock().unwrap().len(), delivered);
  // Nobody is watching the cart any more, so the write only marked it stale
  assert!(h.client.entry(&cart_key()).unwrap().invalidated);
  assert_eq!(h.api.cart_reads.load(Ordering::SeqCst), 1);
}
