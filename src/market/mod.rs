//! EcoFinds marketplace resources on top of the query client.

mod api;
mod bindings;
mod keys;
mod types;

pub use api::{ApiClient, MarketApi};
pub use bindings::{optimistic_line_id, Market};
pub use keys::{
  all_products, cart_key, my_products_key, order_key, orders_key, product_key, products_key,
  MarketKey,
};
pub use types::{
  AddToCart, Cart, CartItem, Order, OrderItem, Product, ProductFilters, ProductInput, Seller,
  UpdateProduct,
};
