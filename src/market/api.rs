//! HTTP access to the marketplace API.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::QueryError;

use super::types::{AddToCart, Cart, Order, Product, ProductFilters, ProductInput};

/// The marketplace endpoints fetchers and write actions call.
#[async_trait]
pub trait MarketApi: Send + Sync {
  async fn products(&self, filters: &ProductFilters) -> Result<Vec<Product>, QueryError>;
  async fn product(&self, id: &str) -> Result<Product, QueryError>;
  async fn my_products(&self) -> Result<Vec<Product>, QueryError>;
  async fn create_product(&self, input: &ProductInput) -> Result<Product, QueryError>;
  async fn update_product(&self, id: &str, input: &ProductInput) -> Result<Product, QueryError>;
  async fn delete_product(&self, id: &str) -> Result<(), QueryError>;

  async fn cart(&self) -> Result<Cart, QueryError>;
  async fn add_to_cart(&self, item: &AddToCart) -> Result<Value, QueryError>;
  async fn remove_from_cart(&self, item_id: &str) -> Result<(), QueryError>;
  async fn clear_cart(&self) -> Result<(), QueryError>;
  async fn checkout(&self) -> Result<Value, QueryError>;

  async fn orders(&self) -> Result<Vec<Order>, QueryError>;
  async fn order(&self, id: &str) -> Result<Order, QueryError>;
}

/// `reqwest`-backed client for the real API.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.api.base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid API base URL {}", config.api.base_url));
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token: Config::get_api_token(),
    })
  }

  fn endpoint(&self, segments: &[&str]) -> Result<Url, QueryError> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| QueryError::validation(format!("cannot build a URL from {}", self.base_url)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    debug!(%method, %url, "api request");
    let req = self.http.request(method, url);
    match &self.token {
      Some(token) => req.bearer_auth(token),
      None => req,
    }
  }

  async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, QueryError> {
    let resp = req.send().await.map_err(transport_error)?;
    let status = resp.status();
    let body = resp.bytes().await.map_err(transport_error)?;
    if status.is_client_error() || status.is_server_error() {
      return Err(error_from_body(status, &body));
    }
    decode(&body)
  }

  async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, QueryError> {
    let url = self.endpoint(segments)?;
    self.send(self.request(Method::GET, url)).await
  }

  async fn write<B, T>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<T, QueryError>
  where
    B: Serialize + Sync + ?Sized,
    T: DeserializeOwned,
  {
    let url = self.endpoint(segments)?;
    let req = self.request(method, url);
    let req = match body {
      Some(body) => req.json(body),
      None => req,
    };
    self.send(req).await
  }
}

#[async_trait]
impl MarketApi for ApiClient {
  async fn products(&self, filters: &ProductFilters) -> Result<Vec<Product>, QueryError> {
    let mut url = self.endpoint(&["products"])?;
    let page = filters.page.map(|p| p.to_string());
    let params = [
      ("q", filters.q.as_deref()),
      ("category", filters.category.as_deref()),
      ("page", page.as_deref()),
    ];
    if params.iter().any(|(_, v)| v.is_some_and(|v| !v.is_empty())) {
      let mut query = url.query_pairs_mut();
      for (name, value) in params {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
          query.append_pair(name, v);
        }
      }
    }
    self.send(self.request(Method::GET, url)).await
  }

  async fn product(&self, id: &str) -> Result<Product, QueryError> {
    self.get(&["products", id]).await
  }

  async fn my_products(&self) -> Result<Vec<Product>, QueryError> {
    self.get(&["my", "products"]).await
  }

  async fn create_product(&self, input: &ProductInput) -> Result<Product, QueryError> {
    self.write(Method::POST, &["products"], Some(input)).await
  }

  async fn update_product(&self, id: &str, input: &ProductInput) -> Result<Product, QueryError> {
    self.write(Method::PUT, &["products", id], Some(input)).await
  }

  async fn delete_product(&self, id: &str) -> Result<(), QueryError> {
    self.write::<Value, _>(Method::DELETE, &["products", id], None).await
  }

  async fn cart(&self) -> Result<Cart, QueryError> {
    self.get(&["cart"]).await
  }

  async fn add_to_cart(&self, item: &AddToCart) -> Result<Value, QueryError> {
    self.write(Method::POST, &["cart", "items"], Some(item)).await
  }

  async fn remove_from_cart(&self, item_id: &str) -> Result<(), QueryError> {
    self.write::<Value, _>(Method::DELETE, &["cart", "items", item_id], None).await
  }

  async fn clear_cart(&self) -> Result<(), QueryError> {
    self.write::<Value, _>(Method::DELETE, &["cart"], None).await
  }

  async fn checkout(&self) -> Result<Value, QueryError> {
    self.write::<Value, _>(Method::POST, &["checkout"], None).await
  }

  async fn orders(&self) -> Result<Vec<Order>, QueryError> {
    self.get(&["orders"]).await
  }

  async fn order(&self, id: &str) -> Result<Order, QueryError> {
    self.get(&["orders", id]).await
  }
}

#[derive(Deserialize)]
struct ErrorBody {
  message: Option<String>,
}

/// Failures where no response arrived.
fn transport_error(e: reqwest::Error) -> QueryError {
  if e.is_timeout() {
    QueryError::network("Request timed out")
  } else {
    QueryError::network(e.to_string())
  }
}

/// Build the error for a 4xx/5xx response, preferring the body's `message`.
fn error_from_body(status: StatusCode, body: &[u8]) -> QueryError {
  let message = serde_json::from_slice::<ErrorBody>(body)
    .ok()
    .and_then(|b| b.message)
    .filter(|m| !m.is_empty())
    .unwrap_or_else(|| match status.canonical_reason() {
      Some(reason) => format!("{} {}", status.as_u16(), reason),
      None => format!("Request failed with status {}", status.as_u16()),
    });
  QueryError::server(Some(status.as_u16()), message)
}

/// Decode a success body. Empty bodies (e.g. 204 on delete) decode as `null`.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, QueryError> {
  let body = if body.iter().all(u8::is_ascii_whitespace) {
    &b"null"[..]
  } else {
    body
  };
  Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ApiConfig;
  use crate::error::ErrorKind;

  fn client(base_url: &str) -> ApiClient {
    let config = Config {
      api: ApiConfig {
        base_url: base_url.to_string(),
        ..Default::default()
      },
      ..Default::default()
    };
    ApiClient::new(&config).unwrap()
  }

  #[test]
  fn test_endpoint_joins_segments() {
    let api = client("http://localhost:5000/api");
    let url = api.endpoint(&["cart", "items", "a/b"]).unwrap();
    assert_eq!(url.as_str(), "http://localhost:5000/api/cart/items/a%2Fb");

    let api = client("http://localhost:5000/api/");
    assert_eq!(
      api.endpoint(&["my", "products"]).unwrap().as_str(),
      "http://localhost:5000/api/my/products"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let config = Config {
      api: ApiConfig {
        base_url: "not a url".to_string(),
        ..Default::default()
      },
      ..Default::default()
    };
    assert!(ApiClient::new(&config).is_err());
  }

  #[test]
  fn test_error_body_message_is_preferred() {
    let err = error_from_body(StatusCode::CONFLICT, br#"{"message": "Out of stock"}"#);
    assert_eq!(err.kind, ErrorKind::ServerError);
    assert_eq!(err.status, Some(409));
    assert_eq!(err.message, "Out of stock");
  }

  #[test]
  fn test_error_without_message_uses_status() {
    let err = error_from_body(StatusCode::INTERNAL_SERVER_ERROR, b"<html>oops</html>");
    assert_eq!(err.message, "500 Internal Server Error");
    assert_eq!(err.status, Some(500));
  }

  #[test]
  fn test_decode() {
    decode::<()>(b"").unwrap();
    let product: Product = decode(br#"{"id": "1", "title": "Bamboo Charger", "price": 29.99}"#).unwrap();
    assert_eq!(product.price, 29.99);

    let err = decode::<Product>(b"{not json").unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerError);
  }

  #[tokio::test]
  async fn test_unreachable_server_is_network_error() {
    // Port 9 (discard) is closed on test machines
    let api = client("http://127.0.0.1:9/api");
    let err = api.cart().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NetworkError);
  }
}
