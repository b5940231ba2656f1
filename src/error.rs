//! Error type shared by fetchers, write actions and cache entries.

use std::fmt;

/// Broad classification of a failed fetch or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// No response was received (connection refused, DNS, timeout)
  NetworkError,
  /// The server answered with a 4xx/5xx status or an unreadable body
  ServerError,
  /// Input was rejected on the client before anything was dispatched
  ValidationError,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorKind::NetworkError => "network error",
      ErrorKind::ServerError => "server error",
      ErrorKind::ValidationError => "validation error",
    };
    f.write_str(s)
  }
}

/// A failed query or mutation.
///
/// Cloneable because one error is stored in the cache entry and handed to
/// every deduplicated awaiter of the same request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct QueryError {
  pub kind: ErrorKind,
  pub message: String,
  /// HTTP status, when the server answered at all
  pub status: Option<u16>,
}

impl QueryError {
  pub fn network(message: impl Into<String>) -> Self {
    Self {
      kind: ErrorKind::NetworkError,
      message: message.into(),
      status: None,
    }
  }

  pub fn server(status: Option<u16>, message: impl Into<String>) -> Self {
    Self {
      kind: ErrorKind::ServerError,
      message: message.into(),
      status,
    }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self {
      kind: ErrorKind::ValidationError,
      message: message.into(),
      status: None,
    }
  }

  pub fn is_network(&self) -> bool {
    self.kind == ErrorKind::NetworkError
  }

  /// The message to show a user, or `fallback` when this error carries
  /// nothing the user can act on (transport failures, empty server bodies).
  pub fn user_message<'a>(&'a self, fallback: &'a str) -> &'a str {
    match self.kind {
      ErrorKind::NetworkError => fallback,
      _ if self.message.trim().is_empty() => fallback,
      _ => &self.message,
    }
  }
}

impl From<serde_json::Error> for QueryError {
  fn from(err: serde_json::Error) -> Self {
    QueryError::server(None, format!("Failed to decode response: {}", err))
  }
}
