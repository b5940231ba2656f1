//! User-visible notifications (toasts) emitted when mutations settle.

use std::sync::Mutex;
use tracing::{info, warn};

use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
  #[default]
  Info,
  Success,
  /// Rendered as a destructive toast
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub description: String,
  pub severity: Severity,
}

impl Notification {
  pub fn success(title: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      description: description.into(),
      severity: Severity::Success,
    }
  }

  pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      description: description.into(),
      severity: Severity::Error,
    }
  }
}

/// Receives one notification per settled mutation.
pub trait NotificationSink: Send + Sync {
  fn notify(&self, notification: Notification);
}

/// Sink that only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
  fn notify(&self, n: Notification) {
    match n.severity {
      Severity::Error => warn!(title = %n.title, "{}", n.description),
      _ => info!(title = %n.title, "{}", n.description),
    }
  }
}

/// Queue of pending toasts, drained by whatever renders them.
#[derive(Debug, Default)]
pub struct ToastQueue {
  pending: Mutex<Vec<Notification>>,
}

impl ToastQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Take every queued notification, oldest first.
  pub fn drain(&self) -> Vec<Notification> {
    std::mem::take(&mut *lock(&self.pending))
  }

  pub fn len(&self) -> usize {
    lock(&self.pending).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl NotificationSink for ToastQueue {
  fn notify(&self, notification: Notification) {
    lock(&self.pending).push(notification);
  }
}
