//! Notification hub.
//!
//! A small synchronous fan-out: components publish a message with a
//! [`Severity`], and every subscribed observer is called in registration
//! order on the publishing thread. A panicking observer is logged and
//! skipped; the remaining observers still receive the notification.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// An operation succeeded.
    Success,
    /// Something the user should know about; no work was lost.
    Warning,
    /// An operation failed.
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A published notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub severity: Severity,
}

/// Handle returned by [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer callback.
pub type Observer = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Fan-out of notifications to registered observers.
#[derive(Default)]
pub struct NotificationHub {
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl NotificationHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It receives every later notification.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Publish a notification to every observer, in registration order.
    pub fn publish(&self, message: impl Into<String>, severity: Severity) {
        let notification = Notification {
            message: message.into(),
            severity,
        };

        match severity {
            Severity::Info | Severity::Success => info!("[{}] {}", severity, notification.message),
            Severity::Warning => warn!("{}", notification.message),
            Severity::Error => error!("{}", notification.message),
        }

        // Snapshot so observers may (un)subscribe while being called
        let observers: Vec<Observer> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&notification))).is_err() {
                error!(
                    "Notification observer panicked while handling '{}'",
                    notification.message
                );
            }
        }
    }

    /// Publish an informational notification.
    pub fn info(&self, message: impl Into<String>) {
        self.publish(message, Severity::Info);
    }

    /// Publish a success notification.
    pub fn success(&self, message: impl Into<String>) {
        self.publish(message, Severity::Success);
    }

    /// Publish a warning notification.
    pub fn warning(&self, message: impl Into<String>) {
        self.publish(message, Severity::Warning);
    }

    /// Publish an error notification.
    pub fn error(&self, message: impl Into<String>) {
        self.publish(message, Severity::Error);
    }
}
