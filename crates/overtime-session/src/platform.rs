//! Platform facilities the session consumes.
//!
//! The host application feeds reachability into a [`NetworkMonitor`] and
//! supplies an [`AnalyticsSink`] and a [`PushRegistrar`]. The defaults do
//! nothing beyond logging.

use std::fmt;
use std::sync::Mutex;

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::User;

/// Reachability as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub connected: bool,
    pub wifi: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            connected: true,
            wifi: false,
        }
    }
}

/// Current network reachability, observable through a watch channel.
#[derive(Debug)]
pub struct NetworkMonitor {
    status_tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    /// A monitor that starts out connected.
    pub fn new() -> Self {
        Self::with_status(NetworkStatus::default())
    }

    pub fn with_status(status: NetworkStatus) -> Self {
        let (status_tx, _) = watch::channel(status);
        Self { status_tx }
    }

    pub fn is_network_connected(&self) -> bool {
        self.status_tx.borrow().connected
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.status_tx.borrow().wifi
    }

    /// Record a reachability change.
    pub fn set_status(&self, status: NetworkStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(connected = status.connected, wifi = status.wifi, "network status changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status_tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination for tracking events and error reports.
pub trait AnalyticsSink: Send + Sync {
    fn track_event(&self, event: &str, properties: &Value);

    fn track_error(&self, description: &str, properties: &Value);

    fn set_user_identity(&self, user: &User);
}

/// Analytics sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalytics;

impl AnalyticsSink for NoopAnalytics {
    fn track_event(&self, _event: &str, _properties: &Value) {}

    fn track_error(&self, _description: &str, _properties: &Value) {}

    fn set_user_identity(&self, _user: &User) {}
}

/// A recorded analytics call.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsRecord {
    Event { name: String, properties: Value },
    Error { description: String, properties: Value },
    Identity { user_id: String },
}

/// Analytics sink that keeps every call in memory.
#[derive(Debug, Default)]
pub struct MemoryAnalytics {
    records: Mutex<Vec<AnalyticsRecord>>,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AnalyticsRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Names of tracked events, in order.
    pub fn events(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AnalyticsRecord::Event { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: AnalyticsRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

impl AnalyticsSink for MemoryAnalytics {
    fn track_event(&self, event: &str, properties: &Value) {
        self.push(AnalyticsRecord::Event {
            name: event.to_string(),
            properties: properties.clone(),
        });
    }

    fn track_error(&self, description: &str, properties: &Value) {
        self.push(AnalyticsRecord::Error {
            description: description.to_string(),
            properties: properties.clone(),
        });
    }

    fn set_user_identity(&self, user: &User) {
        self.push(AnalyticsRecord::Identity {
            user_id: user.id.clone(),
        });
    }
}

/// Log a tracking event and forward it to analytics.
pub(crate) fn track_event(sink: &dyn AnalyticsSink, event: &str) {
    info!(event = %event, "tracking event");
    sink.track_event(event, &json!({}));
}

/// Log an error and forward it to analytics.
pub(crate) fn report_error(sink: &dyn AnalyticsSink, description: &str, error: &dyn fmt::Display) {
    warn!(error = %error, "{}", description);
    sink.track_error(description, &json!({ "error": error.to_string() }));
}

/// Remote push registration.
pub trait PushRegistrar: Send + Sync {
    /// Stop receiving remote notifications on this device.
    fn unregister(&self);
}

/// Push registrar for hosts without remote notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPush;

impl PushRegistrar for NoopPush {
    fn unregister(&self) {
        debug!("push unregistration requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_monitor_notifies_changes() {
        let monitor = NetworkMonitor::new();
        assert!(monitor.is_network_connected());
        assert!(!monitor.is_wifi_connected());

        let mut rx = monitor.subscribe();
        monitor.set_status(NetworkStatus {
            connected: false,
            wifi: false,
        });

        rx.changed().await.unwrap();
        assert!(!rx.borrow().connected);
        assert!(!monitor.is_network_connected());
    }

    #[test]
    fn test_network_monitor_ignores_repeated_status() {
        let monitor = NetworkMonitor::new();
        let rx = monitor.subscribe();

        monitor.set_status(NetworkStatus::default());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_memory_analytics_records_calls() {
        let analytics = MemoryAnalytics::new();
        track_event(&analytics, "Logged Out");
        report_error(&analytics, "Failed to verify token", &"bad status: 401");
        analytics.set_user_identity(&User {
            id: "u1".to_string(),
            ..Default::default()
        });

        assert_eq!(analytics.events(), vec!["Logged Out".to_string()]);
        assert_eq!(
            analytics.records()[1],
            AnalyticsRecord::Error {
                description: "Failed to verify token".to_string(),
                properties: json!({ "error": "bad status: 401" }),
            }
        );
        assert_eq!(
            analytics.records()[2],
            AnalyticsRecord::Identity {
                user_id: "u1".to_string()
            }
        );
    }
}
