//! Notification collaborator.
//!
//! The engine reports failures, rollbacks and degraded runs through
//! [`Notifier`]; delivery mechanics belong to the implementation.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the notification was delivered.
    async fn send(&self, title: &str, message: &str, severity: Severity, metadata: Value) -> bool;
}

/// Emits notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, title: &str, message: &str, severity: Severity, metadata: Value) -> bool {
        match severity {
            Severity::Info => tracing::info!(title, %metadata, "{message}"),
            Severity::Warning => tracing::warn!(title, %metadata, "{message}"),
            Severity::Error | Severity::Critical => tracing::error!(title, %severity, %metadata, "{message}"),
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub metadata: Value,
}

/// Keeps notifications in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.title).collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, title: &str, message: &str, severity: Severity, metadata: Value) -> bool {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(Notification {
            title: title.to_string(),
            message: message.to_string(),
            severity,
            metadata,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_notifier_records() {
        let notifier = MemoryNotifier::new();
        assert!(notifier.send("Run failed", "boom", Severity::Error, json!({"mode": "full"})).await);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].metadata["mode"], "full");
    }

    #[test]
    fn test_severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
    }
}
