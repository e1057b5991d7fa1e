//! Audit event log
//!
//! Registration flows record what they did for the node owner to inspect.
//! Appending is fire-and-forget: a failed write is logged and never surfaces
//! to the flow that emitted it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persistence::PersistenceStore;

/// Event codes written by this agent.
pub mod codes {
    pub const START_SERVICE_CONFIG: &str = "start_service_configuration";
    pub const SERVICE_CONFIG_COMPLETE: &str = "service_configuration_completed";
    pub const SERVICE_CONFIG_FAILED: &str = "error_in_service_configuration";
    pub const SERVICE_ARCHIVED: &str = "service_archived";
    pub const SERVICE_SUSPENDED: &str = "service_suspended";
    pub const SERVICE_RESUMED: &str = "service_resumed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// The service an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSource {
    pub url: String,
    pub org: String,
    pub version_range: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    pub id: String,
    pub timestamp: u64,
    pub severity: Severity,
    pub message: String,
    pub event_code: String,
    pub source: ServiceSource,
}

impl EventLog {
    pub fn new(
        severity: Severity,
        message: impl Into<String>,
        event_code: impl Into<String>,
        source: ServiceSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: crate::now(),
            severity,
            message: message.into(),
            event_code: event_code.into(),
            source,
        }
    }
}

/// Selects event log entries. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLogQuery {
    pub severity: Option<Severity>,
    pub event_code: Option<String>,
    /// Every word must occur in the message.
    pub message_contains: Vec<String>,
    pub service_url: Option<String>,
    pub since: Option<u64>,
}

impl EventLogQuery {
    pub fn matches(&self, entry: &EventLog) -> bool {
        if self.severity.is_some_and(|s| s != entry.severity) {
            return false;
        }
        if self
            .event_code
            .as_ref()
            .is_some_and(|code| *code != entry.event_code)
        {
            return false;
        }
        if self
            .service_url
            .as_ref()
            .is_some_and(|url| *url != entry.source.url)
        {
            return false;
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        self.message_contains
            .iter()
            .all(|word| entry.message.contains(word.as_str()))
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, severity: Severity, message: &str, code: &str, subject: &ServiceSource);
}

/// Audit sink writing into the node's store.
pub struct StoreAuditSink {
    store: Arc<dyn PersistenceStore>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }
}

impl AuditSink for StoreAuditSink {
    fn append(&self, severity: Severity, message: &str, code: &str, subject: &ServiceSource) {
        let entry = EventLog::new(severity, message, code, subject.clone());
        if let Err(e) = self.store.save_event_log(&entry) {
            warn!(error = %e, code, "Failed to record event log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;

    fn entry(severity: Severity, message: &str, url: &str) -> EventLog {
        EventLog::new(
            severity,
            message,
            codes::SERVICE_CONFIG_COMPLETE,
            ServiceSource {
                url: url.to_string(),
                org: "acme".to_string(),
                ..ServiceSource::default()
            },
        )
    }

    #[test]
    fn test_query_matches_all_selectors() {
        let e = entry(Severity::Info, "Complete service configuration for acme/gps.", "gps");

        assert!(EventLogQuery::default().matches(&e));
        assert!(EventLogQuery {
            severity: Some(Severity::Info),
            message_contains: vec!["service".to_string(), "gps".to_string()],
            ..Default::default()
        }
        .matches(&e));
        assert!(!EventLogQuery {
            severity: Some(Severity::Error),
            ..Default::default()
        }
        .matches(&e));
        assert!(!EventLogQuery {
            message_contains: vec!["agreement".to_string()],
            ..Default::default()
        }
        .matches(&e));
        assert!(!EventLogQuery {
            service_url: Some("cpu".to_string()),
            ..Default::default()
        }
        .matches(&e));
        assert!(EventLogQuery {
            since: Some(e.timestamp),
            ..Default::default()
        }
        .matches(&e));
        assert!(!EventLogQuery {
            since: Some(e.timestamp + 1),
            ..Default::default()
        }
        .matches(&e));
    }

    #[test]
    fn test_store_sink_appends() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sink = StoreAuditSink::new(store.clone());

        sink.append(
            Severity::Warning,
            "something odd",
            codes::SERVICE_CONFIG_FAILED,
            &ServiceSource::default(),
        );

        let logs = store
            .find_event_logs(&EventLogQuery {
                event_code: Some(codes::SERVICE_CONFIG_FAILED.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, Severity::Warning);
    }
}
