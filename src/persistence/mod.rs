//! Persistence for device, service definition, attribute and event log records
//!
//! The registrar only relies on [`PersistenceStore`]; [`SqliteStore`] is the
//! on-disk implementation. No cross-call transactions are assumed.

pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, ServiceSpec};
use crate::catalog::{ServiceDefinition, SharingMode, UserInput};
use crate::eventlog::{EventLog, EventLogQuery};

pub use sqlite::SqliteStore;

/// Defaults applied to a new registration when the request does not say otherwise.
pub const DEFAULT_AUTO_UPGRADE: bool = true;
pub const DEFAULT_ACTIVE_UPGRADE: bool = false;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

/// The node's exchange registration. At most one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub org: String,
    pub id: String,
    pub token: String,
    /// `org/name` or bare `name`; empty when the node authors its own policy.
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub ha_enabled: bool,
}

impl Device {
    pub fn is_pattern_bound(&self) -> bool {
        !self.pattern.is_empty()
    }

    /// Pattern `(org, name)`; a bare name lives in the device's org.
    pub fn pattern_parts(&self) -> Option<(&str, &str)> {
        if self.pattern.is_empty() {
            return None;
        }
        Some(match self.pattern.split_once('/') {
            Some((org, name)) => (org, name),
            None => (self.org.as_str(), self.pattern.as_str()),
        })
    }
}

/// Whether a registered service should be running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigState {
    #[default]
    Active,
    Suspended,
}

impl std::fmt::Display for ConfigState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigState::Active => write!(f, "active"),
            ConfigState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Locally cached copy of a registered service definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceDefinition {
    pub id: String,
    pub url: String,
    pub org: String,
    pub name: String,
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub user_inputs: Vec<UserInput>,
    #[serde(default)]
    pub sharable: SharingMode,
    pub auto_upgrade: bool,
    pub active_upgrade: bool,
    pub upgrade_version_range: String,
    pub requested_arch: String,
    #[serde(default)]
    pub config_state: ConfigState,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub archived_at: u64,
    #[serde(default)]
    pub created_at: u64,
}

impl MicroserviceDefinition {
    /// Derive the cached form of a definition fetched from the exchange.
    pub fn from_service(def: &ServiceDefinition, org: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: def.url.clone(),
            org: org.to_string(),
            name: String::new(),
            version: def.version.clone(),
            arch: def.arch.clone(),
            user_inputs: def.user_inputs.clone(),
            sharable: def.sharable,
            auto_upgrade: DEFAULT_AUTO_UPGRADE,
            active_upgrade: DEFAULT_ACTIVE_UPGRADE,
            upgrade_version_range: String::new(),
            requested_arch: String::new(),
            config_state: ConfigState::Active,
            archived: false,
            archived_at: 0,
            created_at: crate::now(),
        }
    }

    pub fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(&self.url, &self.org)
    }

    pub fn user_input(&self, name: &str) -> Option<&UserInput> {
        self.user_inputs.iter().find(|ui| ui.name == name)
    }

    /// Name of the first user input that has no default value.
    pub fn needs_user_input(&self) -> Option<&str> {
        self.user_inputs
            .iter()
            .find(|ui| ui.is_required())
            .map(|ui| ui.name.as_str())
    }

    pub fn archive(&mut self, at: u64) {
        self.archived = true;
        self.archived_at = at;
    }
}

/// Predicates over cached service definitions. A query matches when all filters do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceDefFilter {
    Unarchived,
    Org(String),
    UrlOrg { url: String, org: String },
    /// Archived at or before the given unix time.
    ArchivedBefore(u64),
}

impl ServiceDefFilter {
    pub fn url_org(url: &str, org: &str) -> Self {
        ServiceDefFilter::UrlOrg {
            url: url.to_string(),
            org: org.to_string(),
        }
    }

    pub fn matches(&self, def: &MicroserviceDefinition) -> bool {
        match self {
            ServiceDefFilter::Unarchived => !def.archived,
            ServiceDefFilter::Org(org) => def.org == *org,
            ServiceDefFilter::UrlOrg { url, org } => def.url == *url && def.org == *org,
            ServiceDefFilter::ArchivedBefore(at) => def.archived && def.archived_at <= *at,
        }
    }
}

/// Which attributes to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeScope {
    All,
    /// Node-wide attributes only
    Global,
    /// Attributes bound to the service
    Service(ServiceSpec),
    /// Node-wide attributes plus those bound to the service
    Applicable(ServiceSpec),
}

impl AttributeScope {
    pub fn matches(&self, attr: &Attribute) -> bool {
        match self {
            AttributeScope::All => true,
            AttributeScope::Global => attr.is_global(),
            AttributeScope::Service(spec) => attr.is_bound_to(spec),
            AttributeScope::Applicable(spec) => attr.applies_to(spec),
        }
    }
}

/// Durable storage used by the registrar and the workers.
pub trait PersistenceStore: Send + Sync {
    fn find_device(&self) -> Result<Option<Device>, StoreError>;
    fn save_device(&self, device: &Device) -> Result<(), StoreError>;
    fn delete_device(&self) -> Result<(), StoreError>;

    fn find_service_defs(
        &self,
        filters: &[ServiceDefFilter],
    ) -> Result<Vec<MicroserviceDefinition>, StoreError>;
    /// Insert or replace by id.
    fn save_service_def(&self, def: &MicroserviceDefinition) -> Result<(), StoreError>;
    fn delete_service_def(&self, id: &str) -> Result<(), StoreError>;

    fn find_attributes(&self, scope: &AttributeScope) -> Result<Vec<Attribute>, StoreError>;
    /// Insert or replace by id.
    fn save_attribute(&self, attr: &Attribute) -> Result<(), StoreError>;
    fn delete_attribute(&self, id: &str) -> Result<(), StoreError>;

    fn save_event_log(&self, entry: &EventLog) -> Result<(), StoreError>;
    fn find_event_logs(&self, query: &EventLogQuery) -> Result<Vec<EventLog>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(pattern: &str) -> Device {
        Device {
            org: "acme".to_string(),
            id: "node-1".to_string(),
            token: "secret".to_string(),
            pattern: pattern.to_string(),
            ha_enabled: false,
        }
    }

    #[test]
    fn test_pattern_parts() {
        assert_eq!(device("").pattern_parts(), None);
        assert_eq!(device("netspeed").pattern_parts(), Some(("acme", "netspeed")));
        assert_eq!(
            device("public/netspeed").pattern_parts(),
            Some(("public", "netspeed"))
        );
        assert!(device("netspeed").is_pattern_bound());
    }

    #[test]
    fn test_archived_before_filter() {
        let def = ServiceDefinition {
            url: "svc".to_string(),
            org: "acme".to_string(),
            version: "1.0.0".to_string(),
            arch: "amd64".to_string(),
            user_inputs: vec![],
            sharable: SharingMode::Exclusive,
        };
        let mut msdef = MicroserviceDefinition::from_service(&def, "acme");
        assert!(ServiceDefFilter::Unarchived.matches(&msdef));
        assert!(!ServiceDefFilter::ArchivedBefore(u64::MAX).matches(&msdef));

        msdef.archive(100);
        assert!(ServiceDefFilter::ArchivedBefore(100).matches(&msdef));
        assert!(!ServiceDefFilter::ArchivedBefore(99).matches(&msdef));
        assert!(ServiceDefFilter::url_org("svc", "acme").matches(&msdef));
    }

    #[test]
    fn test_config_state_defaults_to_active() {
        let json = serde_json::json!({
            "id": "1", "url": "svc", "org": "acme", "name": "svc",
            "version": "1.0.0", "arch": "amd64",
            "autoUpgrade": true, "activeUpgrade": false,
            "upgradeVersionRange": "[0.0.0,INFINITY)", "requestedArch": "amd64"
        });
        let def: MicroserviceDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.config_state, ConfigState::Active);

        let suspended = serde_json::to_value(ConfigState::Suspended).unwrap();
        assert_eq!(suspended, "suspended");
    }
}
