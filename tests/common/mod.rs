//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use edge_agent::arch::ArchSynonyms;
use edge_agent::catalog::{
    CatalogError, ServiceCatalog, ServiceDefinition, ServiceReference, SharingMode, UserInput,
    Version, VersionExpression,
};
use edge_agent::eventlog::StoreAuditSink;
use edge_agent::persistence::{Device, PersistenceStore, SqliteStore};
use edge_agent::policy::PolicyWriter;
use edge_agent::registrar::RegistrarSettings;
use edge_agent::ServiceRegistrar;
use tempfile::TempDir;

pub const ORG: &str = "acme";
pub const GPS: &str = "https://example.com/gps";
pub const CPU: &str = "https://example.com/cpu";

/// In-process catalog with call recording.
#[derive(Default)]
pub struct MockCatalog {
    services: Vec<ServiceDefinition>,
    patterns: HashMap<(String, String), Vec<ServiceReference>>,
    resolve_calls: Mutex<Vec<String>>,
    pattern_calls: Mutex<usize>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, def: ServiceDefinition) -> Self {
        self.services.push(def);
        self
    }

    pub fn with_pattern(mut self, org: &str, name: &str, members: Vec<ServiceReference>) -> Self {
        self.patterns
            .insert((org.to_string(), name.to_string()), members);
        self
    }

    /// Arch requested by each `resolve_service` call, in order.
    pub fn resolve_calls(&self) -> Vec<String> {
        self.resolve_calls.lock().unwrap().clone()
    }

    pub fn pattern_calls(&self) -> usize {
        *self.pattern_calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl ServiceCatalog for MockCatalog {
    async fn pattern_members(
        &self,
        pattern: &str,
        org: &str,
    ) -> Result<Vec<ServiceReference>, CatalogError> {
        *self.pattern_calls.lock().unwrap() += 1;
        self.patterns
            .get(&(org.to_string(), pattern.to_string()))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("pattern {}/{}", org, pattern)))
    }

    async fn resolve_service(
        &self,
        url: &str,
        org: &str,
        version: &VersionExpression,
        arch: &str,
    ) -> Result<ServiceDefinition, CatalogError> {
        self.resolve_calls.lock().unwrap().push(arch.to_string());
        self.services
            .iter()
            .filter(|s| s.url == url && s.org == org && s.arch == arch)
            .filter_map(|s| s.version.parse::<Version>().ok().map(|v| (v, s)))
            .filter(|(v, _)| version.contains(v))
            .max_by_key(|(v, _)| *v)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| CatalogError::NotFound(format!("{}/{} {} {}", org, url, version, arch)))
    }
}

pub fn service(url: &str, version: &str, sharable: SharingMode) -> ServiceDefinition {
    ServiceDefinition {
        url: url.to_string(),
        org: ORG.to_string(),
        version: version.to_string(),
        arch: "amd64".to_string(),
        user_inputs: vec![],
        sharable,
    }
}

pub fn required_input(name: &str, kind: &str) -> UserInput {
    UserInput {
        name: name.to_string(),
        label: String::new(),
        kind: kind.to_string(),
        default_value: String::new(),
    }
}

pub fn member(url: &str, version: &str) -> ServiceReference {
    ServiceReference {
        url: url.to_string(),
        org: ORG.to_string(),
        version_range: format!("[{},{}]", version, version),
        arch: "amd64".to_string(),
        name: None,
    }
}

pub fn member_for_arch(url: &str, version: &str, arch: &str) -> ServiceReference {
    ServiceReference {
        arch: arch.to_string(),
        ..member(url, version)
    }
}

pub fn device(pattern: &str, ha_enabled: bool) -> Device {
    Device {
        org: ORG.to_string(),
        id: "node-1".to_string(),
        token: "secret".to_string(),
        pattern: pattern.to_string(),
        ha_enabled,
    }
}

/// Settings pinned to an amd64 host so tests do not depend on the build machine.
pub fn settings() -> RegistrarSettings {
    RegistrarSettings {
        host_arch: "amd64".to_string(),
        arch_synonyms: ArchSynonyms::default(),
        max_agreements: 5,
        default_service_ram_mb: 128,
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub catalog: Arc<MockCatalog>,
    pub policies: PolicyWriter,
    pub registrar: Arc<ServiceRegistrar>,
}

pub fn harness(catalog: MockCatalog, device: Option<Device>) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("agent.db")).unwrap());
    if let Some(device) = device {
        store.save_device(&device).unwrap();
    }
    let catalog = Arc::new(catalog);
    let policy_dir = dir.path().join("policy.d");

    let registrar = ServiceRegistrar::new(
        store.clone(),
        catalog.clone(),
        Arc::new(StoreAuditSink::new(store.clone())),
        PolicyWriter::new(&policy_dir),
        settings(),
    );

    Harness {
        dir,
        store,
        catalog,
        policies: PolicyWriter::new(policy_dir),
        registrar: Arc::new(registrar),
    }
}
