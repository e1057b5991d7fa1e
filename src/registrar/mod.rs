//! Service registration
//!
//! [`ServiceRegistrar::register`] turns a registration request into a cached
//! service definition, a set of service-scoped attributes and a policy
//! document. The request is fully validated before anything is written, so a
//! rejected registration leaves the store untouched.
//!
//! Only one unarchived registration may exist per `(url, org)`. Callers must
//! not register the same service concurrently; in the daemon all registrations
//! go through the resource worker's single command loop.

mod validate;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::arch::{self, ArchSynonyms};
use crate::attributes::{Attribute, AttributeKind, AttributeResolver, AttributeValue, ServiceSpec};
use crate::catalog::{
    CatalogError, ServiceCatalog, ServiceDefinition, ServiceReference, VersionError,
    VersionExpression,
};
use crate::config::Config;
use crate::eventlog::{codes, AuditSink, ServiceSource, Severity};
use crate::persistence::{
    AttributeScope, ConfigState, Device, MicroserviceDefinition, PersistenceStore,
    ServiceDefFilter, StoreError, DEFAULT_ACTIVE_UPGRADE, DEFAULT_AUTO_UPGRADE,
};
use crate::policy::{self, PolicyDocument, PolicyError, PolicyWriter};

use validate::{
    check_input_string, dedupe_variants, missing_variable, pattern_verifier, protocol_verifier,
    user_input_verifier, verify_attributes, ATTRIBUTE_TYPE_FIELD,
};

/// Version used when a request does not name one: everything from 0.0.0 up.
pub const DEFAULT_VERSION: &str = "0.0.0";

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The request is wrong; retrying it unchanged will not help.
    #[error("invalid {field}: {detail}")]
    UserInput { field: String, detail: String },

    #[error("{0}")]
    Duplicate(String),

    #[error("system error: {0}")]
    System(String),
}

impl RegistrationError {
    pub fn user_input(field: impl Into<String>, detail: impl Into<String>) -> Self {
        RegistrationError::UserInput {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

impl From<StoreError> for RegistrationError {
    fn from(e: StoreError) -> Self {
        RegistrationError::System(format!("store: {}", e))
    }
}

impl From<PolicyError> for RegistrationError {
    fn from(e: PolicyError) -> Self {
        RegistrationError::System(format!("policy: {}", e))
    }
}

/// A request to register one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub url: Option<String>,
    /// Defaults to the device's org.
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub version_range: Option<String>,
    /// Defaults to the host architecture.
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub auto_upgrade: Option<bool>,
    #[serde(default)]
    pub active_upgrade: Option<bool>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl ServiceRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Request for a service pinned by a pattern.
    pub fn from_reference(reference: &ServiceReference) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            url: Some(reference.url.clone()),
            org: non_empty(&reference.org),
            version_range: non_empty(&reference.version_range),
            arch: non_empty(&reference.arch),
            name: reference.name.clone(),
            ..Self::default()
        }
    }
}

/// What the node has registered, as reported to its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub url: String,
    pub org: String,
    pub version: String,
    pub auto_upgrade: bool,
    pub active_upgrade: bool,
    pub config_state: ConfigState,
    pub attributes: Vec<Attribute>,
}

/// Configuration state of one registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfigState {
    pub url: String,
    pub org: String,
    pub config_state: ConfigState,
}

impl From<&MicroserviceDefinition> for ServiceConfigState {
    fn from(def: &MicroserviceDefinition) -> Self {
        Self {
            url: def.url.clone(),
            org: def.org.clone(),
            config_state: def.config_state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrarSettings {
    pub host_arch: String,
    pub arch_synonyms: ArchSynonyms,
    /// Agreement cap for shareable services on nodes that author their own policy.
    pub max_agreements: u32,
    pub default_service_ram_mb: i64,
}

impl RegistrarSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host_arch: arch::host_arch(),
            arch_synonyms: config.arch.clone(),
            max_agreements: config.policy.max_agreements,
            default_service_ram_mb: config.policy.default_service_ram_mb,
        }
    }
}

impl Default for RegistrarSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ServiceRegistrar {
    store: Arc<dyn PersistenceStore>,
    catalog: Arc<dyn ServiceCatalog>,
    audit: Arc<dyn AuditSink>,
    policies: PolicyWriter,
    resolver: AttributeResolver,
    settings: RegistrarSettings,
}

impl ServiceRegistrar {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        catalog: Arc<dyn ServiceCatalog>,
        audit: Arc<dyn AuditSink>,
        policies: PolicyWriter,
        settings: RegistrarSettings,
    ) -> Self {
        Self {
            resolver: AttributeResolver::new(store.clone()),
            store,
            catalog,
            audit,
            policies,
            settings,
        }
    }

    /// Register a service and write its policy.
    ///
    /// `from_user` distinguishes explicit requests from automatic
    /// registration of pattern members; only explicit requests on a
    /// pattern-bound node take their version and arch from the pattern.
    pub async fn register(
        &self,
        request: ServiceRequest,
        from_user: bool,
    ) -> Result<PolicyDocument, RegistrationError> {
        let mut subject = ServiceSource {
            url: request.url.clone().unwrap_or_default(),
            org: request.org.clone().unwrap_or_default(),
            version_range: request.version_range.clone().unwrap_or_default(),
            arch: request.arch.clone().unwrap_or_default(),
        };
        let mode = if from_user { "" } else { "auto " };

        self.audit.append(
            Severity::Info,
            &format!(
                "Start service {}configuration for {}/{}.",
                mode, subject.org, subject.url
            ),
            codes::START_SERVICE_CONFIG,
            &subject,
        );

        let result = self.create(request, from_user, &mut subject).await;

        match &result {
            Ok(doc) => {
                info!(url = %subject.url, org = %subject.org, policy = %doc.name, "Service registered");
                self.audit.append(
                    Severity::Info,
                    &format!(
                        "Complete service {}configuration for {}/{}.",
                        mode, subject.org, subject.url
                    ),
                    codes::SERVICE_CONFIG_COMPLETE,
                    &subject,
                );
            }
            // Pattern members already registered are expected on every restart
            Err(RegistrationError::Duplicate(_)) if !from_user => {
                debug!(url = %subject.url, org = %subject.org, "Service already registered");
                self.audit.append(
                    Severity::Info,
                    &format!(
                        "Complete service auto configuration for {}/{}.",
                        subject.org, subject.url
                    ),
                    codes::SERVICE_CONFIG_COMPLETE,
                    &subject,
                );
            }
            Err(e) => {
                warn!(url = %subject.url, org = %subject.org, error = %e, "Service registration failed");
                self.audit.append(
                    Severity::Error,
                    &format!(
                        "Error in service {}configuration for {}/{}: {}",
                        mode, subject.org, subject.url, e
                    ),
                    codes::SERVICE_CONFIG_FAILED,
                    &subject,
                );
            }
        }
        result
    }

    async fn create(
        &self,
        mut request: ServiceRequest,
        from_user: bool,
        subject: &mut ServiceSource,
    ) -> Result<PolicyDocument, RegistrationError> {
        let device = self.store.find_device()?.ok_or_else(|| {
            RegistrationError::user_input(
                "service",
                "exchange registration not recorded; register the device before configuring services",
            )
        })?;

        let url = request
            .url
            .take()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| RegistrationError::user_input("service.url", "not specified"))?;
        check_input_string("service.url", &url)?;

        let org = match request.org.take().filter(|org| !org.is_empty()) {
            Some(org) => {
                check_input_string("service.organization", &org)?;
                org
            }
            None => device.org.clone(),
        };
        subject.url = url.clone();
        subject.org = org.clone();

        if from_user {
            if let Some((pattern_org, pattern_name)) = device.pattern_parts() {
                let members = self
                    .catalog
                    .pattern_members(pattern_name, pattern_org)
                    .await
                    .map_err(|e| pattern_error(&device.pattern, e))?;
                let pinned = members
                    .iter()
                    .find(|m| m.url == url && m.org == org && self.runs_here(m));
                if let Some(member) = pinned {
                    debug!(url = %url, version = %member.version_range, arch = %member.arch, "Using version from pattern");
                    request.version_range = Some(member.version_range.clone());
                    request.arch = Some(member.arch.clone());
                }
            }
        }

        let host_arch = self.settings.host_arch.as_str();
        let arch = match request.arch.take().filter(|arch| !arch.is_empty()) {
            None => host_arch.to_string(),
            Some(arch) if self.settings.arch_synonyms.runs_on(&arch, host_arch) => {
                check_input_string("service.arch", &arch)?;
                arch
            }
            Some(arch) => {
                return Err(RegistrationError::user_input(
                    "service.arch",
                    format!("arch {} is not supported by this node", arch),
                ))
            }
        };

        let range = request
            .version_range
            .take()
            .filter(|range| !range.is_empty())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let expression: VersionExpression = range.parse().map_err(|e: VersionError| {
            RegistrationError::user_input(
                "service.versionRange",
                format!("{} cannot be converted to a version expression: {}", range, e),
            )
        })?;
        subject.version_range = expression.to_string();
        subject.arch = arch.clone();

        let service = self.lookup(&url, &org, &expression, &arch).await?;

        let mut def = MicroserviceDefinition::from_service(&service, &org);
        def.name = match request.name.take().filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => last_path_segment(&url).to_string(),
        };
        def.requested_arch = arch.clone();
        def.upgrade_version_range = expression.to_string();
        if let Some(auto_upgrade) = request.auto_upgrade {
            def.auto_upgrade = auto_upgrade;
        }
        if let Some(active_upgrade) = request.active_upgrade {
            def.active_upgrade = active_upgrade;
        }

        let registered = self
            .store
            .find_service_defs(&[ServiceDefFilter::Unarchived, ServiceDefFilter::url_org(&url, &org)])?;
        if !registered.is_empty() {
            return Err(RegistrationError::Duplicate(format!(
                "duplicate registration for {}/{} {} {}; only one registration per service is supported",
                org, url, expression, arch
            )));
        }

        if request.attributes.is_empty() {
            if let Some(name) = def.needs_user_input() {
                return Err(missing_variable(name, &def));
            }
        }

        let spec = def.spec();
        let stored = self
            .store
            .find_attributes(&AttributeScope::Applicable(spec.clone()))?;
        let mut attributes =
            self.bind_attributes(std::mem::take(&mut request.attributes), &stored, &spec)?;
        {
            let verifiers = vec![
                user_input_verifier(&def),
                pattern_verifier(&device),
                protocol_verifier(),
            ];
            verify_attributes(&attributes, &verifiers)?;
        }

        // The node has one architecture; the first stored record stands
        if stored.iter().any(|a| a.kind() == AttributeKind::Architecture) {
            attributes.retain(|a| a.kind() != AttributeKind::Architecture);
        }

        let mut bundle = self.resolver.resolve_with(&spec, &attributes)?;
        if device.is_pattern_bound() {
            bundle = bundle.without_policy();
        }

        if device.ha_enabled && !bundle.has_ha_partner() {
            return Err(RegistrationError::user_input(
                ATTRIBUTE_TYPE_FIELD,
                "services on an HA device must specify an HA partner",
            ));
        }

        let max_agreements = self.max_agreements(&def, &device);
        let doc = policy::synthesize(&bundle, &def, max_agreements, &device.org)?;

        self.store.save_service_def(&def)?;
        for attr in &attributes {
            self.store.save_attribute(attr)?;
        }
        self.policies.write(&doc)?;

        info!(
            url = %def.url,
            org = %def.org,
            version = %def.version,
            arch = %def.requested_arch,
            attributes = attributes.len(),
            max_agreements,
            "Saved service definition"
        );
        Ok(doc)
    }

    /// Catalog lookup with the requested arch, then once with the host arch.
    async fn lookup(
        &self,
        url: &str,
        org: &str,
        expression: &VersionExpression,
        arch: &str,
    ) -> Result<ServiceDefinition, RegistrationError> {
        let not_found = |arch: &str| {
            RegistrationError::user_input(
                "service",
                format!(
                    "unable to find the service definition using {}/{} {} {} in the exchange",
                    org, url, expression, arch
                ),
            )
        };

        let first = match self.catalog.resolve_service(url, org, expression, arch).await {
            Ok(service) => return Ok(service),
            Err(e) => e,
        };

        let host_arch = self.settings.host_arch.as_str();
        if arch == host_arch {
            debug!(url, org, arch, error = %first, "Service lookup failed");
            return Err(not_found(arch));
        }

        debug!(url, org, arch, error = %first, "Service lookup failed, retrying with host arch");
        self.catalog
            .resolve_service(url, org, expression, host_arch)
            .await
            .map_err(|e| {
                debug!(url, org, arch = host_arch, error = %e, "Service lookup failed");
                not_found(host_arch)
            })
    }

    /// Bind request attributes to the service and assign ids.
    ///
    /// Default sizing is added only when neither the request nor the stored
    /// attributes applying to the service carry a Compute record.
    fn bind_attributes(
        &self,
        attrs: Vec<Attribute>,
        stored: &[Attribute],
        spec: &ServiceSpec,
    ) -> Result<Vec<Attribute>, RegistrationError> {
        let mut bound = dedupe_variants(attrs)?;

        let has_compute = |attrs: &[Attribute]| {
            attrs.iter().any(|a| a.kind() == AttributeKind::Compute)
        };
        if !has_compute(&bound) && !has_compute(stored) {
            let mut compute = Attribute::global(AttributeValue::Compute {
                cpus: 1,
                ram: self.settings.default_service_ram_mb,
            });
            compute.meta.label = "Compute Resources".to_string();
            bound.push(compute);
        }

        for attr in &mut bound {
            if attr.meta.id.is_empty() {
                attr.meta.id = uuid::Uuid::new_v4().to_string();
            }
            attr.meta.service_specs = vec![spec.clone()];
        }
        Ok(bound)
    }

    /// Pattern members built for another architecture are listed alongside
    /// the host's own; only those this node can run apply.
    fn runs_here(&self, member: &ServiceReference) -> bool {
        member.arch.is_empty()
            || self
                .settings
                .arch_synonyms
                .runs_on(&member.arch, &self.settings.host_arch)
    }

    fn max_agreements(&self, def: &MicroserviceDefinition, device: &Device) -> u32 {
        if !def.sharable.is_shareable() {
            1
        } else if device.is_pattern_bound() {
            // The pattern governs agreement counts
            0
        } else {
            self.settings.max_agreements
        }
    }

    /// Register every service pinned by the device's pattern.
    ///
    /// Services that are already registered are skipped. Other failures are
    /// logged and do not stop the remaining registrations.
    pub async fn register_pattern(&self) -> Result<Vec<PolicyDocument>, RegistrationError> {
        let device = self.store.find_device()?.ok_or_else(|| {
            RegistrationError::user_input("device", "exchange registration not recorded")
        })?;
        let Some((pattern_org, pattern_name)) = device.pattern_parts() else {
            debug!("Device is not using a pattern, nothing to auto-register");
            return Ok(Vec::new());
        };

        let members = self
            .catalog
            .pattern_members(pattern_name, pattern_org)
            .await
            .map_err(|e| pattern_error(&device.pattern, e))?;
        let mut applicable: Vec<&ServiceReference> = Vec::new();
        for member in &members {
            if !self.runs_here(member) {
                debug!(url = %member.url, org = %member.org, arch = %member.arch, "Skipping pattern service for another architecture");
            } else if !applicable.iter().any(|m| m.url == member.url && m.org == member.org) {
                applicable.push(member);
            }
        }
        info!(pattern = %device.pattern, services = applicable.len(), "Registering pattern services");

        let mut created = Vec::new();
        for member in applicable {
            match self.register(ServiceRequest::from_reference(member), false).await {
                Ok(doc) => created.push(doc),
                Err(RegistrationError::Duplicate(_)) => {}
                Err(e) => {
                    error!(url = %member.url, org = %member.org, error = %e, "Pattern service registration failed");
                }
            }
        }
        Ok(created)
    }

    /// Registered services joined with their upgrade settings and attributes.
    pub fn service_configs(&self) -> Result<Vec<ServiceConfig>, RegistrationError> {
        let defs = self.store.find_service_defs(&[ServiceDefFilter::Unarchived])?;

        let mut configs = Vec::new();
        for doc in self.policies.list()? {
            let spec = ServiceSpec::new(&doc.service.url, &doc.service.org);
            let def = defs
                .iter()
                .find(|d| d.url == spec.url && d.org == spec.org);
            let attributes = self
                .store
                .find_attributes(&AttributeScope::Applicable(spec.clone()))?;

            configs.push(ServiceConfig {
                url: spec.url,
                org: spec.org,
                version: doc.service.version,
                auto_upgrade: def.map_or(DEFAULT_AUTO_UPGRADE, |d| d.auto_upgrade),
                active_upgrade: def.map_or(DEFAULT_ACTIVE_UPGRADE, |d| d.active_upgrade),
                config_state: def.map_or(ConfigState::Active, |d| d.config_state),
                attributes,
            });
        }
        Ok(configs)
    }

    /// Archive registrations and drop their attributes and policies.
    ///
    /// With neither `org` nor `url` every registration is removed; `url`
    /// requires `org`.
    pub fn unregister(
        &self,
        org: Option<&str>,
        url: Option<&str>,
    ) -> Result<Vec<MicroserviceDefinition>, RegistrationError> {
        let filters = selection(org, url)?;

        let now = crate::now();
        let mut archived = Vec::new();
        for mut def in self.store.find_service_defs(&filters)? {
            let spec = def.spec();
            def.archive(now);
            self.store.save_service_def(&def)?;

            for mut attr in self.store.find_attributes(&AttributeScope::Service(spec.clone()))? {
                attr.meta.service_specs.retain(|s| *s != spec);
                if attr.meta.service_specs.is_empty() {
                    self.store.delete_attribute(&attr.meta.id)?;
                } else {
                    self.store.save_attribute(&attr)?;
                }
            }
            self.policies.remove(&def.org, &def.url)?;

            info!(url = %def.url, org = %def.org, version = %def.version, "Service archived");
            self.audit.append(
                Severity::Info,
                &format!("Service {}/{} archived.", def.org, def.url),
                codes::SERVICE_ARCHIVED,
                &ServiceSource {
                    url: def.url.clone(),
                    org: def.org.clone(),
                    version_range: def.upgrade_version_range.clone(),
                    arch: def.requested_arch.clone(),
                },
            );
            archived.push(def);
        }
        Ok(archived)
    }

    /// Configuration state of every registered service.
    pub fn config_states(&self) -> Result<Vec<ServiceConfigState>, RegistrationError> {
        Ok(self
            .store
            .find_service_defs(&[ServiceDefFilter::Unarchived])?
            .iter()
            .map(ServiceConfigState::from)
            .collect())
    }

    /// Suspend or resume registrations, selected as for [`Self::unregister`].
    ///
    /// Suspended services keep their definition, attributes and policy so
    /// that resuming restores them unchanged. Returns the services whose
    /// state changed.
    pub fn set_config_state(
        &self,
        org: Option<&str>,
        url: Option<&str>,
        state: ConfigState,
    ) -> Result<Vec<ServiceConfigState>, RegistrationError> {
        let filters = selection(org, url)?;
        let (verb, code) = match state {
            ConfigState::Active => ("resumed", codes::SERVICE_RESUMED),
            ConfigState::Suspended => ("suspended", codes::SERVICE_SUSPENDED),
        };

        let mut changed = Vec::new();
        for mut def in self.store.find_service_defs(&filters)? {
            if def.config_state == state {
                continue;
            }
            def.config_state = state;
            self.store.save_service_def(&def)?;

            info!(url = %def.url, org = %def.org, state = %state, "Service config state changed");
            self.audit.append(
                Severity::Info,
                &format!("Service {}/{} {}.", def.org, def.url, verb),
                code,
                &ServiceSource {
                    url: def.url.clone(),
                    org: def.org.clone(),
                    version_range: def.upgrade_version_range.clone(),
                    arch: def.requested_arch.clone(),
                },
            );
            changed.push(ServiceConfigState::from(&def));
        }
        Ok(changed)
    }

    /// Delete definitions archived longer than `retention` ago.
    pub fn collect_garbage(&self, retention: Duration) -> Result<usize, RegistrationError> {
        let cutoff = crate::now().saturating_sub(retention.as_secs());
        let stale = self
            .store
            .find_service_defs(&[ServiceDefFilter::ArchivedBefore(cutoff)])?;
        for def in &stale {
            self.store.delete_service_def(&def.id)?;
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "Removed archived service definitions");
        }
        Ok(stale.len())
    }
}

/// Unarchived registrations selected by `org` and `url`: all of them when
/// both are absent; a url is only meaningful within an org.
fn selection(
    org: Option<&str>,
    url: Option<&str>,
) -> Result<Vec<ServiceDefFilter>, RegistrationError> {
    let mut filters = vec![ServiceDefFilter::Unarchived];
    match (org, url) {
        (None, Some(_)) => {
            return Err(RegistrationError::user_input(
                "service.organization",
                "an organization is required when a url is given",
            ))
        }
        (Some(org), Some(url)) => filters.push(ServiceDefFilter::url_org(url, org)),
        (Some(org), None) => filters.push(ServiceDefFilter::Org(org.to_string())),
        (None, None) => {}
    }
    Ok(filters)
}

fn pattern_error(pattern: &str, e: CatalogError) -> RegistrationError {
    match e {
        CatalogError::NotFound(detail) => RegistrationError::user_input(
            "pattern",
            format!("pattern {} not found in the exchange: {}", pattern, detail),
        ),
        other => RegistrationError::System(format!("reading pattern {}: {}", pattern, other)),
    }
}

fn last_path_segment(url: &str) -> &str {
    let trimmed = url.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
