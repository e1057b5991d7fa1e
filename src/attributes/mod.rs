//! Attributes: typed configuration records contributing to a service's policy
//!
//! An attribute is either node-wide (no service specs) or bound to one or more
//! services by `(url, org)`. Attributes are stored independently of services
//! and joined at read time by the [`resolver`].

pub mod resolver;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::policy::{AgreementProtocol, Meter};

pub use resolver::{AttributeResolver, ComputeSizing, ResolvedBundle};

/// `(url, org)` identity of a service, the scope an attribute may be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub url: String,
    pub org: String,
}

impl ServiceSpec {
    pub fn new(url: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            org: org.into(),
        }
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org, self.url)
    }
}

/// Fields common to every attribute variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub publishable: bool,
    #[serde(default)]
    pub host_only: bool,
    /// Empty means the attribute applies node-wide.
    #[serde(default)]
    pub service_specs: Vec<ServiceSpec>,
}

/// The closed set of attribute variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AttributeValue {
    #[serde(rename = "ComputeAttributes")]
    Compute { cpus: i64, ram: i64 },

    #[serde(rename = "HAAttributes")]
    Ha { partners: Vec<String> },

    #[serde(rename = "MeteringAttributes")]
    Metering {
        tokens: u64,
        #[serde(rename = "perTimeUnit")]
        per_time_unit: String,
        #[serde(rename = "notificationInterval")]
        notification_interval_secs: u64,
    },

    #[serde(rename = "CounterPartyPropertyAttributes")]
    CounterPartyProperty { expression: Value },

    #[serde(rename = "PropertyAttributes")]
    Property { mappings: BTreeMap<String, Value> },

    #[serde(rename = "AgreementProtocolAttributes")]
    AgreementProtocol { protocols: Vec<AgreementProtocol> },

    #[serde(rename = "UserInputAttributes")]
    UserInput { mappings: BTreeMap<String, Value> },

    #[serde(rename = "ArchitectureAttributes")]
    Architecture { architecture: String },
}

/// Discriminant of [`AttributeValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeKind {
    Compute,
    Ha,
    Metering,
    CounterPartyProperty,
    Property,
    AgreementProtocol,
    UserInput,
    Architecture,
}

impl AttributeKind {
    /// Variants that author policy terms. Pattern nodes take these from the pattern.
    pub fn is_policy_generating(&self) -> bool {
        matches!(
            self,
            AttributeKind::Metering
                | AttributeKind::Property
                | AttributeKind::CounterPartyProperty
                | AttributeKind::AgreementProtocol
        )
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeKind::Compute => "ComputeAttributes",
            AttributeKind::Ha => "HAAttributes",
            AttributeKind::Metering => "MeteringAttributes",
            AttributeKind::CounterPartyProperty => "CounterPartyPropertyAttributes",
            AttributeKind::Property => "PropertyAttributes",
            AttributeKind::AgreementProtocol => "AgreementProtocolAttributes",
            AttributeKind::UserInput => "UserInputAttributes",
            AttributeKind::Architecture => "ArchitectureAttributes",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(flatten)]
    pub meta: AttributeMeta,
    #[serde(flatten)]
    pub value: AttributeValue,
}

impl Attribute {
    /// A node-wide attribute.
    pub fn global(value: AttributeValue) -> Self {
        Self {
            meta: AttributeMeta::default(),
            value,
        }
    }

    /// An attribute bound to a single service.
    pub fn scoped(spec: ServiceSpec, value: AttributeValue) -> Self {
        Self {
            meta: AttributeMeta {
                service_specs: vec![spec],
                ..AttributeMeta::default()
            },
            value,
        }
    }

    pub fn kind(&self) -> AttributeKind {
        match &self.value {
            AttributeValue::Compute { .. } => AttributeKind::Compute,
            AttributeValue::Ha { .. } => AttributeKind::Ha,
            AttributeValue::Metering { .. } => AttributeKind::Metering,
            AttributeValue::CounterPartyProperty { .. } => AttributeKind::CounterPartyProperty,
            AttributeValue::Property { .. } => AttributeKind::Property,
            AttributeValue::AgreementProtocol { .. } => AttributeKind::AgreementProtocol,
            AttributeValue::UserInput { .. } => AttributeKind::UserInput,
            AttributeValue::Architecture { .. } => AttributeKind::Architecture,
        }
    }

    pub fn is_global(&self) -> bool {
        self.meta.service_specs.is_empty()
    }

    /// Bound to `spec`, or node-wide.
    pub fn applies_to(&self, spec: &ServiceSpec) -> bool {
        self.is_global() || self.is_bound_to(spec)
    }

    pub fn is_bound_to(&self, spec: &ServiceSpec) -> bool {
        self.meta.service_specs.contains(spec)
    }

    /// Uniform key/value view of the attribute's payload.
    pub fn generic_mappings(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        match &self.value {
            AttributeValue::Compute { cpus, ram } => {
                out.insert("cpus".to_string(), json!(cpus));
                out.insert("ram".to_string(), json!(ram));
            }
            AttributeValue::Ha { partners } => {
                out.insert("partners".to_string(), json!(partners));
            }
            AttributeValue::Metering {
                tokens,
                per_time_unit,
                notification_interval_secs,
            } => {
                out.insert("tokens".to_string(), json!(tokens));
                out.insert("perTimeUnit".to_string(), json!(per_time_unit));
                out.insert(
                    "notificationInterval".to_string(),
                    json!(notification_interval_secs),
                );
            }
            AttributeValue::CounterPartyProperty { expression } => {
                out.insert("expression".to_string(), expression.clone());
            }
            AttributeValue::Property { mappings } | AttributeValue::UserInput { mappings } => {
                out.extend(mappings.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            AttributeValue::AgreementProtocol { protocols } => {
                out.insert("protocols".to_string(), json!(protocols));
            }
            AttributeValue::Architecture { architecture } => {
                out.insert("architecture".to_string(), json!(architecture));
            }
        }
        out
    }
}

impl AttributeValue {
    pub fn meter(&self) -> Option<Meter> {
        match self {
            AttributeValue::Metering {
                tokens,
                per_time_unit,
                notification_interval_secs,
            } => Some(Meter {
                tokens: *tokens,
                per_time_unit: per_time_unit.clone(),
                notification_interval_secs: *notification_interval_secs,
            }),
            _ => None,
        }
    }
}
