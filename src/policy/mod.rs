//! Policy documents: the node's advertised terms for running a service
//!
//! [`synthesize`] is a pure function of its inputs. Maps are ordered, so the
//! same inputs always serialize to the same bytes. Documents are regenerated
//! wholesale whenever an input changes, never patched.

pub mod writer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attributes::ResolvedBundle;
use crate::persistence::MicroserviceDefinition;

pub use writer::PolicyWriter;

/// Agreement protocols this node knows how to negotiate.
pub const KNOWN_PROTOCOLS: &[&str] = &[BASIC_PROTOCOL, CITIZEN_SCIENTIST_PROTOCOL];
pub const BASIC_PROTOCOL: &str = "Basic";
pub const CITIZEN_SCIENTIST_PROTOCOL: &str = "Citizen Scientist";

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown agreement protocol {0:?}")]
    UnknownProtocol(String),

    #[error("policy io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("policy encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Metering terms: tokens charged per time unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    pub tokens: u64,
    pub per_time_unit: String,
    #[serde(rename = "notificationInterval")]
    pub notification_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementProtocol {
    pub name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    1
}

impl AgreementProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol_version: default_protocol_version(),
        }
    }
}

/// The service a policy is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServiceRef {
    pub url: String,
    pub org: String,
    pub name: String,
    pub version: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub name: String,
    pub service: PolicyServiceRef,
    pub properties: BTreeMap<String, Value>,
    pub ha_partners: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_policy: Option<Meter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_party_properties: Option<Value>,
    pub agreement_protocols: Vec<AgreementProtocol>,
    /// 0 means unbounded.
    pub max_agreements: u32,
    pub owner_org: String,
}

impl PolicyDocument {
    pub fn to_json(&self) -> Result<Vec<u8>, PolicyError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Build the policy document for a registered service.
pub fn synthesize(
    bundle: &ResolvedBundle,
    service: &MicroserviceDefinition,
    max_agreements: u32,
    owner_org: &str,
) -> Result<PolicyDocument, PolicyError> {
    let mut properties = BTreeMap::new();
    if let Some(compute) = &bundle.compute {
        properties.insert("cpus".to_string(), Value::String(compute.cpus.to_string()));
        properties.insert("ram".to_string(), Value::String(compute.ram.to_string()));
    }
    if let Some(free_form) = &bundle.properties {
        properties.extend(free_form.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let agreement_protocols = match &bundle.agreement_protocols {
        Some(list) if !list.is_empty() => list.clone(),
        _ => vec![AgreementProtocol::new(BASIC_PROTOCOL)],
    };
    if let Some(unknown) = agreement_protocols
        .iter()
        .find(|p| !KNOWN_PROTOCOLS.contains(&p.name.as_str()))
    {
        return Err(PolicyError::UnknownProtocol(unknown.name.clone()));
    }

    Ok(PolicyDocument {
        name: format!("Policy for {}/{}", service.org, service.url),
        service: PolicyServiceRef {
            url: service.url.clone(),
            org: service.org.clone(),
            name: service.name.clone(),
            version: service.version.clone(),
            arch: service.requested_arch.clone(),
        },
        properties,
        ha_partners: bundle.ha_partners.clone().unwrap_or_default(),
        meter_policy: bundle.meter.clone(),
        counter_party_properties: bundle.counter_party_properties.clone(),
        agreement_protocols,
        max_agreements,
        owner_org: owner_org.to_string(),
    })
}
