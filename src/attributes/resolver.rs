//! Attribute resolution
//!
//! Folds node-wide and service-scoped attributes into one [`ResolvedBundle`].
//! Node-wide records are folded first, so a scoped record of the same variant
//! always wins. Business rules are not interpreted here.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::{Attribute, AttributeValue, ServiceSpec};
use crate::persistence::{AttributeScope, PersistenceStore, StoreError};
use crate::policy::{AgreementProtocol, Meter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSizing {
    pub cpus: i64,
    /// Megabytes
    pub ram: i64,
}

/// The winning value of every policy-relevant variant for one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedBundle {
    pub compute: Option<ComputeSizing>,
    pub ha_partners: Option<Vec<String>>,
    pub meter: Option<Meter>,
    pub counter_party_properties: Option<Value>,
    pub properties: Option<BTreeMap<String, Value>>,
    pub agreement_protocols: Option<Vec<AgreementProtocol>>,
    pub user_inputs: Option<BTreeMap<String, Value>>,
    pub architecture: Option<String>,
}

impl ResolvedBundle {
    /// Apply one attribute on top of what has been resolved so far.
    pub fn merge(mut self, attr: &Attribute) -> Self {
        match &attr.value {
            AttributeValue::Compute { cpus, ram } => {
                self.compute = Some(ComputeSizing {
                    cpus: *cpus,
                    ram: *ram,
                });
            }
            AttributeValue::Ha { partners } => self.ha_partners = Some(partners.clone()),
            AttributeValue::Metering { .. } => self.meter = attr.value.meter(),
            AttributeValue::CounterPartyProperty { expression } => {
                self.counter_party_properties = Some(expression.clone());
            }
            AttributeValue::Property { mappings } => self.properties = Some(mappings.clone()),
            AttributeValue::AgreementProtocol { protocols } => {
                self.agreement_protocols = Some(protocols.clone());
            }
            AttributeValue::UserInput { mappings } => self.user_inputs = Some(mappings.clone()),
            AttributeValue::Architecture { architecture } => {
                self.architecture = Some(architecture.clone());
            }
        }
        self
    }

    /// Fold attributes in order; later records override earlier ones per variant.
    pub fn fold<'a>(attrs: impl IntoIterator<Item = &'a Attribute>) -> Self {
        attrs.into_iter().fold(Self::default(), Self::merge)
    }

    pub fn has_ha_partner(&self) -> bool {
        self.ha_partners.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Drop every policy-authored value, keeping sizing, HA and configuration.
    pub fn without_policy(self) -> Self {
        Self {
            meter: None,
            counter_party_properties: None,
            properties: None,
            agreement_protocols: None,
            ..self
        }
    }
}

/// Reads attributes from the store and resolves them per service.
pub struct AttributeResolver {
    store: Arc<dyn PersistenceStore>,
}

impl AttributeResolver {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    /// Resolve the stored attributes that apply to `spec`.
    pub fn resolve(&self, spec: &ServiceSpec) -> Result<ResolvedBundle, StoreError> {
        self.resolve_with(spec, &[])
    }

    /// Resolve stored attributes plus `pending` records that are not yet persisted.
    ///
    /// Pending records are folded last within their scope, so a pending
    /// service-scoped record replaces a stored one of the same variant.
    pub fn resolve_with(
        &self,
        spec: &ServiceSpec,
        pending: &[Attribute],
    ) -> Result<ResolvedBundle, StoreError> {
        let stored = self
            .store
            .find_attributes(&AttributeScope::Applicable(spec.clone()))?;

        let candidates: Vec<&Attribute> = stored
            .iter()
            .chain(pending.iter())
            .filter(|attr| attr.applies_to(spec))
            .collect();

        let (global, scoped): (Vec<&Attribute>, Vec<&Attribute>) =
            candidates.into_iter().partition(|attr| attr.is_global());

        trace!(
            service = %spec,
            global = global.len(),
            scoped = scoped.len(),
            "Resolving attributes"
        );

        Ok(ResolvedBundle::fold(global.into_iter().chain(scoped)))
    }
}
