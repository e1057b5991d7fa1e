//! Exchange catalog: service definitions and pattern membership
//!
//! The catalog is an external collaborator. [`ServiceCatalog`] is the seam the
//! registrar talks to; [`http::ExchangeClient`] is the production
//! implementation.

pub mod http;
pub mod version;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use http::ExchangeClient;
pub use version::{Version, VersionError, VersionExpression};

/// How many agreements a single running instance of a service may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// One agreement per instance
    #[default]
    Exclusive,
    /// One instance shared by agreements from the same agbot
    Single,
    /// One instance shared by every agreement on the node
    Singleton,
    /// Several shared instances
    Multiple,
}

impl SharingMode {
    pub fn is_shareable(&self) -> bool {
        !matches!(self, SharingMode::Exclusive)
    }
}

/// A configuration variable declared by a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Empty when the node must supply a value.
    #[serde(default)]
    pub default_value: String,
}

impl UserInput {
    pub fn is_required(&self) -> bool {
        self.default_value.is_empty()
    }

    /// Check a supplied value against the declared type.
    pub fn check_value(&self, value: &Value) -> Result<(), String> {
        let ok = match self.kind.as_str() {
            "string" => value.is_string(),
            "int" => value.is_i64() || value.is_u64(),
            "float" => value.is_number(),
            "boolean" | "bool" => value.is_boolean(),
            "list of strings" => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            other => return Err(format!("unsupported user input type {}", other)),
        };

        if ok {
            Ok(())
        } else {
            Err(format!("expected a value of type {}, found {}", self.kind, value))
        }
    }
}

/// A concrete service definition as published in the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub url: String,
    pub org: String,
    pub version: String,
    pub arch: String,
    #[serde(default, rename = "userInput")]
    pub user_inputs: Vec<UserInput>,
    #[serde(default)]
    pub sharable: SharingMode,
}

/// A reference to a service, as found in a pattern or a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    pub url: String,
    pub org: String,
    /// A version or version range expression.
    pub version_range: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("not found in the exchange: {0}")]
    NotFound(String),

    #[error("exchange network error: {0}")]
    Network(String),

    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),
}

/// Read access to the exchange catalog.
#[async_trait::async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Services pinned by a pattern, each with its exact version and arch.
    async fn pattern_members(
        &self,
        pattern: &str,
        org: &str,
    ) -> Result<Vec<ServiceReference>, CatalogError>;

    /// Highest published version of a service inside `version` for `arch`.
    async fn resolve_service(
        &self,
        url: &str,
        org: &str,
        version: &VersionExpression,
        arch: &str,
    ) -> Result<ServiceDefinition, CatalogError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(kind: &str) -> UserInput {
        UserInput {
            name: "var".to_string(),
            label: String::new(),
            kind: kind.to_string(),
            default_value: String::new(),
        }
    }

    #[test]
    fn test_user_input_type_checks() {
        assert!(input("string").check_value(&json!("x")).is_ok());
        assert!(input("string").check_value(&json!(1)).is_err());
        assert!(input("int").check_value(&json!(3)).is_ok());
        assert!(input("int").check_value(&json!(3.5)).is_err());
        assert!(input("float").check_value(&json!(3)).is_ok());
        assert!(input("boolean").check_value(&json!(false)).is_ok());
        assert!(input("list of strings").check_value(&json!(["a", "b"])).is_ok());
        assert!(input("list of strings").check_value(&json!(["a", 1])).is_err());
        assert!(input("blob").check_value(&json!("x")).is_err());
    }

    #[test]
    fn test_service_definition_from_exchange_json() {
        let def: ServiceDefinition = serde_json::from_value(json!({
            "url": "https://example.com/gps",
            "org": "acme",
            "version": "2.0.1",
            "arch": "amd64",
            "sharable": "singleton",
            "userInput": [{"name": "HZN_RATE", "type": "int", "defaultValue": "5"}]
        }))
        .unwrap();

        assert_eq!(def.sharable, SharingMode::Singleton);
        assert!(def.sharable.is_shareable());
        assert!(!def.user_inputs[0].is_required());
    }

    #[test]
    fn test_sharing_mode_defaults_to_exclusive() {
        let def: ServiceDefinition = serde_json::from_value(json!({
            "url": "svc", "org": "acme", "version": "1.0.0", "arch": "arm64"
        }))
        .unwrap();
        assert_eq!(def.sharable, SharingMode::Exclusive);
        assert!(def.user_inputs.is_empty());
    }
}
