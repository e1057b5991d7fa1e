//! HTTP client for the exchange catalog

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    CatalogError, ServiceCatalog, ServiceDefinition, ServiceReference, SharingMode, UserInput,
    Version, VersionExpression,
};

/// Exchange catalog reached over its REST API.
pub struct ExchangeClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Option<(String, String)>,
    timeout: Duration,
}

impl ExchangeClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            credentials: None,
            timeout,
        }
    }

    /// Authenticate as the node, `org/id` with its exchange token.
    pub fn with_node_credentials(mut self, org: &str, node_id: &str, token: &str) -> Self {
        self.credentials = Some((format!("{}/{}", org, node_id), token.to_string()));
        self
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, CatalogError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query).timeout(self.timeout);
        if let Some((user, token)) = &self.credentials {
            request = request.basic_auth(user, Some(token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CatalogError::Network(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct GetServicesResponse {
    #[serde(default)]
    services: HashMap<String, ExchangeService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeService {
    url: String,
    version: String,
    arch: String,
    #[serde(default)]
    sharable: SharingMode,
    #[serde(default, rename = "userInput")]
    user_inputs: Vec<UserInput>,
}

#[derive(Debug, Deserialize)]
struct GetPatternsResponse {
    #[serde(default)]
    patterns: HashMap<String, ExchangePattern>,
}

#[derive(Debug, Deserialize)]
struct ExchangePattern {
    #[serde(default)]
    services: Vec<PatternService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatternService {
    service_url: String,
    service_orgid: String,
    service_arch: String,
    #[serde(default)]
    service_versions: Vec<PatternVersion>,
}

#[derive(Debug, Deserialize)]
struct PatternVersion {
    version: String,
}

#[async_trait::async_trait]
impl ServiceCatalog for ExchangeClient {
    async fn pattern_members(
        &self,
        pattern: &str,
        org: &str,
    ) -> Result<Vec<ServiceReference>, CatalogError> {
        let path = format!("orgs/{}/patterns/{}", org, pattern);
        let response: GetPatternsResponse = self
            .get(&path, &[])
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("pattern {}/{}", org, pattern)))?;

        let mut members = Vec::new();
        for pat in response.patterns.into_values() {
            for svc in pat.services {
                // A pattern may list several rollout versions; nodes converge on the newest.
                let newest = svc
                    .service_versions
                    .iter()
                    .filter_map(|v| v.version.parse::<Version>().ok())
                    .max();
                let Some(version) = newest else {
                    warn!(url = %svc.service_url, "Pattern service lists no usable version, skipping");
                    continue;
                };
                members.push(ServiceReference {
                    url: svc.service_url,
                    org: svc.service_orgid,
                    version_range: format!("[{},{}]", version, version),
                    arch: svc.service_arch,
                    name: None,
                });
            }
        }

        debug!(pattern, org, count = members.len(), "Fetched pattern members");
        Ok(members)
    }

    async fn resolve_service(
        &self,
        url: &str,
        org: &str,
        version: &VersionExpression,
        arch: &str,
    ) -> Result<ServiceDefinition, CatalogError> {
        let path = format!("orgs/{}/services", org);
        let response: GetServicesResponse = self
            .get(&path, &[("url", url), ("arch", arch)])
            .await?
            .unwrap_or(GetServicesResponse {
                services: HashMap::new(),
            });

        let best = response
            .services
            .into_values()
            .filter(|svc| svc.url == url && svc.arch == arch)
            .filter_map(|svc| {
                let parsed = svc.version.parse::<Version>().ok()?;
                version.contains(&parsed).then_some((parsed, svc))
            })
            .max_by(|(a, _), (b, _)| a.cmp(b));

        match best {
            Some((_, svc)) => Ok(ServiceDefinition {
                url: svc.url,
                org: org.to_string(),
                version: svc.version,
                arch: svc.arch,
                user_inputs: svc.user_inputs,
                sharable: svc.sharable,
            }),
            None => Err(CatalogError::NotFound(format!(
                "{}/{} {} {}",
                org, url, version, arch
            ))),
        }
    }
}
