//! Nomad discovery through the Consul catalog
//!
//! Nomad registers its services in Consul with flat `key=value` tags; the
//! `plimni.io` ones are parsed into the record tags and the catalog entries of
//! each service provide the backends.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{check_status, DiscoveryClient, DiscoveryError, Orchestrator};
use crate::service::{tags, Endpoint, ServiceRecord};

pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";

/// Port the Certbot job listens on, on the load balancer's private address
pub const CERTBOT_PORT: u16 = 8080;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// One row of `/v1/catalog/service/{name}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogEntry {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub service_address: String,
    pub service_port: u16,
}

// ============================================================================
// SBIO: Pure extraction (no I/O)
// ============================================================================

/// `plimni.io` tags of a catalog service, `None` when it has none
pub fn plimni_tags(service_tags: &[String]) -> Option<BTreeMap<String, String>> {
    if !service_tags.iter().any(|t| tags::is_plimni_key(t)) {
        return None;
    }
    Some(tags::from_tag_strings(service_tags))
}

/// Backends from catalog entries. The service address wins over the node
/// address when Nomad registered one.
pub fn backends_from_catalog(entries: &[CatalogEntry]) -> Vec<Endpoint> {
    entries
        .iter()
        .map(|e| {
            let address = if e.service_address.is_empty() {
                &e.address
            } else {
                &e.service_address
            };
            Endpoint::new(address.clone(), e.service_port)
        })
        .collect()
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConsulConfig {
    pub address: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl ConsulConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUL_ADDRESS)
    }
}

#[derive(Clone)]
pub struct ConsulClient {
    client: reqwest::Client,
    config: ConsulConfig,
}

impl ConsulClient {
    pub fn new(config: ConsulConfig) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DiscoveryError::Http(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, DiscoveryError> {
        let url = format!("{}{}", self.config.address.trim_end_matches('/'), path);

        let mut req = self.client.get(&url);
        if let Some(ref token) = self.config.token {
            req = req.header(TOKEN_HEADER, token);
        }

        let response = req.send().await.map_err(|e| DiscoveryError::Http(e.to_string()))?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| DiscoveryError::Parse(e.to_string()))
    }
}

#[async_trait]
impl DiscoveryClient for ConsulClient {
    async fn list_services(
        &self,
        _cluster_branch: &str,
        _cluster_domain: &str,
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        debug!("Retrieving services from Consul at {}", self.config.address);

        let services: BTreeMap<String, Vec<String>> = self.get_json("/v1/catalog/services").await?;

        let mut records = Vec::new();
        for (name, service_tags) in services {
            let Some(parsed) = plimni_tags(&service_tags) else {
                debug!("Service {}: no {} tags, skipping", name, tags::PREFIX);
                continue;
            };

            let entries: Vec<CatalogEntry> =
                self.get_json(&format!("/v1/catalog/service/{}", name)).await?;
            let endpoints = backends_from_catalog(&entries);
            debug!("Service {}: {} backend(s)", name, endpoints.len());

            records.push(ServiceRecord {
                name,
                tags: parsed,
                endpoints,
            });
        }

        Ok(records)
    }

    fn issuance_endpoint(&self, private_address: Option<&str>) -> Result<String, DiscoveryError> {
        match private_address.filter(|a| !a.is_empty()) {
            Some(address) => Ok(format!("{}:{}", address, CERTBOT_PORT)),
            None => Err(DiscoveryError::MissingPrivateAddress(Orchestrator::Nomad)),
        }
    }
}
