//! Kubernetes discovery through the API server
//!
//! Services are listed in one namespace; their `plimni.io/*` annotations
//! become the record tags and the matching `Endpoints` object provides the
//! backends (first subset, first port, every ready address).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::ListParams;
use kube::{Api, Client, Config, ResourceExt};
use tracing::debug;

use super::{DiscoveryClient, DiscoveryError};
use crate::service::{tags, Endpoint, ServiceRecord};

/// SRV name of the in-cluster Certbot service
pub const CERTBOT_SRV: &str = "_http._tcp.certbot.loadbalancer.svc.cluster.local";

// ============================================================================
// SBIO: Pure extraction (no I/O)
// ============================================================================

/// `plimni.io` annotations of a service, `None` when it has none
pub fn plimni_annotations(service: &Service) -> Option<BTreeMap<String, String>> {
    let annotations = service.metadata.annotations.as_ref()?;
    let tags = tags::from_annotations(annotations);
    if tags.is_empty() {
        None
    } else {
        Some(tags)
    }
}

/// Backends of an `Endpoints` object.
///
/// Only the first subset and its first port are considered.
pub fn backends_from_endpoints(endpoints: &Endpoints) -> Vec<Endpoint> {
    let Some(subset) = endpoints.subsets.as_ref().and_then(|s| s.first()) else {
        return Vec::new();
    };
    let Some(port) = subset
        .ports
        .as_ref()
        .and_then(|p| p.first())
        .and_then(|p| u16::try_from(p.port).ok())
    else {
        return Vec::new();
    };

    subset
        .addresses
        .iter()
        .flatten()
        .map(|addr| Endpoint::new(addr.ip.clone(), port))
        .collect()
}

// ============================================================================
// SBIO: I/O implementation (kube client)
// ============================================================================

#[derive(Clone)]
pub struct KubernetesClient {
    services: Api<Service>,
    endpoints: Api<Endpoints>,
    namespace: String,
}

impl KubernetesClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client.clone(), namespace),
            endpoints: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Client from the pod's service account, or the local kubeconfig
    /// outside a cluster
    pub async fn infer(namespace: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let mut config = Config::infer()
            .await
            .map_err(|e| DiscoveryError::Config(format!("No Kubernetes configuration: {}", e)))?;
        config.read_timeout = Some(timeout);

        let client = Client::try_from(config)?;
        Ok(Self::new(client, namespace))
    }

    async fn backends(&self, name: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        // A service without an Endpoints object simply has no backends yet
        match self.endpoints.get_opt(name).await? {
            Some(endpoints) => Ok(backends_from_endpoints(&endpoints)),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl DiscoveryClient for KubernetesClient {
    async fn list_services(
        &self,
        _cluster_branch: &str,
        _cluster_domain: &str,
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        debug!("Retrieving services in namespace {}", self.namespace);

        let mut records = Vec::new();
        for service in self.services.list(&ListParams::default()).await? {
            let name = service.name_any();

            let Some(annotations) = plimni_annotations(&service) else {
                debug!("Service {}: no {} annotation, skipping", name, tags::PREFIX);
                continue;
            };

            let endpoints = self.backends(&name).await?;
            debug!("Service {}: {} backend(s)", name, endpoints.len());

            records.push(ServiceRecord {
                name,
                tags: annotations,
                endpoints,
            });
        }

        Ok(records)
    }

    fn issuance_endpoint(&self, _private_address: Option<&str>) -> Result<String, DiscoveryError> {
        Ok(CERTBOT_SRV.to_string())
    }
}
