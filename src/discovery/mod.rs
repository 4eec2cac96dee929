//! Service discovery
//!
//! Both orchestrators are variants of one capability: list the services with
//! their `plimni.io` tags and endpoints, and tell where the Certbot issuance
//! service answers. The variant is picked once at startup from the settings.

pub mod consul;
pub mod kubernetes;

pub use consul::{ConsulClient, ConsulConfig};
pub use kubernetes::KubernetesClient;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ServiceRecord;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kubernetes API error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("A private address is required to reach the issuance service on {0}")]
    MissingPrivateAddress(Orchestrator),
}

/// Supported orchestrators
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orchestrator {
    /// Kubernetes, discovered through the in-cluster API
    K8s,
    /// Nomad, discovered through the Consul catalog
    Nomad,
}

impl fmt::Display for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::K8s => write!(f, "k8s"),
            Self::Nomad => write!(f, "nomad"),
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Every service the orchestrator knows about, with its tags and endpoints
    async fn list_services(
        &self,
        cluster_branch: &str,
        cluster_domain: &str,
    ) -> Result<Vec<ServiceRecord>, DiscoveryError>;

    /// Address HAProxy forwards ACME challenges to
    fn issuance_endpoint(&self, private_address: Option<&str>) -> Result<String, DiscoveryError>;
}

/// Connection settings for whichever orchestrator is selected
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub orchestrator: Orchestrator,
    pub namespace: String,
    pub consul_address: String,
    pub consul_token: Option<String>,
    pub timeout: Duration,
}

/// Build the client for the configured orchestrator
pub async fn build_client(
    settings: &DiscoverySettings,
) -> Result<Box<dyn DiscoveryClient>, DiscoveryError> {
    match settings.orchestrator {
        Orchestrator::K8s => {
            let client = KubernetesClient::infer(&settings.namespace, settings.timeout).await?;
            Ok(Box::new(client))
        }
        Orchestrator::Nomad => {
            let config = ConsulConfig::new(&settings.consul_address)
                .token(settings.consul_token.clone())
                .timeout(settings.timeout);
            Ok(Box::new(ConsulClient::new(config)?))
        }
    }
}

/// Turn a non-success response into [`DiscoveryError::Api`]
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, DiscoveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(DiscoveryError::Api {
        status: status.as_u16(),
        message: text,
    })
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
