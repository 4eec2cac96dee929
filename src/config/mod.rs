//! Runtime settings
//!
//! Settings come in layers: command-line flags (and their `PLIMNI_*`
//! environment variables), an optional YAML settings file, then built-in
//! defaults. Each layer is a [`SettingsLayer`] of optional values; merging
//! keeps the first value set, and [`Settings::from_layer`] fills the gaps and
//! validates what is required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::artifacts::{ArtifactPaths, ClusterContext};
use crate::discovery::consul::DEFAULT_CONSUL_ADDRESS;
use crate::discovery::{DiscoverySettings, Orchestrator};

pub const DEFAULT_SERVICES_CONF_FILE: &str = "/usr/local/etc/haproxy/conf.d/services.cfg";
pub const DEFAULT_PID_FILE: &str = "/usr/local/etc/haproxy/conf.d/haproxy.pid";
pub const DEFAULT_SANITIZE_DIR: &str = "/usr/local/etc/haproxy/sanitize.d";
pub const DEFAULT_CERTBOT_DIR: &str = "/usr/local/etc/haproxy/certs";
pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_SLEEP_SECS: u64 = 5;
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    Parse(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// One layer of settings; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SettingsLayer {
    pub orchestrator: Option<Orchestrator>,
    pub cluster_domain: Option<String>,
    pub cluster_email: Option<String>,
    pub cluster_branch: Option<String>,
    pub private_ip: Option<String>,
    pub init: Option<bool>,
    pub sleep_time: Option<u64>,
    pub haproxy_services_conf_file: Option<PathBuf>,
    pub haproxy_pid_file: Option<PathBuf>,
    pub haproxy_sanitize_conf_folder: Option<PathBuf>,
    pub certbot_conf_folder: Option<PathBuf>,
    pub namespace: Option<String>,
    pub consul_address: Option<String>,
    pub consul_token: Option<String>,
    pub discovery_timeout: Option<u64>,
    pub prune_sanitize: Option<bool>,
}

impl SettingsLayer {
    /// Values from `self`, falling back to `lower` where unset
    pub fn merge(self, lower: SettingsLayer) -> SettingsLayer {
        SettingsLayer {
            orchestrator: self.orchestrator.or(lower.orchestrator),
            cluster_domain: self.cluster_domain.or(lower.cluster_domain),
            cluster_email: self.cluster_email.or(lower.cluster_email),
            cluster_branch: self.cluster_branch.or(lower.cluster_branch),
            private_ip: self.private_ip.or(lower.private_ip),
            init: self.init.or(lower.init),
            sleep_time: self.sleep_time.or(lower.sleep_time),
            haproxy_services_conf_file: self
                .haproxy_services_conf_file
                .or(lower.haproxy_services_conf_file),
            haproxy_pid_file: self.haproxy_pid_file.or(lower.haproxy_pid_file),
            haproxy_sanitize_conf_folder: self
                .haproxy_sanitize_conf_folder
                .or(lower.haproxy_sanitize_conf_folder),
            certbot_conf_folder: self.certbot_conf_folder.or(lower.certbot_conf_folder),
            namespace: self.namespace.or(lower.namespace),
            consul_address: self.consul_address.or(lower.consul_address),
            consul_token: self.consul_token.or(lower.consul_token),
            discovery_timeout: self.discovery_timeout.or(lower.discovery_timeout),
            prune_sanitize: self.prune_sanitize.or(lower.prune_sanitize),
        }
    }
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub orchestrator: Orchestrator,
    pub cluster_domain: String,
    pub cluster_email: Option<String>,
    pub cluster_branch: String,
    pub private_ip: Option<String>,
    pub init: bool,
    pub sleep_time: Duration,
    pub services_conf_file: PathBuf,
    pub pid_file: PathBuf,
    pub sanitize_dir: PathBuf,
    pub certbot_dir: PathBuf,
    pub namespace: String,
    pub consul_address: String,
    pub consul_token: Option<String>,
    pub discovery_timeout: Duration,
    pub prune_sanitize: bool,
}

// ============================================================================
// SBIO: Pure parsing and validation (no I/O)
// ============================================================================

/// Parse a YAML settings file
pub fn parse_settings(content: &str) -> Result<SettingsLayer, ConfigError> {
    if content.trim().is_empty() {
        return Ok(SettingsLayer::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Settings {
    /// Fill defaults into a merged layer and check required values
    pub fn from_layer(layer: SettingsLayer) -> Result<Self, ConfigError> {
        let orchestrator = layer.orchestrator.ok_or(ConfigError::Missing("orchestrator"))?;
        let cluster_domain =
            non_empty(layer.cluster_domain).ok_or(ConfigError::Missing("cluster-domain"))?;
        let private_ip = non_empty(layer.private_ip);

        if orchestrator == Orchestrator::Nomad && private_ip.is_none() {
            return Err(ConfigError::Missing("private-ip (required with nomad)"));
        }

        let sleep_time = layer.sleep_time.unwrap_or(DEFAULT_SLEEP_SECS);
        if sleep_time == 0 {
            return Err(ConfigError::Invalid {
                key: "sleep-time",
                message: "must be at least one second".to_string(),
            });
        }

        let discovery_timeout = layer
            .discovery_timeout
            .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_SECS);
        if discovery_timeout == 0 {
            return Err(ConfigError::Invalid {
                key: "discovery-timeout",
                message: "must be at least one second".to_string(),
            });
        }

        let path_or = |value: Option<PathBuf>, default: &str| {
            expand_path(&value.unwrap_or_else(|| PathBuf::from(default)))
        };

        Ok(Self {
            orchestrator,
            cluster_domain,
            cluster_email: non_empty(layer.cluster_email),
            cluster_branch: non_empty(layer.cluster_branch)
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            private_ip,
            init: layer.init.unwrap_or(false),
            sleep_time: Duration::from_secs(sleep_time),
            services_conf_file: path_or(layer.haproxy_services_conf_file, DEFAULT_SERVICES_CONF_FILE),
            pid_file: path_or(layer.haproxy_pid_file, DEFAULT_PID_FILE),
            sanitize_dir: path_or(layer.haproxy_sanitize_conf_folder, DEFAULT_SANITIZE_DIR),
            certbot_dir: path_or(layer.certbot_conf_folder, DEFAULT_CERTBOT_DIR),
            namespace: non_empty(layer.namespace).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            consul_address: non_empty(layer.consul_address)
                .unwrap_or_else(|| DEFAULT_CONSUL_ADDRESS.to_string()),
            consul_token: non_empty(layer.consul_token),
            discovery_timeout: Duration::from_secs(discovery_timeout),
            prune_sanitize: layer.prune_sanitize.unwrap_or(false),
        })
    }

    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            orchestrator: self.orchestrator,
            namespace: self.namespace.clone(),
            consul_address: self.consul_address.clone(),
            consul_token: self.consul_token.clone(),
            timeout: self.discovery_timeout,
        }
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.services_conf_file, &self.sanitize_dir, &self.certbot_dir)
    }

    /// Cluster values for rendering; the certificate file is filled in per
    /// cycle once it is known whether the bundle exists
    pub fn cluster_context(&self, issuance_endpoint: &str) -> ClusterContext {
        ClusterContext {
            cluster_domain: self.cluster_domain.clone(),
            cluster_branch: self.cluster_branch.clone(),
            cluster_email: self.cluster_email.clone().unwrap_or_default(),
            issuance_endpoint: issuance_endpoint.to_string(),
            https_cert_file: String::new(),
            sanitize_dir: self.sanitize_dir.display().to_string(),
        }
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load a YAML settings file
pub fn load_settings_file(path: &Path) -> Result<SettingsLayer, ConfigError> {
    let content = std::fs::read_to_string(expand_path(path))?;
    parse_settings(&content)
}
