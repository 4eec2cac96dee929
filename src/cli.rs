use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{Settings, SettingsLayer};
use crate::discovery::Orchestrator;
use crate::service::{Service, ValidationError};

#[derive(Parser, Debug)]
#[command(name = "plimni")]
#[command(about = "Keep HAProxy in sync with the services of a Kubernetes or Nomad cluster")]
#[command(version)]
pub struct Args {
    /// Orchestrator to discover services from
    #[arg(short, long, value_enum, env = "PLIMNI_ORCHESTRATOR")]
    pub orchestrator: Option<Orchestrator>,

    /// Domain services are exposed under
    #[arg(short = 'd', long, value_name = "DOMAIN", env = "PLIMNI_CLUSTER_DOMAIN")]
    pub cluster_domain: Option<String>,

    /// Email used for certificate registration [default: postmaster@DOMAIN]
    #[arg(short = 'e', long, value_name = "EMAIL", env = "PLIMNI_CLUSTER_EMAIL")]
    pub cluster_email: Option<String>,

    /// Branch the cluster runs [default: master]
    #[arg(short = 'b', long, value_name = "BRANCH", env = "PLIMNI_CLUSTER_BRANCH")]
    pub cluster_branch: Option<String>,

    /// Private address of this load balancer (required with nomad)
    #[arg(long, value_name = "IP", env = "PLIMNI_PRIVATE_IP")]
    pub private_ip: Option<String>,

    /// Generate the configuration once and exit without reloading HAProxy
    #[arg(long, env = "PLIMNI_INIT")]
    pub init: bool,

    /// Seconds between two cycles [default: 5]
    #[arg(short = 't', long, value_name = "SECS", env = "PLIMNI_SLEEP_TIME")]
    pub sleep_time: Option<u64>,

    /// HAProxy services configuration file
    #[arg(long, value_name = "FILE", env = "PLIMNI_HAPROXY_SERVICES_CONF_FILE")]
    pub haproxy_services_conf_file: Option<PathBuf>,

    /// HAProxy master PID file
    #[arg(long, value_name = "FILE", env = "PLIMNI_HAPROXY_PID_FILE")]
    pub haproxy_pid_file: Option<PathBuf>,

    /// Folder holding the sanitize responses
    #[arg(long, value_name = "DIR", env = "PLIMNI_HAPROXY_SANITIZE_CONF_FOLDER")]
    pub haproxy_sanitize_conf_folder: Option<PathBuf>,

    /// Certbot configuration folder
    #[arg(long, value_name = "DIR", env = "PLIMNI_CERTBOT_CONF_FOLDER")]
    pub certbot_conf_folder: Option<PathBuf>,

    /// Kubernetes namespace to watch [default: default]
    #[arg(long, value_name = "NAMESPACE", env = "PLIMNI_NAMESPACE")]
    pub namespace: Option<String>,

    /// Consul HTTP address [default: http://127.0.0.1:8500]
    #[arg(long, value_name = "URL", env = "PLIMNI_CONSUL_ADDRESS")]
    pub consul_address: Option<String>,

    /// Consul ACL token
    #[arg(long, value_name = "TOKEN", env = "PLIMNI_CONSUL_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    /// Discovery request timeout in seconds [default: 10]
    #[arg(long, value_name = "SECS", env = "PLIMNI_DISCOVERY_TIMEOUT")]
    pub discovery_timeout: Option<u64>,

    /// Remove sanitize responses no service asks for anymore
    #[arg(long, env = "PLIMNI_PRUNE_SANITIZE")]
    pub prune_sanitize: bool,

    /// YAML settings file; flags and environment variables take precedence
    #[arg(short, long, value_name = "FILE", env = "PLIMNI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Dry-run mode: discover and resolve once, print the services, write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging output (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// The settings given on the command line or through the environment
    pub fn layer(&self) -> SettingsLayer {
        SettingsLayer {
            orchestrator: self.orchestrator,
            cluster_domain: self.cluster_domain.clone(),
            cluster_email: self.cluster_email.clone(),
            cluster_branch: self.cluster_branch.clone(),
            private_ip: self.private_ip.clone(),
            // An unset flag leaves the decision to the settings file
            init: self.init.then_some(true),
            sleep_time: self.sleep_time,
            haproxy_services_conf_file: self.haproxy_services_conf_file.clone(),
            haproxy_pid_file: self.haproxy_pid_file.clone(),
            haproxy_sanitize_conf_folder: self.haproxy_sanitize_conf_folder.clone(),
            certbot_conf_folder: self.certbot_conf_folder.clone(),
            namespace: self.namespace.clone(),
            consul_address: self.consul_address.clone(),
            consul_token: self.consul_token.clone(),
            discovery_timeout: self.discovery_timeout,
            prune_sanitize: self.prune_sanitize.then_some(true),
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No services found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!("{:width$}", header, width = widths[i]));
    }
    output.push('\n');

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    }

    output
}

fn service_row(svc: &Service) -> Vec<String> {
    let sanitize = match &svc.sanitize {
        Some(rules) => format!(
            "{} -> {}",
            rules.codes.iter().cloned().collect::<Vec<_>>().join(","),
            rules.return_code
        ),
        None => "-".to_string(),
    };

    vec![
        svc.name.clone(),
        svc.all_fqdns().collect::<Vec<_>>().join(","),
        svc.mode().to_string(),
        svc.listener.port().to_string(),
        if svc.expose { "yes" } else { "no" }.to_string(),
        svc.backends.len().to_string(),
        sanitize,
    ]
}

/// Format the dry-run report: the resolved services and the rejected records
pub fn format_dry_run(
    settings: &Settings,
    services: &[Service],
    rejected: &[(String, ValidationError)],
) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "plimni v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Orchestrator: {}\n", settings.orchestrator));
    output.push_str(&format!(
        "Cluster: {} (branch {})\n",
        settings.cluster_domain, settings.cluster_branch
    ));
    output.push_str(&format!(
        "Services file: {}\n\n",
        settings.services_conf_file.display()
    ));

    output.push_str(&format!("Services ({}):\n", services.len()));
    let headers = &["NAME", "FQDNS", "MODE", "PORT", "EXPOSE", "BACKENDS", "SANITIZE"];
    output.push_str(&format_table(
        headers,
        services.iter().map(service_row).collect(),
    ));

    if !rejected.is_empty() {
        output.push_str(&format!("\nRejected ({}):\n", rejected.len()));
        for (name, error) in rejected {
            output.push_str(&format!("  - {}: {}\n", name, error));
        }
    }

    output.push_str("\nNothing was written. Remove --dry-run to run.\n");

    output
}
