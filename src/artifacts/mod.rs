//! Configuration artifacts
//!
//! [`generate`] turns the resolved services into the full set of documents
//! plimni manages: the HAProxy services file, one sanitize response per
//! `(fqdn, code)` pair and the Certbot `cli.ini`. The set is regenerated from
//! scratch on every cycle and never merged with what is on disk.

pub mod detect;
pub mod fs;
pub mod templates;

pub use detect::{content_digest, has_changed};
pub use fs::{ArtifactFs, LocalFs};
pub use templates::{
    BuiltinTemplates, Bindings, IssuanceBindings, LoadBalancerBindings, RenderError,
    SanitizeBindings, TemplateId, TemplateRenderer,
};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::service::Service;

pub const SANITIZE_EXTENSION: &str = "html";

/// Artifact categories; change detection and reloads work per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    LoadBalancer,
    Sanitize,
    Issuance,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadBalancer => write!(f, "load-balancer"),
            Self::Sanitize => write!(f, "sanitize"),
            Self::Issuance => write!(f, "issuance"),
        }
    }
}

/// Cluster-wide values every cycle renders against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterContext {
    pub cluster_domain: String,
    pub cluster_branch: String,
    pub cluster_email: String,
    pub issuance_endpoint: String,
    /// Certificate bundle path, empty when no bundle exists yet
    pub https_cert_file: String,
    pub sanitize_dir: String,
}

impl ClusterContext {
    /// `postmaster@{domain}` when no email is configured
    pub fn default_email(cluster_domain: &str) -> String {
        format!("postmaster@{}", cluster_domain)
    }
}

/// Where each category lands on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub load_balancer: PathBuf,
    pub sanitize_dir: PathBuf,
    pub issuance: PathBuf,
}

impl ArtifactPaths {
    /// Paths derived from the HAProxy services file, the sanitize folder and
    /// the Certbot configuration folder
    pub fn new(services_conf: &Path, sanitize_dir: &Path, certbot_dir: &Path) -> Self {
        Self {
            load_balancer: services_conf.to_path_buf(),
            sanitize_dir: sanitize_dir.to_path_buf(),
            issuance: certbot_dir.join("cli.ini"),
        }
    }

    pub fn sanitize_file(&self, key: &str) -> PathBuf {
        self.sanitize_dir
            .join(format!("{}.{}", key, SANITIZE_EXTENSION))
    }
}

/// Certificate bundle Certbot maintains for the cluster domain
pub fn https_bundle_path(certbot_dir: &Path, cluster_domain: &str) -> PathBuf {
    certbot_dir
        .join("live")
        .join(cluster_domain)
        .join("bundle.pem")
}

/// One rendered document and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub category: Category,
    pub path: PathBuf,
    pub content: String,
}

/// Everything rendered in one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    pub load_balancer: String,
    /// `"{fqdn}-{code}"` -> response body
    pub sanitize: BTreeMap<String, String>,
    pub issuance: String,
}

impl ArtifactSet {
    /// Flatten into path-addressed artifacts, load balancer first
    pub fn artifacts(&self, paths: &ArtifactPaths) -> Vec<Artifact> {
        let mut out = Vec::with_capacity(self.sanitize.len() + 2);

        out.push(Artifact {
            category: Category::LoadBalancer,
            path: paths.load_balancer.clone(),
            content: self.load_balancer.clone(),
        });

        for (key, content) in &self.sanitize {
            out.push(Artifact {
                category: Category::Sanitize,
                path: paths.sanitize_file(key),
                content: content.clone(),
            });
        }

        out.push(Artifact {
            category: Category::Issuance,
            path: paths.issuance.clone(),
            content: self.issuance.clone(),
        });

        out
    }
}

/// Sanitize artifact key for one code of a service
pub fn sanitize_key(fqdn: &str, code: &str) -> String {
    format!("{}-{}", fqdn, code)
}

// ============================================================================
// SBIO: Pure generation (rendering delegated to the renderer)
// ============================================================================

/// Render the artifact set for `services`.
///
/// Services are ordered by FQDN first so discovery order never changes the
/// output.
pub fn generate(
    services: &[Service],
    ctx: &ClusterContext,
    renderer: &dyn TemplateRenderer,
) -> Result<ArtifactSet, RenderError> {
    let mut services = services.to_vec();
    services.sort_by(|a, b| a.fqdn.cmp(&b.fqdn).then_with(|| a.name.cmp(&b.name)));

    let load_balancer = {
        let bindings = templates::to_bindings(
            TemplateId::LoadBalancer,
            &LoadBalancerBindings {
                services: services.clone(),
                https_cert_file: ctx.https_cert_file.clone(),
                sanitize_dir: ctx.sanitize_dir.clone(),
                cluster_domain: ctx.cluster_domain.clone(),
                cluster_branch: ctx.cluster_branch.clone(),
                issuance_endpoint: ctx.issuance_endpoint.clone(),
            },
        )?;
        renderer.render(TemplateId::LoadBalancer, &bindings)?
    };

    let mut sanitize = BTreeMap::new();
    for svc in &services {
        let Some(rules) = &svc.sanitize else {
            continue;
        };

        // Every code of a service returns the same response
        let bindings = templates::to_bindings(
            TemplateId::SanitizeResponse,
            &SanitizeBindings {
                return_code: rules.return_code.clone(),
            },
        )?;
        let rendered = renderer.render(TemplateId::SanitizeResponse, &bindings)?;

        for code in &rules.codes {
            sanitize.insert(sanitize_key(&svc.fqdn, code), rendered.clone());
        }
    }

    let cluster_email = if ctx.cluster_email.is_empty() {
        ClusterContext::default_email(&ctx.cluster_domain)
    } else {
        ctx.cluster_email.clone()
    };

    let issuance = {
        let bindings = templates::to_bindings(
            TemplateId::Issuance,
            &IssuanceBindings {
                services,
                cluster_domain: ctx.cluster_domain.clone(),
                cluster_email,
                cluster_branch: ctx.cluster_branch.clone(),
            },
        )?;
        renderer.render(TemplateId::Issuance, &bindings)?
    };

    Ok(ArtifactSet {
        load_balancer,
        sanitize,
        issuance,
    })
}
