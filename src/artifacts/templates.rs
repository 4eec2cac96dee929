//! Template rendering
//!
//! The generator owns what gets rendered (the binding shapes below); a
//! [`TemplateRenderer`] owns how it reads as text. [`BuiltinTemplates`] is the
//! renderer shipped with plimni and produces HAProxy and Certbot syntax.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::service::{Listener, Service};

/// Variables handed to a template
pub type Bindings = serde_json::Map<String, Value>;

/// The three documents plimni renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateId {
    LoadBalancer,
    SanitizeResponse,
    Issuance,
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadBalancer => write!(f, "haproxy services"),
            Self::SanitizeResponse => write!(f, "sanitize response"),
            Self::Issuance => write!(f, "certbot cli.ini"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Invalid bindings for {template}: {message}")]
    InvalidBindings {
        template: TemplateId,
        message: String,
    },

    #[error("Failed to render {template}: {message}")]
    Template {
        template: TemplateId,
        message: String,
    },
}

/// Turns a template id and its bindings into text. Must be deterministic.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: TemplateId, bindings: &Bindings) -> Result<String, RenderError>;
}

// ============================================================================
// Binding shapes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerBindings {
    pub services: Vec<Service>,
    /// Empty while no bundle exists on disk
    pub https_cert_file: String,
    pub sanitize_dir: String,
    pub cluster_domain: String,
    pub cluster_branch: String,
    pub issuance_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeBindings {
    pub return_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceBindings {
    pub services: Vec<Service>,
    pub cluster_domain: String,
    pub cluster_email: String,
    pub cluster_branch: String,
}

/// Serialize a binding shape into the generic map a renderer receives
pub fn to_bindings<T: Serialize>(template: TemplateId, value: &T) -> Result<Bindings, RenderError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RenderError::InvalidBindings {
            template,
            message: format!("expected an object, got {}", other),
        }),
        Err(e) => Err(RenderError::InvalidBindings {
            template,
            message: e.to_string(),
        }),
    }
}

fn from_bindings<T: DeserializeOwned>(
    template: TemplateId,
    bindings: &Bindings,
) -> Result<T, RenderError> {
    serde_json::from_value(Value::Object(bindings.clone())).map_err(|e| {
        RenderError::InvalidBindings {
            template,
            message: e.to_string(),
        }
    })
}

// ============================================================================
// Built-in templates
// ============================================================================

const HEADER: &str = "# Generated by plimni. Manual edits are overwritten.";
const ACME_PATH: &str = "/.well-known/acme-challenge/";
const DEFAULT_HTTP_FRONTEND_PORT: u16 = 80;

/// HAProxy / Certbot renderer compiled into the binary
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

impl TemplateRenderer for BuiltinTemplates {
    fn render(&self, template: TemplateId, bindings: &Bindings) -> Result<String, RenderError> {
        let rendered = match template {
            TemplateId::LoadBalancer => render_load_balancer(&from_bindings(template, bindings)?),
            TemplateId::SanitizeResponse => render_sanitize(&from_bindings(template, bindings)?),
            TemplateId::Issuance => render_issuance(&from_bindings(template, bindings)?),
        };

        rendered.map_err(|e| RenderError::Template {
            template,
            message: e.to_string(),
        })
    }
}

fn backend_name(svc: &Service) -> String {
    format!("be_{}", svc.fqdn)
}

fn host_acl(svc: &Service) -> String {
    format!("host_{}", svc.fqdn)
}

fn render_load_balancer(b: &LoadBalancerBindings) -> Result<String, fmt::Error> {
    let tls = !b.https_cert_file.is_empty();
    let exposed: Vec<&Service> = b.services.iter().filter(|s| s.expose).collect();

    // port -> (plain services, services redirected to https)
    let mut http_frontends: BTreeMap<u16, (Vec<&Service>, Vec<&Service>)> = BTreeMap::new();
    let mut https_frontends: BTreeMap<u16, Vec<&Service>> = BTreeMap::new();
    http_frontends.entry(DEFAULT_HTTP_FRONTEND_PORT).or_default();

    for svc in exposed.iter().copied() {
        match svc.listener {
            Listener::Http { port } => http_frontends.entry(port).or_default().0.push(svc),
            Listener::Https { port } if tls => {
                https_frontends.entry(port).or_default().push(svc);
                http_frontends
                    .entry(DEFAULT_HTTP_FRONTEND_PORT)
                    .or_default()
                    .1
                    .push(svc);
            }
            // No certificate yet: serve over plain HTTP until the bundle exists
            Listener::Https { .. } => http_frontends
                .entry(DEFAULT_HTTP_FRONTEND_PORT)
                .or_default()
                .0
                .push(svc),
        }
    }

    let mut out = String::new();
    writeln!(out, "{}", HEADER)?;
    writeln!(out, "# cluster {} (branch {})", b.cluster_domain, b.cluster_branch)?;
    writeln!(out)?;

    for (port, (plain, redirected)) in &http_frontends {
        writeln!(out, "frontend http_{}", port)?;
        writeln!(out, "    bind *:{}", port)?;
        writeln!(out, "    mode http")?;
        if *port == DEFAULT_HTTP_FRONTEND_PORT {
            writeln!(out, "    acl acme_challenge path_beg {}", ACME_PATH)?;
            writeln!(out, "    use_backend be_certbot if acme_challenge")?;
        }
        for svc in plain.iter().chain(redirected.iter()) {
            writeln!(out, "    acl {} hdr(host) -i {}", host_acl(svc), join_fqdns(svc))?;
        }
        for svc in redirected {
            writeln!(
                out,
                "    http-request redirect scheme https code 301 if {} !acme_challenge",
                host_acl(svc)
            )?;
        }
        for svc in plain {
            writeln!(out, "    use_backend {} if {}", backend_name(svc), host_acl(svc))?;
        }
        writeln!(out)?;
    }

    for (port, services) in &https_frontends {
        writeln!(out, "frontend https_{}", port)?;
        writeln!(out, "    bind *:{} ssl crt {}", port, b.https_cert_file)?;
        writeln!(out, "    mode http")?;
        writeln!(out, "    http-request set-header X-Forwarded-Proto https")?;
        for svc in services {
            writeln!(out, "    acl {} hdr(host) -i {}", host_acl(svc), join_fqdns(svc))?;
            writeln!(out, "    use_backend {} if {}", backend_name(svc), host_acl(svc))?;
        }
        writeln!(out)?;
    }

    writeln!(out, "backend be_certbot")?;
    writeln!(out, "    mode http")?;
    if b.issuance_endpoint.starts_with('_') {
        writeln!(
            out,
            "    server-template certbot 1 {} resolvers default init-addr none",
            b.issuance_endpoint
        )?;
    } else {
        writeln!(out, "    server certbot {}", b.issuance_endpoint)?;
    }
    writeln!(out)?;

    for svc in &exposed {
        writeln!(out, "backend {}", backend_name(svc))?;
        writeln!(out, "    mode http")?;
        writeln!(out, "    balance roundrobin")?;
        if let Some(sanitize) = &svc.sanitize {
            for code in &sanitize.codes {
                writeln!(
                    out,
                    "    http-response return status {} content-type text/html file {}/{}-{}.html if {{ status {} }}",
                    sanitize.return_code, b.sanitize_dir, svc.fqdn, code, code
                )?;
            }
        }
        for (i, backend) in svc.backends.iter().enumerate() {
            writeln!(out, "    server {}_{} {} check", svc.name, i, backend)?;
        }
        writeln!(out)?;
    }

    Ok(out)
}

fn join_fqdns(svc: &Service) -> String {
    svc.all_fqdns().collect::<Vec<_>>().join(" ")
}

fn reason_phrase(code: &str) -> &'static str {
    match code {
        "200" => "OK",
        "204" => "No Content",
        "301" => "Moved Permanently",
        "302" => "Found",
        "400" => "Bad Request",
        "401" => "Unauthorized",
        "403" => "Forbidden",
        "404" => "Not Found",
        "410" => "Gone",
        "429" => "Too Many Requests",
        "500" => "Internal Server Error",
        "502" => "Bad Gateway",
        "503" => "Service Unavailable",
        "504" => "Gateway Timeout",
        _ => "",
    }
}

fn render_sanitize(b: &SanitizeBindings) -> Result<String, fmt::Error> {
    let title = format!("{} {}", b.return_code, reason_phrase(&b.return_code));
    let title = title.trim_end();

    let mut out = String::new();
    writeln!(out, "<!DOCTYPE html>")?;
    writeln!(out, "<html>")?;
    writeln!(out, "<head><title>{}</title></head>", title)?;
    writeln!(out, "<body><h1>{}</h1></body>", title)?;
    writeln!(out, "</html>")?;
    Ok(out)
}

fn render_issuance(b: &IssuanceBindings) -> Result<String, fmt::Error> {
    let mut domains: Vec<&str> = Vec::new();
    for svc in b
        .services
        .iter()
        .filter(|s| s.expose && matches!(s.listener, Listener::Https { .. }))
    {
        for fqdn in svc.all_fqdns() {
            if !domains.contains(&fqdn) {
                domains.push(fqdn);
            }
        }
    }

    let mut out = String::new();
    writeln!(out, "{}", HEADER)?;
    writeln!(out, "# cluster {} (branch {})", b.cluster_domain, b.cluster_branch)?;
    writeln!(out, "email = {}", b.cluster_email)?;
    writeln!(out, "agree-tos = true")?;
    writeln!(out, "non-interactive = true")?;
    writeln!(out, "expand = true")?;
    writeln!(out, "authenticator = standalone")?;
    writeln!(out, "http-01-port = 8080")?;
    writeln!(out, "cert-name = {}", b.cluster_domain)?;
    writeln!(out, "domains = {}", domains.join(", "))?;
    Ok(out)
}
