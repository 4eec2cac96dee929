//! Service model
//!
//! A [`ServiceRecord`] is what a discovery client hands over: a name, the
//! `plimni.io/*` tags or annotations it found, and the live endpoints. The
//! resolver turns it into a [`Service`], the validated and fully-defaulted
//! shape that artifact generation works from.

pub mod resolver;
pub mod tags;

pub use resolver::{normalize_branch, resolve, ValidationError};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Raw input (produced by discovery clients)
// ============================================================================

/// A discovered network endpoint backing a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Raw per-service record, immutable for the duration of a cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Orchestrator-level service name
    pub name: String,
    /// Tags or annotations, full keys (prefix included)
    pub tags: BTreeMap<String, String>,
    /// Discovered endpoints, in discovery order
    pub endpoints: Vec<Endpoint>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_endpoint(mut self, address: impl Into<String>, port: u16) -> Self {
        self.endpoints.push(Endpoint::new(address, port));
        self
    }

    /// Whether any tag belongs to the `plimni.io` namespace
    pub fn is_plimni(&self) -> bool {
        tags::has_plimni_keys(self.tags.keys())
    }
}

// ============================================================================
// Canonical service (core-owned)
// ============================================================================

/// Protocol mode a service is exposed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Plain HTTP only
    Http,
    /// HTTPS, with HTTP redirected
    Https,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// The frontend a service listens on. Only the port matching the mode exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Listener {
    Http { port: u16 },
    Https { port: u16 },
}

impl Listener {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Http { .. } => Mode::Http,
            Self::Https { .. } => Mode::Https,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Http { port } | Self::Https { port } => *port,
        }
    }
}

/// Branch a service was deployed from, present only on derived FQDNs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    /// `name` with every character outside `[A-Za-z0-9_.-]` replaced by `-`
    pub normalized: String,
}

/// Upstream status codes replaced by a single return code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sanitize {
    pub codes: BTreeSet<String>,
    pub return_code: String,
}

/// A validated service, rebuilt from its record on every cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub expose: bool,
    pub fqdn: String,
    /// `None` when the FQDN was given explicitly
    pub branch: Option<Branch>,
    pub additional_fqdns: Vec<String>,
    pub listener: Listener,
    pub sanitize: Option<Sanitize>,
    pub backends: Vec<Endpoint>,
}

impl Service {
    pub fn mode(&self) -> Mode {
        self.listener.mode()
    }

    pub fn sanitizes(&self) -> bool {
        self.sanitize.is_some()
    }

    pub fn http_port(&self) -> Option<u16> {
        match self.listener {
            Listener::Http { port } => Some(port),
            Listener::Https { .. } => None,
        }
    }

    pub fn https_port(&self) -> Option<u16> {
        match self.listener {
            Listener::Https { port } => Some(port),
            Listener::Http { .. } => None,
        }
    }

    /// Primary FQDN followed by the additional ones
    pub fn all_fqdns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.fqdn.as_str()).chain(self.additional_fqdns.iter().map(String::as_str))
    }
}
