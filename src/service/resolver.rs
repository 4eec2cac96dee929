//! Resolution of raw service records into validated services
//!
//! Pure: the result depends only on the record and the cluster context, so the
//! same inputs always produce the same [`Service`]. A failing record yields a
//! [`ValidationError`] that the caller logs before moving on to the next one.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::tags;
use super::{Branch, Listener, Sanitize, Service, ServiceRecord};

pub const DEFAULT_MODE: &str = "https";
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

static FQDN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-_.]+$").expect("FQDN pattern is valid"));

static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-5][0-9]{2}$").expect("status code pattern is valid"));

/// Reasons a service record is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing name")]
    MissingName,

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("invalid fqdn: {0:?}")]
    InvalidFqdn(String),

    #[error("invalid mode: {0:?} (expected http or https)")]
    InvalidMode(String),

    #[error("invalid port for {key}: {value:?}")]
    InvalidPort { key: &'static str, value: String },

    #[error("sanitize return required when sanitize codes are set")]
    SanitizeReturnRequired,

    #[error("invalid code: {0:?}")]
    InvalidCode(String),
}

// ============================================================================
// SBIO: Pure resolution logic (no I/O)
// ============================================================================

/// Resolve one record against the cluster's main branch and domain
pub fn resolve(
    record: &ServiceRecord,
    cluster_branch: &str,
    cluster_domain: &str,
) -> Result<Service, ValidationError> {
    let tag = |key: &str| {
        record
            .tags
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    };

    let expose = tag(tags::EXPOSE).is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let name = tag(tags::NAME)
        .unwrap_or(record.name.as_str())
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(ValidationError::MissingName);
    }
    if !FQDN_PATTERN.is_match(&name) {
        return Err(ValidationError::InvalidName(name));
    }

    let mut additional_fqdns = Vec::new();
    for extra in tags::split_list(tag(tags::ADDITIONAL_FQDNS).unwrap_or_default()) {
        validate_fqdn(&extra)?;
        additional_fqdns.push(extra);
    }

    let (fqdn, branch) = match tag(tags::FQDN) {
        Some(explicit) => {
            validate_fqdn(explicit)?;
            (explicit.to_string(), None)
        }
        None => {
            let branch_name = tag(tags::BRANCH).unwrap_or(cluster_branch);
            let normalized = normalize_branch(branch_name);
            let fqdn = format!("{}.{}.{}", name, normalized, cluster_domain);
            validate_fqdn(&fqdn)?;

            if branch_name == cluster_branch {
                let alias = format!("{}.{}", name, cluster_domain);
                validate_fqdn(&alias)?;
                if !additional_fqdns.contains(&alias) {
                    additional_fqdns.push(alias);
                }
            }

            let branch = Branch {
                name: branch_name.to_string(),
                normalized,
            };
            (fqdn, Some(branch))
        }
    };

    // An explicitly empty mode is rejected rather than defaulted
    let mode = record.tags.get(tags::MODE).map(String::as_str);
    let listener = match mode.unwrap_or(DEFAULT_MODE) {
        "http" => Listener::Http {
            port: parse_port(tags::HTTP_PORT, tag(tags::HTTP_PORT), DEFAULT_HTTP_PORT)?,
        },
        "https" => Listener::Https {
            port: parse_port(tags::HTTPS_PORT, tag(tags::HTTPS_PORT), DEFAULT_HTTPS_PORT)?,
        },
        other => return Err(ValidationError::InvalidMode(other.to_string())),
    };

    let sanitize = resolve_sanitize(
        tag(tags::HTTP_SANITIZE_CODES),
        tag(tags::HTTP_SANITIZE_RETURN),
    )?;

    Ok(Service {
        name,
        expose,
        fqdn,
        branch,
        additional_fqdns,
        listener,
        sanitize,
        backends: record.endpoints.clone(),
    })
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `-`, one for one
pub fn normalize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn validate_fqdn(fqdn: &str) -> Result<(), ValidationError> {
    if FQDN_PATTERN.is_match(fqdn) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFqdn(fqdn.to_string()))
    }
}

fn validate_code(code: &str) -> Result<(), ValidationError> {
    if CODE_PATTERN.is_match(code) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCode(code.to_string()))
    }
}

fn parse_port(key: &'static str, value: Option<&str>, default: u16) -> Result<u16, ValidationError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ValidationError::InvalidPort {
                key,
                value: raw.to_string(),
            }),
    }
}

fn resolve_sanitize(
    codes: Option<&str>,
    return_code: Option<&str>,
) -> Result<Option<Sanitize>, ValidationError> {
    let codes = tags::split_list(codes.unwrap_or_default());
    if codes.is_empty() {
        return Ok(None);
    }

    let return_code = return_code.ok_or(ValidationError::SanitizeReturnRequired)?;
    validate_code(return_code)?;

    let mut set = BTreeSet::new();
    for code in codes {
        validate_code(&code)?;
        set.insert(code);
    }

    Ok(Some(Sanitize {
        codes: set,
        return_code: return_code.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Endpoint, Mode};

    const DOMAIN: &str = "example.com";
    const MAIN: &str = "master";

    fn record(name: &str) -> ServiceRecord {
        ServiceRecord::new(name).with_tag(tags::EXPOSE, "true")
    }

    #[test]
    fn test_derived_fqdn_on_main_branch() {
        let rec = record("blog").with_tag(tags::BRANCH, "master");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();

        assert_eq!(svc.fqdn, "blog.master.example.com");
        assert!(svc.additional_fqdns.contains(&"blog.example.com".to_string()));
        let branch = svc.branch.unwrap();
        assert_eq!(branch.name, "master");
        assert_eq!(branch.normalized, "master");
    }

    #[test]
    fn test_missing_branch_defaults_to_cluster_branch() {
        let svc = resolve(&record("blog"), "main", DOMAIN).unwrap();

        assert_eq!(svc.fqdn, "blog.main.example.com");
        assert_eq!(svc.additional_fqdns, vec!["blog.example.com"]);
    }

    #[test]
    fn test_feature_branch_has_no_alias() {
        let rec = record("blog").with_tag(tags::BRANCH, "feature/x y");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();

        assert_eq!(svc.fqdn, "blog.feature-x-y.example.com");
        assert_eq!(svc.branch.unwrap().normalized, "feature-x-y");
        assert!(svc.additional_fqdns.is_empty());
    }

    #[test]
    fn test_normalize_branch_replaces_each_character() {
        assert_eq!(normalize_branch("feature/x y"), "feature-x-y");
        assert_eq!(normalize_branch("a//b"), "a--b");
        assert_eq!(normalize_branch("v1.2_rc-3"), "v1.2_rc-3");
    }

    #[test]
    fn test_explicit_fqdn_has_no_branch() {
        let rec = record("blog")
            .with_tag(tags::FQDN, "www.blog.org")
            .with_tag(tags::BRANCH, "master");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();

        assert_eq!(svc.fqdn, "www.blog.org");
        assert!(svc.branch.is_none());
        assert!(svc.additional_fqdns.is_empty());
    }

    #[test]
    fn test_invalid_explicit_fqdn() {
        let rec = record("blog").with_tag(tags::FQDN, "bad host!");
        assert_eq!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::InvalidFqdn("bad host!".to_string()))
        );
    }

    #[test]
    fn test_additional_fqdns_validated_and_ordered() {
        let rec = record("blog").with_tag(tags::ADDITIONAL_FQDNS, "blog.org, www.blog.org");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();
        assert_eq!(
            svc.additional_fqdns,
            vec!["blog.org", "www.blog.org", "blog.example.com"]
        );

        let bad = record("blog").with_tag(tags::ADDITIONAL_FQDNS, "blog.org,no/slash");
        assert!(matches!(
            resolve(&bad, MAIN, DOMAIN),
            Err(ValidationError::InvalidFqdn(_))
        ));
    }

    #[test]
    fn test_missing_name() {
        let rec = ServiceRecord::new("").with_tag(tags::EXPOSE, "true");
        assert_eq!(resolve(&rec, MAIN, DOMAIN), Err(ValidationError::MissingName));
    }

    #[test]
    fn test_unsafe_names_rejected() {
        for name in ["../../escaped", "a b", "x\nbackend evil"] {
            let rec = record("blog").with_tag(tags::NAME, name);
            assert_eq!(
                resolve(&rec, MAIN, DOMAIN),
                Err(ValidationError::InvalidName(name.to_string())),
                "name {:?}",
                name
            );
        }

        // Also with an explicit FQDN, where the name only reaches the backend servers
        let rec = record("x\nbackend evil").with_tag(tags::FQDN, "www.blog.org");
        assert!(matches!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::InvalidName(_))
        ));
    }

    #[test]
    fn test_derived_fqdn_validated() {
        let rec = record("blog");
        assert_eq!(
            resolve(&rec, MAIN, "example.com/../etc"),
            Err(ValidationError::InvalidFqdn(
                "blog.master.example.com/../etc".to_string()
            ))
        );

        let alias_only = record("blog").with_tag(tags::BRANCH, "master");
        assert!(matches!(
            resolve(&alias_only, MAIN, "bad domain"),
            Err(ValidationError::InvalidFqdn(_))
        ));
    }

    #[test]
    fn test_name_tag_overrides_record_name() {
        let rec = record("blog-svc").with_tag(tags::NAME, "blog");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();
        assert_eq!(svc.name, "blog");
        assert_eq!(svc.fqdn, "blog.master.example.com");
    }

    #[test]
    fn test_expose_is_case_insensitive() {
        let on = record("a").with_tag(tags::EXPOSE, "TRUE");
        assert!(resolve(&on, MAIN, DOMAIN).unwrap().expose);

        let off = record("a").with_tag(tags::EXPOSE, "yes");
        assert!(!resolve(&off, MAIN, DOMAIN).unwrap().expose);

        let absent = ServiceRecord::new("a").with_tag(tags::MODE, "http");
        assert!(!resolve(&absent, MAIN, DOMAIN).unwrap().expose);
    }

    #[test]
    fn test_mode_defaults_to_https() {
        let svc = resolve(&record("a"), MAIN, DOMAIN).unwrap();
        assert_eq!(svc.mode(), Mode::Https);
        assert_eq!(svc.https_port(), Some(443));
        assert_eq!(svc.http_port(), None);
    }

    #[test]
    fn test_http_mode_with_port() {
        let rec = record("a")
            .with_tag(tags::MODE, "http")
            .with_tag(tags::HTTP_PORT, "8080");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();
        assert_eq!(svc.listener, Listener::Http { port: 8080 });
        assert_eq!(svc.https_port(), None);
    }

    #[test]
    fn test_invalid_mode() {
        let rec = record("a").with_tag(tags::MODE, "ftp");
        assert_eq!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::InvalidMode("ftp".to_string()))
        );

        let empty = record("a").with_tag(tags::MODE, "");
        assert_eq!(
            resolve(&empty, MAIN, DOMAIN),
            Err(ValidationError::InvalidMode(String::new()))
        );
    }

    #[test]
    fn test_invalid_port() {
        let rec = record("a").with_tag(tags::HTTPS_PORT, "https");
        assert!(matches!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::InvalidPort { key: tags::HTTPS_PORT, .. })
        ));
    }

    #[test]
    fn test_unused_port_is_ignored() {
        let rec = record("a")
            .with_tag(tags::MODE, "http")
            .with_tag(tags::HTTPS_PORT, "not-a-port");
        assert!(resolve(&rec, MAIN, DOMAIN).is_ok());
    }

    #[test]
    fn test_sanitize_codes() {
        let rec = record("a")
            .with_tag(tags::HTTP_SANITIZE_CODES, "502,404")
            .with_tag(tags::HTTP_SANITIZE_RETURN, "503");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();

        assert!(svc.sanitizes());
        let sanitize = svc.sanitize.unwrap();
        assert_eq!(sanitize.codes.iter().collect::<Vec<_>>(), vec!["404", "502"]);
        assert_eq!(sanitize.return_code, "503");
    }

    #[test]
    fn test_sanitize_invalid_code() {
        let rec = record("a")
            .with_tag(tags::HTTP_SANITIZE_CODES, "404,abc")
            .with_tag(tags::HTTP_SANITIZE_RETURN, "200");
        assert_eq!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::InvalidCode("abc".to_string()))
        );
    }

    #[test]
    fn test_sanitize_invalid_return_code() {
        let rec = record("a")
            .with_tag(tags::HTTP_SANITIZE_CODES, "404")
            .with_tag(tags::HTTP_SANITIZE_RETURN, "600");
        assert_eq!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::InvalidCode("600".to_string()))
        );
    }

    #[test]
    fn test_sanitize_requires_return() {
        let rec = record("a").with_tag(tags::HTTP_SANITIZE_CODES, "404");
        assert_eq!(
            resolve(&rec, MAIN, DOMAIN),
            Err(ValidationError::SanitizeReturnRequired)
        );
    }

    #[test]
    fn test_return_without_codes_is_ignored() {
        let rec = record("a").with_tag(tags::HTTP_SANITIZE_RETURN, "200");
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();
        assert!(!svc.sanitizes());
    }

    #[test]
    fn test_backends_copied_in_order() {
        let rec = record("a")
            .with_endpoint("10.0.0.2", 80)
            .with_endpoint("10.0.0.1", 80);
        let svc = resolve(&rec, MAIN, DOMAIN).unwrap();
        assert_eq!(
            svc.backends,
            vec![Endpoint::new("10.0.0.2", 80), Endpoint::new("10.0.0.1", 80)]
        );

        let empty = resolve(&record("b"), MAIN, DOMAIN).unwrap();
        assert!(empty.backends.is_empty());
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let rec = record("a")
            .with_tag(tags::ADDITIONAL_FQDNS, "x.org")
            .with_tag(tags::HTTP_SANITIZE_CODES, "500,404")
            .with_tag(tags::HTTP_SANITIZE_RETURN, "404")
            .with_endpoint("10.0.0.1", 80);

        assert_eq!(resolve(&rec, MAIN, DOMAIN), resolve(&rec, MAIN, DOMAIN));
    }
}
