//! `plimni.io/*` tag keys and extraction
//!
//! Kubernetes hands us annotations as a map, Consul hands us a flat list of
//! `key=value` strings. Both end up as the same immutable key/value map.

use std::collections::BTreeMap;

pub const PREFIX: &str = "plimni.io";

pub const EXPOSE: &str = "plimni.io/expose";
pub const NAME: &str = "plimni.io/name";
pub const BRANCH: &str = "plimni.io/branch";
pub const FQDN: &str = "plimni.io/fqdn";
pub const ADDITIONAL_FQDNS: &str = "plimni.io/additional-fqdns";
pub const MODE: &str = "plimni.io/mode";
pub const HTTP_PORT: &str = "plimni.io/http-port";
pub const HTTPS_PORT: &str = "plimni.io/https-port";
pub const HTTP_SANITIZE_CODES: &str = "plimni.io/http-sanitize-codes";
pub const HTTP_SANITIZE_RETURN: &str = "plimni.io/http-sanitize-return";

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

pub fn is_plimni_key(key: &str) -> bool {
    key.starts_with(PREFIX)
}

pub fn has_plimni_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> bool {
    keys.into_iter().any(|k| is_plimni_key(k))
}

/// Keep only the `plimni.io` annotations of a Kubernetes object
pub fn from_annotations<'a>(
    annotations: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> BTreeMap<String, String> {
    annotations
        .into_iter()
        .filter(|(k, _)| is_plimni_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Parse Consul-style `key=value` tags, keeping the `plimni.io` ones.
/// Values may contain `=`; tags without one are ignored.
pub fn from_tag_strings(tags: &[String]) -> BTreeMap<String, String> {
    tags.iter()
        .filter(|t| is_plimni_key(t))
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Split a comma-separated tag value, dropping blank entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
