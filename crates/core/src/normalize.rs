//! Canonical keys for type names and watch scopes.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::WatchDescriptor;

// "/v1/", "v3/", "/v1beta1/" style prefixes some producers put in front of type names
static VERSION_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/*v\d+(?:(?:alpha|beta)\d+)?/+").expect("static regex"));

/// Map a server type name (or one of its aliases) onto one canonical key.
///
/// Idempotent: `normalize_type(&normalize_type(x)) == normalize_type(x)`.
pub fn normalize_type(ty: &str) -> String {
    // every step only shortens the string, so this reaches a fixpoint
    let mut cur = ty.to_ascii_lowercase();
    loop {
        let next = normalize_step(&cur);
        if next == cur {
            return next;
        }
        cur = next;
    }
}

fn normalize_step(s: &str) -> String {
    let mut s = s.trim().to_string();
    if let Some(m) = VERSION_PREFIX.find(&s) {
        let end = m.end();
        s.replace_range(..end, "");
    }
    singular(s.trim_matches('/').to_string())
}

fn singular(mut s: String) -> String {
    if let Some(stem) = s.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{stem}y");
        }
        return s;
    }
    if s.ends_with("sses") {
        s.truncate(s.len() - 2);
        return s;
    }
    if s.ends_with("ss") || s.len() < 2 {
        return s;
    }
    if s.ends_with('s') {
        s.pop();
    }
    s
}

/// Deterministic composite key for a watch scope: `type/namespace/id/selector`.
pub fn key_for_subscribe(d: &WatchDescriptor) -> String {
    format!(
        "{}/{}/{}/{}",
        normalize_type(&d.resource_type),
        d.namespace.as_deref().unwrap_or(""),
        d.id.as_deref().unwrap_or(""),
        d.selector.as_deref().unwrap_or(""),
    )
}

/// Same scope: normalized type, namespace, id and selector match. Revision is ignored.
pub fn watches_are_equivalent(a: &WatchDescriptor, b: &WatchDescriptor) -> bool {
    fn eq(x: &Option<String>, y: &Option<String>) -> bool {
        x.as_deref().unwrap_or("") == y.as_deref().unwrap_or("")
    }
    normalize_type(&a.resource_type) == normalize_type(&b.resource_type)
        && eq(&a.namespace, &b.namespace)
        && eq(&a.id, &b.id)
        && eq(&a.selector, &b.selector)
}

/// Revisions arrive as JSON strings ("12345") or numbers; anything else is absent.
pub fn parse_revision(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
