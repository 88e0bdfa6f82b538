//! Kubernetes-style label selectors, evaluated locally against cached resources.

use std::collections::BTreeMap;

use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

/// Parsed selector such as `app=web,tier!=db,env in (prod,stage),!legacy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(s: &str) -> StoreResult<Self> {
        let mut reqs = Vec::new();
        for part in split_top_level(s) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            reqs.push(parse_requirement(part)?);
        }
        Ok(Self { reqs })
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| match r {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::NotEq(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).map(|l| vs.contains(l)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|l| !vs.contains(l)).unwrap_or(true),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }

    /// Match against the `metadata.labels` of a raw resource.
    pub fn matches_value(&self, raw: &serde_json::Value) -> bool {
        self.matches(&labels_of(raw))
    }
}

/// `metadata.labels` as an ordered map; non-string values are skipped.
pub fn labels_of(raw: &serde_json::Value) -> BTreeMap<String, String> {
    raw.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_requirement(part: &str) -> StoreResult<Requirement> {
    let bad = || StoreError::Decode(format!("invalid label selector term: {part}"));
    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(bad());
        }
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if let Some((k, v)) = part.split_once("!=") {
        return Ok(Requirement::NotEq(non_empty(k).ok_or_else(bad)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once("==") {
        return Ok(Requirement::Eq(non_empty(k).ok_or_else(bad)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once('=') {
        return Ok(Requirement::Eq(non_empty(k).ok_or_else(bad)?, v.trim().to_string()));
    }
    let words: Vec<&str> = part.splitn(3, char::is_whitespace).filter(|w| !w.is_empty()).collect();
    match words.as_slice() {
        [key] => Ok(Requirement::Exists((*key).to_string())),
        [key, op, rest] if *op == "in" || *op == "notin" => {
            let values = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(bad)?
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if *op == "in" {
                Ok(Requirement::In((*key).to_string(), values))
            } else {
                Ok(Requirement::NotIn((*key).to_string(), values))
            }
        }
        _ => Err(bad()),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn equality_and_existence() {
        let sel = LabelSelector::parse("app=web,tier!=db,!legacy").unwrap();
        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "fe")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("tier", "db")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("legacy", "1")])));
        assert!(!sel.matches(&labels(&[("app", "api")])));
    }

    #[test]
    fn set_based_terms() {
        let sel = LabelSelector::parse("env in (prod, stage),team notin (x),owner").unwrap();
        assert!(sel.matches(&labels(&[("env", "prod"), ("owner", "me")])));
        assert!(!sel.matches(&labels(&[("env", "dev"), ("owner", "me")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("team", "x"), ("owner", "me")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::parse("").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&BTreeMap::new()));
        assert!(LabelSelector::parse("env in prod").is_err());
    }
}
