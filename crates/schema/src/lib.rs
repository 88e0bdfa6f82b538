//! Steve schema model: resource fields, collection links, printer columns, and
//! blank instances for creation forms.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use steve_core::normalize_type;
use tracing::debug;

/// Recursion guard for `default_for`; schema graphs may be cyclic.
pub const MAX_DEFAULT_DEPTH: usize = 8;

// Field types that never refer to another schema.
const SIMPLE_TYPES: &[&str] = &[
    "string", "multiline", "masked", "password", "float", "int", "date", "blob", "boolean", "enum",
    "version", "dnslabel", "hostname", "base64", "intorstring", "cidr", "ipaddress", "number",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// `map[T]`
    Map(String),
    /// `array[T]`
    Array(String),
    /// `reference[T]`
    Reference(String),
    Json,
    /// Scalar or the id of another schema.
    Named(String),
}

impl FieldType {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let inner = |prefix: &str| {
            raw.strip_prefix(prefix)
                .and_then(|r| r.strip_suffix(']'))
                .map(|s| s.to_string())
        };
        if let Some(t) = inner("map[") {
            FieldType::Map(t)
        } else if let Some(t) = inner("array[") {
            FieldType::Array(t)
        } else if let Some(t) = inner("reference[") {
            FieldType::Reference(t)
        } else if raw == "json" {
            FieldType::Json
        } else {
            FieldType::Named(raw.to_string())
        }
    }

    fn is_simple(name: &str) -> bool {
        SIMPLE_TYPES.contains(&name.to_ascii_lowercase().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub field_type: FieldType,
    pub default: Option<Value>,
    pub nullable: bool,
    pub required: bool,
}

impl Field {
    fn from_value(v: &Value) -> Option<Self> {
        // resourceFields entries are either `{ "type": .. }` objects or bare type strings
        if let Some(s) = v.as_str() {
            return Some(Self { field_type: FieldType::parse(s), default: None, nullable: true, required: false });
        }
        let obj = v.as_object()?;
        let ty = obj.get("type").and_then(|t| t.as_str())?;
        Some(Self {
            field_type: FieldType::parse(ty),
            default: obj.get("default").filter(|d| !d.is_null()).cloned(),
            nullable: obj.get("nullable").and_then(|b| b.as_bool()).unwrap_or(true),
            required: obj.get("required").and_then(|b| b.as_bool()).unwrap_or(false),
        })
    }
}

/// Printer column declared by the server for list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub json_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Server id, as sent (also the wire type name for watches).
    pub id: String,
    pub collection_url: Option<String>,
    pub resource_fields: BTreeMap<String, Field>,
    pub namespaced: bool,
    /// `None` when the server declares no verb list.
    pub verbs: Option<Vec<String>>,
    pub columns: Vec<Column>,
}

impl Schema {
    /// Parse a `type: schema` resource. Returns `None` without an id.
    pub fn from_value(v: &Value) -> Option<Self> {
        let id = v.get("id").and_then(|s| s.as_str())?.to_string();
        let collection_url = v
            .get("links")
            .and_then(|l| l.get("collection"))
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let resource_fields = v
            .get("resourceFields")
            .and_then(|f| f.as_object())
            .map(|obj| obj.iter().filter_map(|(k, f)| Field::from_value(f).map(|f| (k.clone(), f))).collect())
            .unwrap_or_default();
        let attrs = v.get("attributes");
        let namespaced = attrs.and_then(|a| a.get("namespaced")).and_then(|b| b.as_bool()).unwrap_or(false);
        let verbs = attrs
            .and_then(|a| a.get("verbs"))
            .and_then(|vs| vs.as_array())
            .map(|vs| vs.iter().filter_map(|s| s.as_str().map(str::to_string)).collect());
        let mut columns = Vec::new();
        if let Some(cols) = attrs.and_then(|a| a.get("columns")).and_then(|c| c.as_array()) {
            for c in cols {
                let name = c.get("name").and_then(|s| s.as_str()).unwrap_or("").to_string();
                let raw = c.get("field").and_then(|s| s.as_str()).unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                match normalize_json_path(raw) {
                    Some(jp) => columns.push(Column { name, json_path: jp }),
                    None => debug!(schema = %id, column = %name, path = %raw, "schema: unsupported column path"),
                }
            }
        }
        Some(Self { id, collection_url, resource_fields, namespaced, verbs, columns })
    }

    /// Canonical cache key of this schema.
    pub fn key(&self) -> String {
        normalize_type(&self.id)
    }

    /// Watchable unless the server declares verbs without `watch`.
    pub fn watchable(&self) -> bool {
        self.verbs.as_ref().map(|vs| vs.iter().any(|v| v == "watch")).unwrap_or(true)
    }

    /// Render this schema's printer columns for one resource.
    pub fn project(&self, raw: &Value) -> Vec<(String, String)> {
        self.columns
            .iter()
            .map(|c| {
                let s = match extract_path(raw, &c.json_path) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    Some(Value::Bool(b)) => b.to_string(),
                    _ => String::new(),
                };
                (c.name.clone(), s)
            })
            .collect()
    }
}

/// Accept simple paths like `$.metadata.name`, `.status.phase`, `spec.ports[0]`.
fn normalize_json_path(jp: &str) -> Option<String> {
    if jp.contains('?') || jp.contains('*') {
        return None;
    }
    let s = jp.strip_prefix('$').unwrap_or(jp);
    let s = s.strip_prefix('.').unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    for seg in s.split('.') {
        let key = match seg.find('[') {
            Some(open) => {
                let idx = seg.get(open + 1..)?.strip_suffix(']')?;
                if idx.is_empty() || !idx.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                &seg[..open]
            }
            None => seg,
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
    }
    Some(s.to_string())
}

/// Follow dot fields with an optional single `[index]` per segment.
fn extract_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        let (key, idx) = match seg.find('[') {
            Some(open) => {
                let idx: usize = seg.get(open + 1..)?.strip_suffix(']')?.parse().ok()?;
                (&seg[..open], Some(idx))
            }
            None => (seg, None),
        };
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

/// Build a blank instance of `schema`. `lookup` resolves nested schema ids.
///
/// Map and unknown object fields recurse, arrays start empty, references and
/// scalars without a declared default are left out. At the top level
/// `metadata` is generated (with `default_namespace` for namespaced schemas)
/// and `status` is omitted.
pub fn default_for<F>(schema: &Schema, lookup: &F, default_namespace: &str) -> Value
where
    F: Fn(&str) -> Option<Schema>,
{
    default_at_depth(schema, lookup, default_namespace, 0)
}

fn default_at_depth<F>(schema: &Schema, lookup: &F, default_namespace: &str, depth: usize) -> Value
where
    F: Fn(&str) -> Option<Schema>,
{
    let mut out = Map::new();
    if depth > MAX_DEFAULT_DEPTH {
        return Value::Object(out);
    }
    for (key, field) in schema.resource_fields.iter() {
        if depth == 0 && key == "metadata" {
            let mut meta = Map::new();
            meta.insert("name".into(), Value::String(String::new()));
            if schema.namespaced {
                meta.insert("namespace".into(), Value::String(default_namespace.to_string()));
            }
            out.insert(key.clone(), Value::Object(meta));
            continue;
        }
        if depth == 0 && key == "status" {
            continue;
        }
        let value = match &field.field_type {
            FieldType::Reference(_) => None,
            FieldType::Array(_) => Some(field.default.clone().unwrap_or_else(|| Value::Array(Vec::new()))),
            FieldType::Json => Some(field.default.clone().unwrap_or_else(|| Value::Object(Map::new()))),
            FieldType::Map(inner) => Some(match lookup(inner) {
                Some(sub) => default_at_depth(&sub, lookup, default_namespace, depth + 1),
                None => Value::Object(Map::new()),
            }),
            FieldType::Named(name) if FieldType::is_simple(name) => field.default.clone(),
            FieldType::Named(name) => match lookup(name) {
                Some(sub) => Some(default_at_depth(&sub, lookup, default_namespace, depth + 1)),
                None => field.default.clone(),
            },
        };
        if let Some(v) = value {
            out.insert(key.clone(), v);
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod_schema() -> Schema {
        Schema::from_value(&json!({
            "id": "pod",
            "type": "schema",
            "links": { "collection": "https://x/v1/pods" },
            "attributes": {
                "namespaced": true,
                "verbs": ["get", "list", "watch"],
                "columns": [
                    { "name": "Name", "field": "$.metadata.name" },
                    { "name": "Node", "field": "$.spec.nodeName" },
                    { "name": "Bad", "field": "$.spec.containers[*].name" }
                ]
            },
            "resourceFields": {
                "metadata": { "type": "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta" },
                "status": { "type": "io.k8s.api.core.v1.PodStatus" },
                "spec": { "type": "podspec" },
                "labels": { "type": "map[string]" },
                "secretRef": { "type": "reference[secret]" },
                "kind": { "type": "string", "default": "Pod" },
                "note": "string"
            }
        }))
        .unwrap()
    }

    fn spec_schema() -> Schema {
        Schema::from_value(&json!({
            "id": "podspec",
            "resourceFields": {
                "containers": { "type": "array[container]" },
                "restartPolicy": { "type": "enum", "default": "Always" },
                "hostname": { "type": "string" },
                "self": { "type": "podspec" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_links_attributes_and_columns() {
        let s = pod_schema();
        assert_eq!(s.collection_url.as_deref(), Some("https://x/v1/pods"));
        assert!(s.namespaced);
        assert!(s.watchable());
        assert_eq!(s.columns.len(), 2, "wildcard column path is rejected");
        assert_eq!(FieldType::parse("map[string]"), FieldType::Map("string".into()));
        let raw = json!({ "metadata": { "name": "p1" }, "spec": { "nodeName": "n1" } });
        assert_eq!(s.project(&raw), vec![("Name".into(), "p1".into()), ("Node".into(), "n1".into())]);
    }

    #[test]
    fn blank_instance_follows_field_types() {
        let lookup = |id: &str| if id == "podspec" { Some(spec_schema()) } else { None };
        let v = default_for(&pod_schema(), &lookup, "default");
        assert_eq!(v["metadata"], json!({ "name": "", "namespace": "default" }));
        assert!(v.get("status").is_none());
        assert!(v.get("secretRef").is_none());
        assert!(v.get("note").is_none());
        assert_eq!(v["labels"], json!({}));
        assert_eq!(v["kind"], json!("Pod"));
        assert_eq!(v["spec"]["containers"], json!([]));
        assert_eq!(v["spec"]["restartPolicy"], json!("Always"));
        assert!(v["spec"].get("hostname").is_none());
        // cyclic self reference stops at the depth guard
        assert!(v["spec"]["self"].is_object());
    }

    #[test]
    fn schema_without_verbs_is_watchable() {
        let s = Schema::from_value(&json!({ "id": "thing" })).unwrap();
        assert!(s.watchable());
        let s = Schema::from_value(&json!({ "id": "thing", "attributes": { "verbs": ["get"] } })).unwrap();
        assert!(!s.watchable());
        assert!(Schema::from_value(&json!({ "type": "schema" })).is_none());
    }
}
