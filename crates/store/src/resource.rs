//! Identity-stable resource handles.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use steve_core::{meta_str, parse_revision, selector::labels_of};

struct Inner {
    id: String,
    resource_type: String,
    data: ArcSwap<Value>,
}

/// Shared view of one cached resource. Clones point at the same entry; the
/// payload is replaced wholesale by the store and never written by callers.
#[derive(Clone)]
pub struct Resource(Arc<Inner>);

/// `metadata.state` as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceState {
    pub name: Option<String>,
    pub transitioning: bool,
    pub error: bool,
    pub message: Option<String>,
}

impl Resource {
    pub(crate) fn new(resource_type: &str, id: &str, data: Value) -> Self {
        Self(Arc::new(Inner {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            data: ArcSwap::from_pointee(data),
        }))
    }

    pub(crate) fn update(&self, data: Value) {
        self.0.data.store(Arc::new(data));
    }

    /// Current payload snapshot.
    pub fn data(&self) -> Arc<Value> {
        self.0.data.load_full()
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// Canonical (normalized) type this handle is cached under.
    pub fn resource_type(&self) -> &str {
        &self.0.resource_type
    }

    pub fn name(&self) -> String {
        let data = self.data();
        meta_str(&data, "name")
            .map(str::to_string)
            .unwrap_or_else(|| self.0.id.rsplit('/').next().unwrap_or(&self.0.id).to_string())
    }

    pub fn namespace(&self) -> Option<String> {
        let data = self.data();
        meta_str(&data, "namespace").filter(|s| !s.is_empty()).map(str::to_string)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        labels_of(&self.data())
    }

    pub fn resource_version(&self) -> Option<u64> {
        self.data().get("metadata").and_then(|m| m.get("resourceVersion")).and_then(parse_revision)
    }

    pub fn state(&self) -> ResourceState {
        let data = self.data();
        let Some(st) = data.get("metadata").and_then(|m| m.get("state")) else {
            return ResourceState::default();
        };
        ResourceState {
            name: st.get("name").and_then(|v| v.as_str()).map(str::to_string),
            transitioning: st.get("transitioning").and_then(|v| v.as_bool()).unwrap_or(false),
            error: st.get("error").and_then(|v| v.as_bool()).unwrap_or(false),
            message: st.get("message").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Field lookup by JSON pointer, e.g. `/status/phase`.
    pub fn get(&self, pointer: &str) -> Option<Value> {
        self.data().pointer(pointer).cloned()
    }

    /// Same cache entry, not just equal payloads.
    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("type", &self.0.resource_type)
            .field("id", &self.0.id)
            .field("resourceVersion", &self.resource_version())
            .finish()
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.data().as_ref().serialize(s)
    }
}
