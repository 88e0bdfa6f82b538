//! Steve core types: normalizer, watch descriptors, wire messages, errors and config.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod message;
pub mod normalize;
pub mod options;
pub mod selector;

use serde::{Deserialize, Serialize};

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use message::{RawSocketMessage, SocketMessage, WatchEvent, WatchRequest};
pub use normalize::{key_for_subscribe, normalize_type, parse_revision, watches_are_equivalent};
pub use options::{FindOptions, LoadMode, SortOrder};
pub use selector::LabelSelector;

/// Type name of schema resources.
pub const SCHEMA: &str = "schema";

/// Scope of a live subscription. Two descriptors describe the same scope when
/// [`watches_are_equivalent`] holds; `revision` is only a resume point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchDescriptor {
    pub resource_type: String,
    pub namespace: Option<String>,
    pub id: Option<String>,
    pub selector: Option<String>,
    pub revision: Option<u64>,
}

impl WatchDescriptor {
    pub fn for_type(resource_type: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), ..Default::default() }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_revision(mut self, revision: Option<u64>) -> Self {
        self.revision = revision;
        self
    }

    /// Dedup/error-index key for this scope.
    pub fn key(&self) -> String {
        key_for_subscribe(self)
    }
}

/// Label delivered to event observers after a queued change is applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventLabel {
    Create,
    Change,
    Remove,
}

impl std::fmt::Display for EventLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventLabel::Create => "create",
            EventLabel::Change => "change",
            EventLabel::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// What a queued change does once flushed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeAction {
    Load(serde_json::Value),
    Remove,
    ForgetType,
}

/// One entry of the change-event queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub action: ChangeAction,
    pub resource_type: String,
    pub id: String,
    pub label: Option<EventLabel>,
}

pub mod prelude {
    pub use super::{
        Change, ChangeAction, EventLabel, FindOptions, LoadMode, StoreConfig, StoreError, StoreResult,
        WatchDescriptor, SCHEMA,
    };
}

/// Read `metadata.<key>` as a string.
pub fn meta_str<'a>(raw: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    raw.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

/// Read a top-level string field.
pub fn field_str<'a>(raw: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(|v| v.as_str())
}

/// Lock a mutex, carrying on with the inner value if a holder panicked.
pub fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_survives_poisoning() {
        let m = std::sync::Arc::new(std::sync::Mutex::new(1));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(m.is_poisoned());
        *lock(&m) += 1;
        assert_eq!(*lock(&m), 2);
    }
}
