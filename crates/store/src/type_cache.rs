//! Per-type cache: ordered list plus id map, completeness flags and revision.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::resource::Resource;

/// Every id in `map` appears exactly once in `list` and vice versa.
#[derive(Default)]
pub struct TypeCache {
    list: Vec<Resource>,
    map: FxHashMap<String, Resource>,
    have_all: bool,
    have_selector: FxHashSet<String>,
    have_namespace: FxHashSet<String>,
    revision: u64,
    generation: u64,
    /// Type name as the server spells it, used when no schema is known.
    server_type: Option<String>,
}

impl TypeCache {
    pub fn list(&self) -> &[Resource] {
        &self.list
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.map.get(id)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn have_all(&self) -> bool {
        self.have_all
    }

    pub fn have_selector(&self, selector: &str) -> bool {
        self.have_selector.contains(selector)
    }

    pub fn have_namespace(&self, namespace: &str) -> bool {
        self.have_namespace.contains(namespace)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn server_type(&self) -> Option<&str> {
        self.server_type.as_deref()
    }

    pub(crate) fn note_server_type(&mut self, raw_type: &str) {
        if self.server_type.is_none() && !raw_type.is_empty() {
            self.server_type = Some(raw_type.to_string());
        }
    }

    pub(crate) fn set_have_all(&mut self) {
        self.have_all = true;
    }

    pub(crate) fn set_have_selector(&mut self, selector: &str) {
        self.have_selector.insert(selector.to_string());
    }

    pub(crate) fn set_have_namespace(&mut self, namespace: &str) {
        self.have_namespace.insert(namespace.to_string());
    }

    /// Never lowers the watermark.
    pub(crate) fn raise_revision(&mut self, revision: u64) {
        self.revision = self.revision.max(revision);
    }

    /// Update the entry for `id` in place or append a new one. Returns the
    /// handle and whether it was created.
    pub(crate) fn upsert(&mut self, resource_type: &str, id: &str, data: Value) -> (Resource, bool) {
        self.generation += 1;
        if let Some(existing) = self.map.get(id) {
            existing.update(data);
            let r = existing.clone();
            self.raise_from(&r);
            return (r, false);
        }
        let r = Resource::new(resource_type, id, data);
        self.raise_from(&r);
        self.list.push(r.clone());
        self.map.insert(id.to_string(), r.clone());
        (r, true)
    }

    /// Track a handle owned by another type's cache (`baseType` aliasing).
    pub(crate) fn link(&mut self, r: &Resource) {
        self.generation += 1;
        self.raise_from(r);
        match self.map.get(r.id()) {
            Some(existing) if existing.ptr_eq(r) => {}
            Some(existing) => existing.update(r.data().as_ref().clone()),
            None => {
                self.list.push(r.clone());
                self.map.insert(r.id().to_string(), r.clone());
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Resource> {
        let r = self.map.remove(id)?;
        self.list.retain(|x| !x.ptr_eq(&r));
        self.generation += 1;
        Some(r)
    }

    /// Replace the whole content with `entries`, in their order. Handles of
    /// ids that survive are updated in place and reused.
    pub(crate) fn replace_all(&mut self, resource_type: &str, entries: Vec<(String, Value)>) -> Vec<Resource> {
        let mut old = std::mem::take(&mut self.map);
        self.list.clear();
        for (id, data) in entries {
            if let Some(prev) = self.map.get(&id) {
                // duplicate id in one response: last payload wins
                prev.update(data);
                continue;
            }
            let r = match old.remove(&id) {
                Some(r) => {
                    r.update(data);
                    r
                }
                None => Resource::new(resource_type, &id, data),
            };
            self.raise_from(&r);
            self.list.push(r.clone());
            self.map.insert(id, r);
        }
        self.generation += 1;
        self.list.clone()
    }

    fn raise_from(&mut self, r: &Resource) {
        if let Some(rv) = r.resource_version() {
            self.raise_revision(rv);
        }
    }
}
