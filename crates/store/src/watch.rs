//! Watch bookkeeping: started set, per-scope errors and the stop/retry state.

use rustc_hash::{FxHashMap, FxHashSet};
use steve_core::{key_for_subscribe, watches_are_equivalent, StoreError, WatchDescriptor};

/// Tracks subscription scopes by [`key_for_subscribe`]; revisions never take
/// part in identity.
#[derive(Default)]
pub struct WatchBook {
    started: Vec<WatchDescriptor>,
    in_error: FxHashMap<String, StoreError>,
    /// Scopes stopped by the server and already retried once.
    retried: FxHashSet<String>,
    /// Scopes we asked the server to stop; their stop echo is not a failure.
    stopping: FxHashSet<String>,
}

impl WatchBook {
    pub fn started(&self) -> &[WatchDescriptor] {
        &self.started
    }

    pub fn is_started(&self, d: &WatchDescriptor) -> bool {
        self.started.iter().any(|s| watches_are_equivalent(s, d))
    }

    /// Record `d` as started, keeping one entry per scope.
    pub fn mark_started(&mut self, d: WatchDescriptor) {
        match self.started.iter_mut().find(|s| watches_are_equivalent(s, &d)) {
            Some(s) => s.revision = d.revision,
            None => self.started.push(d),
        }
    }

    pub fn remove_started(&mut self, d: &WatchDescriptor) -> Option<WatchDescriptor> {
        let idx = self.started.iter().position(|s| watches_are_equivalent(s, d))?;
        Some(self.started.remove(idx))
    }

    pub fn take_all_started(&mut self) -> Vec<WatchDescriptor> {
        std::mem::take(&mut self.started)
    }

    /// Remove and return every started scope of one type.
    pub fn forget_type(&mut self, resource_type: &str) -> Vec<WatchDescriptor> {
        let (gone, kept) = std::mem::take(&mut self.started)
            .into_iter()
            .partition(|d| d.resource_type == resource_type);
        self.started = kept;
        self.in_error.retain(|k, _| k.split('/').next() != Some(resource_type));
        gone
    }

    pub fn set_error(&mut self, d: &WatchDescriptor, err: StoreError) {
        self.in_error.insert(key_for_subscribe(d), err);
    }

    pub fn error(&self, d: &WatchDescriptor) -> Option<&StoreError> {
        self.in_error.get(&key_for_subscribe(d))
    }

    pub fn clear_error(&mut self, d: &WatchDescriptor) -> bool {
        self.in_error.remove(&key_for_subscribe(d)).is_some()
    }

    pub fn mark_stopping(&mut self, d: &WatchDescriptor) {
        self.stopping.insert(key_for_subscribe(d));
    }

    /// Consume a pending stop we requested ourselves.
    pub fn take_stopping(&mut self, d: &WatchDescriptor) -> bool {
        self.stopping.remove(&key_for_subscribe(d))
    }

    /// True the first time a scope is stopped by the server; false if it was
    /// already retried and stopped again before a start arrived.
    pub fn retry_once(&mut self, d: &WatchDescriptor) -> bool {
        let key = key_for_subscribe(d);
        if self.retried.remove(&key) {
            return false;
        }
        self.retried.insert(key);
        true
    }

    /// Server confirmed the scope is running.
    pub fn acknowledge(&mut self, d: &WatchDescriptor) {
        let key = key_for_subscribe(d);
        self.retried.remove(&key);
        self.stopping.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_entry_per_scope() {
        let mut b = WatchBook::default();
        b.mark_started(WatchDescriptor::for_type("pod").with_revision(Some(1)));
        b.mark_started(WatchDescriptor::for_type("pod").with_revision(Some(7)));
        b.mark_started(WatchDescriptor::for_type("pod").with_namespace("ns"));
        assert_eq!(b.started().len(), 2);
        assert_eq!(b.started()[0].revision, Some(7));
    }

    #[test]
    fn retry_once_then_give_up_until_acknowledged() {
        let mut b = WatchBook::default();
        let d = WatchDescriptor::for_type("pod");
        assert!(b.retry_once(&d));
        assert!(!b.retry_once(&d));
        assert!(b.retry_once(&d));
        b.acknowledge(&d);
        assert!(b.retry_once(&d));
    }

    #[test]
    fn forget_type_drops_scopes_and_errors() {
        let mut b = WatchBook::default();
        let pod = WatchDescriptor::for_type("pod").with_namespace("ns");
        b.mark_started(pod.clone());
        b.mark_started(WatchDescriptor::for_type("node"));
        b.set_error(&pod, StoreError::WatchNotAllowed("pod".into()));
        let gone = b.forget_type("pod");
        assert_eq!(gone.len(), 1);
        assert!(b.error(&pod).is_none());
        assert_eq!(b.started().len(), 1);
    }
}
