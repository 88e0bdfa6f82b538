use std::collections::VecDeque;

use steve_core::Change;

/// FIFO of socket-driven changes waiting for the next flush. Repeated
/// changes to one id are all kept and applied in arrival order.
#[derive(Default)]
pub struct ChangeQueue {
    items: VecDeque<Change>,
}

impl ChangeQueue {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, c: Change) {
        self.items.push_back(c);
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<Change> {
        self.items.drain(..).collect()
    }

    /// Drop queued changes for one type.
    pub fn discard_type(&mut self, resource_type: &str) {
        self.items.retain(|c| c.resource_type != resource_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steve_core::{ChangeAction, EventLabel};

    fn load(id: &str, v: u64) -> Change {
        Change {
            action: ChangeAction::Load(json!({"id": id, "v": v})),
            resource_type: "pod".into(),
            id: id.into(),
            label: Some(EventLabel::Change),
        }
    }

    #[test]
    fn keeps_duplicates_in_order() {
        let mut q = ChangeQueue::default();
        q.push(load("a", 1));
        q.push(load("b", 1));
        q.push(load("a", 2));
        let out = q.drain();
        assert!(q.is_empty());
        let seen: Vec<(String, serde_json::Value)> = out
            .into_iter()
            .map(|c| match c.action {
                ChangeAction::Load(v) => (c.id, v["v"].clone()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(seen, vec![("a".into(), json!(1)), ("b".into(), json!(1)), ("a".into(), json!(2))]);
    }

    #[test]
    fn discard_type_leaves_other_types() {
        let mut q = ChangeQueue::default();
        q.push(load("a", 1));
        q.push(Change { action: ChangeAction::Remove, resource_type: "node".into(), id: "n1".into(), label: None });
        q.discard_type("pod");
        assert_eq!(q.len(), 1);
    }
}
