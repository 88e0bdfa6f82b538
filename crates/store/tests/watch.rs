#![forbid(unsafe_code)]

mod common;

use common::*;
use serde_json::json;
use steve_core::{FindOptions, StoreError, WatchDescriptor};

const PODS: &str = "https://steve.test/v1/pods";

fn pod_watches(h: &Harness) -> usize {
    h.store.started_watches().iter().filter(|d| d.resource_type == "pod").count()
}

#[tokio::test]
async fn repeated_watch_is_started_once() {
    let mut h = harness().await;
    assert!(h.store.watch(WatchDescriptor::for_type("pod"), false));
    assert!(!h.store.watch(WatchDescriptor::for_type("pods"), false));
    assert_eq!(pod_watches(&h), 1);
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod"}));
    assert!(h.peer.quiet(50).await);
}

#[tokio::test]
async fn watch_not_allowed_suppresses_until_cleared() {
    let mut h = harness().await;
    let d = WatchDescriptor::for_type("pod");
    assert!(h.store.watch(d.clone(), false));
    h.peer.frame().await;

    h.peer.push(json!({"name": "resource.error", "resourceType": "pods", "data": {"error": "denied"}, "reason": "Watch not allowed"}));
    assert!(eventually(|| h.store.watch_error(&d).is_some()).await);
    assert!(matches!(h.store.watch_error(&d), Some(StoreError::WatchNotAllowed(_))));

    assert!(!h.store.watch(d.clone(), false));
    assert!(h.peer.quiet(50).await);

    assert!(h.store.clear_watch_error(&d));
    assert!(h.store.watch(d.clone(), false));
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod"}));
}

#[tokio::test]
async fn forced_watch_bypasses_error_state() {
    let mut h = harness().await;
    let d = WatchDescriptor::for_type("pod").with_namespace("ns");
    h.peer.push(json!({"name": "resource.error", "resourceType": "pod", "namespace": "ns", "reason": "failed to find schema for pod"}));
    assert!(eventually(|| h.store.watch_error(&d).is_some()).await);
    assert!(matches!(h.store.watch_error(&d), Some(StoreError::NoSchemaForWatch(_))));
    assert!(h.store.watch(d.clone(), true));
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod", "namespace": "ns"}));
}

#[tokio::test]
async fn types_without_watch_verb_are_not_watched() {
    let mut h = harness().await;
    h.api.get("https://steve.test/v1/nodes", json!({"type": "collection", "revision": "3", "data": [{"id": "n1", "type": "node"}]}));
    h.store.find_all("node", &FindOptions::default()).await.unwrap();
    assert!(!h.store.watch(WatchDescriptor::for_type("node"), false));
    assert!(h.peer.quiet(50).await);
}

#[tokio::test]
async fn reconnect_restarts_watches_without_revision() {
    let mut h = harness().await;
    assert!(h.store.watch(WatchDescriptor::for_type("pod").with_revision(Some(42)), false));
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod", "resourceVersion": "42"}));

    drop(h.peer);
    let mut peer = h.socket.peer().await;
    let mut frames = Vec::new();
    for _ in 0..4 {
        frames.push(peer.frame().await);
    }
    let (stops, starts): (Vec<_>, Vec<_>) = frames.into_iter().partition(|f| f.get("stop").is_some());
    assert_eq!(stops.len(), 2);
    assert_eq!(starts.len(), 2);
    assert!(starts.iter().all(|f| f.get("resourceVersion").is_none()));
    assert!(starts.iter().any(|f| f["resourceType"] == "pod"));
    assert!(h.store.started_watches().iter().all(|d| d.revision.is_none()));
    assert!(eventually(|| h.store.is_live()).await);
}

#[tokio::test]
async fn server_stop_is_retried_once() {
    let mut h = harness().await;
    assert!(h.store.watch(WatchDescriptor::for_type("pod"), false));
    h.peer.frame().await;

    h.peer.push(json!({"name": "resource.stop", "resourceType": "pod"}));
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod"}));
    assert_eq!(pod_watches(&h), 1);

    h.peer.push(json!({"name": "resource.stop", "resourceType": "pod"}));
    assert!(h.peer.quiet(150).await);
    assert_eq!(pod_watches(&h), 0);
}

#[tokio::test]
async fn acknowledged_restart_gets_a_fresh_retry() {
    let mut h = harness().await;
    assert!(h.store.watch(WatchDescriptor::for_type("pod"), false));
    h.peer.frame().await;

    h.peer.push(json!({"name": "resource.stop", "resourceType": "pod"}));
    h.peer.frame().await;
    h.peer.push(json!({"name": "resource.start", "resourceType": "pod"}));
    h.peer.push(json!({"name": "resource.stop", "resourceType": "pod"}));
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod"}));
}

#[tokio::test]
async fn unwatch_sends_stop_and_ignores_the_echo() {
    let mut h = harness().await;
    let d = WatchDescriptor::for_type("pod");
    h.store.watch(d.clone(), false);
    h.peer.frame().await;
    assert!(h.store.unwatch(&d));
    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod", "stop": true}));
    h.peer.push(json!({"name": "resource.stop", "resourceType": "pod"}));
    assert!(h.peer.quiet(100).await);
    assert!(!h.store.unwatch(&d));
}

#[tokio::test]
async fn too_old_resyncs_and_drops_missing_entries() {
    let mut h = harness().await;
    h.api.get(PODS, pods(5, vec![pod("ns", "a", 1), pod("ns", "b", 2), pod("ns", "c", 3)]));
    h.store.find_all("pod", &FindOptions::default()).await.unwrap();
    h.peer.frame().await;
    let held_a = h.store.by_id("pod", "ns/a").unwrap();

    h.api.get(PODS, pods(9, vec![pod("ns", "a", 8), pod("ns", "c", 9)]));
    h.peer.push(json!({"name": "resource.error", "resourceType": "pod", "reason": "too old resource version: 5 (9)"}));

    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod", "resourceVersion": "9"}));
    let ids: Vec<String> = h.store.all("pod").unwrap().iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, vec!["ns/a", "ns/c"]);
    assert!(h.store.by_id("pod", "ns/a").unwrap().ptr_eq(&held_a));
    assert_eq!(held_a.resource_version(), Some(8));
    assert_eq!(h.store.revision("pod"), 9);
}

#[tokio::test]
async fn unsubscribe_stops_everything() {
    let mut h = harness().await;
    h.store.watch(WatchDescriptor::for_type("pod"), false);
    h.peer.frame().await;
    h.store.unsubscribe(false);
    let a = h.peer.frame().await;
    let b = h.peer.frame().await;
    assert!(a["stop"] == true && b["stop"] == true);
    assert!(h.store.started_watches().is_empty());

    h.store.unsubscribe(true);
    assert!(!h.store.is_live());
}

#[tokio::test]
async fn unknown_and_ping_messages_are_harmless() {
    let mut h = harness().await;
    h.peer.push(json!({"name": "ping"}));
    h.peer.push(json!({"name": "resource.bogus", "resourceType": "pod"}));
    h.peer.push(json!("not an object"));
    assert!(h.peer.quiet(50).await);
    assert!(h.store.is_live());
}

#[tokio::test]
async fn hyphenated_reason_codes_are_recognised() {
    let mut h = harness().await;
    let d = WatchDescriptor::for_type("pod");
    assert!(h.store.watch(d.clone(), false));
    h.peer.frame().await;
    h.peer.push(json!({"name": "resource.error", "resourceType": "pod", "reason": "watch-not-allowed"}));
    assert!(eventually(|| h.store.watch_error(&d).is_some()).await);
    assert!(matches!(h.store.watch_error(&d), Some(StoreError::WatchNotAllowed(_))));

    let scoped = WatchDescriptor::for_type("pod").with_namespace("ns");
    h.peer.push(json!({"name": "resource.error", "resourceType": "pod", "namespace": "ns", "reason": "no_schema"}));
    assert!(eventually(|| h.store.watch_error(&scoped).is_some()).await);
    assert!(matches!(h.store.watch_error(&scoped), Some(StoreError::NoSchemaForWatch(_))));
}

#[tokio::test]
async fn too_old_code_triggers_resync() {
    let mut h = harness().await;
    h.api.get(PODS, pods(5, vec![pod("ns", "a", 1), pod("ns", "b", 2)]));
    h.store.find_all("pod", &FindOptions::default()).await.unwrap();
    h.peer.frame().await;

    h.api.get(PODS, pods(7, vec![pod("ns", "a", 7)]));
    h.peer.push(json!({"name": "resource.error", "resourceType": "pod", "reason": "too-old"}));

    assert_eq!(h.peer.frame().await, json!({"resourceType": "pod", "resourceVersion": "7"}));
    assert_eq!(h.api.count(PODS), 2);
    let ids: Vec<String> = h.store.all("pod").unwrap().iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, vec!["ns/a"]);
}
