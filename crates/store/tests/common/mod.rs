#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use steve_core::{StoreConfig, StoreResult};
use steve_store::ResourceStore;
use steve_transport::{Backends, Connection, Connector, Method, RawResponse, Transport};
use tokio::sync::mpsc;

pub const BASE: &str = "https://steve.test/v1";

struct Route {
    method: Method,
    url: String,
    status: u16,
    body: Value,
}

/// In-process HTTP backend. Later routes shadow earlier ones for the same URL.
#[derive(Default)]
pub struct FakeApi {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<(Method, String, Option<Value>)>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, method: Method, url: &str, status: u16, body: Value) {
        self.routes.lock().unwrap().push(Route { method, url: url.to_string(), status, body });
    }

    pub fn get(&self, url: &str, body: Value) {
        self.on(Method::Get, url, 200, body);
    }

    pub fn calls(&self) -> Vec<(Method, String, Option<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(_, u, _)| u == url).count()
    }
}

#[async_trait]
impl Transport for FakeApi {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> StoreResult<RawResponse> {
        self.calls.lock().unwrap().push((method, url.to_string(), body.cloned()));
        let routes = self.routes.lock().unwrap();
        let (status, body) = routes
            .iter()
            .rev()
            .find(|r| r.method == method && r.url == url)
            .map(|r| (r.status, r.body.clone()))
            .unwrap_or((404, json!({"message": format!("no route for {url}")})));
        Ok(RawResponse { status, url: url.to_string(), body: serde_json::to_vec(&body).unwrap() })
    }
}

/// Server side of one fake socket connection.
pub struct Peer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl Peer {
    pub async fn frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("frame in time")
            .expect("connection open");
        serde_json::from_str(&text).unwrap()
    }

    /// True when nothing arrives within `ms`.
    pub async fn quiet(&mut self, ms: u64) -> bool {
        tokio::time::timeout(Duration::from_millis(ms), self.from_client.recv()).await.is_err()
    }

    pub fn push(&self, msg: Value) {
        self.to_client.send(msg.to_string()).unwrap();
    }
}

#[derive(Default)]
pub struct FakeSocket {
    peers: Mutex<Vec<Peer>>,
}

impl FakeSocket {
    /// Oldest connection not yet taken, waiting for it if needed.
    pub async fn peer(&self) -> Peer {
        for _ in 0..400 {
            {
                let mut peers = self.peers.lock().unwrap();
                if !peers.is_empty() {
                    return peers.remove(0);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no socket connection");
    }
}

#[async_trait]
impl Connector for FakeSocket {
    async fn connect(&self, _url: &str) -> anyhow::Result<Connection> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().push(Peer { from_client: out_rx, to_client: in_tx });
        Ok(Connection::new(out_tx, in_rx))
    }
}

pub fn config() -> StoreConfig {
    let mut cfg = StoreConfig::new(BASE);
    cfg.flush_interval = Duration::from_secs(3600);
    cfg.stop_retry_delay = Duration::from_millis(30);
    cfg.reconnect_min = Duration::from_millis(10);
    cfg.reconnect_max = Duration::from_millis(40);
    cfg.poll_interval = None;
    cfg
}

pub fn schema(id: &str, collection: Option<&str>, verbs: Option<&[&str]>, namespaced: bool) -> Value {
    let mut s = json!({
        "id": id,
        "type": "schema",
        "links": {},
        "attributes": { "namespaced": namespaced },
        "resourceFields": {},
    });
    if let Some(c) = collection {
        s["links"]["collection"] = json!(c);
    }
    if let Some(vs) = verbs {
        s["attributes"]["verbs"] = json!(vs);
    }
    s
}

pub fn schemas() -> Value {
    let watchable: &[&str] = &["get", "list", "watch"];
    let mut pod = schema("pod", Some("https://steve.test/v1/pods"), Some(watchable), true);
    pod["resourceFields"] = json!({
        "metadata": { "type": "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta" },
        "status": { "type": "podstatus" },
        "spec": { "type": "podspec" },
        "containers": { "type": "array[container]" },
        "owner": { "type": "reference[node]" },
        "restartPolicy": { "type": "string", "default": "Always" },
    });
    let mut spec = schema("podspec", None, None, false);
    spec["resourceFields"] = json!({
        "hostname": "string",
        "dnsPolicy": { "type": "string", "default": "ClusterFirst" },
    });
    json!({
        "type": "collection",
        "revision": "1",
        "data": [
            pod,
            spec,
            schema("node", Some("https://steve.test/v1/nodes"), Some(&["get", "list"][..]), false),
            schema("secret", None, Some(watchable), true),
            schema("apps.deployment", Some("https://steve.test/v1/apps.deployments"), Some(watchable), true),
            schema("extensions.apps.deployment", Some("https://steve.test/v1/extensions.apps.deployments"), None, true),
            schema("modelfile", Some("https://steve.test/v1/modelfiles"), None, false),
        ],
    })
}

pub fn pod(ns: &str, name: &str, rv: u64) -> Value {
    json!({
        "id": format!("{ns}/{name}"),
        "type": "pod",
        "metadata": { "name": name, "namespace": ns, "resourceVersion": rv.to_string(), "labels": { "app": name } },
    })
}

pub fn pods(rev: u64, items: Vec<Value>) -> Value {
    json!({ "type": "collection", "revision": rev.to_string(), "data": items })
}

/// Poll `cond` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub struct Harness {
    pub store: ResourceStore,
    pub api: Arc<FakeApi>,
    pub socket: Arc<FakeSocket>,
    pub peer: Peer,
}

/// Store with schemas loaded and a live socket; the schema watch frame has
/// already been consumed from `peer`.
pub async fn harness() -> Harness {
    harness_with(config()).await
}

pub async fn harness_with(cfg: StoreConfig) -> Harness {
    let api = FakeApi::new();
    api.get("https://steve.test/v1/schemas", schemas());
    let socket = Arc::new(FakeSocket::default());
    let store = ResourceStore::new(cfg, Backends { transport: api.clone(), connector: socket.clone() }).unwrap();
    store.load_schemas().await.unwrap();
    store.subscribe();
    let mut peer = socket.peer().await;
    let first = peer.frame().await;
    assert_eq!(first["resourceType"], "schema");
    assert!(eventually(|| store.is_live()).await);
    Harness { store, api, socket, peer }
}

/// Store with no schemas and no socket subscription.
pub fn bare_store() -> (ResourceStore, Arc<FakeApi>) {
    let api = FakeApi::new();
    let socket = Arc::new(FakeSocket::default());
    let store = ResourceStore::new(config(), Backends { transport: api.clone(), connector: socket }).unwrap();
    (store, api)
}
