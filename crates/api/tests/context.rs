#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use steve_api::{ApiError, Context, Scope, SteveApi, MANAGEMENT};
use steve_core::{StoreConfig, StoreResult};
use steve_transport::{Backends, Connection, Connector, Method, RawResponse, Transport};
use tokio::sync::mpsc;

const BASE: &str = "https://steve.test/v1";

#[derive(Default)]
struct Api {
    calls: Mutex<Vec<String>>,
}

impl Api {
    fn count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

fn body_for(url: &str) -> Option<Value> {
    match url {
        "https://steve.test/v1/schemas" => Some(json!({
            "type": "collection",
            "revision": "1",
            "data": [
                {"id": "modelfile", "type": "schema", "links": {"collection": "https://steve.test/v1/modelfiles"}},
                {"id": "secret", "type": "schema", "links": {}, "attributes": {"namespaced": true}},
            ],
        })),
        "https://steve.test/v1/modelfiles" => Some(json!({
            "type": "collection",
            "revision": "4",
            "data": [
                {"id": "m1", "type": "modelfile", "status": {"model": "llama3", "modelID": "sha-1", "byteSize": "4GB"}},
                {"id": "m2", "type": "modelfile", "status": {"model": "mistral", "modelID": "sha-2", "byteSize": "7GB"}},
            ],
        })),
        _ => None,
    }
}

#[async_trait]
impl Transport for Api {
    async fn send(&self, _method: Method, url: &str, _body: Option<&Value>) -> StoreResult<RawResponse> {
        self.calls.lock().unwrap().push(url.to_string());
        // slow enough for concurrent callers to overlap
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let (status, body) = match body_for(url) {
            Some(b) => (200, b),
            None => (404, json!({"message": "not found"})),
        };
        Ok(RawResponse { status, url: url.to_string(), body: serde_json::to_vec(&body).unwrap() })
    }
}

/// Accepts connections and keeps the server ends open.
#[derive(Default)]
struct Sockets {
    held: Mutex<Vec<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>>,
}

#[async_trait]
impl Connector for Sockets {
    async fn connect(&self, _url: &str) -> anyhow::Result<Connection> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.held.lock().unwrap().push((out_rx, in_tx));
        Ok(Connection::new(out_tx, in_rx))
    }
}

fn context() -> (Context, Arc<Api>) {
    let api = Arc::new(Api::default());
    let backends = Backends { transport: api.clone(), connector: Arc::new(Sockets::default()) };
    let ctx = Context::new(Arc::new(backends)).with_domain(MANAGEMENT, StoreConfig::new(BASE));
    (ctx, api)
}

#[tokio::test]
async fn modelfiles_route_filters_the_fetched_collection() {
    let (ctx, api) = context();
    let store = ctx.store(MANAGEMENT).await.unwrap();

    let hits = store.modelfiles(Some("m1")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], "m1");

    let hits = store.modelfiles(Some("MISTRAL")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], "m2");

    assert_eq!(store.modelfiles(None).await.unwrap().len(), 2);
    assert_eq!(api.count("https://steve.test/v1/modelfiles"), 1);
}

#[tokio::test]
async fn store_is_initialised_once_per_domain() {
    let (ctx, api) = context();
    let (a, b) = tokio::join!(ctx.store(MANAGEMENT), ctx.store(MANAGEMENT));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.ptr_eq(&b));
    assert_eq!(api.count("https://steve.test/v1/schemas"), 1);
    assert!(ctx.get(MANAGEMENT).unwrap().ptr_eq(&a));

    ctx.teardown();
    assert!(ctx.get(MANAGEMENT).is_none());
}

#[tokio::test]
async fn unknown_domain_and_forbidden_types_surface_as_api_errors() {
    let (ctx, _) = context();
    assert!(matches!(ctx.store("downstream").await, Err(ApiError::Validation(_))));

    let store = ctx.store(MANAGEMENT).await.unwrap();
    let err = SteveApi::list(&store, "secrets", &Scope::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));
    let err = SteveApi::get(&store, "widget", "w").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn watch_streams_applied_changes_for_the_type() {
    let (ctx, _) = context();
    let store = ctx.store(MANAGEMENT).await.unwrap();
    let mut stream = SteveApi::watch(&store, "modelfiles", &Scope::default()).await.unwrap();

    store.queue_change(json!({"id": "m3", "type": "modelfile"}), true, steve_core::EventLabel::Create);
    store.flush();
    let ev = tokio::time::timeout(std::time::Duration::from_secs(2), stream.rx.recv()).await.unwrap().unwrap();
    assert_eq!(ev.id, "m3");
    assert_eq!(ev.label, steve_core::EventLabel::Create);
    stream.cancel.cancel();
}
