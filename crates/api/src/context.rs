//! Explicit per-domain store ownership.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use steve_core::{lock, StoreConfig, StoreResult};
use steve_store::ResourceStore;
use steve_transport::Backends;
use tokio::sync::OnceCell;
use tracing::info;

use crate::{ApiError, ApiResult};

/// Domain name of the primary management API.
pub const MANAGEMENT: &str = "management";

/// Builds the HTTP/socket backends for a domain's store.
pub trait BackendFactory: Send + Sync {
    fn backends(&self, cfg: &StoreConfig) -> StoreResult<Backends>;
}

/// reqwest + tokio-tungstenite.
pub struct NetworkBackends;

impl BackendFactory for NetworkBackends {
    fn backends(&self, cfg: &StoreConfig) -> StoreResult<Backends> {
        Backends::network(cfg)
    }
}

/// Backends shared by every domain; handy for tests and embedding.
impl BackendFactory for Backends {
    fn backends(&self, _cfg: &StoreConfig) -> StoreResult<Backends> {
        Ok(self.clone())
    }
}

/// Owns at most one [`ResourceStore`] per domain. Stores are created on first
/// use: built, subscribed and given their schemas exactly once even under
/// concurrent callers. A failed initialisation is retried on the next call.
pub struct Context {
    factory: Arc<dyn BackendFactory>,
    configs: Mutex<HashMap<String, StoreConfig>>,
    stores: Mutex<HashMap<String, Arc<OnceCell<ResourceStore>>>>,
}

impl Context {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self { factory, configs: Mutex::new(HashMap::new()), stores: Mutex::new(HashMap::new()) }
    }

    /// Declare (or replace) the configuration of `domain`. An already running
    /// store keeps its old configuration until [`Context::teardown`].
    pub fn register(&self, domain: &str, cfg: StoreConfig) {
        lock(&self.configs).insert(domain.to_string(), cfg);
    }

    pub fn with_domain(self, domain: &str, cfg: StoreConfig) -> Self {
        self.register(domain, cfg);
        self
    }

    pub fn domains(&self) -> Vec<String> {
        let mut out: Vec<String> = lock(&self.configs).keys().cloned().collect();
        out.sort();
        out
    }

    /// Store for `domain`, initialising it on first use.
    pub async fn store(&self, domain: &str) -> ApiResult<ResourceStore> {
        let cfg = lock(&self.configs)
            .get(domain)
            .cloned()
            .ok_or_else(|| ApiError::Validation(format!("unknown domain {domain}")))?;
        let cell = lock(&self.stores).entry(domain.to_string()).or_default().clone();
        let store = cell
            .get_or_try_init(move || async move {
                let t0 = Instant::now();
                let backends = self.factory.backends(&cfg)?;
                let store = ResourceStore::new(cfg, backends)?;
                store.subscribe();
                let schemas = store.load_schemas().await?;
                info!(domain = %domain, schemas, took_ms = %t0.elapsed().as_millis(), "api: store ready");
                Ok::<_, ApiError>(store)
            })
            .await?;
        Ok(store.clone())
    }

    /// Store for `domain` if it has been initialised.
    pub fn get(&self, domain: &str) -> Option<ResourceStore> {
        lock(&self.stores).get(domain).and_then(|c| c.get().cloned())
    }

    /// Close every store's socket and forget them.
    pub fn teardown(&self) {
        let stores: Vec<(String, Arc<OnceCell<ResourceStore>>)> = lock(&self.stores).drain().collect();
        for (domain, cell) in stores {
            if let Some(store) = cell.get() {
                store.unsubscribe(true);
                info!(domain = %domain, "api: store torn down");
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}
