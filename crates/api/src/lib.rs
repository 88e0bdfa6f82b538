//! Steve public API façade (in-process).
//!
//! Frontends (the CLI) depend on the [`SteveApi`] trait and on [`Context`],
//! which owns one live [`ResourceStore`] per API domain.

#![forbid(unsafe_code)]

mod context;
mod modelfiles;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steve_core::{FindOptions, StoreError};
use steve_schema::Schema;
use steve_store::{ResourceStore, StoreEvent};
use tracing::info;

pub use context::{BackendFactory, Context, NetworkBackends, MANAGEMENT};
pub use modelfiles::{filter_modelfiles, list_modelfiles};

/// API errors suitable for rendering to users or serialising.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let msg = e.to_string();
        match e {
            StoreError::Unauthorized { .. } => ApiError::Unauthorized(msg),
            StoreError::NotPermitted(_) | StoreError::WatchNotAllowed(_) => ApiError::Forbidden(msg),
            StoreError::UnknownType(_) | StoreError::TypeNotRegistered(_) | StoreError::NoSchemaForWatch(_) => {
                ApiError::NotFound(msg)
            }
            StoreError::Http { status: 404, .. } => ApiError::NotFound(msg),
            StoreError::Http { status: 403, .. } => ApiError::Forbidden(msg),
            StoreError::MalformedResource(_) | StoreError::Decode(_) | StoreError::Config(_) => ApiError::Validation(msg),
            StoreError::SchemasNotLoaded | StoreError::Transport(_) | StoreError::StaleWatch(_) => ApiError::Unavailable(msg),
            StoreError::Http { .. } => ApiError::Internal(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Where a listing looks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    pub namespace: Option<String>,
    /// Label selector, e.g. `app=web`.
    pub selector: Option<String>,
    /// Bypass the cache.
    pub force: bool,
}

pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Receiver plus the handle that stops its producer.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Consumer-facing operations.
#[async_trait::async_trait]
pub trait SteveApi: Send + Sync {
    /// Resources of a type within `scope`.
    async fn list(&self, ty: &str, scope: &Scope) -> ApiResult<Vec<Value>>;

    /// One resource; `ns/name` for namespaced types.
    async fn get(&self, ty: &str, id: &str) -> ApiResult<Value>;

    /// Schema of a type, looked up fuzzily.
    async fn schema(&self, ty: &str) -> ApiResult<Option<Schema>>;

    /// Blank instance for creation forms.
    async fn defaults(&self, ty: &str) -> ApiResult<Value>;

    async fn create(&self, body: Value) -> ApiResult<Value>;

    async fn delete(&self, ty: &str, id: &str) -> ApiResult<bool>;

    /// Load the type, keep it watched and stream applied changes for it.
    async fn watch(&self, ty: &str, scope: &Scope) -> ApiResult<StreamHandle<StoreEvent>>;

    /// The `modelfiles` route with its `q` filter.
    async fn modelfiles(&self, q: Option<&str>) -> ApiResult<Vec<Value>>;
}

fn values(list: Vec<steve_store::Resource>) -> Vec<Value> {
    list.iter().map(|r| r.data().as_ref().clone()).collect()
}

#[async_trait::async_trait]
impl SteveApi for ResourceStore {
    async fn list(&self, ty: &str, scope: &Scope) -> ApiResult<Vec<Value>> {
        let t0 = Instant::now();
        let opts = FindOptions { force: scope.force, ..FindOptions::default() };
        let out = match (scope.namespace.as_deref(), scope.selector.as_deref()) {
            (ns, Some(sel)) => {
                let found = self.find_matching(ty, sel, &opts).await?;
                found.into_iter().filter(|r| ns.is_none() || r.namespace().as_deref() == ns).collect()
            }
            (Some(ns), None) => self.find_namespace(ty, ns, &opts).await?,
            (None, None) => self.find_all(ty, &opts).await?,
        };
        info!(ty = %ty, items = out.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(values(out))
    }

    async fn get(&self, ty: &str, id: &str) -> ApiResult<Value> {
        let r = self.find(ty, id, &FindOptions::default()).await?;
        Ok(r.data().as_ref().clone())
    }

    async fn schema(&self, ty: &str) -> ApiResult<Option<Schema>> {
        Ok(self.schema_for(ty, true, true)?)
    }

    async fn defaults(&self, ty: &str) -> ApiResult<Value> {
        Ok(self.default_for(ty)?)
    }

    async fn create(&self, body: Value) -> ApiResult<Value> {
        let r = ResourceStore::create(self, body).await?;
        Ok(r.data().as_ref().clone())
    }

    async fn delete(&self, ty: &str, id: &str) -> ApiResult<bool> {
        Ok(self.destroy(ty, id).await?)
    }

    async fn watch(&self, ty: &str, scope: &Scope) -> ApiResult<StreamHandle<StoreEvent>> {
        use tokio::sync::{broadcast, mpsc};
        let mut events = self.events();
        SteveApi::list(self, ty, scope).await?;
        let want = steve_core::normalize_type(ty);
        info!(ty = %want, "api: watch start");
        let cap = std::env::var("STEVE_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        let (tx, rx) = mpsc::channel::<StoreEvent>(cap);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) if ev.resource_type == want => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        metrics::counter!("api_watch_lagged_total", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("api: watch ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { task: Some(handle) } })
    }

    async fn modelfiles(&self, q: Option<&str>) -> ApiResult<Vec<Value>> {
        list_modelfiles(self, q).await
    }
}
