//! The resource store: find family, load/remove, watch state machine, change
//! queue and flush, resync, schema lookups and URL building.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use steve_core::{
    field_str, normalize_type, prelude::*, LabelSelector, SocketMessage, SortOrder, WatchEvent, WatchRequest,
};
use steve_schema::Schema;
use steve_transport::{Backends, HttpClient, Method, Request, Socket, SocketEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::lock;
use crate::queue::ChangeQueue;
use crate::resource::Resource;
use crate::type_cache::TypeCache;
use crate::watch::WatchBook;

/// Published after a queued change has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreEvent {
    pub label: EventLabel,
    pub resource_type: String,
    pub id: String,
}

#[derive(Default)]
struct StoreState {
    types: FxHashMap<String, TypeCache>,
    watches: WatchBook,
    queue: ChangeQueue,
    generation: u64,
    live: bool,
    polling: FxHashSet<String>,
}

struct Inner {
    config: StoreConfig,
    http: HttpClient,
    socket: Socket,
    state: Mutex<StoreState>,
    flushing: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
    generation_tx: watch::Sender<u64>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.socket.disconnect();
        if let Some(h) = lock(&self.pump).take() {
            h.abort();
        }
    }
}

/// Cache of server resources for one API domain, kept current over the
/// subscribe socket. Cheap to clone; all clones share one cache.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<Inner>,
}

impl ResourceStore {
    /// Build a store and spawn its event pump. Must run inside a tokio runtime.
    /// The socket is not opened until [`ResourceStore::subscribe`].
    pub fn new(config: StoreConfig, backends: Backends) -> StoreResult<Self> {
        let http = HttpClient::new(&config.base_url, backends.transport)?;
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let socket = Socket::new(backends.connector, ev_tx, config.reconnect_min, config.reconnect_max);
        let (events, _) = broadcast::channel(1024);
        let (generation_tx, _) = watch::channel(0u64);
        let every = config.flush_interval;
        let inner = Arc::new(Inner {
            config,
            http,
            socket,
            state: Mutex::new(StoreState::default()),
            flushing: Mutex::new(()),
            events,
            generation_tx,
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(pump(Arc::downgrade(&inner), ev_rx, every));
        *lock(&inner.pump) = Some(handle);
        info!(base = %inner.config.base_url, "store: created");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Both handles refer to the same store.
    pub fn ptr_eq(&self, other: &ResourceStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        lock(&self.inner.state)
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    // ----- find family -------------------------------------------------------

    /// All resources of a type. Served from cache once the type is complete,
    /// otherwise one (depaginated) fetch loaded per `opts.load`.
    pub async fn find_all(&self, ty: &str, opts: &FindOptions) -> StoreResult<Vec<Resource>> {
        let ty = normalize_type(ty);
        if !opts.force {
            let cached = {
                let st = self.state();
                st.types.get(&ty).filter(|c| c.have_all()).map(|c| (c.list().to_vec(), c.revision()))
            };
            if let Some((list, revision)) = cached {
                if opts.watch {
                    self.watch_scope(&ty, WatchDescriptor::for_type(&ty), Some(revision), opts);
                }
                trace!(ty = %ty, items = list.len(), "store: find_all cached");
                return Ok(list);
            }
        }
        let t0 = Instant::now();
        let url = self.url_for(&ty, None, opts)?;
        let resp = self.inner.http.request(Request::get(url).depaginated(opts.depaginate)).await?;
        let revision = resp.revision();
        let items = with_type(resp.into_items(), &ty);
        let out = match opts.load {
            LoadMode::All => self.load_all(&ty, items, revision),
            LoadMode::Multi => {
                let out = self.load_multi(items);
                if let Some(rev) = revision {
                    self.raise_revision(&ty, rev);
                }
                out
            }
            LoadMode::None => detached(&ty, items),
        };
        if opts.load != LoadMode::None && opts.watch {
            self.watch_scope(&ty, WatchDescriptor::for_type(&ty), revision, opts);
        }
        info!(ty = %ty, items = out.len(), took_ms = %t0.elapsed().as_millis(), "store: find_all ok");
        Ok(out)
    }

    /// One resource by id. `ns/name` ids scope the follow-up watch to the namespace.
    pub async fn find(&self, ty: &str, id: &str, opts: &FindOptions) -> StoreResult<Resource> {
        let ty = normalize_type(ty);
        if !opts.force {
            if let Some(r) = self.by_id(&ty, id) {
                return Ok(r);
            }
        }
        let url = self.url_for(&ty, Some(id), opts)?;
        let resp = self.inner.http.request(Request::get(url)).await?;
        let mut raw = resp.body;
        fill_type(&mut raw, &ty);
        let loaded = match opts.load {
            LoadMode::None => detached(&ty, vec![raw]).pop(),
            _ => self.load(raw),
        };
        let res = loaded.ok_or_else(|| StoreError::MalformedResource(format!("{ty}/{id}")))?;
        if opts.load != LoadMode::None && opts.watch {
            let d = match id.split_once('/') {
                Some((ns, name)) => WatchDescriptor::for_type(&ty).with_namespace(ns).with_id(name),
                None => WatchDescriptor::for_type(&ty).with_id(id),
            };
            self.watch_scope(&ty, d, res.resource_version(), opts);
        }
        debug!(ty = %ty, id = %id, "store: find ok");
        Ok(res)
    }

    /// Resources matching a label selector, tracked per selector string.
    pub async fn find_matching(&self, ty: &str, selector: &str, opts: &FindOptions) -> StoreResult<Vec<Resource>> {
        let ty = normalize_type(ty);
        let sel = LabelSelector::parse(selector)?;
        if !opts.force {
            let cached = {
                let st = self.state();
                st.types
                    .get(&ty)
                    .filter(|c| c.have_all() || c.have_selector(selector))
                    .map(|c| c.list().iter().filter(|r| sel.matches_value(&r.data())).cloned().collect::<Vec<_>>())
            };
            if let Some(list) = cached {
                return Ok(list);
            }
        }
        let url = self.url_for(&ty, None, opts)?;
        let url = append_query(&url, &[("labelSelector", selector)])?;
        let resp = self.inner.http.request(Request::get(url).depaginated(opts.depaginate)).await?;
        let revision = resp.revision();
        let items = with_type(resp.into_items(), &ty);
        let out = match opts.load {
            LoadMode::None => detached(&ty, items),
            mode => {
                let out = self.load_multi(items);
                let mut st = self.state();
                let cache = st.types.entry(ty.clone()).or_default();
                if let Some(rev) = revision {
                    cache.raise_revision(rev);
                }
                if mode == LoadMode::All {
                    cache.set_have_selector(selector);
                }
                out
            }
        };
        if opts.load != LoadMode::None && opts.watch {
            self.watch_scope(&ty, WatchDescriptor::for_type(&ty).with_selector(selector), revision, opts);
        }
        info!(ty = %ty, selector = %selector, items = out.len(), "store: find_matching ok");
        Ok(out)
    }

    /// Resources of one namespace, fetched from `<collection>/<namespace>`.
    pub async fn find_namespace(&self, ty: &str, namespace: &str, opts: &FindOptions) -> StoreResult<Vec<Resource>> {
        let ty = normalize_type(ty);
        if !opts.force {
            let cached = {
                let st = self.state();
                st.types.get(&ty).filter(|c| c.have_all() || c.have_namespace(namespace)).map(|c| {
                    c.list().iter().filter(|r| r.namespace().as_deref() == Some(namespace)).cloned().collect::<Vec<_>>()
                })
            };
            if let Some(list) = cached {
                return Ok(list);
            }
        }
        let url = self.url_for(&ty, Some(namespace), opts)?;
        let resp = self.inner.http.request(Request::get(url).depaginated(opts.depaginate)).await?;
        let revision = resp.revision();
        let items = with_type(resp.into_items(), &ty);
        let out = match opts.load {
            LoadMode::None => detached(&ty, items),
            mode => {
                let out = self.load_multi(items);
                let mut st = self.state();
                let cache = st.types.entry(ty.clone()).or_default();
                if let Some(rev) = revision {
                    cache.raise_revision(rev);
                }
                if mode == LoadMode::All {
                    cache.set_have_namespace(namespace);
                }
                out
            }
        };
        if opts.load != LoadMode::None && opts.watch {
            self.watch_scope(&ty, WatchDescriptor::for_type(&ty).with_namespace(namespace), revision, opts);
        }
        info!(ty = %ty, namespace = %namespace, items = out.len(), "store: find_namespace ok");
        Ok(out)
    }

    /// Watch after a load. `watch_namespace` narrows whole-type scopes.
    fn watch_scope(&self, ty: &str, mut d: WatchDescriptor, revision: Option<u64>, opts: &FindOptions) {
        if d.namespace.is_none() && d.id.is_none() {
            d.namespace = opts.watch_namespace.clone();
        }
        let revision = revision.or_else(|| Some(self.revision(ty)).filter(|r| *r > 0));
        self.watch(d.with_revision(revision), opts.force_watch);
    }

    // ----- cache mutation ----------------------------------------------------

    /// Upsert one raw resource. Resources without `type` or `id` are logged and
    /// dropped. Existing handles are updated in place.
    pub fn load(&self, raw: Value) -> Option<Resource> {
        let Some(raw_type) = field_str(&raw, "type").map(str::to_string) else {
            warn!(error = %StoreError::MalformedResource("missing type".into()), "store: load rejected");
            counter!("store_malformed_total", 1u64);
            return None;
        };
        let ty = normalize_type(&raw_type);
        let Some(id) = cache_id(&ty, &raw) else {
            warn!(ty = %ty, error = %StoreError::MalformedResource("missing id".into()), "store: load rejected");
            counter!("store_malformed_total", 1u64);
            return None;
        };
        let base = field_str(&raw, "baseType").map(normalize_type).filter(|b| !b.is_empty() && *b != ty);
        let (res, created, generation) = {
            let mut st = self.state();
            st.generation += 1;
            let generation = st.generation;
            let cache = st.types.entry(ty.clone()).or_default();
            cache.note_server_type(&raw_type);
            let (res, created) = cache.upsert(&ty, &id, raw);
            if let Some(base) = base {
                st.types.entry(base).or_default().link(&res);
            }
            (res, created, generation)
        };
        let _ = self.inner.generation_tx.send(generation);
        counter!("store_loads_total", 1u64);
        trace!(ty = %ty, id = %id, created, "store: load");
        self.arm_poller(&res);
        Some(res)
    }

    /// Replace a type's content with `items` and mark it complete.
    pub fn load_all(&self, ty: &str, items: Vec<Value>, revision: Option<u64>) -> Vec<Resource> {
        let ty = normalize_type(ty);
        let mut entries = Vec::with_capacity(items.len());
        let mut raw_type = None;
        for raw in items {
            match cache_id(&ty, &raw) {
                Some(id) => {
                    if raw_type.is_none() {
                        raw_type = field_str(&raw, "type").map(str::to_string);
                    }
                    entries.push((id, raw));
                }
                None => warn!(ty = %ty, "store: load_all skipped resource without id"),
            }
        }
        let (out, generation) = {
            let mut st = self.state();
            st.generation += 1;
            let generation = st.generation;
            let cache = st.types.entry(ty.clone()).or_default();
            if let Some(rt) = raw_type.as_deref() {
                cache.note_server_type(rt);
            }
            let out = cache.replace_all(&ty, entries);
            cache.set_have_all();
            if let Some(rev) = revision {
                cache.raise_revision(rev);
            }
            (out, generation)
        };
        let _ = self.inner.generation_tx.send(generation);
        counter!("store_loads_total", out.len() as u64);
        for r in out.iter() {
            self.arm_poller(r);
        }
        out
    }

    /// Merge without clearing or marking the type complete.
    pub fn load_multi(&self, items: Vec<Value>) -> Vec<Resource> {
        items.into_iter().filter_map(|raw| self.load(raw)).collect()
    }

    pub fn remove(&self, ty: &str, id: &str) -> bool {
        let ty = normalize_type(ty);
        let id = if ty == SCHEMA { normalize_type(id) } else { id.to_string() };
        let generation = {
            let mut st = self.state();
            let Some(removed) = st.types.get_mut(&ty).and_then(|c| c.remove(&id)) else {
                return false;
            };
            let base = field_str(&removed.data(), "baseType").map(normalize_type);
            if let Some(base) = base.filter(|b| *b != ty) {
                if let Some(c) = st.types.get_mut(&base) {
                    c.remove(&id);
                }
            }
            st.generation += 1;
            st.generation
        };
        let _ = self.inner.generation_tx.send(generation);
        debug!(ty = %ty, id = %id, "store: removed");
        true
    }

    pub fn remove_resource(&self, r: &Resource) -> bool {
        self.remove(r.resource_type(), r.id())
    }

    /// Register an empty cache for `ty` if it has none.
    pub fn ensure_type(&self, ty: &str) {
        self.state().types.entry(normalize_type(ty)).or_default();
    }

    /// Drop a type's cache and stop its watches.
    pub fn forget_type(&self, ty: &str) -> bool {
        let ty = normalize_type(ty);
        let (existed, stopped) = {
            let mut st = self.state();
            let stopped = st.watches.forget_type(&ty);
            for d in stopped.iter() {
                st.watches.mark_stopping(d);
            }
            st.queue.discard_type(&ty);
            st.generation += 1;
            (st.types.remove(&ty).is_some(), stopped)
        };
        let wire = self.wire_type(&ty);
        for d in stopped.iter() {
            self.send_frame(&WatchRequest::stop(d, &wire));
        }
        info!(ty = %ty, existed, watches = stopped.len(), "store: type forgotten");
        existed
    }

    // ----- accessors ---------------------------------------------------------

    /// Cached resources of a registered type.
    pub fn all(&self, ty: &str) -> StoreResult<Vec<Resource>> {
        let ty = normalize_type(ty);
        self.state()
            .types
            .get(&ty)
            .map(|c| c.list().to_vec())
            .ok_or(StoreError::TypeNotRegistered(ty))
    }

    pub fn by_id(&self, ty: &str, id: &str) -> Option<Resource> {
        let ty = normalize_type(ty);
        let id = if ty == SCHEMA { normalize_type(id) } else { id.to_string() };
        self.state().types.get(&ty).and_then(|c| c.get(&id)).cloned()
    }

    pub fn have_all(&self, ty: &str) -> bool {
        self.state().types.get(&normalize_type(ty)).map(|c| c.have_all()).unwrap_or(false)
    }

    pub fn have_selector(&self, ty: &str, selector: &str) -> bool {
        self.state().types.get(&normalize_type(ty)).map(|c| c.have_selector(selector)).unwrap_or(false)
    }

    pub fn have_namespace(&self, ty: &str, namespace: &str) -> bool {
        self.state().types.get(&normalize_type(ty)).map(|c| c.have_namespace(namespace)).unwrap_or(false)
    }

    /// Revision watermark of a type; 0 when unknown.
    pub fn revision(&self, ty: &str) -> u64 {
        self.state().types.get(&normalize_type(ty)).map(|c| c.revision()).unwrap_or(0)
    }

    /// Store-wide mutation counter.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut out: Vec<String> = self.state().types.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn generation_watch(&self) -> watch::Receiver<u64> {
        self.inner.generation_tx.subscribe()
    }

    fn raise_revision(&self, ty: &str, revision: u64) {
        self.state().types.entry(ty.to_string()).or_default().raise_revision(revision);
    }

    // ----- schemas and urls --------------------------------------------------

    /// Schema for `ty` by canonical id, or with `fuzzy` the shortest schema id
    /// ending in `.<ty>`. Before schemas are loaded this fails with
    /// `SchemasNotLoaded` unless `allow_throw` is false.
    pub fn schema_for(&self, ty: &str, fuzzy: bool, allow_throw: bool) -> StoreResult<Option<Schema>> {
        let key = normalize_type(ty);
        let st = self.state();
        let Some(cache) = st.types.get(SCHEMA).filter(|c| c.have_all() || !c.is_empty()) else {
            return if allow_throw { Err(StoreError::SchemasNotLoaded) } else { Ok(None) };
        };
        if let Some(r) = cache.get(&key) {
            return Ok(Schema::from_value(&r.data()));
        }
        if fuzzy {
            let suffix = format!(".{key}");
            let best = cache.list().iter().filter(|r| r.id().ends_with(&suffix)).min_by_key(|r| r.id().len());
            if let Some(r) = best {
                return Ok(Schema::from_value(&r.data()));
            }
        }
        Ok(None)
    }

    /// Collection (or `/id`) URL for `ty` with filter, limit and sort applied.
    pub fn url_for(&self, ty: &str, id: Option<&str>, opts: &FindOptions) -> StoreResult<String> {
        let base = match &opts.url {
            Some(u) => u.clone(),
            None => {
                let schema = self.schema_for(ty, false, true)?.ok_or_else(|| StoreError::UnknownType(normalize_type(ty)))?;
                schema.collection_url.ok_or_else(|| StoreError::NotPermitted(schema.id.clone()))?
            }
        };
        let mut url = base.trim_end_matches('/').to_string();
        if let Some(id) = id {
            url.push('/');
            url.push_str(id.trim_start_matches('/'));
        }
        let url = self.inner.http.resolve(&url)?;
        let mut params: Vec<(String, String)> = opts.filter.iter().map(|(k, v)| ("filter".to_string(), format!("{k}={v}"))).collect();
        if let Some(limit) = opts.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if let Some(sort) = &opts.sort_by {
            params.push(("sort".into(), sort.clone()));
            if opts.sort_order == SortOrder::Desc {
                params.push(("order".into(), "desc".into()));
            }
        }
        if params.is_empty() {
            return Ok(url);
        }
        let pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        append_query(&url, &pairs)
    }

    /// Blank instance of `ty` built from its schema.
    pub fn default_for(&self, ty: &str) -> StoreResult<Value> {
        let schema = self.schema_for(ty, false, true)?.ok_or_else(|| StoreError::UnknownType(normalize_type(ty)))?;
        let lookup = |id: &str| self.schema_for(id, false, false).ok().flatten();
        let mut out = steve_schema::default_for(&schema, &lookup, &self.inner.config.default_namespace);
        if let Some(obj) = out.as_object_mut() {
            obj.entry("type").or_insert_with(|| Value::String(schema.id.clone()));
        }
        Ok(out)
    }

    /// Fetch every schema into the `schema` type cache.
    pub async fn load_schemas(&self) -> StoreResult<usize> {
        let opts = FindOptions { url: Some(self.inner.config.schemas_url.clone()), ..FindOptions::default() };
        let schemas = self.find_all(SCHEMA, &opts).await?;
        info!(count = schemas.len(), "store: schemas loaded");
        Ok(schemas.len())
    }

    fn wire_type(&self, ty: &str) -> String {
        if let Ok(Some(schema)) = self.schema_for(ty, false, false) {
            return schema.id;
        }
        self.state()
            .types
            .get(ty)
            .and_then(|c| c.server_type().map(str::to_string))
            .unwrap_or_else(|| ty.to_string())
    }

    fn watchable(&self, ty: &str) -> bool {
        match self.schema_for(ty, false, false) {
            Ok(Some(schema)) => schema.watchable(),
            _ => ty == SCHEMA,
        }
    }

    // ----- remote mutations --------------------------------------------------

    /// POST a new resource to its type's collection and cache the result.
    pub async fn create(&self, raw: Value) -> StoreResult<Resource> {
        let ty = field_str(&raw, "type")
            .map(normalize_type)
            .ok_or_else(|| StoreError::MalformedResource("create without type".into()))?;
        let url = self.url_for(&ty, None, &FindOptions::default())?;
        let resp = self.inner.http.request(Request::new(Method::Post, url).with_body(raw)).await?;
        let mut body = resp.body;
        fill_type(&mut body, &ty);
        let res = self.load(body).ok_or_else(|| StoreError::MalformedResource(format!("{ty}: created without id")))?;
        info!(ty = %ty, id = %res.id(), "store: created");
        Ok(res)
    }

    /// PUT an existing resource back, to `links.update` when present.
    pub async fn save(&self, raw: Value) -> StoreResult<Resource> {
        let ty = field_str(&raw, "type")
            .map(normalize_type)
            .ok_or_else(|| StoreError::MalformedResource("save without type".into()))?;
        let id = field_str(&raw, "id").ok_or_else(|| StoreError::MalformedResource(format!("{ty}: save without id")))?;
        let url = match raw.get("links").and_then(|l| l.get("update")).and_then(|u| u.as_str()) {
            Some(u) => u.to_string(),
            None => self.url_for(&ty, Some(id), &FindOptions::default())?,
        };
        let resp = self.inner.http.request(Request::new(Method::Put, url).with_body(raw)).await?;
        let mut body = resp.body;
        fill_type(&mut body, &ty);
        self.load(body).ok_or_else(|| StoreError::MalformedResource(format!("{ty}: saved without id")))
    }

    /// DELETE on the server, then drop the cached copy.
    pub async fn destroy(&self, ty: &str, id: &str) -> StoreResult<bool> {
        let url = self.url_for(ty, Some(id), &FindOptions::default())?;
        self.inner.http.request(Request::new(Method::Delete, url)).await?;
        Ok(self.remove(ty, id))
    }

    // ----- watches -----------------------------------------------------------

    /// Open the subscribe socket.
    pub fn subscribe(&self) {
        self.inner.socket.subscribe(&self.inner.config.subscribe_url());
    }

    /// Stop every started watch; with `disconnect` also close the socket and
    /// drop buffered frames.
    pub fn unsubscribe(&self, disconnect: bool) {
        let stopped = {
            let mut st = self.state();
            let stopped = st.watches.take_all_started();
            if disconnect {
                st.live = false;
            } else {
                for d in stopped.iter() {
                    st.watches.mark_stopping(d);
                }
            }
            stopped
        };
        if disconnect {
            self.inner.socket.disconnect();
        } else {
            for d in stopped.iter() {
                let wire = self.wire_type(&d.resource_type);
                self.send_frame(&WatchRequest::stop(d, &wire));
            }
        }
        info!(watches = stopped.len(), disconnect, "store: unsubscribed");
    }

    /// Request a live subscription for `d`. Skipped when the scope is in error
    /// or already started (unless forced) or when the type cannot be watched.
    /// Returns whether a start frame was issued.
    pub fn watch(&self, d: WatchDescriptor, force: bool) -> bool {
        let mut d = d;
        d.resource_type = normalize_type(&d.resource_type);
        let ty = d.resource_type.clone();
        if !self.watchable(&ty) {
            debug!(ty = %ty, "store: watch skipped, type not watchable");
            return false;
        }
        let wire = self.wire_type(&ty);
        {
            let mut st = self.state();
            if !force {
                if let Some(err) = st.watches.error(&d) {
                    debug!(key = %d.key(), error = %err, "store: watch suppressed");
                    return false;
                }
                if st.watches.is_started(&d) {
                    trace!(key = %d.key(), "store: watch already started");
                    return false;
                }
            }
            st.watches.mark_started(d.clone());
        }
        debug!(key = %d.key(), revision = ?d.revision, "store: watch");
        self.send_frame(&WatchRequest::start(&d, &wire));
        true
    }

    /// Stop a started watch. Returns false when it was not started.
    pub fn unwatch(&self, d: &WatchDescriptor) -> bool {
        let stopped = {
            let mut st = self.state();
            let stopped = st.watches.remove_started(d);
            if let Some(s) = &stopped {
                st.watches.mark_stopping(s);
            }
            stopped
        };
        let Some(d) = stopped else { return false };
        let wire = self.wire_type(&d.resource_type);
        self.send_frame(&WatchRequest::stop(&d, &wire));
        true
    }

    pub fn started_watches(&self) -> Vec<WatchDescriptor> {
        self.state().watches.started().to_vec()
    }

    pub fn watch_error(&self, d: &WatchDescriptor) -> Option<StoreError> {
        self.state().watches.error(d).cloned()
    }

    pub fn clear_watch_error(&self, d: &WatchDescriptor) -> bool {
        self.state().watches.clear_error(d)
    }

    pub fn is_live(&self) -> bool {
        self.state().live
    }

    fn send_frame(&self, req: &WatchRequest) {
        match serde_json::to_string(req) {
            Ok(frame) => {
                let kind = if req.stop == Some(true) { "stop" } else { "start" };
                counter!("store_watch_frames_total", 1u64, "kind" => kind);
                if !self.inner.socket.send(frame) {
                    trace!(ty = %req.resource_type, kind, "store: frame buffered");
                }
            }
            Err(e) => warn!(error = %e, "store: watch frame not encoded"),
        }
    }

    /// Re-fetch the scope of `d`, drop cached entries the server no longer
    /// has, load the rest and watch again from the fresh revision.
    pub async fn resync_watch(&self, d: &WatchDescriptor) -> StoreResult<()> {
        let t0 = Instant::now();
        let ty = normalize_type(&d.resource_type);
        let selector = match d.selector.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(LabelSelector::parse(s)?),
            None => None,
        };
        let opts = FindOptions { force: true, watch: false, ..FindOptions::default() };
        let (fresh, revision) = match (&d.id, &d.namespace) {
            (Some(id), ns) => {
                let full = match ns {
                    Some(ns) => format!("{ns}/{id}"),
                    None => id.clone(),
                };
                let url = self.url_for(&ty, Some(&full), &opts)?;
                match self.inner.http.request(Request::get(url)).await {
                    Ok(resp) => {
                        let rev = resp.revision();
                        (with_type(resp.into_items(), &ty), rev)
                    }
                    Err(e) if e.is_not_found() => (Vec::new(), None),
                    Err(e) => return Err(e),
                }
            }
            (None, ns) => {
                let url = self.url_for(&ty, ns.as_deref(), &opts)?;
                let url = match d.selector.as_deref().filter(|s| !s.is_empty()) {
                    Some(s) => append_query(&url, &[("labelSelector", s)])?,
                    None => url,
                };
                let resp = self.inner.http.request(Request::get(url).depaginated(true)).await?;
                let rev = resp.revision();
                (with_type(resp.into_items(), &ty), rev)
            }
        };
        let keep: FxHashSet<String> = fresh.iter().filter_map(|raw| cache_id(&ty, raw)).collect();
        let stale: Vec<String> = {
            let st = self.state();
            st.types
                .get(&ty)
                .map(|c| {
                    c.list()
                        .iter()
                        .filter(|r| in_scope(r, d, selector.as_ref()) && !keep.contains(r.id()))
                        .map(|r| r.id().to_string())
                        .collect()
                })
                .unwrap_or_default()
        };
        for id in stale.iter() {
            if !self.remove(&ty, id) {
                debug!(ty = %ty, id = %id, "store: resync removal skipped");
            }
        }
        let loaded = self.load_multi(fresh).len();
        {
            let mut st = self.state();
            let cache = st.types.entry(ty.clone()).or_default();
            if let Some(rev) = revision {
                cache.raise_revision(rev);
            }
            if d.id.is_none() && d.namespace.is_none() && d.selector.is_none() {
                cache.set_have_all();
            }
            st.watches.clear_error(d);
            st.watches.remove_started(d);
        }
        counter!("store_resyncs_total", 1u64);
        info!(key = %d.key(), removed = stale.len(), loaded, took_ms = %t0.elapsed().as_millis(), "store: resync ok");
        let revision = revision.or_else(|| Some(self.revision(&ty)).filter(|r| *r > 0));
        self.watch(d.clone().with_revision(revision), false);
        Ok(())
    }

    fn spawn_resync(&self, d: WatchDescriptor) {
        let weak = self.weak();
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            let store = ResourceStore { inner };
            if let Err(e) = store.resync_watch(&d).await {
                warn!(key = %d.key(), error = %e, "store: resync failed");
            }
        });
    }

    // ----- change queue ------------------------------------------------------

    /// Queue a load (or removal) for the next flush. Changes for types with no
    /// registered cache are ignored. Returns whether anything was queued.
    pub fn queue_change(&self, msg: Value, load: bool, label: EventLabel) -> bool {
        let (Some(ty), Some(raw_id)) = (field_str(&msg, "type").map(normalize_type), field_str(&msg, "id").map(str::to_string))
        else {
            warn!(error = %StoreError::MalformedResource("change without type or id".into()), "store: change dropped");
            return false;
        };
        let id = if ty == SCHEMA { normalize_type(&raw_id) } else { raw_id.clone() };
        let mut st = self.state();
        if !st.types.contains_key(&ty) {
            trace!(ty = %ty, id = %id, "store: change for unregistered type ignored");
            return false;
        }
        let action = if load { ChangeAction::Load(msg) } else { ChangeAction::Remove };
        st.queue.push(Change { action, resource_type: ty.clone(), id, label: Some(label) });
        if !load && ty == SCHEMA {
            let described = normalize_type(&raw_id);
            if st.types.contains_key(&described) {
                st.queue.push(Change {
                    action: ChangeAction::ForgetType,
                    resource_type: described.clone(),
                    id: raw_id,
                    label: None,
                });
            }
        }
        true
    }

    pub fn pending_changes(&self) -> usize {
        self.state().queue.len()
    }

    /// Apply queued changes oldest first; returns how many were applied.
    pub fn flush(&self) -> usize {
        let _flushing = lock(&self.inner.flushing);
        let batch = self.state().queue.drain();
        if batch.is_empty() {
            return 0;
        }
        histogram!("store_flush_batch", batch.len() as f64);
        let mut applied = 0usize;
        for c in batch {
            let done = match c.action {
                ChangeAction::Load(raw) => self.load(raw).is_some(),
                ChangeAction::Remove => self.remove(&c.resource_type, &c.id),
                ChangeAction::ForgetType => self.forget_type(&c.resource_type),
            };
            if !done {
                continue;
            }
            applied += 1;
            if let Some(label) = c.label {
                let _ = self.inner.events.send(StoreEvent { label, resource_type: c.resource_type, id: c.id });
            }
        }
        debug!(applied, "store: flushed");
        applied
    }

    // ----- socket events -----------------------------------------------------

    fn on_socket_event(&self, ev: SocketEvent) {
        match ev {
            SocketEvent::Connected { reconnect } => {
                self.state().live = true;
                if reconnect {
                    self.restart_watches();
                }
            }
            SocketEvent::Disconnected => {
                self.state().live = false;
                debug!("store: socket down, flush paused");
            }
            SocketEvent::Error(e) => {
                self.state().live = false;
                warn!(error = %e, "store: socket error");
            }
            SocketEvent::Message(text) => match SocketMessage::parse(&text) {
                Ok(msg) => self.on_message(msg),
                Err(e) => warn!(error = %e, "store: undecodable socket frame"),
            },
        }
    }

    /// After a reconnect every started watch is stopped and started again
    /// without a revision so the server resends current state.
    fn restart_watches(&self) {
        let started = {
            let mut st = self.state();
            let started = st.watches.take_all_started();
            for d in started.iter() {
                st.watches.mark_stopping(d);
            }
            started
        };
        info!(watches = started.len(), "store: socket reconnected, restarting watches");
        for d in started {
            let wire = self.wire_type(&d.resource_type);
            self.send_frame(&WatchRequest::stop(&d, &wire));
            let fresh = d.with_revision(None);
            self.state().watches.mark_started(fresh.clone());
            self.send_frame(&WatchRequest::start(&fresh, &wire));
        }
    }

    fn on_message(&self, msg: SocketMessage) {
        match msg {
            SocketMessage::Ping => trace!("store: ping"),
            SocketMessage::Start(ev) => {
                let d = ev.descriptor;
                let mut st = self.state();
                st.watches.acknowledge(&d);
                if let (Some(rev), Some(c)) = (d.revision, st.types.get_mut(&d.resource_type)) {
                    c.raise_revision(rev);
                }
                debug!(key = %d.key(), "store: watch started");
            }
            SocketMessage::Error(ev) => self.on_watch_error(ev),
            SocketMessage::Stop(ev) => self.on_watch_stop(ev.descriptor),
            SocketMessage::Create(ev) => self.on_resource_event(ev, EventLabel::Create),
            SocketMessage::Change(ev) => self.on_resource_event(ev, EventLabel::Change),
            SocketMessage::Remove(ev) => self.on_resource_event(ev, EventLabel::Remove),
            SocketMessage::Unknown(name) => warn!(name = %name, "store: unknown socket message dropped"),
        }
    }

    fn on_watch_error(&self, ev: WatchEvent) {
        let d = ev.descriptor;
        let reason = ev.reason.unwrap_or_default();
        // reasons arrive both as phrases and as codes like `watch-not-allowed`
        let lower = reason.to_ascii_lowercase().replace(['-', '_'], " ");
        let err = if lower.contains("watch not allowed") {
            Some(StoreError::WatchNotAllowed(reason.clone()))
        } else if lower.contains("failed to find schema") || lower.contains("no schema") {
            Some(StoreError::NoSchemaForWatch(reason.clone()))
        } else {
            None
        };
        if let Some(err) = err {
            warn!(key = %d.key(), error = %err, "store: watch in error");
            let mut st = self.state();
            st.watches.remove_started(&d);
            st.watches.set_error(&d, err);
            return;
        }
        if lower.contains("too old") || lower.contains("410") {
            info!(key = %d.key(), reason = %reason, "store: watch stale, resyncing");
            self.spawn_resync(d);
            return;
        }
        warn!(key = %d.key(), reason = %reason, "store: watch error ignored");
    }

    fn on_watch_stop(&self, d: WatchDescriptor) {
        let retry = {
            let mut st = self.state();
            if st.watches.take_stopping(&d) {
                return;
            }
            let Some(started) = st.watches.remove_started(&d) else {
                trace!(key = %d.key(), "store: stop for unknown watch");
                return;
            };
            if !st.watches.retry_once(&started) {
                warn!(key = %d.key(), "store: watch stopped again, giving up");
                return;
            }
            started
        };
        let delay = self.inner.config.stop_retry_delay;
        info!(key = %d.key(), delay_ms = %delay.as_millis(), "store: watch stopped, retrying");
        let weak = self.weak();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let store = ResourceStore { inner };
            let revision = Some(store.revision(&retry.resource_type)).filter(|r| *r > 0);
            store.watch(retry.with_revision(revision), false);
        });
    }

    fn on_resource_event(&self, ev: WatchEvent, label: EventLabel) {
        let ty = ev.descriptor.resource_type.clone();
        let mut data = match ev.data {
            Some(data) => data,
            None if label == EventLabel::Remove => match removed_id(&ev.descriptor) {
                Some(id) => serde_json::json!({ "type": ty, "id": id }),
                None => {
                    debug!(key = %ev.descriptor.key(), "store: remove event without id");
                    return;
                }
            },
            None => {
                debug!(key = %ev.descriptor.key(), "store: resource event without data");
                return;
            }
        };
        fill_type(&mut data, &ty);
        if let Some(rev) = ev.descriptor.revision {
            if let Some(c) = self.state().types.get_mut(&ty) {
                c.raise_revision(rev);
            }
        }
        self.queue_change(data, label != EventLabel::Remove, label);
    }

    // ----- unsettled-state poller --------------------------------------------

    /// Re-fetch a resource while it reports `transitioning` or `error`.
    fn arm_poller(&self, r: &Resource) {
        let Some(every) = self.inner.config.poll_interval else { return };
        if !needs_polling(r) {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else { return };
        let ty = r.resource_type().to_string();
        let id = r.id().to_string();
        let key = format!("{ty}/{id}");
        if !self.state().polling.insert(key.clone()) {
            return;
        }
        let max = self.inner.config.poll_max_attempts;
        let weak = self.weak();
        debug!(key = %key, "store: polling unsettled resource");
        rt.spawn(async move {
            let opts = FindOptions { force: true, watch: false, ..FindOptions::default() };
            for _ in 0..max {
                tokio::time::sleep(every).await;
                let Some(inner) = weak.upgrade() else { return };
                let store = ResourceStore { inner };
                match store.find(&ty, &id, &opts).await {
                    Ok(r) if !needs_polling(&r) => break,
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        store.remove(&ty, &id);
                        break;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "store: poll failed");
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                lock(&inner.state).polling.remove(&key);
            }
        });
    }
}

fn needs_polling(r: &Resource) -> bool {
    let st = r.state();
    st.transitioning || st.error
}

/// Cache id named by a remove frame that carries no payload.
fn removed_id(d: &WatchDescriptor) -> Option<String> {
    let id = d.id.as_deref()?;
    match d.namespace.as_deref() {
        Some(ns) if !id.contains('/') => Some(format!("{ns}/{id}")),
        _ => Some(id.to_string()),
    }
}

async fn pump(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<SocketEvent>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                let Some(inner) = weak.upgrade() else { break };
                ResourceStore { inner }.on_socket_event(ev);
            }
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                let store = ResourceStore { inner };
                if store.is_live() && store.pending_changes() > 0 {
                    store.flush();
                }
            }
        }
    }
    debug!("store: pump stopped");
}

/// Cache key of a raw resource: its id, normalized for schemas.
fn cache_id(ty: &str, raw: &Value) -> Option<String> {
    let id = field_str(raw, "id").filter(|s| !s.is_empty())?;
    Some(if ty == SCHEMA { normalize_type(id) } else { id.to_string() })
}

fn fill_type(raw: &mut Value, ty: &str) {
    if let Some(obj) = raw.as_object_mut() {
        obj.entry("type").or_insert_with(|| Value::String(ty.to_string()));
    }
}

fn with_type(mut items: Vec<Value>, ty: &str) -> Vec<Value> {
    for raw in items.iter_mut() {
        fill_type(raw, ty);
    }
    items
}

/// Handles for `LoadMode::None`: decorated but never cached.
fn detached(ty: &str, items: Vec<Value>) -> Vec<Resource> {
    items
        .into_iter()
        .filter_map(|raw| {
            let id = cache_id(ty, &raw)?;
            Some(Resource::new(ty, &id, raw))
        })
        .collect()
}

fn in_scope(r: &Resource, d: &WatchDescriptor, selector: Option<&LabelSelector>) -> bool {
    if let Some(ns) = d.namespace.as_deref().filter(|s| !s.is_empty()) {
        if r.namespace().as_deref() != Some(ns) {
            return false;
        }
    }
    if let Some(id) = d.id.as_deref().filter(|s| !s.is_empty()) {
        let full = d.namespace.as_deref().map(|ns| format!("{ns}/{id}"));
        if r.id() != id && Some(r.id()) != full.as_deref() {
            return false;
        }
    }
    selector.map(|s| s.matches_value(&r.data())).unwrap_or(true)
}

fn append_query(url: &str, pairs: &[(&str, &str)]) -> StoreResult<String> {
    let mut u = url::Url::parse(url).map_err(|e| StoreError::Config(format!("invalid url {url}: {e}")))?;
    {
        let mut q = u.query_pairs_mut();
        for (k, v) in pairs {
            q.append_pair(k, v);
        }
    }
    Ok(u.to_string())
}
