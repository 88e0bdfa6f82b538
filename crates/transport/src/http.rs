//! HTTP side of the transport: URL resolution, status mapping and depagination.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use steve_core::{parse_revision, StoreConfig, StoreError, StoreResult};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    /// Follow `has_more` cursors and return one concatenated collection.
    pub depaginate: bool,
    /// Map 401 to [`StoreError::Unauthorized`]; when false a 401 is a plain `Http` error.
    pub redirect_unauthorized: bool,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), body: None, depaginate: false, redirect_unauthorized: true }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn depaginated(mut self, on: bool) -> Self {
        self.depaginate = on;
        self
    }
}

/// What a backend hands back before any interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub url: String,
    pub body: Vec<u8>,
}

/// Raw HTTP backend. Implementations send exactly one request; status handling
/// and pagination live in [`HttpClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> StoreResult<RawResponse>;
}

/// Decoded response. Status and final URL ride beside the payload, never inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub url: String,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_collection(&self) -> bool {
        is_collection(&self.body)
    }

    /// Collection revision watermark, if the server sent one.
    pub fn revision(&self) -> Option<u64> {
        self.body.get("revision").and_then(parse_revision)
    }

    /// Items of a collection, or the single resource as a one-element list.
    pub fn into_items(self) -> Vec<Value> {
        match self.body {
            Value::Object(mut obj) if obj.get("data").map(Value::is_array).unwrap_or(false) => {
                match obj.remove("data") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                }
            }
            Value::Array(items) => items,
            Value::Object(obj) if obj.is_empty() => Vec::new(),
            other => vec![other],
        }
    }
}

fn is_collection(body: &Value) -> bool {
    body.get("type").and_then(|t| t.as_str()) == Some("collection")
        || body.get("data").map(Value::is_array).unwrap_or(false)
}

fn has_more(body: &Value) -> bool {
    body.get("has_more")
        .or_else(|| body.get("hasMore"))
        .and_then(|b| b.as_bool())
        .unwrap_or(false)
}

/// `last_id` when the server sends one, else the id of the page's last item.
fn page_cursor(body: &Value) -> Option<String> {
    body.get("last_id")
        .or_else(|| body.get("lastId"))
        .and_then(|v| v.as_str())
        .or_else(|| {
            body.get("data")
                .and_then(|d| d.as_array())
                .and_then(|items| items.last())
                .and_then(|it| it.get("id"))
                .and_then(|v| v.as_str())
        })
        .map(str::to_string)
}

/// Resolve `url` against `base`: relative paths are appended to the base path,
/// `/`-rooted paths keep only the base origin, `localhost` is forced to https
/// and trailing slashes are stripped.
pub fn resolve_url(base: &Url, url: &str) -> StoreResult<String> {
    let invalid = |e: url::ParseError| StoreError::Config(format!("invalid url {url}: {e}"));
    let mut u = match Url::parse(url) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if url.starts_with('/') {
                base.join(url).map_err(invalid)?
            } else {
                let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), url);
                Url::parse(&joined).map_err(invalid)?
            }
        }
        Err(e) => return Err(invalid(e)),
    };
    if u.scheme() == "http" && u.host_str() == Some("localhost") {
        let _ = u.set_scheme("https");
    }
    let path = u.path().trim_end_matches('/').to_string();
    u.set_path(&path);
    let mut s = u.to_string();
    if u.query().is_none() && u.fragment().is_none() {
        while s.ends_with('/') {
            s.pop();
        }
    }
    Ok(s)
}

/// Replace (or add) one query parameter.
pub(crate) fn with_query(url: &str, key: &str, value: &str) -> StoreResult<String> {
    let mut u = Url::parse(url).map_err(|e| StoreError::Config(format!("invalid url {url}: {e}")))?;
    let kept: Vec<(String, String)> = u.query_pairs().filter(|(k, _)| k != key).map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    {
        let mut q = u.query_pairs_mut();
        q.clear();
        for (k, v) in kept.iter() {
            q.append_pair(k, v);
        }
        q.append_pair(key, value);
    }
    Ok(u.to_string())
}

/// HTTP client bound to one API base.
#[derive(Clone)]
pub struct HttpClient {
    base: Url,
    backend: Arc<dyn Transport>,
}

impl HttpClient {
    pub fn new(base_url: &str, backend: Arc<dyn Transport>) -> StoreResult<Self> {
        let base = Url::parse(base_url).map_err(|e| StoreError::Config(format!("invalid base url {base_url}: {e}")))?;
        Ok(Self { base, backend })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    pub fn resolve(&self, url: &str) -> StoreResult<String> {
        resolve_url(&self.base, url)
    }

    /// Issue `req`. Depaginated GETs of a collection return every page's
    /// `data` in page order, with the first page's revision.
    pub async fn request(&self, req: Request) -> StoreResult<ApiResponse> {
        let url = self.resolve(&req.url)?;
        let mut first = self.once(req.method, &url, req.body.as_ref(), req.redirect_unauthorized).await?;
        if !req.depaginate || req.method != Method::Get || !first.is_collection() || !has_more(&first.body) {
            return Ok(first);
        }
        let t0 = Instant::now();
        let mut cursor = page_cursor(&first.body);
        let mut data: Vec<Value> = match first.body.get_mut("data").map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let mut pages = 1usize;
        loop {
            let after = cursor.take().ok_or_else(|| StoreError::Decode(format!("{url}: has_more without a cursor")))?;
            let next_url = with_query(&url, "after", &after)?;
            let page = self.once(Method::Get, &next_url, None, req.redirect_unauthorized).await?;
            pages += 1;
            let more = has_more(&page.body);
            if more {
                cursor = page_cursor(&page.body);
            }
            let items = page.into_items();
            debug!(url = %next_url, items = items.len(), more, "http: page fetched");
            data.extend(items);
            if !more {
                break;
            }
        }
        if let Some(obj) = first.body.as_object_mut() {
            obj.insert("data".into(), Value::Array(data));
            obj.insert("has_more".into(), Value::Bool(false));
            obj.remove("last_id");
        }
        info!(url = %url, pages, took_ms = %t0.elapsed().as_millis(), "http: depaginated");
        Ok(first)
    }

    async fn once(&self, method: Method, url: &str, body: Option<&Value>, redirect_unauthorized: bool) -> StoreResult<ApiResponse> {
        let t0 = Instant::now();
        let raw = self.backend.send(method, url, body).await?;
        histogram!("http_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("http_requests_total", 1u64, "status" => raw.status.to_string());
        debug!(method = method.as_str(), url = %url, status = raw.status, "http: response");
        match raw.status {
            401 if redirect_unauthorized => Err(StoreError::Unauthorized { url: raw.url }),
            410 => Err(StoreError::StaleWatch(raw.url)),
            s if !(200..300).contains(&s) => {
                let message = serde_json::from_slice::<Value>(&raw.body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .unwrap_or_else(|| String::from_utf8_lossy(&raw.body).into_owned());
                Err(StoreError::Http { status: s, url: raw.url, message })
            }
            s => {
                let body = if s == 204 || raw.body.iter().all(u8::is_ascii_whitespace) {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_slice(&raw.body)?
                };
                Ok(ApiResponse { status: s, url: raw.url, body })
            }
        }
    }
}

/// Network backend over reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
    token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(cfg: &StoreConfig) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self { client, token: cfg.token.clone() })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> StoreResult<RawResponse> {
        let m = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut rb = self.client.request(m, url).header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            rb = rb.bearer_auth(token);
        }
        if let Some(body) = body {
            rb = rb.json(body);
        }
        let resp = rb.send().await.map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let bytes = resp.bytes().await.map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(RawResponse { status, url: final_url, body: bytes.to_vec() })
    }
}
