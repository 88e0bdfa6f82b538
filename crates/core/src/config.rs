//! Per-store runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

/// Settings for one resource store (one logical domain).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// API root, e.g. `https://rancher.example.com/v1`. No trailing slash.
    pub base_url: String,
    /// Bearer token applied to HTTP and websocket requests.
    pub token: Option<String>,
    /// Schema collection; relative values resolve against `base_url`.
    pub schemas_url: String,
    /// Websocket path appended to `base_url`.
    pub subscribe_path: String,
    pub flush_interval: Duration,
    /// Delay before a server-stopped watch is retried.
    pub stop_retry_delay: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Re-fetch interval for transitioning resources; `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Stop polling a resource after this many attempts.
    pub poll_max_attempts: u32,
    pub http_timeout: Duration,
    /// Namespace pre-filled into blank instances of namespaced types.
    pub default_namespace: String,
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        let trimmed = base_url.trim_end_matches('/').len();
        base_url.truncate(trimmed);
        Self {
            base_url,
            token: None,
            schemas_url: "schemas".to_string(),
            subscribe_path: "subscribe".to_string(),
            flush_interval: Duration::from_secs(1),
            stop_retry_delay: Duration::from_secs(5),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            poll_interval: Some(Duration::from_secs(5)),
            poll_max_attempts: 20,
            http_timeout: Duration::from_secs(30),
            default_namespace: "default".to_string(),
        }
    }

    /// Build from `STEVE_*` environment variables. `STEVE_API_URL` is required.
    pub fn from_env() -> StoreResult<Self> {
        let base = std::env::var("STEVE_API_URL")
            .map_err(|_| StoreError::Config("STEVE_API_URL is not set".into()))?;
        let mut cfg = Self::new(base);
        cfg.token = std::env::var("STEVE_TOKEN").ok().filter(|s| !s.is_empty());
        if let Ok(s) = std::env::var("STEVE_SCHEMAS_URL") {
            cfg.schemas_url = s;
        }
        if let Some(ms) = env_parse::<u64>("STEVE_FLUSH_MS") {
            cfg.flush_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_parse::<u64>("STEVE_STOP_RETRY_SECS") {
            cfg.stop_retry_delay = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("STEVE_RECONNECT_MIN_MS") {
            cfg.reconnect_min = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_parse::<u64>("STEVE_RECONNECT_MAX_SECS") {
            cfg.reconnect_max = Duration::from_secs(secs.max(1));
        }
        match env_parse::<u64>("STEVE_POLL_SECS") {
            Some(0) => cfg.poll_interval = None,
            Some(secs) => cfg.poll_interval = Some(Duration::from_secs(secs)),
            None => {}
        }
        if let Some(secs) = env_parse::<u64>("STEVE_HTTP_TIMEOUT_SECS") {
            cfg.http_timeout = Duration::from_secs(secs.max(1));
        }
        if let Ok(ns) = std::env::var("STEVE_DEFAULT_NAMESPACE") {
            cfg.default_namespace = ns;
        }
        Ok(cfg)
    }

    /// Websocket endpoint: `<base>/<subscribe_path>` with http(s) mapped to ws(s).
    /// `localhost` always gets the secure scheme, like HTTP requests do.
    pub fn subscribe_url(&self) -> String {
        let mut url = format!("{}/{}", self.base_url, self.subscribe_path.trim_start_matches('/'));
        if url.starts_with("http://localhost") {
            url.replace_range(..4, "https");
        }
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_url_switches_scheme() {
        let cfg = StoreConfig::new("https://example.com/v1/");
        assert_eq!(cfg.base_url, "https://example.com/v1");
        assert_eq!(cfg.subscribe_url(), "wss://example.com/v1/subscribe");
        let cfg = StoreConfig::new("http://localhost:8080/v1");
        assert_eq!(cfg.subscribe_url(), "wss://localhost:8080/v1/subscribe");
        let cfg = StoreConfig::new("http://10.0.0.1/v1");
        assert_eq!(cfg.subscribe_url(), "ws://10.0.0.1/v1/subscribe");
    }
}
