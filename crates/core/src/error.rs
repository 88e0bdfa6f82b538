//! Error taxonomy shared by transport, store and context.

use serde::{Deserialize, Serialize};

/// Store errors suitable for surfacing to consumers.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    #[error("unauthorized: {url}")]
    Unauthorized { url: String },
    #[error("not permitted to list {0}")]
    NotPermitted(String),
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("schemas not loaded")]
    SchemasNotLoaded,
    #[error("watch not allowed: {0}")]
    WatchNotAllowed(String),
    #[error("no schema for watch: {0}")]
    NoSchemaForWatch(String),
    #[error("stale watch: {0}")]
    StaleWatch(String),
    #[error("malformed resource: {0}")]
    MalformedResource(String),
    #[error("http {status} from {url}: {message}")]
    Http { status: u16, url: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("type {0} is not registered")]
    TypeNotRegistered(String),
    #[error("config: {0}")]
    Config(String),
}

impl StoreError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Unauthorized { .. } => Some(401),
            StoreError::StaleWatch(_) => Some(410),
            StoreError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
