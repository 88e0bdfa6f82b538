//! Steve transport: HTTP requests with depagination and the subscribe socket.

#![forbid(unsafe_code)]

pub mod http;
pub mod socket;

use std::sync::Arc;

use steve_core::{StoreConfig, StoreResult};

pub use http::{resolve_url, ApiResponse, HttpClient, Method, RawResponse, ReqwestTransport, Request, Transport};
pub use socket::{Connection, Connector, Socket, SocketEvent, WsConnector};

/// HTTP and websocket backends a store runs on.
#[derive(Clone)]
pub struct Backends {
    pub transport: Arc<dyn Transport>,
    pub connector: Arc<dyn Connector>,
}

impl Backends {
    /// reqwest + tokio-tungstenite backends carrying the configured token.
    pub fn network(cfg: &StoreConfig) -> StoreResult<Self> {
        Ok(Self {
            transport: Arc::new(ReqwestTransport::new(cfg)?),
            connector: Arc::new(WsConnector::new(cfg.token.clone())),
        })
    }
}

pub(crate) use steve_core::lock;
