//! Persistent subscribe socket with auto-reconnect and pending-frame replay.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lock;

/// One live connection as a pair of text-frame channels. The connection is
/// considered closed once `inbound` yields `None`.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Frames taken from `outbound` that never reached the wire, in send order.
    /// Drained once `inbound` closes and buffered for the next connect.
    pub undelivered: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    /// Connection whose writer never hands frames back.
    pub fn new(outbound: mpsc::UnboundedSender<String>, inbound: mpsc::UnboundedReceiver<String>) -> Self {
        let (_, undelivered) = mpsc::unbounded_channel();
        Self { outbound, inbound, undelivered }
    }
}

/// Opens connections to a subscribe endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<Connection>;
}

/// Lifecycle and data events emitted by a [`Socket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// `reconnect` is false only for the first connection of a subscription.
    Connected { reconnect: bool },
    Disconnected,
    Error(String),
    Message(String),
}

#[derive(Default)]
struct Shared {
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: VecDeque<String>,
    connected: bool,
    auto_reconnect: bool,
}

/// Socket handle. Frames sent while disconnected are buffered and replayed in
/// order on the next connect.
pub struct Socket {
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SocketEvent>,
    shared: Arc<Mutex<Shared>>,
    task: Mutex<Option<JoinHandle<()>>>,
    reconnect_min: Duration,
    reconnect_max: Duration,
}

impl Socket {
    pub fn new(
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SocketEvent>,
        reconnect_min: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            connector,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            task: Mutex::new(None),
            reconnect_min,
            reconnect_max: reconnect_max.max(reconnect_min),
        }
    }

    /// Point the socket at `url` and start connecting. Any previous
    /// subscription is dropped; buffered frames are kept for the new one.
    pub fn subscribe(&self, url: &str) {
        let mut task = lock(&self.task);
        if let Some(h) = task.take() {
            h.abort();
        }
        {
            let mut s = lock(&self.shared);
            s.auto_reconnect = true;
            s.connected = false;
            s.outbound = None;
        }
        info!(url = %url, "socket: subscribe");
        let sup = Supervisor {
            connector: self.connector.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            url: url.to_string(),
            min: self.reconnect_min,
            max: self.reconnect_max,
        };
        *task = Some(tokio::spawn(sup.run()));
    }

    /// Send a text frame now, or buffer it until the next connect. Returns
    /// whether the frame went out immediately.
    pub fn send(&self, frame: String) -> bool {
        let mut s = lock(&self.shared);
        let mut frame = frame;
        if s.connected {
            if let Some(tx) = &s.outbound {
                match tx.send(frame) {
                    Ok(()) => return true,
                    Err(e) => frame = e.0,
                }
            }
        }
        debug!(pending = s.pending.len() + 1, "socket: buffering frame");
        s.pending.push_back(frame);
        false
    }

    /// Close for good: no reconnect, pending frames dropped.
    pub fn disconnect(&self) {
        {
            let mut s = lock(&self.shared);
            s.auto_reconnect = false;
            s.connected = false;
            s.outbound = None;
            s.pending.clear();
        }
        if let Some(h) = lock(&self.task).take() {
            h.abort();
            info!("socket: disconnected by caller");
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).connected
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared).pending.len()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(h) = lock(&self.task).take() {
            h.abort();
        }
    }
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    url: String,
    min: Duration,
    max: Duration,
}

impl Supervisor {
    async fn run(self) {
        let mut connects = 0u64;
        let mut delay = self.min;
        loop {
            match self.connector.connect(&self.url).await {
                Ok(mut conn) => {
                    delay = self.min;
                    let reconnect = connects > 0;
                    connects += 1;
                    if reconnect {
                        counter!("socket_reconnects_total", 1u64);
                    }
                    let replayed = {
                        let mut s = lock(&self.shared);
                        let mut n = 0usize;
                        while let Some(frame) = s.pending.pop_front() {
                            if let Err(e) = conn.outbound.send(frame) {
                                s.pending.push_front(e.0);
                                break;
                            }
                            n += 1;
                        }
                        s.outbound = Some(conn.outbound.clone());
                        s.connected = true;
                        n
                    };
                    info!(url = %self.url, reconnect, replayed, "socket: connected");
                    if self.events.send(SocketEvent::Connected { reconnect }).is_err() {
                        return;
                    }
                    while let Some(frame) = conn.inbound.recv().await {
                        if self.events.send(SocketEvent::Message(frame)).is_err() {
                            return;
                        }
                    }
                    {
                        let mut s = lock(&self.shared);
                        s.connected = false;
                        s.outbound = None;
                    }
                    let Connection { outbound, mut undelivered, .. } = conn;
                    drop(outbound);
                    let mut lost = Vec::new();
                    // the writer exits once every outbound sender is gone
                    let drain = async {
                        while let Some(frame) = undelivered.recv().await {
                            lost.push(frame);
                        }
                    };
                    if tokio::time::timeout(self.max, drain).await.is_err() {
                        warn!(url = %self.url, "socket: writer did not settle");
                    }
                    if !lost.is_empty() {
                        let mut s = lock(&self.shared);
                        for frame in lost.iter().rev() {
                            s.pending.push_front(frame.clone());
                        }
                        debug!(requeued = lost.len(), pending = s.pending.len(), "socket: undelivered frames buffered");
                    }
                    warn!(url = %self.url, "socket: connection closed");
                    if self.events.send(SocketEvent::Disconnected).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, retry_ms = %delay.as_millis(), "socket: connect failed");
                    if self.events.send(SocketEvent::Error(e.to_string())).is_err() {
                        return;
                    }
                }
            }
            if !lock(&self.shared).auto_reconnect {
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.max);
        }
    }
}

/// Network connector over tokio-tungstenite.
pub struct WsConnector {
    token: Option<String>,
}

impl WsConnector {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Connection> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::http::HeaderValue;
        use tokio_tungstenite::tungstenite::Message;

        let mut request = url.into_client_request().context("building subscribe request")?;
        if let Some(token) = &self.token {
            request.headers_mut().insert("Authorization", HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        let (ws, _resp) = tokio_tungstenite::connect_async(request).await.with_context(|| format!("connecting {url}"))?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (back_tx, back_rx) = mpsc::unbounded_channel::<String>();

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t,
                    Ok(Message::Binary(b)) => match String::from_utf8(b) {
                        Ok(t) => t,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "socket: read failed");
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.clone())).await {
                    warn!(error = %e, "socket: write failed");
                    let _ = back_tx.send(frame);
                    // closes `inbound` so the supervisor sees the disconnect
                    reader.abort();
                    while let Some(rest) = out_rx.recv().await {
                        let _ = back_tx.send(rest);
                    }
                    return;
                }
            }
            let _ = sink.close().await;
        });
        Ok(Connection { outbound: out_tx, inbound: in_rx, undelivered: back_rx })
    }
}
