use crate::config::Timings;
use crate::errors::{AgentError, Result};
use backon::{ConstantBuilder, Retryable};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Engine.IO v4 server defaults, used when OPEN omits them.
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Engine.IO v4 / Socket.IO v4 text packets, default namespace only.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `0{...}` handshake from the server
    Open(Value),
    /// `1`
    Close,
    /// `2`
    Ping,
    /// `3`
    Pong,
    /// `40` with optional auth payload
    Connect(Option<Value>),
    /// `41`
    Disconnect,
    /// `42[id]["name", data]`
    Event { id: Option<u64>, name: String, data: Value },
    /// `43id[args...]`
    Ack { id: u64, args: Vec<Value> },
    /// `44{...}`
    ConnectError(Value),
}

impl Packet {
    pub fn encode(&self) -> String {
        match self {
            Packet::Open(v) => format!("0{}", v),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(v)) => format!("40{}", v),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { id, name, data } => {
                let id = id.map(|i| i.to_string()).unwrap_or_default();
                format!("42{}{}", id, json!([name, data]))
            }
            Packet::Ack { id, args } => format!("43{}{}", id, Value::Array(args.clone())),
            Packet::ConnectError(v) => format!("44{}", v),
        }
    }

    pub fn decode(text: &str) -> Option<Packet> {
        let mut chars = text.chars();
        let engine = chars.next()?;
        let rest = chars.as_str();

        match engine {
            '0' => Some(Packet::Open(serde_json::from_str(rest).unwrap_or(Value::Null))),
            '1' => Some(Packet::Close),
            '2' => Some(Packet::Ping),
            '3' => Some(Packet::Pong),
            '4' => Self::decode_socket(rest),
            _ => None,
        }
    }

    fn decode_socket(text: &str) -> Option<Packet> {
        let mut chars = text.chars();
        let kind = chars.next()?;
        let mut body = chars.as_str();

        // "/nsp," prefix; only the default namespace is used here
        if body.starts_with('/') {
            body = body.split_once(',').map(|(_, b)| b).unwrap_or("");
        }

        let digits = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
        let (id, body) = body.split_at(digits);
        let id: Option<u64> = id.parse().ok();

        match kind {
            '0' => {
                let payload = if body.is_empty() { None } else { serde_json::from_str(body).ok() };
                Some(Packet::Connect(payload))
            }
            '1' => Some(Packet::Disconnect),
            '2' => {
                let mut items = match serde_json::from_str::<Value>(body).ok()? {
                    Value::Array(items) => items.into_iter(),
                    _ => return None,
                };
                let name = items.next()?.as_str()?.to_string();
                let data = items.next().unwrap_or(Value::Null);
                Some(Packet::Event { id, name, data })
            }
            '3' => {
                let args = match serde_json::from_str::<Value>(body).ok()? {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                Some(Packet::Ack { id: id?, args })
            }
            '4' => Some(Packet::ConnectError(serde_json::from_str(body).unwrap_or(Value::Null))),
            _ => None,
        }
    }
}

/// What the channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected,
    Disconnected(String),
    /// Reconnection attempts exhausted; the channel is gone for good.
    ReconnectFailed,
    Event { name: String, data: Value },
}

/// Build the websocket URL for a Socket.IO server at `endpoint`.
pub fn socket_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint.trim())
        .map_err(|e| AgentError::Config(format!("Invalid realtime URL '{}': {}", endpoint, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(AgentError::Config(format!("Unsupported realtime scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| AgentError::Config(format!("Cannot use {} for {}", scheme, endpoint)))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

/// How long the read side may stay quiet before the link counts as dead:
/// the server pings every `pingInterval` and allows `pingTimeout` on top.
pub fn liveness_window(open: &Value) -> Duration {
    let interval = open
        .get("pingInterval")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PING_INTERVAL_MS);
    let timeout = open
        .get("pingTimeout")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PING_TIMEOUT_MS);
    Duration::from_millis(interval.saturating_add(timeout))
}

struct Shared {
    sink: Mutex<Option<WsSink>>,
    pending_acks: std::sync::Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    next_ack: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    async fn send(&self, packet: Packet) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(AgentError::Realtime("Realtime channel not connected".to_string()));
        };
        sink.send(Message::Text(packet.encode()))
            .await
            .map_err(|e| AgentError::Realtime(format!("Send failed: {}", e)))
    }

    fn resolve_ack(&self, id: u64, args: Vec<Value>) {
        let sender = self.pending_acks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(args);
            }
            None => debug!("Ack {} has no waiter", id),
        }
    }

    /// Drop every waiter so pending `emit_with_ack` calls fail fast.
    fn fail_pending_acks(&self) {
        self.pending_acks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Cloneable handle for emitting on the channel and shutting it down.
#[derive(Clone)]
pub struct RealtimeHandle {
    shared: Arc<Shared>,
}

impl RealtimeHandle {
    /// Fire-and-forget emit.
    pub async fn emit(&self, name: &str, data: Value) -> Result<()> {
        self.shared
            .send(Packet::Event { id: None, name: name.to_string(), data })
            .await
    }

    /// Emit and wait for the server's acknowledgement; resolves to its
    /// first argument.
    pub async fn emit_with_ack(&self, name: &str, data: Value, timeout: Duration) -> Result<Value> {
        let id = self.shared.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let sent = self
            .shared
            .send(Packet::Event { id: Some(id), name: name.to_string(), data })
            .await;
        if let Err(e) = sent {
            self.forget_ack(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(args)) => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            Ok(Err(_)) => Err(AgentError::Realtime(format!("Channel closed before '{}' was acknowledged", name))),
            Err(_) => {
                self.forget_ack(id);
                Err(AgentError::Realtime(format!("No acknowledgement for '{}' within {:?}", name, timeout)))
            }
        }
    }

    fn forget_ack(&self, id: u64) {
        self.shared
            .pending_acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Stop reconnecting and close the socket. Idempotent.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let mut sink = self.shared.sink.lock().await;
        if let Some(mut s) = sink.take() {
            let _ = s.send(Message::Text(Packet::Disconnect.encode())).await;
            let _ = s.close().await;
            debug!("Realtime socket closed");
        }
        self.shared.fail_pending_acks();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// Socket.IO client over `tokio-tungstenite` with fixed-delay reconnection.
pub struct RealtimeClient;

impl RealtimeClient {
    /// Start the channel in the background. Lifecycle and inbound events
    /// arrive on the returned receiver until the handle is closed or
    /// reconnection gives up.
    pub fn start(
        endpoint: &str,
        token: &str,
        timings: &Timings,
    ) -> Result<(RealtimeHandle, mpsc::UnboundedReceiver<RealtimeEvent>)> {
        let url = socket_url(endpoint)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            sink: Mutex::new(None),
            pending_acks: std::sync::Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        let handle = RealtimeHandle { shared: shared.clone() };

        let token = token.to_string();
        let delay = timings.reconnect_delay();
        let attempts = timings.reconnect_attempts.unwrap_or(usize::MAX);

        tokio::spawn(async move {
            Self::run(url, token, delay, attempts, shared, events_tx).await;
        });

        Ok((handle, events_rx))
    }

    async fn run(
        url: Url,
        token: String,
        delay: Duration,
        attempts: usize,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<RealtimeEvent>,
    ) {
        let cancel = shared.cancel.clone();
        let mut dropped = false;

        loop {
            // After a drop the fixed delay runs before the first new attempt.
            if dropped {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let connect = || async { Self::establish(&url, &token, &shared).await };
            let backoff = ConstantBuilder::default()
                .with_delay(delay)
                .with_max_times(attempts);

            let attempt = connect
                .retry(backoff)
                .sleep(tokio::time::sleep)
                .notify(|err: &AgentError, dur: Duration| {
                    warn!("Realtime connect failed: {}. Retrying in {:?}", err, dur);
                });

            let (read, liveness) = tokio::select! {
                _ = cancel.cancelled() => break,
                result = attempt => match result {
                    Ok(connected) => connected,
                    Err(e) => {
                        error!("Realtime reconnection gave up: {}", e);
                        let _ = events.send(RealtimeEvent::ReconnectFailed);
                        break;
                    }
                },
            };

            if cancel.is_cancelled() {
                break;
            }
            info!("Realtime channel connected");
            let _ = events.send(RealtimeEvent::Connected);

            let reason = tokio::select! {
                _ = cancel.cancelled() => break,
                reason = Self::pump(read, liveness, &shared, &events) => reason,
            };

            shared.sink.lock().await.take();
            shared.fail_pending_acks();

            if cancel.is_cancelled() {
                break;
            }
            warn!("Realtime channel lost: {}", reason);
            let _ = events.send(RealtimeEvent::Disconnected(reason));
            dropped = true;
        }

        // A handshake can finish after close() already emptied the slot.
        if let Some(mut sink) = shared.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        shared.fail_pending_acks();
        debug!("Realtime task stopped");
    }

    /// Websocket connect plus Engine.IO/Socket.IO handshake. On success the
    /// write half is parked in `shared` and the read half returned along
    /// with the liveness window the server advertised.
    async fn establish(url: &Url, token: &str, shared: &Shared) -> Result<(WsRead, Duration)> {
        debug!("Connecting to {}", url);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| AgentError::Realtime(format!("WebSocket connection failed: {}", e)))?;
        let (mut write, mut read) = ws.split();

        let handshake = async {
            let mut opened: Option<Duration> = None;
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(AgentError::Realtime(format!("Handshake failed: {}", e))),
                };
                match Packet::decode(&text) {
                    Some(Packet::Open(info)) if opened.is_none() => {
                        opened = Some(liveness_window(&info));
                        write
                            .send(Message::Text(Packet::Connect(Some(json!({ "token": token }))).encode()))
                            .await
                            .map_err(|e| AgentError::Realtime(format!("Failed to send connect: {}", e)))?;
                    }
                    Some(Packet::Ping) => {
                        write
                            .send(Message::Text(Packet::Pong.encode()))
                            .await
                            .map_err(|e| AgentError::Realtime(e.to_string()))?;
                    }
                    Some(Packet::Connect(_)) => {
                        if let Some(liveness) = opened {
                            return Ok(liveness);
                        }
                    }
                    Some(Packet::ConnectError(reason)) => {
                        return Err(AgentError::Realtime(format!("Connection rejected: {}", reason)));
                    }
                    other => debug!("Ignoring packet during handshake: {:?}", other),
                }
            }
            Err(AgentError::Realtime("Socket closed during handshake".to_string()))
        };

        let liveness = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| AgentError::Realtime("Handshake timeout".to_string()))??;

        *shared.sink.lock().await = Some(write);
        Ok((read, liveness))
    }

    /// Read until the socket goes away or stays silent past `liveness`;
    /// returns the reason.
    async fn pump(
        mut read: WsRead,
        liveness: Duration,
        shared: &Shared,
        events: &mpsc::UnboundedSender<RealtimeEvent>,
    ) -> String {
        loop {
            let msg = match tokio::time::timeout(liveness, read.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return "stream ended".to_string(),
                Err(_) => return "ping timeout".to_string(),
            };
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => return "closed by server".to_string(),
                Ok(_) => continue,
                Err(e) => return e.to_string(),
            };

            match Packet::decode(&text) {
                Some(Packet::Ping) => {
                    if let Err(e) = shared.send(Packet::Pong).await {
                        return e.to_string();
                    }
                }
                Some(Packet::Event { id, name, data }) => {
                    if let Some(id) = id {
                        let _ = shared.send(Packet::Ack { id, args: Vec::new() }).await;
                    }
                    let _ = events.send(RealtimeEvent::Event { name, data });
                }
                Some(Packet::Ack { id, args }) => shared.resolve_ack(id, args),
                Some(Packet::Disconnect) | Some(Packet::Close) => {
                    return "disconnected by server".to_string();
                }
                other => debug!("Ignoring packet: {:?}", other),
            }
        }
    }
}
