// Shared fixtures for integration tests

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store_print_agent::realtime::Packet;
use store_print_agent::{PrintError, PrintTransport, PrinterTarget};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

/// Transport that records deliveries instead of touching hardware.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct MockPrinter {
    delivered: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    active: Arc<Mutex<HashMap<String, usize>>>,
    max_active_per_target: Arc<AtomicUsize>,
    max_active_total: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, target: &PrinterTarget, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(target.key(), delay);
        self
    }

    pub fn failing(self, target: &PrinterTarget) -> Self {
        self.failing.lock().unwrap().insert(target.key());
        self
    }

    /// Payloads in delivery order, tagged with the target key.
    pub fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Payloads delivered to one target, as UTF-8.
    pub fn delivered_to(&self, target: &PrinterTarget) -> Vec<String> {
        let key = target.key();
        self.delivered()
            .into_iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, p)| String::from_utf8_lossy(&p).into_owned())
            .collect()
    }

    pub fn max_active_per_target(&self) -> usize {
        self.max_active_per_target.load(Ordering::SeqCst)
    }

    pub fn max_active_total(&self) -> usize {
        self.max_active_total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrintTransport for MockPrinter {
    async fn send(&self, target: &PrinterTarget, payload: &[u8], _timeout: Duration) -> Result<(), PrintError> {
        let key = target.key();
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(key.clone()).or_insert(0);
            *count += 1;
            self.max_active_per_target.fetch_max(*count, Ordering::SeqCst);
            let total: usize = active.values().sum();
            self.max_active_total.fetch_max(total, Ordering::SeqCst);
        }

        let delay = self.delays.lock().unwrap().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self.failing.lock().unwrap().contains(&key);
        if let Some(count) = self.active.lock().unwrap().get_mut(&key) {
            *count -= 1;
        }

        if fail {
            return Err(PrintError::WriteFailed("simulated paper jam".to_string()));
        }
        self.delivered.lock().unwrap().push((key, payload.to_vec()));
        Ok(())
    }
}

/// A `/printer-jobs` record with a text payload.
#[allow(dead_code)]
pub fn job_json(id: &str, target_type: &str, address: &str, text: &str) -> Value {
    json!({
        "id": id,
        "orderId": format!("order-{}", id),
        "sector": "kitchen",
        "targetType": target_type,
        "targetAddress": address,
        "payload": BASE64.encode(text.as_bytes()),
    })
}

/// Poll `condition` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Ping settings the fake server advertises in OPEN.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub struct PingSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Actually send `2` every `interval_ms`. A server that advertises
    /// pings but never sends them looks like a half-open link.
    pub send_pings: bool,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self { interval_ms: 25_000, timeout_ms: 20_000, send_pings: false }
    }
}

/// Minimal Socket.IO v4 server over websockets.
///
/// Completes the handshake, answers `register-print-agent` acks with a
/// fixed reply, records every inbound packet and can push events, drop
/// its clients or stop listening.
#[allow(dead_code)]
pub struct FakeSocketServer {
    pub url: String,
    received: Arc<Mutex<Vec<Packet>>>,
    push: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    accept_task: tokio::task::JoinHandle<()>,
    connections: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FakeSocketServer {
    pub async fn start(register_reply: Value) -> Self {
        Self::start_with(register_reply, PingSettings::default()).await
    }

    pub async fn start_with(register_reply: Value, ping: PingSettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let (push, _) = broadcast::channel(16);
        let (kick, _) = broadcast::channel(4);
        let connections = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let accept_task = {
            let received = received.clone();
            let push = push.clone();
            let kick = kick.clone();
            let connections = connections.clone();
            let disconnects = disconnects.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let received = received.clone();
                    let mut push_rx = push.subscribe();
                    let mut kick_rx = kick.subscribe();
                    let connections = connections.clone();
                    let disconnects = disconnects.clone();
                    let register_reply = register_reply.clone();

                    tokio::spawn(async move {
                        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                            return;
                        };
                        let open = Packet::Open(json!({
                            "sid": "test",
                            "pingInterval": ping.interval_ms,
                            "pingTimeout": ping.timeout_ms,
                        }));
                        if ws.send(Message::Text(open.encode())).await.is_err() {
                            return;
                        }
                        connections.fetch_add(1, Ordering::SeqCst);

                        let period = Duration::from_millis(ping.interval_ms);
                        let mut pings = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

                        loop {
                            tokio::select! {
                                _ = kick_rx.recv() => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                                _ = pings.tick(), if ping.send_pings => {
                                    if ws.send(Message::Text(Packet::Ping.encode())).await.is_err() {
                                        break;
                                    }
                                }
                                msg = ws.next() => {
                                    let text = match msg {
                                        Some(Ok(Message::Text(text))) => text,
                                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                        Some(Ok(_)) => continue,
                                    };
                                    let Some(packet) = Packet::decode(&text) else { continue };
                                    let reply = match &packet {
                                        Packet::Connect(_) => Some(Packet::Connect(Some(json!({"sid": "ns-test"})))),
                                        Packet::Event { id: Some(id), name, .. } if name == "register-print-agent" => {
                                            Some(Packet::Ack { id: *id, args: vec![register_reply.clone()] })
                                        }
                                        _ => None,
                                    };
                                    received.lock().unwrap().push(packet);
                                    if let Some(reply) = reply {
                                        if ws.send(Message::Text(reply.encode())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                pushed = push_rx.recv() => {
                                    let Ok(text) = pushed else { continue };
                                    if ws.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        disconnects.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            url: format!("http://{}", addr),
            received,
            push,
            kick,
            accept_task,
            connections,
            disconnects,
        }
    }

    /// Close every open client connection; new ones are still accepted.
    pub fn drop_clients(&self) {
        let _ = self.kick.send(());
    }

    /// Stop listening and close every client, so reconnects are refused.
    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_clients();
    }

    /// Data of every inbound event named `name`, in arrival order.
    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match p {
                Packet::Event { name: n, data, .. } if n == name => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match p {
                Packet::Event { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn push_event(&self, name: &str, data: Value) {
        let packet = Packet::Event { id: None, name: name.to_string(), data };
        let _ = self.push.send(packet.encode());
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

/// Number of requests the mock cloud saw for `method path`.
#[allow(dead_code)]
pub async fn request_count(server: &wiremock::MockServer, method: &str, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .count()
}

/// Wait until the mock cloud has seen at least `n` matching requests.
#[allow(dead_code)]
pub async fn wait_for_requests(
    server: &wiremock::MockServer,
    method: &str,
    path: &str,
    n: usize,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if request_count(server, method, path).await >= n {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
