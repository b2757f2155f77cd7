use crate::activity_log::{ActivityEntry, ActivityLog};
use crate::cloud_client::CloudClient;
use crate::config::AgentConfig;
use crate::dispatcher::{FetchOutcome, JobDispatcher};
use crate::errors::Result;
use crate::presence::PresenceDetector;
use crate::printer::PrintTransport;
use crate::realtime::{RealtimeClient, RealtimeEvent, RealtimeHandle};
use crate::sentry_init;
use crate::status::{ConnectionState, ConnectionStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ORDER_EVENTS: [&str; 2] = ["order-created", "new-order"];

/// One connected session: the realtime channel, the poll and heartbeat
/// timers, and the event loop. Dropped as a unit by `disconnect`.
struct Session {
    cancel: CancellationToken,
    realtime: RealtimeHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.realtime.close().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// State the session's tasks share.
struct SessionContext {
    config: AgentConfig,
    cloud: Arc<CloudClient>,
    dispatcher: JobDispatcher,
    detector: PresenceDetector,
    realtime: RealtimeHandle,
    status: ConnectionStatus,
    log: ActivityLog,
    cancel: CancellationToken,
}

impl SessionContext {
    async fn fetch(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.dispatcher.fetch_and_print().await == FetchOutcome::AuthError {
            self.stop_for_auth_error().await;
        }
    }

    /// Tear the session down from the inside and pin `auth_error`.
    async fn stop_for_auth_error(&self) {
        self.cancel.cancel();
        self.realtime.close().await;
        self.status.pin_auth_error();
        self.log.error("Session stopped: store credentials rejected. Reconnect with a new token.");
    }

    async fn on_connected(&self) {
        self.status.set_channel_up(true);
        self.status.transition(ConnectionState::Online);
        self.log.ok("Connected to cloud");

        let registration = json!({ "storeId": self.config.store_id, "token": self.config.token });
        // Rejection is logged only; the session carries on either way.
        match self
            .realtime
            .emit_with_ack("register-print-agent", registration, self.config.timings.ack_timeout())
            .await
        {
            Ok(ack) if ack.get("ok").and_then(Value::as_bool) == Some(true) => {
                self.log.ok("Agent registered");
            }
            Ok(ack) => {
                let reason = ack.get("error").and_then(Value::as_str).unwrap_or("unknown reason");
                self.log.error(format!("Agent registration rejected: {}", reason));
            }
            Err(e) => self.log.error(format!("Agent registration failed: {}", e)),
        }

        if let Err(e) = self
            .realtime
            .emit("join-store", json!({ "storeId": self.config.store_id }))
            .await
        {
            warn!("join-store emit failed: {}", e);
        }

        self.fetch().await;
        self.heartbeat().await;
    }

    async fn heartbeat(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let printers = match self.cloud.fetch_configured_printers().await {
            Ok(printers) => printers,
            Err(e) => {
                debug!("Printer list unavailable for heartbeat: {}", e);
                Vec::new()
            }
        };
        let presence = self.detector.detect_printers(&printers).await;

        let payload = json!({ "storeId": self.config.store_id, "printersOnline": presence });
        match self.realtime.emit("heartbeat", payload).await {
            Ok(()) => debug!("Heartbeat sent ({} printer(s))", presence.len()),
            Err(e) => debug!("Heartbeat skipped: {}", e),
        }
    }

    async fn handle_event(self: &Arc<Self>, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Connected => self.on_connected().await,
            RealtimeEvent::Disconnected(reason) => {
                self.status.set_channel_up(false);
                self.status.transition(ConnectionState::Reconnecting);
                self.log.info(format!("Connection lost ({}), reconnecting", reason));
            }
            RealtimeEvent::ReconnectFailed => {
                self.status.set_channel_up(false);
                self.status.transition(ConnectionState::Offline);
                self.log.error("Could not reconnect to cloud");
            }
            RealtimeEvent::Event { name, data } if ORDER_EVENTS.contains(&name.as_str()) => {
                let order = data
                    .get("orderId")
                    .or_else(|| data.get("order_id"))
                    .or_else(|| data.get("id"))
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "?".to_string());
                self.log.info(format!("New order {}", order));
                self.spawn_debounced_fetch();
            }
            RealtimeEvent::Event { name, .. } => debug!("Unhandled realtime event '{}'", name),
        }
    }

    /// Give the cloud a moment to finish writing the job, then fetch.
    fn spawn_debounced_fetch(self: &Arc<Self>) {
        let ctx = self.clone();
        let delay = self.config.timings.order_debounce();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => ctx.fetch().await,
            }
        });
    }
}

/// Owns at most one session and the state visible to the operator.
pub struct SessionManager {
    status: ConnectionStatus,
    log: ActivityLog,
    transport: Arc<dyn PrintTransport>,
    session: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn PrintTransport>) -> Self {
        Self {
            status: ConnectionStatus::new(),
            log: ActivityLog::new(),
            transport,
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get()
    }

    pub fn activity(&self, limit: usize) -> Vec<ActivityEntry> {
        self.log.entries(limit)
    }

    /// The transport jobs go through, for operator test prints.
    pub fn transport(&self) -> Arc<dyn PrintTransport> {
        self.transport.clone()
    }

    /// Replace any running session with a fresh one for `config`.
    pub async fn connect(&self, config: AgentConfig) -> Result<()> {
        let mut slot = self.session.lock().await;
        if let Some(old) = slot.take() {
            old.shutdown().await;
        }
        self.status.reset();
        config.validate()?;

        info!("Connecting store {} to {}", config.store_id, config.api_url);
        sentry_init::set_store_context(&config.store_id);

        let (realtime, events) =
            RealtimeClient::start(config.realtime_endpoint(), &config.token, &config.timings)?;

        let cloud = Arc::new(CloudClient::from_config(&config));
        let dispatcher = JobDispatcher::new(
            cloud.clone(),
            self.transport.clone(),
            self.status.clone(),
            self.log.clone(),
            config.timings.print_timeout(),
        );
        let cancel = CancellationToken::new();

        let ctx = Arc::new(SessionContext {
            detector: PresenceDetector::new(config.timings.presence_probe()),
            config,
            cloud,
            dispatcher,
            realtime: realtime.clone(),
            status: self.status.clone(),
            log: self.log.clone(),
            cancel: cancel.clone(),
        });

        self.log.info("Connecting to cloud...");
        let tasks = vec![
            tokio::spawn(event_loop(ctx.clone(), events)),
            tokio::spawn(poll_loop(ctx.clone())),
            tokio::spawn(heartbeat_loop(ctx)),
        ];

        *slot = Some(Session { cancel, realtime, tasks });
        Ok(())
    }

    /// Stop the session and go `offline`. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.shutdown().await;
            self.log.info("Disconnected");
        }
        self.status.reset();
    }
}

async fn event_loop(ctx: Arc<SessionContext>, mut events: mpsc::UnboundedReceiver<RealtimeEvent>) {
    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        ctx.handle_event(event).await;
    }
    debug!("Session event loop stopped");
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn poll_loop(ctx: Arc<SessionContext>) {
    let mut ticker = ticker(ctx.config.timings.poll_interval());
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => ctx.fetch().await,
        }
    }
    debug!("Poll timer stopped");
}

async fn heartbeat_loop(ctx: Arc<SessionContext>) {
    let mut ticker = ticker(ctx.config.timings.heartbeat_interval());
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => ctx.heartbeat().await,
        }
    }
    debug!("Heartbeat timer stopped");
}
