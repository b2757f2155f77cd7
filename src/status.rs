use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Connection state reported to the UI and used in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Offline,
    Reconnecting,
    Online,
    AuthError,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Online => "online",
            ConnectionState::AuthError => "auth_error",
        }
    }
}

/// Shared, cloneable handle on the agent's connection state.
///
/// `AuthError` is sticky: automatic transitions coming from the realtime
/// channel or the dispatcher are ignored once it is set. Only `reset`
/// (called by connect/disconnect) leaves it.
///
/// It also tracks whether the realtime channel is up, so a successful
/// fetch can undo a fetch-induced `Reconnecting` without ever claiming
/// `Online` while the channel is down.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    state: Arc<RwLock<ConnectionState>>,
    channel_up: Arc<AtomicBool>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Offline)),
            channel_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an automatic transition. Returns false when refused.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == ConnectionState::AuthError {
            debug!("Ignoring transition to {} while auth_error is pinned", next.as_str());
            return false;
        }
        if *state != next {
            info!("Connection state: {} -> {}", state.as_str(), next.as_str());
            *state = next;
        }
        true
    }

    pub fn set_channel_up(&self, up: bool) {
        self.channel_up.store(up, Ordering::SeqCst);
    }

    /// A job fetch went through: `Reconnecting` goes back to `Online` if
    /// the realtime channel is up. Other states are left alone.
    pub fn fetch_succeeded(&self) {
        if !self.channel_up.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == ConnectionState::Reconnecting {
            info!("Connection state: reconnecting -> online (fetch recovered)");
            *state = ConnectionState::Online;
        }
    }

    pub fn pin_auth_error(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != ConnectionState::AuthError {
            info!("Connection state: {} -> auth_error", state.as_str());
        }
        *state = ConnectionState::AuthError;
    }

    /// Force `Offline`, clearing a pinned `AuthError`.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = ConnectionState::Offline;
        self.channel_up.store(false, Ordering::SeqCst);
    }
}
