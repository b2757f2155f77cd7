use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "PRINT_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the cloud order API (`GET /printer-jobs` etc.)
    pub api_url: String,
    /// Realtime endpoint; the API host is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_url: Option<String>,
    pub store_id: String,
    pub token: String,
    #[serde(default)]
    pub store_name: String,
    #[serde(default)]
    pub timings: Timings,
}

/// Fixed intervals and timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub order_debounce_ms: u64,
    pub reconnect_delay_ms: u64,
    /// `None` keeps reconnecting forever.
    pub reconnect_attempts: Option<usize>,
    pub ack_timeout_ms: u64,
    pub print_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub presence_probe_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            heartbeat_interval_ms: 10_000,
            order_debounce_ms: 500,
            reconnect_delay_ms: 5_000,
            reconnect_attempts: None,
            ack_timeout_ms: 10_000,
            print_timeout_ms: 8_000,
            http_timeout_ms: 15_000,
            presence_probe_ms: 1_200,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn order_debounce(&self) -> Duration {
        Duration::from_millis(self.order_debounce_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn print_timeout(&self) -> Duration {
        Duration::from_millis(self.print_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn presence_probe(&self) -> Duration {
        Duration::from_millis(self.presence_probe_ms)
    }
}

impl AgentConfig {
    pub fn new(api_url: impl Into<String>, store_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            realtime_url: None,
            store_id: store_id.into(),
            token: token.into(),
            store_name: String::new(),
            timings: Timings::default(),
        }
    }

    /// Load from `PRINT_AGENT_CONFIG` (or the default location), then apply
    /// `PRINT_AGENT_API_URL` / `PRINT_AGENT_STORE_ID` / `PRINT_AGENT_TOKEN`.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());

        let mut config = if path.exists() {
            info!("Loading agent config from {:?}", path);
            Self::from_file(&path)?
        } else {
            debug!("No config file at {:?}, relying on environment", path);
            Self::new(String::new(), String::new(), String::new())
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PRINT_AGENT_API_URL") {
            self.api_url = url;
        }
        if let Ok(store_id) = std::env::var("PRINT_AGENT_STORE_ID") {
            self.store_id = store_id;
        }
        if let Ok(token) = std::env::var("PRINT_AGENT_TOKEN") {
            self.token = token;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(AgentError::Config("api_url is not set".to_string()));
        }
        if self.store_id.trim().is_empty() {
            return Err(AgentError::Config("store_id is not set".to_string()));
        }
        if self.token.trim().is_empty() {
            return Err(AgentError::Config("token is not set".to_string()));
        }
        Ok(())
    }

    /// Endpoint for the realtime channel, falling back to the API URL.
    pub fn realtime_endpoint(&self) -> &str {
        self.realtime_url.as_deref().unwrap_or(&self.api_url)
    }

    fn app_dir(base: Option<PathBuf>) -> PathBuf {
        let name = if cfg!(target_os = "windows") {
            "Store Print Agent"
        } else {
            "store-print-agent"
        };
        base.map(|p| p.join(name)).unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn default_path() -> PathBuf {
        Self::app_dir(dirs::config_dir()).join("agent.json")
    }

    pub fn log_dir() -> PathBuf {
        Self::app_dir(dirs::data_local_dir()).join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_timings_defaults_match_agent_schedule() {
        let t = Timings::default();
        assert_eq!(t.poll_interval(), Duration::from_secs(10));
        assert_eq!(t.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(t.order_debounce(), Duration::from_millis(500));
        assert_eq!(t.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(t.print_timeout(), Duration::from_secs(8));
        assert_eq!(t.http_timeout(), Duration::from_secs(15));
        assert_eq!(t.presence_probe(), Duration::from_millis(1200));
        assert_eq!(t.reconnect_attempts, None);
    }

    #[test]
    fn test_partial_timings_fill_from_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"api_url":"https://api.example.com","store_id":"s1","token":"t","timings":{"poll_interval_ms":250}}"#,
        )
        .unwrap();
        assert_eq!(config.timings.poll_interval_ms, 250);
        assert_eq!(config.timings.heartbeat_interval_ms, 10_000);
        assert_eq!(config.realtime_endpoint(), "https://api.example.com");
    }

    #[test]
    fn test_validate_rejects_missing_token() {
        let config = AgentConfig::new("https://api.example.com", "s1", "  ");
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_load_reads_file_and_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"api_url":"https://api.example.com","store_id":"s1","token":"from-file","store_name":"Corner Cafe"}}"#
        )
        .unwrap();

        std::env::set_var(CONFIG_PATH_ENV, file.path());
        std::env::set_var("PRINT_AGENT_TOKEN", "from-env");
        let loaded = AgentConfig::load();
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var("PRINT_AGENT_TOKEN");

        let config = loaded.unwrap();
        assert_eq!(config.store_id, "s1");
        assert_eq!(config.token, "from-env");
        assert_eq!(config.store_name, "Corner Cafe");
    }
}
