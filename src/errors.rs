use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Realtime connection error: {0}")]
    Realtime(String),

    #[error("Cloud API error: {0}")]
    Cloud(String),

    #[error("Invalid job record: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Print(#[from] PrintError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Delivery failures for a single payload to a single printer.
///
/// The `Display` text is what gets reported back to the cloud in the
/// "error" acknowledgement, so it is written for store staff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrintError {
    #[error("Printer did not respond within {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Connection refused by {addr} (check IP/port)")]
    ConnectionRefused { addr: String },

    #[error("Printer not found on network ({addr})")]
    HostUnreachable { addr: String },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Invalid USB identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Could not open USB printer: {0}")]
    DeviceOpenFailed(String),

    #[error("USB write failed: {0}")]
    WriteFailed(String),
}

/// Failures while pulling work from the cloud.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Store token rejected by cloud (HTTP {0})")]
    Auth(u16),

    #[error("Cloud unavailable: {0}")]
    NetworkUnavailable(String),
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth(_))
    }
}
