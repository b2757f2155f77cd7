//! Local print agent: pulls print jobs for one store from the cloud and
//! delivers them to ESC/POS printers on the LAN or over USB.

pub mod activity_log;
pub mod cloud_client;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod escpos;
pub mod presence;
pub mod printer;
pub mod queue;
pub mod realtime;
pub mod routing;
pub mod sentry_init;
pub mod session;
pub mod status;

pub use config::AgentConfig;
pub use dispatcher::{FetchOutcome, JobDispatcher};
pub use errors::{AgentError, FetchError, PrintError, Result};
pub use printer::{print_test_ticket, PrintTransport, WireClient};
pub use routing::PrinterTarget;
pub use session::SessionManager;
pub use status::ConnectionState;
