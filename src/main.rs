use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use store_print_agent::{discovery, print_test_ticket, AgentConfig, PrinterTarget, SessionManager, WireClient};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = AgentConfig::log_dir();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(sentry_tracing::layer())
        .init();

    guard
}

#[derive(Parser)]
#[command(name = "store-print-agent", version, about = "Bridges cloud print jobs to store receipt printers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the cloud and print jobs until Ctrl-C (default)
    Run,
    /// Scan the local network for printers on port 9100
    Scan,
    /// Print the connectivity test ticket
    TestPrint {
        /// `host[:port]` for a network printer, or `usb:VID:XXXX_PID:YYYY`
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging();
    let _sentry_guard = store_print_agent::sentry_init::init();

    info!("Store print agent v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Scan => scan().await,
        Command::TestPrint { target } => test_print(&target).await,
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AgentConfig::load().context("loading agent configuration")?;
    let manager = SessionManager::new(Arc::new(WireClient::new()));

    manager.connect(config).await.context("starting session")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    manager.disconnect().await;
    Ok(())
}

async fn scan() -> anyhow::Result<()> {
    let found = discovery::scan(
        |pct| info!("Scanning... {}%", pct),
        |endpoint| println!("{}:{}", endpoint.ip, endpoint.port),
    )
    .await;
    if found.is_empty() {
        warn!("No printers answered on port {}", discovery::PRINTER_PORT);
    }
    Ok(())
}

async fn test_print(target: &str) -> anyhow::Result<()> {
    let target = match target.strip_prefix("usb:") {
        Some(identifier) => PrinterTarget::usb(identifier),
        None => PrinterTarget::parse_ip(target, None)
            .with_context(|| format!("'{}' is not a printer address", target))?,
    };
    let store_name = AgentConfig::load().map(|c| c.store_name).unwrap_or_default();

    print_test_ticket(&WireClient::new(), &target, &store_name).await?;
    info!("Test ticket sent to {}", target);
    Ok(())
}
