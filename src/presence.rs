use crate::discovery::{self, probe_host};
use crate::queue::{opt_string_or_number, string_or_number};
use crate::routing::DEFAULT_PRINTER_PORT;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PRESENCE_PROBE_TIMEOUT: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterKind {
    #[serde(alias = "IP")]
    Ip,
    #[serde(alias = "USB")]
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A printer as configured in the cloud (`GET /printer-jobs/agent/printers`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredPrinter {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: PrinterKind,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default, deserialize_with = "opt_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub usb_identifier: Option<String>,
}

fn default_active() -> bool {
    true
}

fn opt_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.and_then(|p| p.trim().parse().ok()))
}

/// Per-printer entry of a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: String,
    pub sector: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: PrinterKind,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
}

/// Decides which configured printers are reachable right now.
///
/// Never fails: probe errors count as offline and a missing USB stack
/// just means an empty USB inventory.
#[derive(Debug, Clone)]
pub struct PresenceDetector {
    probe_timeout: Duration,
}

impl Default for PresenceDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_PROBE_TIMEOUT)
    }
}

impl PresenceDetector {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    pub async fn detect_printers(&self, printers: &[ConfiguredPrinter]) -> Vec<PresenceRecord> {
        let needs_usb = printers.iter().any(|p| p.is_active && p.kind == PrinterKind::Usb);
        let inventory = if needs_usb {
            discovery::usb_printer_inventory().await
        } else {
            Vec::new()
        };
        self.detect_with_inventory(printers, &inventory).await
    }

    /// Same as `detect_printers` with a caller-supplied USB inventory.
    pub async fn detect_with_inventory(
        &self,
        printers: &[ConfiguredPrinter],
        usb_inventory: &[String],
    ) -> Vec<PresenceRecord> {
        let checks = printers.iter().map(|printer| async move {
            let online = if !printer.is_active {
                false
            } else {
                match printer.kind {
                    PrinterKind::Ip => self.ip_reachable(printer).await,
                    PrinterKind::Usb => usb_present(printer, usb_inventory),
                }
            };
            debug!("Printer {} presence: {}", printer.id, online);
            PresenceRecord {
                id: printer.id.clone(),
                sector: printer.sector.clone(),
                name: printer.name.clone(),
                kind: printer.kind,
                status: if online { PresenceStatus::Online } else { PresenceStatus::Offline },
                last_seen_at: Utc::now(),
            }
        });

        futures_util::future::join_all(checks).await
    }

    async fn ip_reachable(&self, printer: &ConfiguredPrinter) -> bool {
        let Some(host) = printer.ip_address.as_deref().map(str::trim).filter(|h| !h.is_empty()) else {
            return false;
        };
        let port = printer.port.unwrap_or(DEFAULT_PRINTER_PORT);
        probe_host(host, port, self.probe_timeout).await
    }
}

/// Case-insensitive substring match in either direction against the USB
/// inventory. A printer with neither identifier nor name counts as present
/// whenever any USB printer is attached.
pub fn usb_present(printer: &ConfiguredPrinter, inventory: &[String]) -> bool {
    let needle = printer
        .usb_identifier
        .as_deref()
        .or(printer.name.as_deref())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    match needle {
        None => !inventory.is_empty(),
        Some(needle) => inventory.iter().any(|entry| {
            let entry = entry.trim().to_lowercase();
            !entry.is_empty() && (entry.contains(&needle) || needle.contains(&entry))
        }),
    }
}
