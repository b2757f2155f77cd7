use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Raw ESC/POS port probed during LAN scans.
pub const PRINTER_PORT: u16 = 9100;

/// Concurrent probes per batch (bounds open sockets).
pub const PROBE_BATCH_SIZE: usize = 30;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// USB printer interface class
const USB_CLASS_PRINTER: u8 = 0x07;

const OS_ENUMERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// TCP connect probe. Resolves to reachability only; never errors.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// `probe` for a host name or address literal. Name lookup and connect
/// share the one deadline.
pub async fn probe_host(host: &str, port: u16, timeout: Duration) -> bool {
    let attempt = async {
        let addr = tokio::net::lookup_host((host, port)).await.ok()?.next()?;
        TcpStream::connect(addr).await.ok()
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(_)))
}

/// Distinct `/24` prefixes of the host's non-loopback IPv4 interfaces.
pub fn local_prefixes() -> Vec<[u8; 3]> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            warn!("Could not list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut prefixes: Vec<[u8; 3]> = Vec::new();
    for (name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if v4.is_loopback() {
                continue;
            }
            let [a, b, c, _] = v4.octets();
            if !prefixes.contains(&[a, b, c]) {
                debug!("Scanning interface {} ({}) as {}.{}.{}.0/24", name, v4, a, b, c);
                prefixes.push([a, b, c]);
            }
        }
    }
    prefixes
}

/// Scan every local `/24` for port 9100.
///
/// `on_progress` gets the rounded percentage after each probe and
/// `on_found` each reachable endpoint as it is found.
pub async fn scan<P, F>(on_progress: P, on_found: F) -> Vec<DiscoveredEndpoint>
where
    P: FnMut(u8),
    F: FnMut(&DiscoveredEndpoint),
{
    let prefixes = local_prefixes();
    if prefixes.is_empty() {
        info!("No non-loopback IPv4 interface, skipping LAN scan");
        return Vec::new();
    }
    scan_prefixes(&prefixes, PRINTER_PORT, DEFAULT_PROBE_TIMEOUT, on_progress, on_found).await
}

/// Probe `.1`-`.254` of each prefix on `port`, `PROBE_BATCH_SIZE` at a time.
pub async fn scan_prefixes<P, F>(
    prefixes: &[[u8; 3]],
    port: u16,
    probe_timeout: Duration,
    mut on_progress: P,
    mut on_found: F,
) -> Vec<DiscoveredEndpoint>
where
    P: FnMut(u8),
    F: FnMut(&DiscoveredEndpoint),
{
    let total = prefixes.len() * 254;
    let mut checked = 0usize;
    let mut found = Vec::new();

    info!("LAN scan started: {} subnet(s), {} addresses, port {}", prefixes.len(), total, port);

    for &[a, b, c] in prefixes {
        let hosts: Vec<Ipv4Addr> = (1..=254u8).map(|d| Ipv4Addr::new(a, b, c, d)).collect();

        for batch in hosts.chunks(PROBE_BATCH_SIZE) {
            let mut probes: FuturesUnordered<_> = batch
                .iter()
                .map(|&ip| async move {
                    let reachable = probe(SocketAddr::new(IpAddr::V4(ip), port), probe_timeout).await;
                    (ip, reachable)
                })
                .collect();

            while let Some((ip, reachable)) = probes.next().await {
                checked += 1;
                let pct = ((checked as f64 / total as f64) * 100.0).round() as u8;
                on_progress(pct.min(100));

                if reachable {
                    let endpoint = DiscoveredEndpoint { ip, port };
                    info!("Found printer-like endpoint at {}:{}", ip, port);
                    on_found(&endpoint);
                    found.push(endpoint);
                }
            }
        }
    }

    info!("LAN scan complete: {} endpoint(s) found", found.len());
    found
}

// =============================================================================
// USB enumeration
// =============================================================================

/// Connected USB devices exposing a printer-class interface, as
/// `VID:XXXX_PID:YYYY` identifiers.
pub fn escpos_usb_devices() -> Vec<String> {
    let context = match rusb::Context::new() {
        Ok(c) => c,
        Err(e) => {
            debug!("USB context unavailable: {}", e);
            return Vec::new();
        }
    };
    let devices = match rusb::UsbContext::devices(&context) {
        Ok(d) => d,
        Err(e) => {
            debug!("USB device list failed: {}", e);
            return Vec::new();
        }
    };

    let mut identifiers = Vec::new();
    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };

        let is_printer = desc.class_code() == USB_CLASS_PRINTER
            || device
                .active_config_descriptor()
                .or_else(|_| device.config_descriptor(0))
                .map(|config| {
                    config
                        .interfaces()
                        .flat_map(|i| i.descriptors())
                        .any(|d| d.class_code() == USB_CLASS_PRINTER)
                })
                .unwrap_or(false);

        if is_printer {
            identifiers.push(format!("VID:{:04X}_PID:{:04X}", desc.vendor_id(), desc.product_id()));
        }
    }
    identifiers
}

/// USB printers installed at the OS level (CUPS queues / Windows printers).
pub async fn installed_usb_printers() -> Vec<String> {
    match tokio::time::timeout(OS_ENUMERATION_TIMEOUT, query_installed_printers()).await {
        Ok(Ok(names)) => names,
        Ok(Err(e)) => {
            debug!("OS printer enumeration unavailable: {}", e);
            Vec::new()
        }
        Err(_) => {
            warn!("OS printer enumeration timed out");
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "windows"))]
async fn query_installed_printers() -> std::io::Result<Vec<String>> {
    let output = tokio::process::Command::new("lpstat")
        .arg("-v")
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(parse_lpstat_usb(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(target_os = "windows")]
async fn query_installed_printers() -> std::io::Result<Vec<String>> {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    let script = "Get-Printer | Where-Object { $_.PortName -like 'USB*' } | Select-Object -ExpandProperty Name";
    let output = tokio::process::Command::new("powershell.exe")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .creation_flags(CREATE_NO_WINDOW)
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Queue names and device URIs of `usb:` entries in `lpstat -v` output.
///
/// Lines look like `device for EPSON_TM_T20: usb://EPSON/TM-T20?serial=X`.
pub fn parse_lpstat_usb(output: &str) -> Vec<String> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("device for ") else {
            continue;
        };
        let Some((name, uri)) = rest.split_once(':') else {
            continue;
        };
        let uri = uri.trim();
        if uri.starts_with("usb:") {
            entries.push(name.trim().to_string());
            entries.push(uri.to_string());
        }
    }
    entries
}

/// Both USB sources combined.
pub async fn usb_printer_inventory() -> Vec<String> {
    let mut inventory = tokio::task::spawn_blocking(escpos_usb_devices)
        .await
        .unwrap_or_default();
    inventory.extend(installed_usb_printers().await);
    inventory
}
