use crate::errors::PrintError;
use crate::escpos::build_test_ticket;
use crate::routing::PrinterTarget;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rusb::{Context, UsbContext};
use std::fmt;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default bound on a single delivery.
pub const DEFAULT_PRINT_TIMEOUT: Duration = Duration::from_secs(8);

/// `VID:04B8_PID:0202`, `vid=04b8 pid=0202`, `USB\VID_04B8&PID_0202\...`
static VID_PID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)VID[:=_-]([0-9a-f]{4}).*?PID[:=_-]([0-9a-f]{4})")
        .expect("Invalid VID/PID regex pattern")
});
/// Bare `04b8:0202`
static BARE_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([0-9a-f]{4}):([0-9a-f]{4})\s*$").expect("Invalid bare USB id regex pattern")
});

/// USB vendor/product pair identifying a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbDeviceId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbDeviceId {
    pub fn parse(identifier: &str) -> Result<Self, PrintError> {
        let caps = VID_PID_REGEX
            .captures(identifier)
            .or_else(|| BARE_ID_REGEX.captures(identifier))
            .ok_or_else(|| PrintError::InvalidIdentifier(identifier.to_string()))?;

        let hex = |i: usize| {
            u16::from_str_radix(&caps[i], 16)
                .map_err(|_| PrintError::InvalidIdentifier(identifier.to_string()))
        };

        Ok(Self { vid: hex(1)?, pid: hex(2)? })
    }
}

impl fmt::Display for UsbDeviceId {
    /// Canonical `VID:XXXX_PID:YYYY` form
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VID:{:04X}_PID:{:04X}", self.vid, self.pid)
    }
}

/// Delivers one opaque payload to one printer.
///
/// Implementations never retry; the dispatcher owns that decision.
#[async_trait]
pub trait PrintTransport: Send + Sync {
    async fn send(
        &self,
        target: &PrinterTarget,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), PrintError>;
}

/// Raw ESC/POS over TCP or USB bulk transfer.
#[derive(Debug, Clone, Default)]
pub struct WireClient;

impl WireClient {
    pub fn new() -> Self {
        Self
    }

    /// Raw TCP delivery: connect, write, flush, shut down our side.
    ///
    /// The whole sequence is bounded by `timeout`; on expiry the in-flight
    /// future is dropped, which closes the socket.
    pub async fn send_tcp(&self, addr: &str, payload: &[u8], timeout: Duration) -> Result<(), PrintError> {
        let started = Instant::now();
        let delivery = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| classify_io_error(addr, &e))?;
            stream.set_nodelay(true).ok();
            stream
                .write_all(payload)
                .await
                .map_err(|e| classify_io_error(addr, &e))?;
            stream.flush().await.map_err(|e| classify_io_error(addr, &e))?;
            stream
                .shutdown()
                .await
                .map_err(|e| classify_io_error(addr, &e))?;
            Ok::<_, PrintError>(())
        };

        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(())) => {
                debug!("Delivered {} bytes to {} in {:?}", payload.len(), addr, started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Delivery to {} timed out after {:?}", addr, timeout);
                Err(PrintError::Timeout { after_ms: timeout.as_millis() as u64 })
            }
        }
    }

    /// USB delivery by vendor/product id. Identifier parsing happens before
    /// any device access.
    pub async fn send_usb(&self, identifier: &str, payload: &[u8], timeout: Duration) -> Result<(), PrintError> {
        let id = UsbDeviceId::parse(identifier)?;
        let data = payload.to_vec();

        // rusb is synchronous; keep it off the async workers
        let task = tokio::task::spawn_blocking(move || write_usb_blocking(id, &data, timeout));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PrintError::WriteFailed(format!("USB task failed: {}", e))),
            Err(_) => {
                warn!("USB delivery to {} timed out after {:?}", id, timeout);
                Err(PrintError::Timeout { after_ms: timeout.as_millis() as u64 })
            }
        }
    }
}

#[async_trait]
impl PrintTransport for WireClient {
    #[tracing::instrument(skip(self, payload), fields(printer = %target, bytes = payload.len()))]
    async fn send(
        &self,
        target: &PrinterTarget,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), PrintError> {
        match target {
            PrinterTarget::Ip { .. } => {
                let addr = target
                    .socket_address()
                    .ok_or_else(|| PrintError::Transport("Missing printer address".to_string()))?;
                self.send_tcp(&addr, payload, timeout).await
            }
            PrinterTarget::Usb { identifier } => self.send_usb(identifier, payload, timeout).await,
        }
    }
}

/// Map socket errors onto the delivery taxonomy.
fn classify_io_error(addr: &str, err: &std::io::Error) -> PrintError {
    match err.kind() {
        ErrorKind::ConnectionRefused => PrintError::ConnectionRefused { addr: addr.to_string() },
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::TimedOut => {
            PrintError::HostUnreachable { addr: addr.to_string() }
        }
        _ => PrintError::Transport(format!("{}: {}", addr, err)),
    }
}

fn write_usb_blocking(id: UsbDeviceId, data: &[u8], timeout: Duration) -> Result<(), PrintError> {
    let context = Context::new().map_err(|e| PrintError::DeviceOpenFailed(format!("USB unavailable: {}", e)))?;

    let device = context
        .devices()
        .map_err(|e| PrintError::DeviceOpenFailed(e.to_string()))?
        .iter()
        .find(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == id.vid && desc.product_id() == id.pid)
                .unwrap_or(false)
        })
        .ok_or_else(|| PrintError::DeviceOpenFailed(format!("{} not connected", id)))?;

    let config = device
        .active_config_descriptor()
        .map_err(|e| PrintError::DeviceOpenFailed(e.to_string()))?;

    // First bulk OUT endpoint and the interface it belongs to
    let (interface_number, endpoint) = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .find_map(|iface| {
            iface
                .endpoint_descriptors()
                .find(|ep| {
                    ep.direction() == rusb::Direction::Out
                        && ep.transfer_type() == rusb::TransferType::Bulk
                })
                .map(|ep| (iface.interface_number(), ep.address()))
        })
        .ok_or_else(|| PrintError::DeviceOpenFailed(format!("{} has no bulk OUT endpoint", id)))?;

    let handle = device.open().map_err(|e| {
        if e == rusb::Error::Access {
            PrintError::DeviceOpenFailed(format!("permission denied for {}", id))
        } else {
            PrintError::DeviceOpenFailed(format!("{}: {}", id, e))
        }
    })?;

    let _ = handle.set_auto_detach_kernel_driver(true);
    handle
        .claim_interface(interface_number)
        .map_err(|e| PrintError::DeviceOpenFailed(format!("interface busy on {}: {}", id, e)))?;

    let mut written = 0;
    let result = loop {
        if written >= data.len() {
            break Ok(());
        }
        match handle.write_bulk(endpoint, &data[written..], timeout) {
            Ok(0) => break Err(PrintError::WriteFailed(format!("{} accepted no data", id))),
            Ok(n) => written += n,
            Err(rusb::Error::Timeout) => {
                break Err(PrintError::Timeout { after_ms: timeout.as_millis() as u64 })
            }
            Err(e) => break Err(PrintError::WriteFailed(e.to_string())),
        }
    };

    handle.release_interface(interface_number).ok();
    if result.is_ok() {
        debug!("Wrote {} bytes to USB printer {}", data.len(), id);
    }
    result
}

/// Deliver the connectivity test ticket to `target`.
pub async fn print_test_ticket(
    transport: &dyn PrintTransport,
    target: &PrinterTarget,
    store_name: &str,
) -> Result<(), PrintError> {
    info!("Test print requested for {}", target);
    let ticket = build_test_ticket(store_name);
    transport.send(target, &ticket, DEFAULT_PRINT_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_vid_pid_forms() {
        let expected = UsbDeviceId { vid: 0x04B8, pid: 0x0202 };
        assert_eq!(UsbDeviceId::parse("VID:04B8_PID:0202").unwrap(), expected);
        assert_eq!(UsbDeviceId::parse("04b8:0202").unwrap(), expected);
        assert_eq!(UsbDeviceId::parse("vid=04b8-pid=0202").unwrap(), expected);
        assert_eq!(UsbDeviceId::parse("vid-04b8 pid_0202").unwrap(), expected);
        assert_eq!(UsbDeviceId::parse(r"USB\VID_04B8&PID_0202\5&2A3B").unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["not-an-id", "", "04b8-0202", "VID:04B_PID:0202", "04b80202"] {
            assert!(
                matches!(UsbDeviceId::parse(bad), Err(PrintError::InvalidIdentifier(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn test_canonical_display() {
        let id = UsbDeviceId { vid: 0x0519, pid: 0x000b };
        assert_eq!(id.to_string(), "VID:0519_PID:000B");
    }

    #[tokio::test]
    async fn test_invalid_usb_identifier_fails_before_io() {
        let client = WireClient::new();
        let started = Instant::now();
        let err = client
            .send(&PrinterTarget::usb("not-an-id"), b"x", Duration::from_secs(8))
            .await
            .unwrap_err();
        assert!(matches!(err, PrintError::InvalidIdentifier(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tcp_delivery_writes_payload_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let payload = vec![0x1b, 0x40, 0x00, 0xff, b'o', b'k', 0x1d, 0x56, 0x00];
        WireClient::new()
            .send(&PrinterTarget::ip("127.0.0.1", port), &payload, Duration::from_secs(2))
            .await
            .unwrap();

        // read_to_end finishing proves the agent closed its side
        assert_eq!(server.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = WireClient::new()
            .send(&PrinterTarget::ip("127.0.0.1", port), b"x", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, PrintError::ConnectionRefused { addr: format!("127.0.0.1:{}", port) });
    }

    #[test]
    fn test_io_error_classification() {
        let addr = "10.0.0.1:9100";
        let unreachable = std::io::Error::from(ErrorKind::HostUnreachable);
        assert_eq!(
            classify_io_error(addr, &unreachable),
            PrintError::HostUnreachable { addr: addr.to_string() }
        );
        let other = std::io::Error::from(ErrorKind::BrokenPipe);
        assert!(matches!(classify_io_error(addr, &other), PrintError::Transport(_)));
    }
}
