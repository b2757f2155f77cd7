use crate::queue::PrintJob;
use std::collections::HashMap;
use std::fmt;

/// Default raw ESC/POS port.
pub const DEFAULT_PRINTER_PORT: u16 = 9100;

/// Where a job goes. Also the queue partition key: jobs with equal targets
/// print in arrival order, different targets print concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrinterTarget {
    Ip { address: String, port: u16 },
    /// Identifier is stored uppercased so equality matches the key.
    Usb { identifier: String },
}

impl PrinterTarget {
    pub fn ip(address: impl Into<String>, port: u16) -> Self {
        PrinterTarget::Ip {
            address: address.into().trim().to_string(),
            port,
        }
    }

    pub fn usb(identifier: impl AsRef<str>) -> Self {
        PrinterTarget::Usb {
            identifier: identifier.as_ref().trim().to_uppercase(),
        }
    }

    /// Parse `host`, `host:port` (or `[v6]:port`) into an IP target.
    pub fn parse_ip(address: &str, port: Option<u16>) -> Option<Self> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }

        if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None => port.unwrap_or(DEFAULT_PRINTER_PORT),
            };
            return Some(Self::ip(host, port));
        }

        match address.rsplit_once(':') {
            // More than one colon without brackets: bare IPv6
            Some((host, _)) if host.contains(':') => {
                Some(Self::ip(address, port.unwrap_or(DEFAULT_PRINTER_PORT)))
            }
            Some((host, p)) => Some(Self::ip(host, p.parse().ok()?)),
            None => Some(Self::ip(address, port.unwrap_or(DEFAULT_PRINTER_PORT))),
        }
    }

    /// Normalized key: `IP:<address>:<port>` or `USB:<IDENTIFIER>`.
    pub fn key(&self) -> String {
        match self {
            PrinterTarget::Ip { address, port } => format!("IP:{}:{}", address, port),
            PrinterTarget::Usb { identifier } => format!("USB:{}", identifier),
        }
    }

    pub fn socket_address(&self) -> Option<String> {
        match self {
            PrinterTarget::Ip { address, port } if address.contains(':') => {
                Some(format!("[{}]:{}", address, port))
            }
            PrinterTarget::Ip { address, port } => Some(format!("{}:{}", address, port)),
            PrinterTarget::Usb { .. } => None,
        }
    }
}

impl fmt::Display for PrinterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One printer's jobs, in arrival order.
#[derive(Debug)]
pub struct PrinterQueue {
    pub target: PrinterTarget,
    pub jobs: Vec<PrintJob>,
}

/// Split jobs into per-printer queues.
///
/// Queues come out in order of each printer's first job and every queue
/// keeps the relative order its jobs had in `jobs`.
pub fn partition_by_target(jobs: Vec<PrintJob>) -> Vec<PrinterQueue> {
    let mut index: HashMap<PrinterTarget, usize> = HashMap::new();
    let mut queues: Vec<PrinterQueue> = Vec::new();

    for job in jobs {
        match index.get(&job.target) {
            Some(&i) => queues[i].jobs.push(job),
            None => {
                index.insert(job.target.clone(), queues.len());
                queues.push(PrinterQueue {
                    target: job.target.clone(),
                    jobs: vec![job],
                });
            }
        }
    }

    queues
}
