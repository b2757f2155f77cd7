use crate::errors::{AgentError, Result};
use crate::routing::PrinterTarget;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer};

/// One pending print job as pulled from the cloud.
///
/// `payload` is opaque: it is written to the printer byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub id: String,
    pub order_id: Option<String>,
    pub sector: Option<String>,
    pub target: PrinterTarget,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum TargetType {
    #[serde(alias = "ip")]
    Ip,
    #[serde(alias = "usb")]
    Usb,
}

/// Wire shape of a job. Accepts camelCase and snake_case keys.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRecord {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default, alias = "order_id", deserialize_with = "opt_string_or_number")]
    order_id: Option<String>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(alias = "target_type")]
    target_type: TargetType,
    #[serde(alias = "target_address")]
    target_address: String,
    #[serde(default, alias = "target_port")]
    target_port: Option<u16>,
    payload: String,
}

impl PrintJob {
    /// Build a job from one element of the `/printer-jobs` response.
    pub fn from_record(record: &serde_json::Value) -> Result<Self> {
        let record: JobRecord = serde_json::from_value(record.clone())
            .map_err(|e| AgentError::InvalidJob(e.to_string()))?;

        let target = match record.target_type {
            TargetType::Ip => PrinterTarget::parse_ip(&record.target_address, record.target_port)
                .ok_or_else(|| {
                    AgentError::InvalidJob(format!("Bad printer address '{}'", record.target_address))
                })?,
            TargetType::Usb => {
                if record.target_address.trim().is_empty() {
                    return Err(AgentError::InvalidJob("Empty USB identifier".to_string()));
                }
                PrinterTarget::usb(&record.target_address)
            }
        };

        let payload = BASE64
            .decode(record.payload.trim())
            .map_err(|e| AgentError::InvalidJob(format!("Payload is not base64: {}", e)))?;

        Ok(PrintJob {
            id: record.id,
            order_id: record.order_id,
            sector: record.sector,
            target,
            payload,
        })
    }
}

/// Best-effort id extraction for records that failed to parse.
pub fn record_id(record: &serde_json::Value) -> Option<String> {
    match record.get("id")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

pub(crate) fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}
