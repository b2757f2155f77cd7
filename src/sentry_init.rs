use crate::errors::PrintError;
use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
static UUID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("Invalid UUID regex pattern")
});
static JWT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+")
        .expect("Invalid JWT regex pattern")
});
static BEARER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+")
        .expect("Invalid bearer regex pattern")
});
// Seven digits minimum so IP octets and ports survive.
static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?[1-9]\d{6,14}")
        .expect("Invalid phone regex pattern")
});

/// Initialize Sentry crash reporting.
///
/// Reads `SENTRY_DSN` (disabled when unset), `SENTRY_ENVIRONMENT` and
/// `SENTRY_RELEASE`. The returned guard must live as long as the process.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "production".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

fn before_send_filter(mut event: sentry::protocol::Event<'static>) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = strip_pii_from_message(message);
    }
    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = strip_pii_from_message(value);
        }
    }
    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = strip_pii_from_message(message);
        }
    }

    event.tags.insert("agent_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());

    Some(event)
}

/// Remove tokens and personal data from a message before it leaves the host.
pub fn strip_pii_from_message(message: &str) -> String {
    let cleaned = EMAIL_REGEX.replace_all(message, "[EMAIL_REDACTED]");
    // UUIDs go before phone numbers; the phone pattern would eat their digits.
    let cleaned = UUID_REGEX.replace_all(&cleaned, "[UUID_REDACTED]");
    let cleaned = JWT_REGEX.replace_all(&cleaned, "[JWT_REDACTED]");
    let cleaned = BEARER_REGEX.replace_all(&cleaned, "Bearer [TOKEN_REDACTED]");
    PHONE_REGEX.replace_all(&cleaned, "[PHONE_REDACTED]").into_owned()
}

/// Tag the Sentry scope with a hash of the store id.
pub fn set_store_context(store_id: &str) {
    let hashed_id = format!("{:x}", md5::compute(store_id));
    sentry::configure_scope(|scope| {
        scope.set_tag("store_id_hash", hashed_id);
    });
}

/// Report a failed delivery. Job id is hashed; the printer key is kept
/// since it is an address on the store's own network.
pub fn capture_print_failure(job_id: &str, target_key: &str, error: &PrintError) {
    let kind = match error {
        PrintError::Timeout { .. } => "timeout",
        PrintError::ConnectionRefused { .. } => "connection_refused",
        PrintError::HostUnreachable { .. } => "host_unreachable",
        PrintError::Transport(_) => "transport",
        PrintError::InvalidIdentifier(_) => "invalid_identifier",
        PrintError::DeviceOpenFailed(_) => "device_open_failed",
        PrintError::WriteFailed(_) => "write_failed",
    };

    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "print_failure");
            scope.set_tag("failure_kind", kind);
            scope.set_tag("printer", target_key);
            scope.set_context(
                "print_job",
                sentry::protocol::Context::Other(sentry::protocol::Map::from_iter(vec![(
                    "job_id_hash".to_string(),
                    format!("{:x}", md5::compute(job_id)).into(),
                )])),
            );
        },
        || {
            sentry::capture_message(
                &format!("Print job failed: {}", strip_pii_from_message(&error.to_string())),
                sentry::Level::Error,
            );
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_pii_email() {
        let cleaned = strip_pii_from_message("Owner jane.doe@example.com triggered error");
        assert!(!cleaned.contains("jane.doe@example.com"));
        assert!(cleaned.contains("[EMAIL_REDACTED]"));
    }

    #[test]
    fn test_strip_pii_uuid() {
        let cleaned = strip_pii_from_message("Store 550e8400-e29b-41d4-a716-446655440000 failed");
        assert!(!cleaned.contains("550e8400"));
        assert!(cleaned.contains("[UUID_REDACTED]"));
    }

    #[test]
    fn test_strip_bearer_token() {
        let cleaned = strip_pii_from_message("request with Authorization: Bearer s3cr3t-store-token failed");
        assert!(!cleaned.contains("s3cr3t-store-token"));
        assert!(cleaned.contains("Bearer [TOKEN_REDACTED]"));
    }

    #[test]
    fn test_strip_pii_jwt() {
        let test_jwt = ["eyJhbGci", "OiJIUzI1NiJ9.", "eyJzdWIiOi", "IxMjMifQ.", "c2lnbmF0dXJl"].join("");
        let cleaned = strip_pii_from_message(&format!("token {}", test_jwt));
        assert!(!cleaned.contains("eyJhbGci"));
        assert!(cleaned.contains("[JWT_REDACTED]"));
    }

    #[test]
    fn test_printer_addresses_survive() {
        let message = PrintError::ConnectionRefused { addr: "192.168.1.50:9100".into() }.to_string();
        assert_eq!(strip_pii_from_message(&message), message);
    }

    #[test]
    fn test_phone_numbers_redacted() {
        let cleaned = strip_pii_from_message("call +31612345678 for pickup");
        assert!(cleaned.contains("[PHONE_REDACTED]"));
    }
}
