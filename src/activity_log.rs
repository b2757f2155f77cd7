use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::{error, info};

/// Max retained entries; older ones are dropped first.
const MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Ok,
    Erro,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub level: ActivityLevel,
    pub message: String,
}

/// Operator-facing running log of what the agent did.
///
/// Every entry is mirrored to `tracing`, so this is a view for the UI,
/// not a replacement for the process logs.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<RwLock<VecDeque<ActivityEntry>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "activity", "{}", message);
        self.push(ActivityLevel::Info, message);
    }

    pub fn ok(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "activity", ok = true, "{}", message);
        self.push(ActivityLevel::Ok, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(target: "activity", "{}", message);
        self.push(ActivityLevel::Erro, message);
    }

    fn push(&self, level: ActivityLevel, message: String) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(ActivityEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// Most recent `limit` entries, oldest first.
    pub fn entries(&self, limit: usize) -> Vec<ActivityEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
