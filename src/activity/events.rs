use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{Activity, ActivityStatusSummary};
use crate::database::{JsonMap, text_enum};
use crate::notifications::Notification;

/// Events streamed to interactive clients, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    ActivityUpdate { data: Activity },
    StatusUpdate { data: ActivityStatusSummary },
    ConsoleLog { data: ConsoleLine },
    Notification { data: Notification },
    System { event: String },
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::ActivityUpdate { .. } => "activity_update",
            BusEvent::StatusUpdate { .. } => "status_update",
            BusEvent::ConsoleLog { .. } => "console_log",
            BusEvent::Notification { .. } => "notification",
            BusEvent::System { .. } => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanionEventKind {
    FileAdded,
    FileRemoved,
    FileModified,
    FileRenamed,
    Insight,
    Notification,
}

text_enum!(CompanionEventKind {
    FileAdded => "file_added",
    FileRemoved => "file_removed",
    FileModified => "file_modified",
    FileRenamed => "file_renamed",
    Insight => "insight",
    Notification => "notification",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Ephemeral observation from the watcher or the companion monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionEvent {
    #[serde(rename = "type")]
    pub kind: CompanionEventKind,
    pub source: String,
    pub message: String,
    pub data: JsonMap,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl CompanionEvent {
    pub fn new(kind: CompanionEventKind, source: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.to_string(),
            message: message.into(),
            data: JsonMap::new(),
            severity: Severity::Info,
            timestamp: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}
