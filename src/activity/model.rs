use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::database::{JsonMap, json_map, text_enum};

/// Kinds of work tracked on the bus. Closed set; rows with any other value fail to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scanning,
    Indexing,
    ThumbnailGeneration,
    ThumbnailGenerationBatch,
    PerformerThumbnailGeneration,
    PerformerScan,
    VideoScan,
    Metadata,
    AiTagging,
    ScraperThread,
    ForumScrape,
    LinkVerification,
    VideoConversion,
}

text_enum!(TaskKind {
    Scanning => "scanning",
    Indexing => "indexing",
    ThumbnailGeneration => "thumbnail_generation",
    ThumbnailGenerationBatch => "thumbnail_generation_batch",
    PerformerThumbnailGeneration => "performer_thumbnail_generation",
    PerformerScan => "performer_scan",
    VideoScan => "video_scan",
    Metadata => "metadata",
    AiTagging => "ai_tagging",
    ScraperThread => "scraper_thread",
    ForumScrape => "forum_scrape",
    LinkVerification => "link_verification",
    VideoConversion => "video_conversion",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

text_enum!(ActivityStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl ActivityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivityStatus::Completed | ActivityStatus::Failed)
    }
}

/// One durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub task_type: TaskKind,
    pub status: ActivityStatus,
    pub message: String,
    pub progress: u8,
    pub details: JsonMap,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub checkpoint: Option<JsonMap>,
}

pub(crate) const ACTIVITY_COLUMNS: &str = "id, task_type, status, message, progress, details, started_at, updated_at, \
     completed_at, is_paused, paused_at, checkpoint";

impl Activity {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let checkpoint: Option<String> = row.get(11)?;
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            status: row.get(2)?,
            message: row.get(3)?,
            progress: row.get(4)?,
            details: json_map(row.get(5)?),
            started_at: row.get(6)?,
            updated_at: row.get(7)?,
            completed_at: row.get(8)?,
            is_paused: row.get(9)?,
            paused_at: row.get(10)?,
            checkpoint: checkpoint.map(|raw| json_map(Some(raw))),
        })
    }

    pub fn detail_i64(&self, key: &str) -> Option<i64> {
        self.details.get(key).and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
    }
}

/// Partial update applied by `ActivityBus::update`.
#[derive(Debug, Clone, Default)]
pub struct ActivityPatch {
    pub status: Option<ActivityStatus>,
    pub message: Option<String>,
    pub progress: Option<i64>,
    pub details: Option<JsonMap>,
    pub completed: bool,
}

impl ActivityPatch {
    pub fn progress(progress: i64, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Counts by status plus the most recent running records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityStatusSummary {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub running_tasks: Vec<Activity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTypeStats {
    pub task_type: String,
    pub total: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

/// What a worker should do at its next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Paused,
    Cancelled,
}

/// How a worker that stopped early left its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Resumable from the saved checkpoint.
    Paused,
    /// Failed with `cancelled`.
    Cancelled,
}
