//! Scheduled job records, execution history and next-run arithmetic.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::cron::CronSchedule;
use crate::database::{JsonMap, text_enum};

/// Job kinds the dispatcher knows. Stored as free text so an unknown kind
/// can still be loaded and reported as a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ScrapeThread,
    VerifyLinks,
    CleanupOldActivities,
    CleanupOldAuditLogs,
    DatabaseBackup,
    CleanupOldBackups,
}

text_enum!(JobKind {
    ScrapeThread => "scrape_thread",
    VerifyLinks => "verify_links",
    CleanupOldActivities => "cleanup_old_activities",
    CleanupOldAuditLogs => "cleanup_old_audit_logs",
    DatabaseBackup => "database_backup",
    CleanupOldBackups => "cleanup_old_backups",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
    Once,
}

text_enum!(ScheduleType {
    Interval => "interval",
    Cron => "cron",
    Once => "once",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

text_enum!(ExecutionStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// JSON stored in `schedule_config`. `timeout_minutes` doubles as the
/// retention in days for the cleanup kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(skip_serializing_if = "is_zero")]
    pub interval_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_start: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_retries: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub timeout_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub job_type: String,
    pub schedule_type: ScheduleType,
    pub schedule_config: ScheduleConfig,
    pub target_type: Option<String>,
    pub target_id: Option<i64>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, name, job_type, schedule_type, schedule_config, target_type, target_id, enabled, \
     last_run_at, next_run_at, run_count, success_count, failure_count, created_at, updated_at";

impl ScheduledJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let config: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            job_type: row.get(2)?,
            schedule_type: row.get(3)?,
            schedule_config: serde_json::from_str(&config).unwrap_or_default(),
            target_type: row.get(5)?,
            target_id: row.get(6)?,
            enabled: row.get(7)?,
            last_run_at: row.get(8)?,
            next_run_at: row.get(9)?,
            run_count: row.get(10)?,
            success_count: row.get(11)?,
            failure_count: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    pub fn kind(&self) -> Option<JobKind> {
        self.job_type.parse().ok()
    }

    /// Retention in days for the cleanup kinds, or `default`.
    pub fn retention_days(&self, default: i64) -> i64 {
        match self.schedule_config.timeout_minutes {
            days if days > 0 => days,
            _ => default,
        }
    }
}

/// Everything a caller supplies when creating or replacing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub job_type: String,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl JobDefinition {
    pub fn interval(name: &str, kind: JobKind, minutes: i64) -> Self {
        Self {
            name: name.to_string(),
            job_type: kind.as_str().to_string(),
            schedule_type: ScheduleType::Interval,
            schedule_config: ScheduleConfig {
                interval_minutes: minutes,
                ..ScheduleConfig::default()
            },
            target_type: None,
            target_id: None,
            enabled: true,
        }
    }

    pub fn cron(name: &str, kind: JobKind, expression: &str) -> Self {
        Self {
            schedule_type: ScheduleType::Cron,
            schedule_config: ScheduleConfig {
                cron_expression: Some(expression.to_string()),
                ..ScheduleConfig::default()
            },
            ..Self::interval(name, kind, 0)
        }
    }

    pub fn once(name: &str, kind: JobKind, run_at: Option<DateTime<Utc>>) -> Self {
        Self {
            schedule_type: ScheduleType::Once,
            schedule_config: ScheduleConfig {
                run_at,
                ..ScheduleConfig::default()
            },
            ..Self::interval(name, kind, 0)
        }
    }

    pub fn target(mut self, target_type: &str, target_id: i64) -> Self {
        self.target_type = Some(target_type.to_string());
        self.target_id = Some(target_id);
        self
    }

    pub fn retention_days(mut self, days: i64) -> Self {
        self.schedule_config.timeout_minutes = days;
        self
    }

    /// Reject schedules that could never run or would run on every tick.
    pub fn validate(&self) -> Result<(), String> {
        match self.schedule_type {
            ScheduleType::Interval if self.schedule_config.interval_minutes <= 0 => {
                Err("interval jobs need interval_minutes > 0".to_string())
            }
            ScheduleType::Cron => match &self.schedule_config.cron_expression {
                Some(expr) => CronSchedule::parse(expr).map(|_| ()).map_err(|e| e.to_string()),
                None => Err("cron jobs need a cron_expression".to_string()),
            },
            _ => Ok(()),
        }
    }
}

/// Outcome of one dispatch, stored as JSON in the history row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub items_processed: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub items_succeeded: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub items_failed: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub details: JsonMap,
}

impl JobResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn processed(mut self, items: i64) -> Self {
        self.items_processed = items;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

impl ExecutionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let result: Option<String> = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            status: row.get(4)?,
            result: result.and_then(|raw| serde_json::from_str(&raw).ok()),
            error_message: row.get(6)?,
            duration_ms: row.get(7)?,
        })
    }
}

// ---- next-run arithmetic ----

/// `next_run_at` for a freshly created or edited job. `None` means due now.
pub fn initial_next_run(schedule: ScheduleType, config: &ScheduleConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        ScheduleType::Interval => None,
        ScheduleType::Once => config.run_at,
        ScheduleType::Cron => cron_next(config, now),
    }
}

/// `next_run_at` after a run finished at `now`, and whether the job should be
/// disabled.
pub fn after_run(schedule: ScheduleType, config: &ScheduleConfig, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, bool) {
    match schedule {
        ScheduleType::Interval if config.interval_minutes > 0 => {
            (Some(now + ChronoDuration::minutes(config.interval_minutes)), false)
        }
        ScheduleType::Interval => (None, false),
        ScheduleType::Once => (None, true),
        ScheduleType::Cron => (cron_next(config, now), false),
    }
}

fn cron_next(config: &ScheduleConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let expr = config.cron_expression.as_deref()?;
    match CronSchedule::parse(expr) {
        Ok(schedule) => schedule.next_after(now),
        Err(e) => {
            warn!("Unparseable cron expression '{}': {}", expr, e);
            None
        }
    }
}

// ---- storage ----

pub fn insert_job(conn: &Connection, def: &JobDefinition, now: DateTime<Utc>) -> rusqlite::Result<ScheduledJob> {
    let config = serde_json::to_string(&def.schedule_config).unwrap_or_else(|_| "{}".to_string());
    let next_run_at = initial_next_run(def.schedule_type, &def.schedule_config, now);
    conn.execute(
        "INSERT INTO scheduled_jobs (name, job_type, schedule_type, schedule_config, target_type, target_id,
             enabled, next_run_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            def.name,
            def.job_type,
            def.schedule_type,
            config,
            def.target_type,
            def.target_id,
            def.enabled,
            next_run_at,
            now
        ],
    )?;
    job_by_id(conn, conn.last_insert_rowid())?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

/// Replace a job's definition and recompute its next run. Counters survive.
pub fn replace_job(conn: &Connection, id: i64, def: &JobDefinition, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    let config = serde_json::to_string(&def.schedule_config).unwrap_or_else(|_| "{}".to_string());
    let next_run_at = initial_next_run(def.schedule_type, &def.schedule_config, now);
    let changed = conn.execute(
        "UPDATE scheduled_jobs SET name = ?1, job_type = ?2, schedule_type = ?3, schedule_config = ?4,
             target_type = ?5, target_id = ?6, enabled = ?7, next_run_at = ?8, updated_at = ?9
         WHERE id = ?10",
        params![
            def.name,
            def.job_type,
            def.schedule_type,
            config,
            def.target_type,
            def.target_id,
            def.enabled,
            next_run_at,
            now,
            id
        ],
    )?;
    Ok(changed > 0)
}

pub fn set_enabled(conn: &Connection, id: i64, enabled: bool, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    Ok(conn.execute(
        "UPDATE scheduled_jobs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
        params![enabled, now, id],
    )? > 0)
}

pub fn delete_job(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", [id])? > 0)
}

pub fn job_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<ScheduledJob>> {
    conn.query_row(
        &format!("SELECT {} FROM scheduled_jobs WHERE id = ?1", JOB_COLUMNS),
        [id],
        ScheduledJob::from_row,
    )
    .optional()
}

pub fn list_jobs(conn: &Connection) -> rusqlite::Result<Vec<ScheduledJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scheduled_jobs ORDER BY created_at DESC, id DESC",
        JOB_COLUMNS
    ))?;
    stmt.query_map([], ScheduledJob::from_row)?.collect()
}

/// Enabled jobs whose `next_run_at` is unset or not in the future.
pub fn due_jobs(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<ScheduledJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scheduled_jobs
         WHERE enabled = 1 AND (next_run_at IS NULL OR next_run_at <= ?1)
         ORDER BY next_run_at IS NOT NULL, next_run_at ASC, id ASC",
        JOB_COLUMNS
    ))?;
    stmt.query_map([now], ScheduledJob::from_row)?.collect()
}

/// Counters, timestamps and next run after one dispatch.
pub fn record_run(
    conn: &Connection,
    id: i64,
    success: bool,
    now: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
    disable: bool,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE scheduled_jobs SET
             last_run_at = ?1,
             next_run_at = ?2,
             run_count = run_count + 1,
             success_count = success_count + ?3,
             failure_count = failure_count + ?4,
             enabled = CASE WHEN ?5 THEN 0 ELSE enabled END,
             updated_at = ?1
         WHERE id = ?6",
        params![now, next_run_at, success as i64, (!success) as i64, disable, id],
    )?;
    Ok(())
}

pub fn start_execution(conn: &Connection, job_id: i64, started_at: DateTime<Utc>) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO job_execution_history (job_id, started_at, status) VALUES (?1, ?2, ?3)",
        params![job_id, started_at, ExecutionStatus::Running],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_execution(
    conn: &Connection,
    history_id: i64,
    result: &JobResult,
    completed_at: DateTime<Utc>,
    duration_ms: i64,
) -> rusqlite::Result<()> {
    let (status, error) = if result.success {
        (ExecutionStatus::Completed, None)
    } else {
        (ExecutionStatus::Failed, Some(result.message.as_str()))
    };
    let data = serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string());
    conn.execute(
        "UPDATE job_execution_history
         SET completed_at = ?1, status = ?2, result_data = ?3, error_message = ?4, duration_ms = ?5
         WHERE id = ?6",
        params![completed_at, status, data, error, duration_ms, history_id],
    )?;
    Ok(())
}

pub fn history(conn: &Connection, job_id: i64, limit: i64) -> rusqlite::Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, job_id, started_at, completed_at, status, result_data, error_message, duration_ms
         FROM job_execution_history
         WHERE job_id = ?1
         ORDER BY started_at DESC, id DESC
         LIMIT ?2",
    )?;
    stmt.query_map(params![job_id, limit], ExecutionRecord::from_row)?
        .collect()
}
