//! Activity Bus
//!
//! Durable activity records (the control plane every worker polls for pause and
//! cancel) plus two in-memory fan-outs: one for client-facing `BusEvent`s and
//! one for `CompanionEvent`s from the watcher and the companion monitor.

mod events;
mod fanout;
mod model;

pub use events::{BusEvent, CompanionEvent, CompanionEventKind, ConsoleLine, Severity};
pub use fanout::{DEFAULT_SUBSCRIBER_BUFFER, Fanout, FanoutStats, SubscriberStats, Subscription};
pub use model::{
    Activity, ActivityPatch, ActivityStatus, ActivityStatusSummary, Control, Halt, TaskKind, TaskTypeStats,
};

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::{Database, DatabaseError, JsonMap, json_text, now};
use model::ACTIVITY_COLUMNS;

/// Running records included in a status summary.
const STATUS_RUNNING_LIMIT: i64 = 10;

#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("Activity {0} not found")]
    NotFound(i64),

    #[error("Activity {0} already reached a terminal status")]
    Terminal(i64),

    #[error("Activity {0} is not running")]
    NotRunning(i64),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for ActivityError {
    fn from(e: rusqlite::Error) -> Self {
        ActivityError::Database(DatabaseError::Database(e))
    }
}

pub type ActivityResult<T> = Result<T, ActivityError>;

pub struct ActivityBus {
    db: Arc<Database>,
    shutdown: CancellationToken,
    events: Fanout<BusEvent>,
    companion: Fanout<CompanionEvent>,
}

impl ActivityBus {
    pub fn new(db: Arc<Database>, shutdown: CancellationToken) -> Arc<Self> {
        Self::with_buffer(db, DEFAULT_SUBSCRIBER_BUFFER, shutdown)
    }

    pub fn with_buffer(db: Arc<Database>, buffer: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            db,
            events: Fanout::new("activity", buffer, shutdown.clone()),
            companion: Fanout::new("companion", buffer, shutdown.clone()),
            shutdown,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// True once the process-wide shutdown has fired. A worker whose own token
    /// fired while this is still false was cancelled, not interrupted.
    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ---- store operations ----

    /// Insert a new `running` record with progress 0.
    pub async fn create(&self, kind: TaskKind, message: &str, details: JsonMap) -> ActivityResult<Activity> {
        let started = now();
        let message = message.to_string();
        let activity = self
            .db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO activity_logs (task_type, status, message, progress, details, started_at, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
                    params![kind, ActivityStatus::Running, message, json_text(&details), started],
                )?;
                let id = conn.last_insert_rowid();
                load(conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
            })
            .await?;

        debug!(activity_id = activity.id, task_type = %kind, "Activity started");
        self.announce(&activity).await;
        Ok(activity)
    }

    pub async fn start_task(&self, kind: TaskKind, message: &str, details: JsonMap) -> ActivityResult<Activity> {
        self.create(kind, message, details).await
    }

    /// Apply a partial update. A terminal status stamps `completed_at` and clears the paused flag.
    pub async fn update(&self, id: i64, patch: ActivityPatch) -> ActivityResult<Activity> {
        self.mutate(id, move |activity| {
            apply_patch(activity, patch);
            Ok(())
        })
        .await
    }

    pub async fn update_progress(&self, id: i64, progress: i64, message: &str) -> ActivityResult<Activity> {
        self.update(id, ActivityPatch::progress(progress, message)).await
    }

    pub async fn complete_task(&self, id: i64, message: &str) -> ActivityResult<Activity> {
        let activity = self
            .update(
                id,
                ActivityPatch {
                    status: Some(ActivityStatus::Completed),
                    message: Some(message.to_string()),
                    progress: Some(100),
                    completed: true,
                    ..ActivityPatch::default()
                },
            )
            .await?;
        info!(activity_id = id, task_type = %activity.task_type, "Activity completed: {}", message);
        self.publish_idle_if_quiet().await;
        Ok(activity)
    }

    pub async fn fail_task(&self, id: i64, error_message: &str) -> ActivityResult<Activity> {
        let activity = self
            .update(
                id,
                ActivityPatch {
                    status: Some(ActivityStatus::Failed),
                    message: Some(error_message.to_string()),
                    completed: true,
                    ..ActivityPatch::default()
                },
            )
            .await?;
        warn!(activity_id = id, task_type = %activity.task_type, "Activity failed: {}", error_message);
        self.publish_idle_if_quiet().await;
        Ok(activity)
    }

    pub async fn delete(&self, id: i64) -> ActivityResult<()> {
        let removed = self
            .db
            .write(move |conn| conn.execute("DELETE FROM activity_logs WHERE id = ?1", [id]))
            .await?;
        if removed == 0 {
            return Err(ActivityError::NotFound(id));
        }
        self.publish_status().await;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> ActivityResult<Activity> {
        self.db
            .read(move |conn| load(conn, id))
            .await?
            .ok_or(ActivityError::NotFound(id))
    }

    /// Counts by status and the latest running records.
    pub async fn get_status(&self) -> ActivityResult<ActivityStatusSummary> {
        let summary = self
            .db
            .read(|conn| {
                let mut summary = ActivityStatusSummary::default();
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM activity_logs GROUP BY status")?;
                let rows = stmt.query_map([], |row| Ok((row.get::<_, ActivityStatus>(0)?, row.get::<_, i64>(1)?)))?;
                for row in rows {
                    let (status, count) = row?;
                    match status {
                        ActivityStatus::Pending => summary.pending = count,
                        ActivityStatus::Running => summary.running = count,
                        ActivityStatus::Completed => summary.completed = count,
                        ActivityStatus::Failed => summary.failed = count,
                    }
                    summary.total += count;
                }

                summary.running_tasks = query_activities(
                    conn,
                    &format!(
                        "SELECT {ACTIVITY_COLUMNS} FROM activity_logs WHERE status = ?1
                         ORDER BY started_at DESC, id DESC LIMIT ?2"
                    ),
                    params![ActivityStatus::Running, STATUS_RUNNING_LIMIT],
                )?;
                Ok(summary)
            })
            .await?;
        Ok(summary)
    }

    pub async fn get_recent(&self, limit: i64) -> ActivityResult<Vec<Activity>> {
        let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activity_logs ORDER BY started_at DESC, id DESC LIMIT ?1");
        Ok(self.db.read(move |conn| query_activities(conn, &sql, params![limit])).await?)
    }

    /// One page of records with the given status plus the total count for that status.
    pub async fn get_by_status(
        &self,
        status: ActivityStatus,
        limit: i64,
        offset: i64,
    ) -> ActivityResult<(Vec<Activity>, i64)> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_logs WHERE status = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        );
        Ok(self
            .db
            .read(move |conn| {
                let page = query_activities(conn, &sql, params![status, limit, offset])?;
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM activity_logs WHERE status = ?1",
                    [status],
                    |row| row.get(0),
                )?;
                Ok((page, total))
            })
            .await?)
    }

    /// Records completed after `cursor`, oldest first.
    pub async fn completed_since(&self, cursor: Option<DateTime<Utc>>) -> ActivityResult<Vec<Activity>> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_logs
             WHERE status = 'completed' AND completed_at IS NOT NULL AND (?1 IS NULL OR completed_at > ?1)
             ORDER BY completed_at ASC, id ASC"
        );
        Ok(self.db.read(move |conn| query_activities(conn, &sql, params![cursor])).await?)
    }

    /// Delete terminal records older than `days`. Returns the number removed.
    pub async fn clean_old(&self, days: i64) -> ActivityResult<usize> {
        let cutoff = now() - ChronoDuration::days(days.max(0));
        let removed = self
            .db
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM activity_logs
                     WHERE status IN ('completed', 'failed')
                       AND COALESCE(completed_at, started_at) < ?1",
                    [cutoff],
                )
            })
            .await?;
        if removed > 0 {
            info!("Removed {} activities older than {} days", removed, days);
            self.publish_status().await;
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> ActivityResult<usize> {
        let removed = self.db.write(|conn| conn.execute("DELETE FROM activity_logs", [])).await?;
        info!("Cleared {} activities", removed);
        self.publish_status().await;
        Ok(removed)
    }

    pub async fn get_stats_by_type(&self) -> ActivityResult<Vec<TaskTypeStats>> {
        Ok(self
            .db
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_type,
                            COUNT(*),
                            SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END),
                            SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
                     FROM activity_logs GROUP BY task_type ORDER BY task_type",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(TaskTypeStats {
                        task_type: row.get(0)?,
                        total: row.get(1)?,
                        running: row.get(2)?,
                        completed: row.get(3)?,
                        failed: row.get(4)?,
                    })
                })?;
                rows.collect()
            })
            .await?)
    }

    // ---- pause / cancel / checkpoint ----

    pub async fn pause(&self, id: i64) -> ActivityResult<Activity> {
        let activity = self
            .mutate(id, move |activity| {
                if activity.status != ActivityStatus::Running {
                    return Err(ActivityError::NotRunning(id));
                }
                if !activity.is_paused {
                    activity.is_paused = true;
                    activity.paused_at = Some(now());
                }
                Ok(())
            })
            .await?;
        info!(activity_id = id, "Activity paused");
        Ok(activity)
    }

    pub async fn resume(&self, id: i64) -> ActivityResult<Activity> {
        let activity = self
            .mutate(id, |activity| {
                activity.is_paused = false;
                activity.paused_at = None;
                Ok(())
            })
            .await?;
        info!(activity_id = id, "Activity resumed");
        Ok(activity)
    }

    /// Transition to `failed` with the message `cancelled`.
    pub async fn cancel(&self, id: i64) -> ActivityResult<Activity> {
        let activity = self
            .update(
                id,
                ActivityPatch {
                    status: Some(ActivityStatus::Failed),
                    message: Some("cancelled".to_string()),
                    completed: true,
                    ..ActivityPatch::default()
                },
            )
            .await?;
        info!(activity_id = id, "Activity cancelled");
        self.publish_idle_if_quiet().await;
        Ok(activity)
    }

    /// Stop a worker early. A token cancelled while the process keeps running
    /// means the job itself was withdrawn, so the record fails with `cancelled`;
    /// a pause request or a shutdown keeps it resumable.
    pub async fn halt(
        &self,
        id: i64,
        token: &CancellationToken,
        message: &str,
        checkpoint: JsonMap,
    ) -> ActivityResult<Halt> {
        if token.is_cancelled() && !self.shutting_down() {
            self.cancel(id).await?;
            return Ok(Halt::Cancelled);
        }
        self.record_pause(id, message, checkpoint).await?;
        Ok(Halt::Paused)
    }

    /// Written by a worker as it stops on a pause: message plus resume state.
    pub async fn record_pause(&self, id: i64, message: &str, checkpoint: JsonMap) -> ActivityResult<Activity> {
        let message = message.to_string();
        self.mutate(id, move |activity| {
            activity.message = message;
            activity.checkpoint = Some(checkpoint);
            if !activity.is_paused {
                activity.is_paused = true;
                activity.paused_at = Some(now());
            }
            Ok(())
        })
        .await
    }

    pub async fn save_checkpoint(&self, id: i64, checkpoint: JsonMap) -> ActivityResult<Activity> {
        self.mutate(id, move |activity| {
            activity.checkpoint = Some(checkpoint);
            Ok(())
        })
        .await
    }

    pub async fn checkpoint(&self, id: i64) -> ActivityResult<Option<JsonMap>> {
        Ok(self.get(id).await?.checkpoint)
    }

    /// Polled by workers at each suspension point. A deleted or terminal record reads as cancelled.
    pub async fn control(&self, id: i64) -> ActivityResult<Control> {
        match self.get(id).await {
            Ok(activity) if activity.status.is_terminal() => Ok(Control::Cancelled),
            Ok(activity) if activity.is_paused => Ok(Control::Paused),
            Ok(_) => Ok(Control::Continue),
            Err(ActivityError::NotFound(_)) => Ok(Control::Cancelled),
            Err(e) => Err(e),
        }
    }

    // ---- fan-out ----

    pub fn subscribe(&self) -> Subscription<BusEvent> {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    pub fn fanout_stats(&self) -> FanoutStats {
        self.events.stats()
    }

    /// Non-blocking broadcast to every subscriber.
    pub fn broadcast(&self, event: BusEvent) {
        self.events.publish(event);
    }

    pub fn console_log(&self, level: &str, message: impl Into<String>) {
        self.broadcast(BusEvent::ConsoleLog {
            data: ConsoleLine {
                level: level.to_string(),
                message: message.into(),
                timestamp: now(),
            },
        });
    }

    pub fn publish_system(&self, event: &str) {
        self.broadcast(BusEvent::System { event: event.to_string() });
    }

    pub fn subscribe_companion(&self) -> Subscription<CompanionEvent> {
        self.companion.subscribe()
    }

    pub fn unsubscribe_companion(&self, id: u64) -> bool {
        self.companion.unsubscribe(id)
    }

    pub fn companion_subscriber_count(&self) -> usize {
        self.companion.subscriber_count()
    }

    pub fn companion_stats(&self) -> FanoutStats {
        self.companion.stats()
    }

    pub fn emit_companion(&self, event: CompanionEvent) {
        match event.severity {
            Severity::Info => debug!(source = %event.source, kind = %event.kind, "{}", event.message),
            Severity::Warning => warn!(source = %event.source, kind = %event.kind, "{}", event.message),
            Severity::Error | Severity::Critical => {
                error!(source = %event.source, kind = %event.kind, severity = ?event.severity, "{}", event.message)
            }
        }
        self.companion.publish(event);
    }

    // ---- internals ----

    /// Load, check non-terminal, modify, write back, publish.
    async fn mutate<F>(&self, id: i64, f: F) -> ActivityResult<Activity>
    where
        F: FnOnce(&mut Activity) -> ActivityResult<()>,
    {
        let activity = self
            .db
            .transaction(move |conn| {
                let Some(mut activity) = load(conn, id)? else {
                    return Ok(Err(ActivityError::NotFound(id)));
                };
                if activity.status.is_terminal() {
                    return Ok(Err(ActivityError::Terminal(id)));
                }
                if let Err(e) = f(&mut activity) {
                    return Ok(Err(e));
                }
                activity.updated_at = now();
                store(conn, &activity)?;
                Ok(Ok(activity))
            })
            .await??;

        self.announce(&activity).await;
        Ok(activity)
    }

    async fn announce(&self, activity: &Activity) {
        self.broadcast(BusEvent::ActivityUpdate { data: activity.clone() });
        self.publish_status().await;
    }

    async fn publish_status(&self) {
        match self.get_status().await {
            Ok(summary) => self.broadcast(BusEvent::StatusUpdate { data: summary }),
            Err(e) => warn!("Failed to compute activity status: {}", e),
        }
    }

    async fn publish_idle_if_quiet(&self) {
        let busy = self
            .db
            .read(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM activity_logs WHERE status IN ('running', 'pending')",
                    [],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await;
        match busy {
            Ok(0) => self.publish_system("idle"),
            Ok(_) => {}
            Err(e) => warn!("Failed to count active tasks: {}", e),
        }
    }
}

fn apply_patch(activity: &mut Activity, patch: ActivityPatch) {
    if let Some(status) = patch.status {
        activity.status = status;
    }
    if let Some(message) = patch.message {
        activity.message = message;
    }
    if let Some(progress) = patch.progress {
        activity.progress = progress.clamp(0, 100) as u8;
    }
    if let Some(details) = patch.details {
        activity.details = details;
    }
    if patch.completed || activity.status.is_terminal() {
        let stamp = now().max(activity.started_at);
        activity.completed_at.get_or_insert(stamp);
    }
    if activity.status.is_terminal() {
        activity.is_paused = false;
        activity.paused_at = None;
    }
}

fn load(conn: &Connection, id: i64) -> rusqlite::Result<Option<Activity>> {
    conn.query_row(
        &format!("SELECT {ACTIVITY_COLUMNS} FROM activity_logs WHERE id = ?1"),
        [id],
        Activity::from_row,
    )
    .optional()
}

fn store(conn: &Connection, activity: &Activity) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE activity_logs
         SET status = ?2, message = ?3, progress = ?4, details = ?5, updated_at = ?6,
             completed_at = ?7, is_paused = ?8, paused_at = ?9, checkpoint = ?10
         WHERE id = ?1",
        params![
            activity.id,
            activity.status,
            activity.message,
            activity.progress,
            json_text(&activity.details),
            activity.updated_at,
            activity.completed_at,
            activity.is_paused,
            activity.paused_at,
            activity.checkpoint.as_ref().map(json_text),
        ],
    )?;
    Ok(())
}

fn query_activities(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<Vec<Activity>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, Activity::from_row)?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{json_object, test_database};
    use serde_json::json;
    use tempfile::tempdir;

    async fn bus() -> (tempfile::TempDir, Arc<ActivityBus>) {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        (dir, ActivityBus::new(db, CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_create_starts_running_at_zero() {
        let (_dir, bus) = bus().await;
        let activity = bus
            .create(TaskKind::Scanning, "Scanning library", json_object(json!({ "library": "Main" })))
            .await
            .unwrap();

        assert_eq!(activity.status, ActivityStatus::Running);
        assert_eq!(activity.progress, 0);
        assert!(activity.completed_at.is_none());
        assert_eq!(activity.details["library"], "Main");
    }

    #[tokio::test]
    async fn test_complete_sets_terminal_fields() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::Indexing, "Indexing", JsonMap::new()).await.unwrap();

        bus.update_progress(activity.id, 40, "Halfway-ish").await.unwrap();
        let done = bus.complete_task(activity.id, "Done").await.unwrap();

        assert_eq!(done.status, ActivityStatus::Completed);
        assert_eq!(done.progress, 100);
        let completed_at = done.completed_at.unwrap();
        assert!(done.started_at <= completed_at);
    }

    #[tokio::test]
    async fn test_fail_keeps_progress() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::Metadata, "Fetching", JsonMap::new()).await.unwrap();
        bus.update_progress(activity.id, 35, "Working").await.unwrap();

        let failed = bus.fail_task(activity.id, "upstream returned 500").await.unwrap();
        assert_eq!(failed.status, ActivityStatus::Failed);
        assert_eq!(failed.progress, 35);
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_records_are_not_mutated() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::Indexing, "Indexing", JsonMap::new()).await.unwrap();
        bus.complete_task(activity.id, "Done").await.unwrap();

        assert!(matches!(
            bus.update_progress(activity.id, 10, "again").await,
            Err(ActivityError::Terminal(_))
        ));
        assert!(matches!(bus.pause(activity.id).await, Err(ActivityError::Terminal(_))));
        assert_eq!(bus.get(activity.id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_dir, bus) = bus().await;
        assert!(matches!(
            bus.update(999, ActivityPatch::default()).await,
            Err(ActivityError::NotFound(999))
        ));
        assert!(matches!(bus.delete(999).await, Err(ActivityError::NotFound(999))));
        assert_eq!(bus.control(999).await.unwrap(), Control::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::VideoScan, "Scan", JsonMap::new()).await.unwrap();

        assert_eq!(bus.update_progress(activity.id, 250, "over").await.unwrap().progress, 100);
        assert_eq!(bus.update_progress(activity.id, -5, "under").await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_pause_resume_and_control() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::LinkVerification, "Verify", JsonMap::new()).await.unwrap();
        assert_eq!(bus.control(activity.id).await.unwrap(), Control::Continue);

        let paused = bus.pause(activity.id).await.unwrap();
        assert!(paused.is_paused);
        assert_eq!(paused.status, ActivityStatus::Running);
        assert!(paused.paused_at.is_some());
        assert_eq!(bus.control(activity.id).await.unwrap(), Control::Paused);

        bus.record_pause(activity.id, "⏸️ Paused at link 3/9", json_object(json!({ "next_index": 3 })))
            .await
            .unwrap();
        let checkpoint = bus.checkpoint(activity.id).await.unwrap().unwrap();
        assert_eq!(checkpoint["next_index"], 3);

        let resumed = bus.resume(activity.id).await.unwrap();
        assert!(!resumed.is_paused);
        assert!(resumed.paused_at.is_none());
        assert_eq!(bus.control(activity.id).await.unwrap(), Control::Continue);
    }

    #[tokio::test]
    async fn test_cancel_is_failed_with_message() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::ForumScrape, "Forum", JsonMap::new()).await.unwrap();
        bus.pause(activity.id).await.unwrap();

        let cancelled = bus.cancel(activity.id).await.unwrap();
        assert_eq!(cancelled.status, ActivityStatus::Failed);
        assert_eq!(cancelled.message, "cancelled");
        assert!(!cancelled.is_paused);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(bus.control(activity.id).await.unwrap(), Control::Cancelled);
    }

    #[tokio::test]
    async fn test_halt_tells_job_cancel_from_shutdown() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let shutdown = CancellationToken::new();
        let bus = ActivityBus::new(db, shutdown.clone());

        let withdrawn = bus.start_task(TaskKind::ForumScrape, "Forum", JsonMap::new()).await.unwrap();
        let job = shutdown.child_token();
        job.cancel();
        let halt = bus
            .halt(withdrawn.id, &job, "paused", json_object(json!({ "page": 2 })))
            .await
            .unwrap();
        assert_eq!(halt, Halt::Cancelled);
        let withdrawn = bus.get(withdrawn.id).await.unwrap();
        assert_eq!(withdrawn.status, ActivityStatus::Failed);
        assert_eq!(withdrawn.message, "cancelled");

        let requested = bus.start_task(TaskKind::ForumScrape, "Forum", JsonMap::new()).await.unwrap();
        bus.pause(requested.id).await.unwrap();
        let halt = bus
            .halt(requested.id, &shutdown.child_token(), "paused", JsonMap::new())
            .await
            .unwrap();
        assert_eq!(halt, Halt::Paused);

        let interrupted = bus.start_task(TaskKind::ScraperThread, "Thread", JsonMap::new()).await.unwrap();
        let job = shutdown.child_token();
        shutdown.cancel();
        let halt = bus
            .halt(interrupted.id, &job, "paused at page 3", json_object(json!({ "page": 3 })))
            .await
            .unwrap();
        assert_eq!(halt, Halt::Paused);
        let interrupted = bus.get(interrupted.id).await.unwrap();
        assert_eq!(interrupted.status, ActivityStatus::Running);
        assert!(interrupted.is_paused);
        assert_eq!(interrupted.checkpoint.unwrap()["page"], 3);
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::Indexing, "Queued", JsonMap::new()).await.unwrap();
        bus.update(
            activity.id,
            ActivityPatch {
                status: Some(ActivityStatus::Pending),
                ..ActivityPatch::default()
            },
        )
        .await
        .unwrap();

        assert!(matches!(bus.pause(activity.id).await, Err(ActivityError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_status_summary_and_listing() {
        let (_dir, bus) = bus().await;
        let a = bus.start_task(TaskKind::Scanning, "a", JsonMap::new()).await.unwrap();
        let b = bus.start_task(TaskKind::Scanning, "b", JsonMap::new()).await.unwrap();
        let c = bus.start_task(TaskKind::Metadata, "c", JsonMap::new()).await.unwrap();
        bus.complete_task(a.id, "done").await.unwrap();
        bus.fail_task(b.id, "boom").await.unwrap();

        let status = bus.get_status().await.unwrap();
        assert_eq!(status.running, 1);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.total, 3);
        assert_eq!(status.running_tasks.len(), 1);
        assert_eq!(status.running_tasks[0].id, c.id);

        let recent = bus.get_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, c.id);

        let (page, total) = bus.get_by_status(ActivityStatus::Completed, 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].id, a.id);

        let stats = bus.get_stats_by_type().await.unwrap();
        let scanning = stats.iter().find(|s| s.task_type == "scanning").unwrap();
        assert_eq!(scanning.total, 2);
        assert_eq!(scanning.completed, 1);
        assert_eq!(scanning.failed, 1);
    }

    #[tokio::test]
    async fn test_clean_old_only_removes_old_terminal_records() {
        let (_dir, bus) = bus().await;
        let old = bus.start_task(TaskKind::Indexing, "old", JsonMap::new()).await.unwrap();
        let fresh = bus.start_task(TaskKind::Indexing, "fresh", JsonMap::new()).await.unwrap();
        let running = bus.start_task(TaskKind::Indexing, "running", JsonMap::new()).await.unwrap();
        bus.complete_task(old.id, "done").await.unwrap();
        bus.complete_task(fresh.id, "done").await.unwrap();

        let long_ago = now() - ChronoDuration::days(45);
        bus.database()
            .write(move |conn| {
                conn.execute(
                    "UPDATE activity_logs SET started_at = ?1, completed_at = ?1 WHERE id IN (?2, ?3)",
                    params![long_ago, old.id, running.id],
                )
            })
            .await
            .unwrap();

        assert_eq!(bus.clean_old(30).await.unwrap(), 1);
        assert!(matches!(bus.get(old.id).await, Err(ActivityError::NotFound(_))));
        assert!(bus.get(fresh.id).await.is_ok());
        assert!(bus.get(running.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_publishes_activity_then_status() {
        let (_dir, bus) = bus().await;
        let sub = bus.subscribe();
        let activity = bus.start_task(TaskKind::Indexing, "Indexing", JsonMap::new()).await.unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert!(matches!(first, BusEvent::ActivityUpdate { ref data } if data.id == activity.id));
        assert_eq!(second.kind(), "status_update");
    }

    #[tokio::test]
    async fn test_idle_event_after_last_task_finishes() {
        let (_dir, bus) = bus().await;
        let activity = bus.start_task(TaskKind::Indexing, "Indexing", JsonMap::new()).await.unwrap();
        let sub = bus.subscribe();
        bus.complete_task(activity.id, "done").await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(std::time::Duration::from_millis(200), sub.recv()).await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["activity_update", "status_update", "system"]);
    }

    #[tokio::test]
    async fn test_completed_since_uses_cursor() {
        let (_dir, bus) = bus().await;
        let a = bus.start_task(TaskKind::Indexing, "a", JsonMap::new()).await.unwrap();
        let a = bus.complete_task(a.id, "done").await.unwrap();

        let all = bus.completed_since(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(bus.completed_since(a.completed_at).await.unwrap().is_empty());

        let b = bus.start_task(TaskKind::Metadata, "b", JsonMap::new()).await.unwrap();
        bus.complete_task(b.id, "done").await.unwrap();
        let newer = bus.completed_since(a.completed_at).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, b.id);
    }
}
