//! Durable notifications
//!
//! Every notification is stored in the `notifications` table and published on
//! the activity bus as a `notification` event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::activity::{ActivityBus, BusEvent};
use crate::database::{Database, DatabaseError, JsonMap, json_map, json_object, json_text, now, text_enum};

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification {0} not found")]
    NotFound(i64),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub type NotificationResult<T> = Result<T, NotificationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

text_enum!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub category: String,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    pub metadata: JsonMap,
    pub is_read: bool,
    pub is_archived: bool,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

const NOTIFICATION_COLUMNS: &str = "id, type, priority, title, message, category, action_url, action_label, \
     metadata, is_read, is_archived, related_entity_type, related_entity_id, created_at, read_at, expires_at";

impl Notification {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            priority: row.get(2)?,
            title: row.get(3)?,
            message: row.get(4)?,
            category: row.get(5)?,
            action_url: row.get(6)?,
            action_label: row.get(7)?,
            metadata: json_map(row.get(8)?),
            is_read: row.get(9)?,
            is_archived: row.get(10)?,
            related_entity_type: row.get(11)?,
            related_entity_id: row.get(12)?,
            created_at: row.get(13)?,
            read_at: row.get(14)?,
            expires_at: row.get(15)?,
        })
    }
}

/// Creation request. `priority` defaults to normal and `category` to `system`.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: String,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub category: String,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    pub metadata: JsonMap,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub fn new(kind: &str, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            priority: Priority::Normal,
            title: title.into(),
            message: message.into(),
            category: "system".to_string(),
            action_url: None,
            action_label: None,
            metadata: JsonMap::new(),
            related_entity_type: None,
            related_entity_id: None,
            expires_at: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn action(mut self, url: impl Into<String>, label: &str) -> Self {
        self.action_url = Some(url.into());
        self.action_label = Some(label.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = json_object(metadata);
        self
    }

    pub fn related(mut self, entity_type: &str, entity_id: i64) -> Self {
        self.related_entity_type = Some(entity_type.to_string());
        self.related_entity_id = Some(entity_id);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NotificationFilter {
    pub unread_only: bool,
    pub priority: Option<Priority>,
    pub category: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            unread_only: false,
            priority: None,
            category: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationStats {
    pub total: i64,
    pub unread: i64,
    pub by_priority: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
}

pub struct NotificationStore {
    db: Arc<Database>,
    bus: Arc<ActivityBus>,
}

impl NotificationStore {
    pub fn new(bus: Arc<ActivityBus>) -> Arc<Self> {
        Arc::new(Self {
            db: bus.database().clone(),
            bus,
        })
    }

    pub async fn create(&self, request: NewNotification) -> NotificationResult<Notification> {
        let notification = self
            .db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO notifications (
                        type, priority, title, message, category, action_url, action_label, metadata,
                        related_entity_type, related_entity_id, expires_at, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        request.kind,
                        request.priority,
                        request.title,
                        request.message,
                        request.category,
                        request.action_url,
                        request.action_label,
                        json_text(&request.metadata),
                        request.related_entity_type,
                        request.related_entity_id,
                        request.expires_at,
                        now(),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                conn.query_row(
                    &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                    [id],
                    Notification::from_row,
                )
            })
            .await?;

        debug!(
            notification_id = notification.id,
            kind = %notification.kind,
            priority = %notification.priority,
            "Notification created"
        );
        self.bus.broadcast(BusEvent::Notification {
            data: notification.clone(),
        });
        Ok(notification)
    }

    pub async fn get(&self, id: i64) -> NotificationResult<Notification> {
        self.db
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                    [id],
                    Notification::from_row,
                )
                .optional()
            })
            .await?
            .ok_or(NotificationError::NotFound(id))
    }

    /// Unarchived, unexpired notifications, most urgent and newest first.
    pub async fn list(&self, filter: NotificationFilter) -> NotificationResult<Vec<Notification>> {
        Ok(self
            .db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE is_archived = 0
                       AND (expires_at IS NULL OR expires_at > ?1)
                       AND (?2 = 0 OR is_read = 0)
                       AND (?3 IS NULL OR priority = ?3)
                       AND (?4 IS NULL OR category = ?4)
                     ORDER BY CASE priority
                                WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0
                              END DESC,
                              created_at DESC, id DESC
                     LIMIT ?5 OFFSET ?6"
                ))?;
                let rows = stmt.query_map(
                    params![
                        now(),
                        filter.unread_only,
                        filter.priority,
                        filter.category,
                        filter.limit,
                        filter.offset
                    ],
                    Notification::from_row,
                )?;
                rows.collect()
            })
            .await?)
    }

    pub async fn mark_as_read(&self, id: i64) -> NotificationResult<()> {
        let changed = self
            .db
            .write(move |conn| {
                conn.execute(
                    "UPDATE notifications SET is_read = 1, read_at = ?1 WHERE id = ?2",
                    params![now(), id],
                )
            })
            .await?;
        if changed == 0 {
            return Err(NotificationError::NotFound(id));
        }
        Ok(())
    }

    pub async fn mark_all_as_read(&self) -> NotificationResult<usize> {
        Ok(self
            .db
            .write(|conn| {
                conn.execute(
                    "UPDATE notifications SET is_read = 1, read_at = ?1 WHERE is_read = 0 AND is_archived = 0",
                    [now()],
                )
            })
            .await?)
    }

    pub async fn archive(&self, id: i64) -> NotificationResult<()> {
        let changed = self
            .db
            .write(move |conn| conn.execute("UPDATE notifications SET is_archived = 1 WHERE id = ?1", [id]))
            .await?;
        if changed == 0 {
            return Err(NotificationError::NotFound(id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> NotificationResult<()> {
        let changed = self
            .db
            .write(move |conn| conn.execute("DELETE FROM notifications WHERE id = ?1", [id]))
            .await?;
        if changed == 0 {
            return Err(NotificationError::NotFound(id));
        }
        Ok(())
    }

    /// Remove archived notifications older than `days_to_keep`.
    pub async fn delete_old(&self, days_to_keep: i64) -> NotificationResult<usize> {
        let cutoff = now() - ChronoDuration::days(days_to_keep.max(0));
        Ok(self
            .db
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM notifications WHERE is_archived = 1 AND created_at < ?1",
                    [cutoff],
                )
            })
            .await?)
    }

    pub async fn stats(&self) -> NotificationResult<NotificationStats> {
        Ok(self
            .db
            .read(|conn| {
                let mut stats = NotificationStats::default();
                (stats.total, stats.unread) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0)
                     FROM notifications
                     WHERE is_archived = 0 AND (expires_at IS NULL OR expires_at > ?1)",
                    [now()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;

                for (column, target) in [
                    ("priority", &mut stats.by_priority),
                    ("category", &mut stats.by_category),
                ] {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {column}, COUNT(*) FROM notifications
                         WHERE is_archived = 0 AND is_read = 0 GROUP BY {column}"
                    ))?;
                    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
                    for row in rows {
                        let (key, count) = row?;
                        target.insert(key, count);
                    }
                }
                Ok(stats)
            })
            .await?)
    }

    // ---- typed helpers ----

    pub async fn notify_job_completed(
        &self,
        job_id: i64,
        job_type: &str,
        success: bool,
        message: &str,
    ) -> NotificationResult<Notification> {
        let (kind, priority, title) = if success {
            ("job_completed", Priority::Normal, format!("Job Completed: {}", job_type))
        } else {
            ("job_failed", Priority::High, format!("Job Failed: {}", job_type))
        };
        self.create(
            NewNotification::new(kind, title, message)
                .priority(priority)
                .category("scheduler")
                .action("/scheduler", "View Scheduler")
                .related("job", job_id),
        )
        .await
    }

    /// Scrape summary. Large first scrapes are high priority; an incremental pass
    /// that found nothing new is low priority.
    pub async fn notify_scrape_completed(
        &self,
        thread_id: i64,
        thread_title: &str,
        posts_found: usize,
        links_found: usize,
        duration: Duration,
        is_incremental: bool,
    ) -> NotificationResult<Notification> {
        let elapsed = format_duration(duration);
        let (priority, message) = match (is_incremental, posts_found, links_found) {
            (true, 0, _) => (
                Priority::Low,
                format!("✓ Thread up-to-date: No new posts found • {}", elapsed),
            ),
            (true, posts, links) => (
                Priority::Normal,
                format!("🔄 Incremental update: {} new posts, {} download links • {}", posts, links, elapsed),
            ),
            (false, posts, links) => (
                if links > 50 { Priority::High } else { Priority::Normal },
                format!("✨ New thread scraped: {} posts, {} download links • {}", posts, links, elapsed),
            ),
        };

        self.create(
            NewNotification::new("scrape_completed", "Scrape Completed", message)
                .priority(priority)
                .category("scraper")
                .action(format!("/scraper/{}", thread_id), "View Thread")
                .related("thread", thread_id)
                .metadata(json!({
                    "thread_title": thread_title,
                    "posts_found": posts_found,
                    "links_found": links_found,
                    "duration_ms": duration.as_millis() as u64,
                    "is_incremental": is_incremental,
                })),
        )
        .await
    }

    pub async fn notify_links_verified(
        &self,
        thread_id: i64,
        thread_title: &str,
        total_links: usize,
        dead_links: usize,
    ) -> NotificationResult<Notification> {
        let priority = if dead_links > total_links / 2 {
            Priority::High
        } else {
            Priority::Normal
        };
        self.create(
            NewNotification::new(
                "links_verified",
                "Link Verification Complete",
                format!("{}/{} links dead in: {}", dead_links, total_links, thread_title),
            )
            .priority(priority)
            .category("downloads")
            .action(format!("/scraper/{}", thread_id), "View Links")
            .related("thread", thread_id)
            .metadata(json!({ "total_links": total_links, "dead_links": dead_links })),
        )
        .await
    }

    pub async fn notify_system_health_degraded(
        &self,
        component: &str,
        details: &str,
    ) -> NotificationResult<Notification> {
        warn!(component, "System health degraded: {}", details);
        self.create(
            NewNotification::new(
                "system_health_degraded",
                "System Health Degraded",
                format!("{}: {}", component, details),
            )
            .priority(Priority::Urgent)
            .action("/system-health", "View System Health")
            .metadata(json!({ "component": component, "details": details })),
        )
        .await
    }

    pub async fn notify_backup_completed(
        &self,
        filename: &str,
        size: u64,
        kind: &str,
    ) -> NotificationResult<Notification> {
        self.create(
            NewNotification::new(
                "backup_completed",
                "Database Backup Completed",
                format!("Backup created: {} ({:.2} MB)", filename, size as f64 / 1024.0 / 1024.0),
            )
            .action("/settings", "View Backups")
            .metadata(json!({ "filename": filename, "size": size, "type": kind })),
        )
        .await
    }

    pub async fn notify_backup_restored(&self, filename: &str) -> NotificationResult<Notification> {
        self.create(
            NewNotification::new(
                "backup_restored",
                "Database Restored",
                format!("Database restored from backup: {}", filename),
            )
            .priority(Priority::High)
            .action("/settings", "View Settings")
            .metadata(json!({ "filename": filename })),
        )
        .await
    }
}

/// Coarse human duration: seconds, minutes, hours or days.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        s if s < 60 => format!("{} seconds", s),
        s if s < 3600 => format!("{} minutes", s / 60),
        s if s < 86_400 => format!("{} hours", s / 3600),
        s => format!("{} days", s / 86_400),
    }
}
