//! Job handlers. Each turns one dispatch into a `JobResult`; failures are
//! results, never errors, so the dispatcher's bookkeeping always runs.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::jobs::{JobKind, JobResult, ScheduledJob};
use crate::activity::ActivityBus;
use crate::backup::{BackupKind, BackupService};
use crate::database::now;
use crate::scraper::{ForumScraper, ThreadOutcome};
use crate::verifier::{LinkVerifier, VerifyOutcome};

const DEFAULT_ACTIVITY_RETENTION_DAYS: i64 = 30;
const DEFAULT_AUDIT_RETENTION_DAYS: i64 = 90;
const DEFAULT_BACKUP_RETENTION_DAYS: i64 = 30;
const BACKUPS_KEPT: usize = 3;

/// The engines jobs act on.
#[derive(Clone)]
pub struct JobHandlers {
    pub bus: Arc<ActivityBus>,
    pub scraper: Arc<ForumScraper>,
    pub verifier: Arc<LinkVerifier>,
    pub backups: Arc<BackupService>,
}

impl JobHandlers {
    pub async fn run(&self, job: &ScheduledJob, cancel: &CancellationToken) -> JobResult {
        let Some(kind) = job.kind() else {
            return JobResult::failure(format!("Unknown job type: {}", job.job_type));
        };
        info!(job_id = job.id, "Running {} job", kind);

        match kind {
            JobKind::ScrapeThread => self.scrape_thread(job, cancel).await,
            JobKind::VerifyLinks => self.verify_links(job, cancel).await,
            JobKind::CleanupOldActivities => self.cleanup_old_activities(job).await,
            JobKind::CleanupOldAuditLogs => self.cleanup_old_audit_logs(job).await,
            JobKind::DatabaseBackup => self.database_backup().await,
            JobKind::CleanupOldBackups => self.cleanup_old_backups(job).await,
        }
    }

    async fn scrape_thread(&self, job: &ScheduledJob, cancel: &CancellationToken) -> JobResult {
        let Some(thread_id) = job.target_id else {
            return JobResult::failure("No target thread ID specified");
        };
        let thread = match self.scraper.thread(thread_id).await {
            Ok(thread) => thread,
            Err(e) => return JobResult::failure(format!("Failed to get thread: {}", e)),
        };

        match self.scraper.scrape_thread_complete(&thread.url, cancel).await {
            Ok(ThreadOutcome::Completed(summary)) => {
                JobResult::success(format!("Successfully scraped thread: {}", thread.title))
                    .processed(summary.posts_found as i64)
                    .detail("new_posts", summary.new_posts)
                    .detail("new_links", summary.new_links)
            }
            Ok(ThreadOutcome::Paused { page, .. }) => {
                JobResult::failure(format!("Scrape paused at page {}", page))
            }
            Ok(ThreadOutcome::Stopped) => JobResult::failure("Scrape cancelled"),
            Err(e) => JobResult::failure(format!("Scraping failed: {}", e)),
        }
    }

    async fn verify_links(&self, job: &ScheduledJob, cancel: &CancellationToken) -> JobResult {
        let Some(thread_id) = job.target_id else {
            return JobResult::failure("No target thread ID specified");
        };

        match self.verifier.verify_thread_links(thread_id, cancel).await {
            Ok(VerifyOutcome::Completed(summary)) => JobResult {
                success: true,
                items_processed: summary.total as i64,
                items_succeeded: summary.counts.active as i64,
                items_failed: (summary.counts.dead + summary.counts.expired) as i64,
                message: format!("Link verification completed for thread {}", thread_id),
                ..JobResult::default()
            },
            Ok(VerifyOutcome::Paused { next_index }) => {
                JobResult::failure(format!("Verification paused at link {}", next_index))
            }
            Ok(VerifyOutcome::Stopped) => JobResult::failure("Verification cancelled"),
            Err(e) => JobResult::failure(format!("Verification failed: {}", e)),
        }
    }

    async fn cleanup_old_activities(&self, job: &ScheduledJob) -> JobResult {
        let days = job.retention_days(DEFAULT_ACTIVITY_RETENTION_DAYS);
        match self.bus.clean_old(days).await {
            Ok(removed) => {
                JobResult::success(format!("Cleaned up {} old activity records", removed)).processed(removed as i64)
            }
            Err(e) => JobResult::failure(format!("Cleanup failed: {}", e)),
        }
    }

    async fn cleanup_old_audit_logs(&self, job: &ScheduledJob) -> JobResult {
        let days = job.retention_days(DEFAULT_AUDIT_RETENTION_DAYS);
        let cutoff = now() - ChronoDuration::days(days);
        let removed = self
            .bus
            .database()
            .write(move |c| c.execute("DELETE FROM ai_audit_logs WHERE created_at < ?1", [cutoff]))
            .await;
        match removed {
            Ok(removed) => {
                JobResult::success(format!("Cleaned up {} old audit logs", removed)).processed(removed as i64)
            }
            Err(e) => JobResult::failure(format!("Cleanup failed: {}", e)),
        }
    }

    async fn database_backup(&self) -> JobResult {
        match self.backups.create_backup(BackupKind::Automatic).await {
            Ok(backup) => JobResult::success(format!(
                "Backup created: {} ({:.2} MB)",
                backup.filename,
                backup.size as f64 / 1024.0 / 1024.0
            ))
            .processed(1),
            Err(e) => JobResult::failure(format!("Backup failed: {}", e)),
        }
    }

    async fn cleanup_old_backups(&self, job: &ScheduledJob) -> JobResult {
        let days = job.retention_days(DEFAULT_BACKUP_RETENTION_DAYS);
        // Directory listing and deletes stay off the runtime workers.
        let backups = self.backups.clone();
        let cleaned = tokio::task::spawn_blocking(move || backups.cleanup_old_backups(days, BACKUPS_KEPT)).await;
        match cleaned {
            Ok(Ok(deleted)) => JobResult::success(format!(
                "Cleaned up {} old backups (retention: {} days, minimum kept: {})",
                deleted, days, BACKUPS_KEPT
            ))
            .processed(deleted as i64),
            Ok(Err(e)) => JobResult::failure(format!("Cleanup failed: {}", e)),
            Err(e) => JobResult::failure(format!("Cleanup task failed: {}", e)),
        }
    }
}
