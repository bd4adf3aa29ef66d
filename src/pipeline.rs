//! Pipeline wiring
//!
//! Builds every engine on one database and one root cancellation token, starts
//! the long-lived tasks, and tears them down in order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::activity::{ActivityBus, ActivityError, TaskKind};
use crate::backup::{BackupError, BackupService};
use crate::companion::CompanionMonitor;
use crate::config::{AppConfig, EnvConfig};
use crate::database::{Database, DatabaseError, PoolConfig, init_database};
use crate::jdownloader::{JDownloaderClient, JDownloaderError};
use crate::notifications::NotificationStore;
use crate::rate_limiter::RatePolicy;
use crate::scheduler::{JobHandlers, Scheduler, SchedulerError};
use crate::scraper::{ForumScraper, ScraperError};
use crate::verifier::{LinkVerifier, VerifierError};
use crate::watcher::{LibraryWatcher, WatcherError};

/// How long shutdown waits for each background task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Activity {0} cannot be resumed: {1}")]
    NotResumable(i64, String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Scraper(#[from] ScraperError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    JDownloader(#[from] JDownloaderError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

pub struct Pipeline {
    pub db: Arc<Database>,
    pub bus: Arc<ActivityBus>,
    pub notifications: Arc<NotificationStore>,
    pub watcher: Arc<LibraryWatcher>,
    pub scraper: Arc<ForumScraper>,
    pub verifier: Arc<LinkVerifier>,
    pub backups: Arc<BackupService>,
    pub scheduler: Arc<Scheduler>,
    pub companion: Arc<CompanionMonitor>,
    pub jdownloader: JDownloaderClient,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn pool_config(env: &EnvConfig) -> PoolConfig {
    PoolConfig::from_caps(env.database.max_idle_connections, env.database.max_open_connections)
}

impl Pipeline {
    /// Open storage, build the engines and start their background tasks.
    pub async fn start(env: &EnvConfig, config: &AppConfig) -> PipelineResult<Arc<Self>> {
        if let Some(parent) = env.database.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = init_database(&env.database.path, pool_config(env)).await?;
        let pipeline = Self::build(db, config, RatePolicy::from_config(&config.rate)).await?;
        pipeline.start_tasks(config).await?;
        Ok(pipeline)
    }

    /// Build every engine on an open database without starting anything.
    pub async fn build(db: Arc<Database>, config: &AppConfig, policy: RatePolicy) -> PipelineResult<Arc<Self>> {
        let shutdown = CancellationToken::new();
        let bus = ActivityBus::new(db.clone(), shutdown.clone());
        let notifications = NotificationStore::new(bus.clone());
        let watcher = LibraryWatcher::new(bus.clone(), config.watcher.clone(), shutdown.clone());
        let scraper = ForumScraper::new(bus.clone(), notifications.clone(), &config.rate, policy.clone()).await?;
        let verifier = LinkVerifier::new(bus.clone(), notifications.clone(), &config.rate, policy)?;
        let backups = BackupService::new(db.clone(), notifications.clone(), &config.paths.backup_directory)?;
        let handlers = JobHandlers {
            bus: bus.clone(),
            scraper: scraper.clone(),
            verifier: verifier.clone(),
            backups: backups.clone(),
        };
        let scheduler = Scheduler::new(
            notifications.clone(),
            handlers,
            config.scheduler.clone(),
            shutdown.clone(),
        );
        let companion = CompanionMonitor::new(
            bus.clone(),
            watcher.clone(),
            config.companion.clone(),
            shutdown.clone(),
        );
        let jdownloader = JDownloaderClient::new(&config.jdownloader)?;

        Ok(Arc::new(Self {
            db,
            bus,
            notifications,
            watcher,
            scraper,
            verifier,
            backups,
            scheduler,
            companion,
            jdownloader,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    async fn start_tasks(&self, config: &AppConfig) -> PipelineResult<()> {
        let watched = self.watcher.start().await?;
        info!("📂 Watching {} libraries", watched);

        let mut tasks = vec![self.scheduler.start()?];
        tasks.push(self.verifier.spawn_sweeper(config.verifier.clone(), self.shutdown.child_token()));
        tasks.extend(self.companion.start());
        self.tasks.lock().extend(tasks);

        let status = self.bus.get_status().await?;
        if status.running > 0 {
            info!(
                "{} activities were left running by a previous process; resume or cancel them",
                status.running
            );
        }
        info!("🚀 Pipeline started");
        Ok(())
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Clear the paused flag and re-run the worker for a scrape or verification.
    pub async fn resume_activity(&self, activity_id: i64) -> PipelineResult<()> {
        let activity = self.bus.get(activity_id).await?;
        if activity.status.is_terminal() {
            return Err(PipelineError::NotResumable(activity_id, format!("status is {}", activity.status)));
        }

        let cancel = self.shutdown.child_token();
        let span = info_span!("resume", activity_id, kind = %activity.task_type);
        let task = match activity.task_type {
            TaskKind::ScraperThread => {
                let scraper = self.scraper.clone();
                tokio::spawn(
                    async move {
                        match scraper.resume_thread_scrape(activity_id, &cancel).await {
                            Ok(outcome) => info!("Thread scrape resume finished: {:?}", outcome),
                            Err(e) => warn!("Thread scrape resume failed: {}", e),
                        }
                    }
                    .instrument(span),
                )
            }
            TaskKind::ForumScrape => {
                let scraper = self.scraper.clone();
                tokio::spawn(
                    async move {
                        match scraper.resume_forum_scrape(activity_id, &cancel).await {
                            Ok(outcome) => info!("Forum scrape resume finished: {:?}", outcome),
                            Err(e) => warn!("Forum scrape resume failed: {}", e),
                        }
                    }
                    .instrument(span),
                )
            }
            TaskKind::LinkVerification => {
                let verifier = self.verifier.clone();
                tokio::spawn(
                    async move {
                        match verifier.resume_verification(activity_id, &cancel).await {
                            Ok(outcome) => info!("Verification resume finished: {:?}", outcome),
                            Err(e) => warn!("Verification resume failed: {}", e),
                        }
                    }
                    .instrument(span),
                )
            }
            other => {
                return Err(PipelineError::NotResumable(
                    activity_id,
                    format!("{} activities are not resumable", other),
                ));
            }
        };

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(())
    }

    /// Cancel the root token, wait for the background tasks, close storage.
    pub async fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.shutdown.cancel();
        self.watcher.stop_all();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => error!("Background task panicked: {}", e),
                Ok(Err(_)) => {}
                Err(_) => warn!("Background task did not stop within {:?}", SHUTDOWN_GRACE),
            }
        }

        if let Err(e) = self.db.checkpoint_wal().await {
            warn!("WAL checkpoint on shutdown failed: {}", e);
        }
        self.db.shutdown().await;
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityStatus;
    use crate::database::test_database;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn app_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.backup_directory = dir.join("backups").display().to_string();
        config.paths.log_directory = dir.join("logs").display().to_string();
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempdir().unwrap();
        let vars: HashMap<&str, String> = HashMap::from([
            ("DATABASE_PATH", dir.path().join("data/pipeline.db").display().to_string()),
            ("ADULTDATALINK_API_KEY", "key".to_string()),
        ]);
        let env = EnvConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let pipeline = Pipeline::start(&env, &app_config(dir.path())).await.unwrap();
        assert!(dir.path().join("data/pipeline.db").exists());
        assert!(pipeline.scheduler.is_running());
        assert!(pipeline.companion.status().running);
        assert_eq!(pipeline.watcher.active_watchers(), 0);

        pipeline.shutdown().await;
        assert!(pipeline.shutdown_token().is_cancelled());
        assert!(!pipeline.companion.status().running);
    }

    #[tokio::test]
    async fn test_resume_rejects_unsupported_activities() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let pipeline = Pipeline::build(db, &app_config(dir.path()), RatePolicy::immediate())
            .await
            .unwrap();

        let scan = pipeline
            .bus
            .start_task(TaskKind::Scanning, "Scanning library", Default::default())
            .await
            .unwrap();
        let err = pipeline.resume_activity(scan.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable(id, _) if id == scan.id));

        let done = pipeline
            .bus
            .start_task(TaskKind::LinkVerification, "Verifying", Default::default())
            .await
            .unwrap();
        pipeline.bus.complete_task(done.id, "done").await.unwrap();
        let err = pipeline.resume_activity(done.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable(..)));

        let err = pipeline.resume_activity(9_999).await.unwrap_err();
        assert!(matches!(err, PipelineError::Activity(ActivityError::NotFound(9_999))));
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_data_fails_in_worker() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let pipeline = Pipeline::build(db, &app_config(dir.path()), RatePolicy::immediate())
            .await
            .unwrap();

        let activity = pipeline
            .bus
            .start_task(
                TaskKind::LinkVerification,
                "Verifying",
                crate::database::json_object(json!({ "note": "no thread recorded" })),
            )
            .await
            .unwrap();
        pipeline.bus.pause(activity.id).await.unwrap();

        pipeline.resume_activity(activity.id).await.unwrap();
        let tasks: Vec<_> = pipeline.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await.unwrap();
        }
        // The worker refused before touching the record
        let after = pipeline.bus.get(activity.id).await.unwrap();
        assert_eq!(after.status, ActivityStatus::Running);
        assert!(after.is_paused);
    }
}
