//! Scheduler
//!
//! Polls `scheduled_jobs` on a fixed tick and runs every due job in its own
//! task. A job already running is skipped, so one job never overlaps itself
//! while distinct jobs run in parallel. Each dispatch writes a history row,
//! updates the job's counters and next run, and sends a notification.

pub mod cron;
pub mod handlers;
pub mod jobs;

pub use handlers::JobHandlers;
pub use jobs::{
    ExecutionRecord, ExecutionStatus, JobDefinition, JobKind, JobResult, ScheduleConfig, ScheduleType, ScheduledJob,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::SchedulerSettings;
use crate::database::{Database, DatabaseError, now};
use crate::notifications::NotificationStore;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Scheduler already running")]
    AlreadyRunning,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

struct RunningJob {
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJobInfo {
    pub job_id: i64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub running_jobs: Vec<RunningJobInfo>,
}

/// Removes a job from the running map however its dispatch ends.
struct RunningGuard {
    scheduler: Arc<Scheduler>,
    job_id: i64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.scheduler.running.lock().remove(&self.job_id);
    }
}

pub struct Scheduler {
    db: Arc<Database>,
    notifications: Arc<NotificationStore>,
    handlers: JobHandlers,
    settings: SchedulerSettings,
    shutdown: CancellationToken,
    running: Mutex<HashMap<i64, RunningJob>>,
    started: Mutex<bool>,
}

impl Scheduler {
    pub fn new(
        notifications: Arc<NotificationStore>,
        handlers: JobHandlers,
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            db: handlers.bus.database().clone(),
            notifications,
            handlers,
            settings,
            shutdown,
            running: Mutex::new(HashMap::new()),
            started: Mutex::new(false),
        })
    }

    /// Spawn the polling loop. The first tick fires one period after start.
    pub fn start(self: &Arc<Self>) -> SchedulerResult<JoinHandle<()>> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(SchedulerError::AlreadyRunning);
            }
            *started = true;
        }

        let scheduler = self.clone();
        let period = Duration::from_secs(self.settings.tick_seconds.max(1));
        Ok(tokio::spawn(
            async move {
                info!("Scheduler started, polling every {:?}", period);
                let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = scheduler.shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.tick().await {
                                error!("Error getting due jobs: {}", e);
                            }
                        }
                    }
                }
                *scheduler.started.lock() = false;
                info!("Scheduler stopped");
            }
            .instrument(info_span!("scheduler")),
        ))
    }

    pub fn is_running(&self) -> bool {
        *self.started.lock()
    }

    /// Launch every due job that is not already running. Returns the spawned
    /// dispatches.
    pub async fn tick(self: &Arc<Self>) -> SchedulerResult<Vec<JoinHandle<()>>> {
        let due = self.due_jobs().await?;
        let mut launched = Vec::new();

        for job in due {
            let cancel = {
                let mut running = self.running.lock();
                if running.contains_key(&job.id) {
                    info!(job_id = job.id, "Job {} already running, skipping", job.job_type);
                    continue;
                }
                let cancel = self.shutdown.child_token();
                running.insert(
                    job.id,
                    RunningJob {
                        started_at: now(),
                        cancel: cancel.clone(),
                    },
                );
                cancel
            };

            let guard = RunningGuard {
                scheduler: self.clone(),
                job_id: job.id,
            };
            let span = info_span!("job", job_id = job.id, job_type = %job.job_type);
            let scheduler = self.clone();
            launched.push(tokio::spawn(
                async move {
                    let _guard = guard;
                    scheduler.execute(job, cancel).await;
                }
                .instrument(span),
            ));
        }

        Ok(launched)
    }

    async fn execute(&self, job: ScheduledJob, cancel: CancellationToken) {
        info!("Executing job {}: {}", job.id, job.job_type);

        let job_id = job.id;
        let history_id = match self.db.write(move |c| jobs::start_execution(c, job_id, now())).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create execution history: {}", e);
                return;
            }
        };

        let started = Instant::now();
        let handlers = self.handlers.clone();
        let dispatched = job.clone();
        let result = match tokio::spawn(async move { handlers.run(&dispatched, &cancel).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => JobResult::failure("Job handler panicked"),
            Err(e) => JobResult::failure(format!("Job handler aborted: {}", e)),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let finished = now();
        let (next_run_at, disable) = jobs::after_run(job.schedule_type, &job.schedule_config, finished);
        let stored = result.clone();
        let bookkeeping = self
            .db
            .transaction(move |c| {
                jobs::finish_execution(c, history_id, &stored, finished, duration_ms)?;
                jobs::record_run(c, job_id, stored.success, finished, next_run_at, disable)
            })
            .await;
        if let Err(e) = bookkeeping {
            error!("Failed to update job after execution: {}", e);
        }

        if let Err(e) = self
            .notifications
            .notify_job_completed(job.id, &job.job_type, result.success, &result.message)
            .await
        {
            warn!("Failed to send job notification: {}", e);
        }

        if result.success {
            info!("Job {} completed successfully: {}", job.id, result.message);
        } else {
            warn!("Job {} failed: {}", job.id, result.message);
        }
    }

    // ---- job CRUD ----

    pub async fn create_job(&self, def: JobDefinition) -> SchedulerResult<ScheduledJob> {
        def.validate().map_err(SchedulerError::InvalidSchedule)?;
        let job = self.db.write(move |c| jobs::insert_job(c, &def, now())).await?;
        info!(job_id = job.id, "Created {} job '{}'", job.job_type, job.name);
        Ok(job)
    }

    pub async fn job(&self, id: i64) -> SchedulerResult<ScheduledJob> {
        self.db
            .read(move |c| jobs::job_by_id(c, id))
            .await?
            .ok_or(SchedulerError::JobNotFound(id))
    }

    pub async fn list_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        Ok(self.db.read(jobs::list_jobs).await?)
    }

    pub async fn due_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        Ok(self.db.read(|c| jobs::due_jobs(c, now())).await?)
    }

    pub async fn update_job(&self, id: i64, def: JobDefinition) -> SchedulerResult<ScheduledJob> {
        def.validate().map_err(SchedulerError::InvalidSchedule)?;
        if !self.db.write(move |c| jobs::replace_job(c, id, &def, now())).await? {
            return Err(SchedulerError::JobNotFound(id));
        }
        self.job(id).await
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> SchedulerResult<ScheduledJob> {
        if !self.db.write(move |c| jobs::set_enabled(c, id, enabled, now())).await? {
            return Err(SchedulerError::JobNotFound(id));
        }
        self.job(id).await
    }

    /// Delete a job, cancelling its dispatch if one is in flight.
    pub async fn delete_job(&self, id: i64) -> SchedulerResult<()> {
        if let Some(running) = self.running.lock().get(&id) {
            info!(job_id = id, "Cancelling running job before delete");
            running.cancel.cancel();
        }
        if !self.db.write(move |c| jobs::delete_job(c, id)).await? {
            return Err(SchedulerError::JobNotFound(id));
        }
        Ok(())
    }

    pub async fn execution_history(&self, job_id: i64, limit: i64) -> SchedulerResult<Vec<ExecutionRecord>> {
        Ok(self.db.read(move |c| jobs::history(c, job_id, limit)).await?)
    }

    pub fn running_jobs(&self) -> Vec<RunningJobInfo> {
        let mut running: Vec<RunningJobInfo> = self
            .running
            .lock()
            .iter()
            .map(|(id, job)| RunningJobInfo {
                job_id: *id,
                started_at: job.started_at,
            })
            .collect();
        running.sort_by_key(|r| r.job_id);
        running
    }

    pub async fn status(&self) -> SchedulerResult<SchedulerStatus> {
        let all = self.list_jobs().await?;
        Ok(SchedulerStatus {
            running: self.is_running(),
            total_jobs: all.len(),
            enabled_jobs: all.iter().filter(|j| j.enabled).count(),
            running_jobs: self.running_jobs(),
        })
    }
}
