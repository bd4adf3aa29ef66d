//! Link verifier
//!
//! Probes stored download links with HEAD requests and records whether each
//! is still reachable. Thread-scoped runs are tracked as activities and can be
//! paused between links; a background sweep re-checks stale links daily.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode, redirect};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::activity::{ActivityBus, ActivityError, Control, Halt, TaskKind};
use crate::config::{Rate, VerifierSettings};
use crate::database::{Database, DatabaseError, JsonMap, json_object, now};
use crate::notifications::NotificationStore;
use crate::rate_limiter::{RatePolicy, pace};
use crate::scraper::store::{self as scraper_store, DownloadLink, LINK_COLUMNS, LinkStatus};

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("Thread {0} not found")]
    ThreadNotFound(i64),

    #[error("Link {0} not found")]
    LinkNotFound(i64),

    #[error("Activity {0} cannot be resumed: {1}")]
    NotResumable(i64, String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

pub type VerifierResult<T> = Result<T, VerifierError>;

/// Map a final HEAD status to a link status. Auth walls count as alive.
pub fn classify_status(status: StatusCode) -> LinkStatus {
    match status.as_u16() {
        200..=299 | 401 | 403 => LinkStatus::Active,
        410 => LinkStatus::Expired,
        _ => LinkStatus::Dead,
    }
}

/// Counts for one provider. `health_score` is `active / total × 100`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub total: i64,
    pub active: i64,
    pub dead: i64,
    pub expired: i64,
    pub unchecked: i64,
    pub health_score: f64,
}

impl ProviderHealth {
    fn add(&mut self, status: &str, count: i64) {
        self.total += count;
        match status {
            "active" => self.active += count,
            "dead" => self.dead += count,
            "expired" => self.expired += count,
            _ => self.unchecked += count,
        }
        self.health_score = if self.total > 0 {
            self.active as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
    }
}

/// Running totals since process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationStats {
    pub total_checked: u64,
    pub active: u64,
    pub dead: u64,
    pub expired: u64,
    pub last_check_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkCounts {
    pub active: usize,
    pub dead: usize,
    pub expired: usize,
}

impl LinkCounts {
    fn record(&mut self, status: LinkStatus) {
        match status {
            LinkStatus::Active => self.active += 1,
            LinkStatus::Dead => self.dead += 1,
            LinkStatus::Expired => self.expired += 1,
            LinkStatus::Unchecked => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub thread_id: i64,
    pub total: usize,
    pub counts: LinkCounts,
}

#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Completed(VerificationSummary),
    /// `next_index` is the first link a resume will check.
    Paused { next_index: usize },
    Stopped,
}

pub struct LinkVerifier {
    bus: Arc<ActivityBus>,
    notifications: Arc<NotificationStore>,
    http: Client,
    policy: RatePolicy,
    stats: Mutex<VerificationStats>,
}

impl LinkVerifier {
    pub fn new(
        bus: Arc<ActivityBus>,
        notifications: Arc<NotificationStore>,
        rate: &Rate,
        policy: RatePolicy,
    ) -> VerifierResult<Arc<Self>> {
        let http = Client::builder()
            .timeout(Duration::from_secs(rate.verifier_timeout_secs))
            .redirect(redirect::Policy::limited(rate.verifier_max_redirects))
            .user_agent(crate::scraper::USER_AGENT)
            .use_rustls_tls()
            .build()?;

        Ok(Arc::new(Self {
            bus,
            notifications,
            http,
            policy,
            stats: Mutex::new(VerificationStats::default()),
        }))
    }

    fn db(&self) -> &Arc<Database> {
        self.bus.database()
    }

    /// HEAD the URL and classify the answer. Network errors and timeouts are dead.
    pub async fn check_url(&self, url: &str) -> LinkStatus {
        match self.http.head(url).send().await {
            Ok(response) => {
                let status = classify_status(response.status());
                debug!("HEAD {} -> {} ({})", url, response.status(), status);
                status
            }
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                LinkStatus::Dead
            }
        }
    }

    /// Check one stored link and save the result.
    pub async fn verify_link(&self, link_id: i64) -> VerifierResult<LinkStatus> {
        let link = self
            .db()
            .read(move |c| load_link(c, link_id))
            .await?
            .ok_or(VerifierError::LinkNotFound(link_id))?;
        let status = self.check_url(&link.url).await;
        self.store_status(link_id, status).await?;
        self.bump_stats(status);
        Ok(status)
    }

    async fn store_status(&self, link_id: i64, status: LinkStatus) -> VerifierResult<()> {
        self.db()
            .write(move |c| {
                c.execute(
                    "UPDATE scraped_download_links SET status = ?1, last_checked_at = ?2 WHERE id = ?3",
                    params![status, now(), link_id],
                )
            })
            .await?;
        Ok(())
    }

    fn bump_stats(&self, status: LinkStatus) {
        let mut stats = self.stats.lock();
        stats.total_checked += 1;
        match status {
            LinkStatus::Active => stats.active += 1,
            LinkStatus::Dead => stats.dead += 1,
            LinkStatus::Expired => stats.expired += 1,
            LinkStatus::Unchecked => {}
        }
        stats.last_check_at = Some(now());
    }

    pub fn verification_stats(&self) -> VerificationStats {
        self.stats.lock().clone()
    }

    // ---- thread verification ----

    /// Verify every link of a thread under a new `link_verification` activity.
    pub async fn verify_thread_links(&self, thread_id: i64, cancel: &CancellationToken) -> VerifierResult<VerifyOutcome> {
        let thread = self
            .db()
            .read(move |c| scraper_store::thread_by_id(c, thread_id))
            .await?
            .ok_or(VerifierError::ThreadNotFound(thread_id))?;

        let activity = self
            .bus
            .start_task(
                TaskKind::LinkVerification,
                &format!("Verifying links for thread: {}", thread.title),
                json_object(json!({ "thread_id": thread_id, "thread_title": thread.title })),
            )
            .await?;

        self.run_verification(activity.id, thread_id, &thread.title, 0, LinkCounts::default(), cancel)
            .instrument(info_span!("verify_links", activity_id = activity.id, thread_id))
            .await
    }

    /// Continue a paused verification from its checkpointed link with the
    /// counters it had reached.
    pub async fn resume_verification(&self, activity_id: i64, cancel: &CancellationToken) -> VerifierResult<VerifyOutcome> {
        let activity = self.bus.get(activity_id).await?;
        if activity.task_type != TaskKind::LinkVerification {
            return Err(VerifierError::NotResumable(
                activity_id,
                format!("not a link verification ({})", activity.task_type),
            ));
        }
        if activity.status.is_terminal() {
            return Err(VerifierError::NotResumable(activity_id, format!("status is {}", activity.status)));
        }
        let thread_id = activity
            .detail_i64("thread_id")
            .ok_or_else(|| VerifierError::NotResumable(activity_id, "no thread recorded".to_string()))?;
        let title = activity
            .details
            .get("thread_title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let checkpoint = activity.checkpoint.clone().unwrap_or_default();
        let field = |key: &str| checkpoint.get(key).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let next_index = field("next_index");
        let counts = LinkCounts {
            active: field("active"),
            dead: field("dead"),
            expired: field("expired"),
        };

        if activity.is_paused {
            self.bus.resume(activity_id).await?;
        }
        info!(activity_id, next_index, "Resuming link verification for thread {}", thread_id);

        self.run_verification(activity_id, thread_id, &title, next_index, counts, cancel)
            .instrument(info_span!("verify_links", activity_id, thread_id))
            .await
    }

    async fn run_verification(
        &self,
        activity_id: i64,
        thread_id: i64,
        title: &str,
        start: usize,
        mut counts: LinkCounts,
        cancel: &CancellationToken,
    ) -> VerifierResult<VerifyOutcome> {
        let links = self
            .db()
            .read(move |c| scraper_store::links_for_thread(c, thread_id))
            .await?;
        let total = links.len();

        if total == 0 {
            self.bus.complete_task(activity_id, "No links found to verify").await?;
            return Ok(VerifyOutcome::Completed(VerificationSummary {
                thread_id,
                total,
                counts,
            }));
        }
        if start == 0 {
            self.bus
                .update_progress(activity_id, 0, &format!("Found {} links to verify", total))
                .await?;
        }

        let checkpoint = |next_index: usize, counts: &LinkCounts| -> JsonMap {
            json_object(json!({
                "thread_id": thread_id,
                "next_index": next_index,
                "total": total,
                "active": counts.active,
                "dead": counts.dead,
                "expired": counts.expired,
            }))
        };

        for (index, link) in links.iter().enumerate().skip(start) {
            let paused = cancel.is_cancelled()
                || match self.bus.control(activity_id).await? {
                    Control::Continue => false,
                    Control::Paused => true,
                    Control::Cancelled => return Ok(VerifyOutcome::Stopped),
                };
            if paused || (index > start && !pace(self.policy.link_delay, cancel).await) {
                let halt = self
                    .bus
                    .halt(
                        activity_id,
                        cancel,
                        &format!("⏸️ Paused at link {}/{}", index, total),
                        checkpoint(index, &counts),
                    )
                    .await?;
                return Ok(match halt {
                    Halt::Paused => {
                        info!(activity_id, "Link verification paused at {}/{}", index, total);
                        VerifyOutcome::Paused { next_index: index }
                    }
                    Halt::Cancelled => {
                        info!(activity_id, "Link verification cancelled at {}/{}", index, total);
                        VerifyOutcome::Stopped
                    }
                });
            }

            let status = self.check_url(&link.url).await;
            match self.store_status(link.id, status).await {
                Ok(()) => {
                    counts.record(status);
                    self.bump_stats(status);
                }
                Err(e) => warn!(activity_id, link_id = link.id, "Failed to store link status: {}", e),
            }

            let done = index + 1;
            self.bus
                .update_progress(
                    activity_id,
                    (done * 100 / total) as i64,
                    &format!(
                        "Verified {}/{} links - Active: {}, Dead: {}, Expired: {}",
                        done, total, counts.active, counts.dead, counts.expired
                    ),
                )
                .await?;
        }

        self.bus
            .complete_task(
                activity_id,
                &format!(
                    "✅ Verified {}/{} links - Active: {}, Dead: {}, Expired: {}",
                    total, total, counts.active, counts.dead, counts.expired
                ),
            )
            .await?;
        if let Err(e) = self
            .notifications
            .notify_links_verified(thread_id, title, total, counts.dead)
            .await
        {
            warn!(thread_id, "Failed to send verification notification: {}", e);
        }

        Ok(VerifyOutcome::Completed(VerificationSummary {
            thread_id,
            total,
            counts,
        }))
    }

    // ---- background sweep ----

    /// Re-check up to `limit` links never checked or last checked more than
    /// `stale_after_days` ago, oldest first.
    pub async fn sweep(&self, limit: usize, stale_after_days: i64, cancel: &CancellationToken) -> VerifierResult<LinkCounts> {
        let cutoff = now() - ChronoDuration::days(stale_after_days);
        let links = self.db().read(move |c| stale_links(c, cutoff, limit)).await?;
        let mut counts = LinkCounts::default();

        for (i, link) in links.iter().enumerate() {
            if i > 0 && !pace(self.policy.sweep_link_delay, cancel).await {
                info!("Link sweep interrupted after {} links", i);
                break;
            }
            let status = self.check_url(&link.url).await;
            match self.store_status(link.id, status).await {
                Ok(()) => {
                    counts.record(status);
                    self.bump_stats(status);
                }
                Err(e) => warn!(link_id = link.id, "Failed to store link status: {}", e),
            }
        }

        info!(
            "Verified {} stale links (active {}, dead {}, expired {})",
            counts.active + counts.dead + counts.expired,
            counts.active,
            counts.dead,
            counts.expired
        );
        Ok(counts)
    }

    /// Run `sweep` every `sweep_interval_hours` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, settings: VerifierSettings, cancel: CancellationToken) -> JoinHandle<()> {
        let verifier = self.clone();
        let period = Duration::from_secs(settings.sweep_interval_hours.max(1) * 3600);

        tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                info!("Link sweep scheduled every {:?}", period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = verifier.sweep(settings.sweep_limit, settings.stale_after_days, &cancel).await {
                                warn!("Link sweep failed: {}", e);
                            }
                        }
                    }
                }
                info!("Link sweep stopped");
            }
            .instrument(info_span!("link_sweep")),
        )
    }

    // ---- health ----

    /// Status → count for one thread's links.
    pub async fn thread_link_stats(&self, thread_id: i64) -> VerifierResult<BTreeMap<String, i64>> {
        Ok(self
            .db()
            .read(move |c| {
                let mut stmt = c.prepare(
                    "SELECT status, COUNT(*) FROM scraped_download_links WHERE thread_id = ?1 GROUP BY status",
                )?;
                stmt.query_map([thread_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect()
            })
            .await?)
    }

    pub async fn provider_health(&self, provider: &str) -> VerifierResult<ProviderHealth> {
        let provider = provider.to_string();
        Ok(self
            .db()
            .read(move |c| {
                let mut health = ProviderHealth {
                    provider: provider.clone(),
                    ..ProviderHealth::default()
                };
                let mut stmt = c.prepare(
                    "SELECT status, COUNT(*) FROM scraped_download_links WHERE provider = ?1 GROUP BY status",
                )?;
                for row in stmt.query_map([&provider], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
                    let (status, count) = row?;
                    health.add(&status, count);
                }
                Ok(health)
            })
            .await?)
    }

    /// One record per provider, largest first.
    pub async fn provider_health_all(&self) -> VerifierResult<Vec<ProviderHealth>> {
        Ok(self
            .db()
            .read(|c| {
                let mut stmt = c.prepare(
                    "SELECT provider, status, COUNT(*) FROM scraped_download_links GROUP BY provider, status",
                )?;
                let mut by_provider: BTreeMap<String, ProviderHealth> = BTreeMap::new();
                for row in stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })? {
                    let (provider, status, count) = row?;
                    by_provider
                        .entry(provider.clone())
                        .or_insert_with(|| ProviderHealth {
                            provider,
                            ..ProviderHealth::default()
                        })
                        .add(&status, count);
                }
                let mut all: Vec<ProviderHealth> = by_provider.into_values().collect();
                all.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.provider.cmp(&b.provider)));
                Ok(all)
            })
            .await?)
    }
}

fn load_link(conn: &Connection, id: i64) -> rusqlite::Result<Option<DownloadLink>> {
    conn.query_row(
        &format!("SELECT {} FROM scraped_download_links WHERE id = ?1", LINK_COLUMNS),
        [id],
        DownloadLink::from_row,
    )
    .optional()
}

fn stale_links(conn: &Connection, cutoff: DateTime<Utc>, limit: usize) -> rusqlite::Result<Vec<DownloadLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scraped_download_links
         WHERE last_checked_at IS NULL OR last_checked_at < ?1
         ORDER BY last_checked_at IS NOT NULL, last_checked_at ASC, id ASC
         LIMIT ?2",
        LINK_COLUMNS
    ))?;
    stmt.query_map(params![cutoff, limit as i64], DownloadLink::from_row)?
        .collect()
}
