//! Companion monitor
//!
//! Watches library health counters and the activity log, and talks back
//! through `CompanionEvent`s: suggestions when a counter crosses a threshold,
//! a follow-up when the suggested task shows up as completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::activity::{Activity, ActivityBus, ActivityError, CompanionEvent, CompanionEventKind, Severity, TaskKind};
use crate::config::CompanionSettings;
use crate::database::{DatabaseError, JsonMap, now};
use crate::watcher::LibraryWatcher;

pub const HEALTH_SOURCE: &str = "health_monitor";
pub const ACTIVITY_SOURCE: &str = "activity_monitor";

#[derive(Error, Debug)]
pub enum CompanionError {
    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

pub type CompanionResult<T> = Result<T, CompanionError>;

/// A suggestion waiting for the matching task to complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub task_kind: TaskKind,
    pub message: String,
    pub suggested_at: DateTime<Utc>,
    pub context: JsonMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanionStatus {
    pub running: bool,
    pub uptime_secs: i64,
    pub active_watchers: usize,
    pub events_processed: u64,
    pub start_time: DateTime<Utc>,
    pub subscriber_count: usize,
    pub tracked_recommendations: usize,
}

/// Counters read by one health pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LibraryHealth {
    pub videos: i64,
    pub performers: i64,
    pub tags: i64,
    pub studios: i64,
    pub performers_with_thumbnails: i64,
    pub performers_with_previews: i64,
    pub performers_without_thumbnails: i64,
    pub videos_with_thumbnails: i64,
    pub videos_with_previews: i64,
    pub performers_without_metadata: i64,
}

impl LibraryHealth {
    fn read(conn: &Connection) -> rusqlite::Result<Self> {
        let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));
        Ok(Self {
            videos: count("SELECT COUNT(*) FROM videos")?,
            performers: count("SELECT COUNT(*) FROM performers")?,
            tags: count("SELECT COUNT(*) FROM tags")?,
            studios: count("SELECT COUNT(*) FROM studios")?,
            performers_with_thumbnails: count(
                "SELECT COUNT(*) FROM performers WHERE thumbnail_path IS NOT NULL AND thumbnail_path != ''",
            )?,
            performers_with_previews: count(
                "SELECT COUNT(*) FROM performers WHERE preview_path IS NOT NULL AND preview_path != ''",
            )?,
            performers_without_thumbnails: count(
                "SELECT COUNT(*) FROM performers WHERE preview_path IS NOT NULL AND preview_path != ''
                 AND (thumbnail_path IS NULL OR thumbnail_path = '')",
            )?,
            videos_with_thumbnails: count(
                "SELECT COUNT(*) FROM videos WHERE thumbnail_path IS NOT NULL AND thumbnail_path != ''",
            )?,
            videos_with_previews: count(
                "SELECT COUNT(*) FROM videos WHERE preview_path IS NOT NULL AND preview_path != ''",
            )?,
            performers_without_metadata: count(
                "SELECT COUNT(*) FROM performers WHERE category = 'regular'
                 AND (metadata IS NULL OR metadata = '{}' OR metadata = '')",
            )?,
        })
    }
}

struct MonitorState {
    recommendations: HashMap<String, Recommendation>,
    last_activity_check: Option<DateTime<Utc>>,
    last_summary: DateTime<Utc>,
    running: bool,
}

pub struct CompanionMonitor {
    bus: Arc<ActivityBus>,
    watcher: Arc<LibraryWatcher>,
    settings: CompanionSettings,
    start_time: DateTime<Utc>,
    state: Mutex<MonitorState>,
    shutdown: CancellationToken,
}

impl CompanionMonitor {
    pub fn new(
        bus: Arc<ActivityBus>,
        watcher: Arc<LibraryWatcher>,
        settings: CompanionSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let start_time = now();
        Arc::new(Self {
            bus,
            watcher,
            settings,
            start_time,
            state: Mutex::new(MonitorState {
                recommendations: HashMap::new(),
                last_activity_check: Some(start_time),
                last_summary: start_time,
                running: false,
            }),
            shutdown,
        })
    }

    /// Spawn the health, analysis and activity-log tasks.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.state.lock().running = true;
        info!("🤖 Companion monitor started");

        let health = self.clone();
        let analysis = self.clone();
        let activity = self.clone();
        vec![
            self.every(
                Duration::from_secs(self.settings.health_interval_secs.max(1)),
                info_span!("companion_health"),
                move || {
                    let monitor = health.clone();
                    async move {
                        if let Err(e) = monitor.check_library_health().await {
                            warn!("Library health check failed: {}", e);
                        }
                    }
                },
            ),
            self.every(
                Duration::from_secs(self.settings.analysis_interval_secs.max(1)),
                info_span!("companion_analysis"),
                move || {
                    let monitor = analysis.clone();
                    async move { monitor.periodic_analysis() }
                },
            ),
            self.every(
                Duration::from_secs(self.settings.activity_poll_secs.max(1)),
                info_span!("companion_activity"),
                move || {
                    let monitor = activity.clone();
                    async move {
                        if let Err(e) = monitor.check_completed_activities().await {
                            debug!("Activity log poll failed: {}", e);
                        }
                    }
                },
            ),
        ]
    }

    fn every<F, Fut>(self: &Arc<Self>, period: Duration, span: tracing::Span, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let monitor = self.clone();
        tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => tick().await,
                    }
                }
                monitor.state.lock().running = false;
            }
            .instrument(span),
        )
    }

    pub fn status(&self) -> CompanionStatus {
        let state = self.state.lock();
        CompanionStatus {
            running: state.running,
            uptime_secs: (now() - self.start_time).num_seconds(),
            active_watchers: self.watcher.active_watchers(),
            events_processed: self.bus.companion_stats().published,
            start_time: self.start_time,
            subscriber_count: self.bus.companion_subscriber_count(),
            tracked_recommendations: state.recommendations.len(),
        }
    }

    /// Remember a suggestion so the matching completion can be answered.
    /// Repeating a suggestion refreshes the pending entry and keeps its id.
    pub fn track_recommendation(&self, kind: &str, task_kind: TaskKind, message: &str, context: JsonMap) -> String {
        let mut state = self.state.lock();
        let id = state
            .recommendations
            .values()
            .find(|r| r.kind == kind && r.task_kind == task_kind)
            .map(|r| r.id.clone())
            .unwrap_or_else(|| format!("{}_{}", kind, uuid::Uuid::new_v4().simple()));
        let recommendation = Recommendation {
            id: id.clone(),
            kind: kind.to_string(),
            task_kind,
            message: message.to_string(),
            suggested_at: now(),
            context,
        };
        state.recommendations.insert(id.clone(), recommendation);
        id
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        let mut recommendations: Vec<_> = self.state.lock().recommendations.values().cloned().collect();
        recommendations.sort_by_key(|r| r.suggested_at);
        recommendations
    }

    fn emit(&self, kind: CompanionEventKind, source: &str, message: String, severity: Severity, data: JsonMap) {
        let mut event = CompanionEvent::new(kind, source, message).with_severity(severity);
        event.data = data;
        self.bus.emit_companion(event);
    }

    // ---- health ----

    pub async fn check_library_health(&self) -> CompanionResult<LibraryHealth> {
        let health = self.bus.database().read(LibraryHealth::read).await?;
        let s = &self.settings;
        debug!(?health, "Library health pass");

        if health.performers_without_thumbnails > s.performers_without_thumbnails {
            let message = format!(
                "⚡ Performance Opportunity: {} performers have preview videos but no thumbnails. Generate thumbnails for faster page loading!",
                health.performers_without_thumbnails
            );
            let mut context = JsonMap::new();
            context.insert("performers_without_thumbnails".into(), health.performers_without_thumbnails.into());
            context.insert("performers_with_previews".into(), health.performers_with_previews.into());
            self.track_recommendation(
                "performance_optimization",
                TaskKind::PerformerThumbnailGeneration,
                &message,
                context.clone(),
            );
            context.insert("action".into(), "generate_performer_thumbnails".into());
            self.emit(CompanionEventKind::Notification, HEALTH_SOURCE, message, Severity::Info, context);
        }

        if health.videos > s.tagging_min_videos && health.tags < s.tagging_max_tags {
            let mut data = JsonMap::new();
            data.insert("video_count".into(), health.videos.into());
            data.insert("tag_count".into(), health.tags.into());
            data.insert("action".into(), "smart_tagging".into());
            self.emit(
                CompanionEventKind::Notification,
                HEALTH_SOURCE,
                format!(
                    "📋 Organization Tip: You have {} videos but only {} tags. Consider using Smart Tagging to better organize your library.",
                    health.videos, health.tags
                ),
                Severity::Warning,
                data,
            );
        }

        if health.videos > s.linking_min_videos && health.performers < s.linking_max_performers {
            let mut data = JsonMap::new();
            data.insert("video_count".into(), health.videos.into());
            data.insert("performer_count".into(), health.performers.into());
            data.insert("action".into(), "auto_link_performers".into());
            self.emit(
                CompanionEventKind::Notification,
                HEALTH_SOURCE,
                format!(
                    "🔗 Metadata Alert: {} videos detected with only {} performers. Try Auto-Link Performers to improve organization.",
                    health.videos, health.performers
                ),
                Severity::Warning,
                data,
            );
        }

        let videos_without_previews = health.videos - health.videos_with_previews;
        if videos_without_previews > s.previews_missing && health.videos > s.previews_min_videos {
            let coverage = health.videos_with_previews as f64 / health.videos as f64 * 100.0;
            let mut data = JsonMap::new();
            data.insert("videos_without_previews".into(), videos_without_previews.into());
            data.insert("total_videos".into(), health.videos.into());
            data.insert("coverage_percent".into(), coverage.into());
            data.insert("action".into(), "generate_previews".into());
            self.emit(
                CompanionEventKind::Notification,
                HEALTH_SOURCE,
                format!(
                    "🎬 Preview Coverage: Only {:.1}% of videos have previews. Generate previews for better browsing experience.",
                    coverage
                ),
                Severity::Info,
                data,
            );
        }

        if health.performers_without_metadata > s.performers_without_metadata {
            let mut data = JsonMap::new();
            data.insert("performers_without_metadata".into(), health.performers_without_metadata.into());
            data.insert("action".into(), "fetch_metadata".into());
            self.emit(
                CompanionEventKind::Notification,
                HEALTH_SOURCE,
                format!(
                    "📊 Metadata Incomplete: {} performers are missing metadata. Fetch from AdultDataLink for richer information.",
                    health.performers_without_metadata
                ),
                Severity::Info,
                data,
            );
        }

        self.maybe_daily_summary(&health);
        Ok(health)
    }

    fn maybe_daily_summary(&self, health: &LibraryHealth) {
        let current = now();
        let interval = ChronoDuration::hours(self.settings.summary_interval_hours.max(1) as i64);
        {
            let mut state = self.state.lock();
            if current - state.last_summary < interval {
                return;
            }
            state.last_summary = current;
        }

        let coverage = if health.performers_with_previews > 0 {
            health.performers_with_thumbnails as f64 / health.performers_with_previews as f64 * 100.0
        } else {
            0.0
        };
        let mut data = JsonMap::new();
        data.insert("video_count".into(), health.videos.into());
        data.insert("performer_count".into(), health.performers.into());
        data.insert("tag_count".into(), health.tags.into());
        data.insert("studio_count".into(), health.studios.into());
        data.insert("thumbnail_coverage".into(), coverage.into());
        data.insert("uptime_hours".into(), (current - self.start_time).num_hours().into());
        self.emit(
            CompanionEventKind::Notification,
            HEALTH_SOURCE,
            format!(
                "📈 Daily Library Report: {} videos, {} performers, {} tags, {} studios. Performer thumbnail coverage: {:.1}%",
                health.videos, health.performers, health.tags, health.studios, coverage
            ),
            Severity::Info,
            data,
        );
    }

    fn periodic_analysis(&self) {
        let status = self.status();
        info!(
            recommendations = status.tracked_recommendations,
            events = status.events_processed,
            "🔍 Running periodic analysis"
        );
    }

    // ---- activity log ----

    /// Answer every activity completed since the last poll. Returns how many were seen.
    pub async fn check_completed_activities(&self) -> CompanionResult<usize> {
        let cursor = self.state.lock().last_activity_check;
        let completed = self.bus.completed_since(cursor).await?;
        if let Some(latest) = completed.iter().filter_map(|a| a.completed_at).max() {
            self.state.lock().last_activity_check = Some(latest);
        }

        for activity in &completed {
            self.process_completed(activity).await?;
        }
        Ok(completed.len())
    }

    async fn process_completed(&self, activity: &Activity) -> CompanionResult<()> {
        let cleared = {
            let mut state = self.state.lock();
            let before = state.recommendations.len();
            state.recommendations.retain(|_, r| r.task_kind != activity.task_type);
            before - state.recommendations.len()
        };
        let was_recommended = cleared > 0;
        if was_recommended {
            debug!(activity_id = activity.id, "Cleared {} recommendation(s) for {}", cleared, activity.task_type);
        }

        let message = if was_recommended {
            Some(follow_up_message(activity))
        } else {
            acknowledgment_message(activity.task_type)
        };
        if let Some(message) = message {
            let mut data = JsonMap::new();
            data.insert("activity_id".into(), activity.id.into());
            data.insert("task_type".into(), activity.task_type.as_str().into());
            data.insert("was_recommended".into(), was_recommended.into());
            data.insert("completion_time".into(), serde_json::to_value(activity.completed_at).unwrap_or_default());
            data.insert("details".into(), activity.details.clone().into());
            self.emit(CompanionEventKind::Notification, ACTIVITY_SOURCE, message, Severity::Info, data);
        }

        self.analyze_completion_impact(activity.task_type).await
    }

    async fn analyze_completion_impact(&self, task_kind: TaskKind) -> CompanionResult<()> {
        match task_kind {
            TaskKind::PerformerThumbnailGeneration => {
                let missing = self
                    .count("SELECT COUNT(*) FROM videos WHERE thumbnail_path IS NULL OR thumbnail_path = ''")
                    .await?;
                if missing > self.settings.videos_without_thumbnails {
                    let mut data = JsonMap::new();
                    data.insert("videos_needing_thumbnails".into(), missing.into());
                    data.insert("action".into(), "generate_video_thumbnails".into());
                    self.emit(
                        CompanionEventKind::Notification,
                        ACTIVITY_SOURCE,
                        format!(
                            "💡 Next optimization: {} videos don't have thumbnails. Consider generating them for even better performance!",
                            missing
                        ),
                        Severity::Info,
                        data,
                    );
                }
            }
            TaskKind::Scanning => {
                let missing = self
                    .count("SELECT COUNT(*) FROM videos WHERE metadata IS NULL OR metadata = '' OR metadata = '{}'")
                    .await?;
                if missing > self.settings.videos_without_metadata {
                    let mut data = JsonMap::new();
                    data.insert("videos_without_metadata".into(), missing.into());
                    data.insert("action".into(), "fetch_metadata".into());
                    self.emit(
                        CompanionEventKind::Notification,
                        ACTIVITY_SOURCE,
                        format!(
                            "📋 Suggestion: {} videos have minimal metadata. Fetch metadata to enrich your library!",
                            missing
                        ),
                        Severity::Info,
                        data,
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn count(&self, sql: &'static str) -> CompanionResult<i64> {
        Ok(self
            .bus
            .database()
            .read(move |c| c.query_row(sql, [], |row| row.get(0)))
            .await?)
    }
}

/// Reply when a completed task is the one we suggested.
pub fn follow_up_message(activity: &Activity) -> String {
    let count = |key: &str| activity.detail_i64(key).unwrap_or(0);
    match activity.task_type {
        TaskKind::PerformerThumbnailGeneration => format!(
            "🎉 Great! I see you generated thumbnails for {} performers. The Performers page should load much faster now. Your library performance is improving!",
            count("total_count")
        ),
        TaskKind::ThumbnailGeneration => {
            "🎉 Excellent! Video thumbnails have been generated. Your library browsing experience should be much smoother now!".to_string()
        }
        TaskKind::ThumbnailGenerationBatch => format!(
            "✅ Excellent! Video thumbnails generated for {} files. Browse performance is now optimized.",
            count("total_count")
        ),
        TaskKind::Scanning => {
            "🔍 Library scan completed! I've indexed all the new content. Your library is now up to date.".to_string()
        }
        TaskKind::PerformerScan => format!(
            "👤 Performer scan finished! Processed {} performers. All performer previews are now updated.",
            count("scanned_count")
        ),
        TaskKind::Metadata => {
            "📋 Metadata fetching complete! Your content now has enriched information from external sources.".to_string()
        }
        TaskKind::AiTagging => {
            "🏷️ AI tagging finished! Your videos are now automatically categorized and easier to discover.".to_string()
        }
        other => format!(
            "✅ Task '{}' completed successfully! Thanks for keeping your library optimized.",
            other
        ),
    }
}

/// Reply for tasks started without a suggestion. Minor kinds get none.
pub fn acknowledgment_message(task_kind: TaskKind) -> Option<String> {
    let message = match task_kind {
        TaskKind::PerformerThumbnailGeneration => {
            "✅ Performer thumbnails generated! Your Performers page should load significantly faster now."
        }
        TaskKind::ThumbnailGeneration => {
            "✅ Video thumbnails generated successfully! Your videos now have preview thumbnails."
        }
        TaskKind::ThumbnailGenerationBatch => "✅ Video thumbnails generated successfully! Browse performance improved.",
        TaskKind::Scanning => "✅ Library scan complete! All content has been indexed.",
        TaskKind::PerformerScan => "✅ Performer scan complete! All performer previews updated.",
        _ => return None,
    };
    Some(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Subscription;
    use crate::config::WatcherSettings;
    use crate::database::{json_object, test_database};
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _dir: TempDir,
        bus: Arc<ActivityBus>,
        monitor: Arc<CompanionMonitor>,
        events: Subscription<CompanionEvent>,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let shutdown = CancellationToken::new();
        let bus = ActivityBus::new(db, shutdown.clone());
        let watcher = LibraryWatcher::new(bus.clone(), WatcherSettings::default(), shutdown.clone());
        let monitor = CompanionMonitor::new(bus.clone(), watcher, CompanionSettings::default(), shutdown);
        let events = bus.subscribe_companion();
        Harness {
            _dir: dir,
            bus,
            monitor,
            events,
        }
    }

    async fn next_event(events: &Subscription<CompanionEvent>) -> CompanionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn seed_performers(bus: &ActivityBus, with_preview_only: usize, complete: usize) {
        bus.database()
            .write(move |c| {
                for i in 0..with_preview_only {
                    c.execute(
                        "INSERT INTO performers (name, preview_path, metadata) VALUES (?1, 'p.mp4', '{\"a\":1}')",
                        [format!("preview-{i}")],
                    )?;
                }
                for i in 0..complete {
                    c.execute(
                        "INSERT INTO performers (name, preview_path, thumbnail_path, metadata)
                         VALUES (?1, 'p.mp4', 't.jpg', '{\"a\":1}')",
                        [format!("complete-{i}")],
                    )?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn seed_videos(bus: &ActivityBus, count: usize, with_thumbnails: bool) {
        bus.database()
            .write(move |c| {
                for i in 0..count {
                    c.execute(
                        "INSERT INTO videos (title, file_path, thumbnail_path, preview_path, metadata)
                         VALUES (?1, ?2, ?3, 'p.mp4', '{\"a\":1}')",
                        rusqlite::params![
                            format!("v{i}"),
                            format!("/lib/v{i}.mp4"),
                            with_thumbnails.then_some("t.jpg")
                        ],
                    )?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn complete(bus: &ActivityBus, kind: TaskKind, details: JsonMap) -> Activity {
        let activity = bus.start_task(kind, "working", details).await.unwrap();
        bus.complete_task(activity.id, "done").await.unwrap()
    }

    #[tokio::test]
    async fn test_follow_up_after_recommended_task() {
        let h = harness().await;
        seed_performers(&h.bus, 6, 10).await;

        let health = h.monitor.check_library_health().await.unwrap();
        assert_eq!(health.performers_without_thumbnails, 6);
        let tracked = h.monitor.recommendations();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].kind, "performance_optimization");
        assert_eq!(tracked[0].task_kind, TaskKind::PerformerThumbnailGeneration);
        let suggestion = next_event(&h.events).await;
        assert_eq!(suggestion.source, HEALTH_SOURCE);
        assert!(suggestion.message.contains("6 performers have preview videos"));

        complete(
            &h.bus,
            TaskKind::PerformerThumbnailGeneration,
            json_object(json!({ "total_count": 17 })),
        )
        .await;
        assert_eq!(h.monitor.check_completed_activities().await.unwrap(), 1);

        let follow_up = next_event(&h.events).await;
        assert_eq!(follow_up.source, ACTIVITY_SOURCE);
        assert!(follow_up.message.contains("17 performers"));
        assert_eq!(follow_up.data["was_recommended"], true);
        assert!(h.monitor.recommendations().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_health_passes_keep_one_recommendation() {
        let h = harness().await;
        seed_performers(&h.bus, 6, 0).await;

        h.monitor.check_library_health().await.unwrap();
        let first = h.monitor.recommendations();
        h.monitor.check_library_health().await.unwrap();
        let second = h.monitor.recommendations();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert!(second[0].suggested_at >= first[0].suggested_at);

        h.monitor.track_recommendation(
            "manual",
            TaskKind::PerformerThumbnailGeneration,
            "generate thumbnails",
            JsonMap::new(),
        );
        assert_eq!(h.monitor.recommendations().len(), 2);

        complete(&h.bus, TaskKind::PerformerThumbnailGeneration, JsonMap::new()).await;
        assert_eq!(h.monitor.check_completed_activities().await.unwrap(), 1);
        assert!(h.monitor.recommendations().is_empty());
        assert_eq!(h.monitor.status().tracked_recommendations, 0);
    }

    #[tokio::test]
    async fn test_thresholds_are_strict() {
        let h = harness().await;
        seed_performers(&h.bus, 5, 0).await;
        h.monitor.check_library_health().await.unwrap();
        settle().await;
        assert!(h.events.try_recv().is_none());
        assert!(h.monitor.recommendations().is_empty());
    }

    #[tokio::test]
    async fn test_large_library_with_few_tags_and_performers() {
        let h = harness().await;
        seed_videos(&h.bus, 101, true).await;
        seed_performers(&h.bus, 0, 3).await;

        h.monitor.check_library_health().await.unwrap();
        settle().await;
        let events = h.events.drain();
        let actions: Vec<_> = events.iter().map(|e| e.data["action"].as_str().unwrap()).collect();
        assert_eq!(actions, vec!["smart_tagging", "auto_link_performers"]);
        assert!(events.iter().all(|e| e.severity == Severity::Warning));
    }

    #[tokio::test]
    async fn test_preview_coverage() {
        let h = harness().await;
        seed_videos(&h.bus, 30, true).await;
        h.bus
            .database()
            .write(|c| {
                for i in 0..30 {
                    c.execute(
                        "INSERT INTO videos (title, file_path, thumbnail_path, metadata) VALUES ('x', ?1, 't.jpg', '{\"a\":1}')",
                        [format!("/lib/np{i}.mp4")],
                    )?;
                }
                c.execute("INSERT INTO tags (name) SELECT 'tag' || value FROM json_each('[1,2,3,4,5]')", [])?;
                Ok(())
            })
            .await
            .unwrap();

        h.monitor.check_library_health().await.unwrap();
        let event = next_event(&h.events).await;
        assert_eq!(event.data["action"], "generate_previews");
        assert!(event.message.contains("Only 50.0% of videos"));
    }

    #[tokio::test]
    async fn test_acknowledges_unrecommended_tasks() {
        let h = harness().await;
        complete(&h.bus, TaskKind::Scanning, JsonMap::new()).await;
        complete(&h.bus, TaskKind::ScraperThread, JsonMap::new()).await;

        assert_eq!(h.monitor.check_completed_activities().await.unwrap(), 2);
        settle().await;
        let events = h.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "✅ Library scan complete! All content has been indexed.");
        assert_eq!(events[0].data["was_recommended"], false);

        // The cursor moved past both records
        assert_eq!(h.monitor.check_completed_activities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_impact_analysis_after_scan() {
        let h = harness().await;
        h.bus
            .database()
            .write(|c| {
                for i in 0..51 {
                    c.execute("INSERT INTO videos (file_path) VALUES (?1)", [format!("/lib/bare{i}.mp4")])?;
                }
                Ok(())
            })
            .await
            .unwrap();

        complete(&h.bus, TaskKind::Scanning, JsonMap::new()).await;
        h.monitor.check_completed_activities().await.unwrap();
        settle().await;
        let events = h.events.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data["action"], "fetch_metadata");
        assert!(events[1].message.contains("51 videos have minimal metadata"));
    }

    #[tokio::test]
    async fn test_activities_before_start_are_ignored() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let shutdown = CancellationToken::new();
        let bus = ActivityBus::new(db, shutdown.clone());
        complete(&bus, TaskKind::Scanning, JsonMap::new()).await;

        let watcher = LibraryWatcher::new(bus.clone(), WatcherSettings::default(), shutdown.clone());
        let monitor = CompanionMonitor::new(bus, watcher, CompanionSettings::default(), shutdown);
        assert_eq!(monitor.check_completed_activities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_daily_summary_once_per_interval() {
        let h = harness().await;
        h.monitor.check_library_health().await.unwrap();
        settle().await;
        assert!(h.events.drain().is_empty());

        h.monitor.state.lock().last_summary = now() - ChronoDuration::hours(25);
        h.monitor.check_library_health().await.unwrap();
        let summary = next_event(&h.events).await;
        assert!(summary.message.starts_with("📈 Daily Library Report: 0 videos"));

        h.monitor.check_library_health().await.unwrap();
        settle().await;
        assert!(h.events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let h = harness().await;
        h.monitor.track_recommendation("custom", TaskKind::AiTagging, "try tagging", JsonMap::new());
        let status = h.monitor.status();
        assert!(!status.running);
        assert_eq!(status.active_watchers, 0);
        assert_eq!(status.subscriber_count, 1);
        assert_eq!(status.tracked_recommendations, 1);

        let tasks = h.monitor.start();
        assert!(h.monitor.status().running);
        h.monitor.shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!h.monitor.status().running);
    }

    #[test]
    fn test_messages() {
        assert_eq!(acknowledgment_message(TaskKind::LinkVerification), None);
        assert!(acknowledgment_message(TaskKind::PerformerScan).is_some());
    }
}
