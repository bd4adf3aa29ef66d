//! Forum scraper
//!
//! Fetches XenForo-style thread pages, extracts posts and provider download
//! links, and persists them idempotently. Long runs are tracked as activities
//! and honor pause and cancel between pages (thread scrape) or threads
//! (forum scrape).

pub mod client;
pub mod heuristics;
pub mod parse;
pub mod store;

pub use client::{ForumClient, USER_AGENT};
pub use heuristics::ExtractedLink;
pub use parse::{Attachment, ForumThreadInfo, ParsedPost};
pub use store::{
    DownloadLink, LinkStatus, ScrapedPost, ScrapedThread, ScraperStats, ThreadMetadata, ThreadQuery, ThreadSort,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::activity::{ActivityBus, ActivityError, ActivityPatch, Control, Halt, TaskKind};
use crate::config::Rate;
use crate::database::{Database, DatabaseError, JsonMap, delete_setting, get_setting, json_object, put_setting};
use crate::notifications::NotificationStore;
use crate::rate_limiter::{RatePolicy, pace};
use heuristics::{
    clean_title, extract_download_links, extract_tags_from_title, normalize_thread_url, page_url, performer_names,
    studio_names, thread_external_id,
};
use parse::{ThreadPage, parse_forum_page, parse_thread_page};
use store::NewThread;

/// Source tag stored with every scraped row.
pub const DEFAULT_SOURCE: &str = "simpcity";

/// `app_settings` key holding the forum session cookie.
pub const SESSION_COOKIE_KEY: &str = "scraper_session_cookie";

/// Forum scrapes save a checkpoint after this many threads.
const FORUM_CHECKPOINT_EVERY: usize = 10;

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("unexpected status code: {status}")]
    Http { status: u16 },

    #[error("no thread content found")]
    NoContent,

    #[error("invalid thread URL: {0}")]
    InvalidUrl(String),

    #[error("Thread {0} not found")]
    ThreadNotFound(i64),

    #[error("Activity {0} cannot be resumed: {1}")]
    NotResumable(i64, String),

    #[error("cancelled")]
    Cancelled,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

pub type ScraperResult<T> = Result<T, ScraperError>;

/// Result of one thread scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: i64,
    pub title: String,
    pub pages: u32,
    /// Posts seen during this run
    pub posts_found: usize,
    /// Provider links seen during this run
    pub links_found: usize,
    pub new_posts: usize,
    pub new_links: usize,
    /// The thread was already on file before this run
    pub is_incremental: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub enum ThreadOutcome {
    Completed(ThreadSummary),
    /// Stopped on the pause flag or shutdown; `page` is where a resume starts.
    Paused { page: u32, thread_id: Option<i64> },
    /// The activity was cancelled, either directly or by withdrawing the job.
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumSummary {
    pub threads_found: usize,
    pub success_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone)]
pub enum ForumOutcome {
    Completed(ForumSummary),
    Paused { thread_index: usize },
    Stopped,
}

/// Activity a scrape reports to. Thread scrapes inside a forum scrape share
/// the forum's activity and leave its progress alone.
#[derive(Debug, Clone, Copy)]
struct Run {
    activity_id: i64,
    nested: bool,
}

/// Where a page walk stopped.
enum WalkEnd {
    Done,
    Paused(u32),
    Failed(ScraperError),
}

/// Forum position saved in checkpoints.
#[derive(Debug, Clone, Copy, Default)]
struct ForumProgress {
    thread_index: usize,
    success_count: usize,
    error_count: usize,
}

impl ForumProgress {
    fn from_checkpoint(checkpoint: Option<&JsonMap>) -> Self {
        let field = |key: &str| {
            checkpoint
                .and_then(|c| c.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize
        };
        Self {
            thread_index: field("thread_index"),
            success_count: field("success_count"),
            error_count: field("error_count"),
        }
    }

    fn checkpoint(&self, forum_url: &str, total: usize) -> JsonMap {
        json_object(json!({
            "forum_url": forum_url,
            "thread_index": self.thread_index,
            "threads_completed": self.thread_index,
            "total_threads": total,
            "success_count": self.success_count,
            "error_count": self.error_count,
        }))
    }
}

enum Listing {
    Complete(Vec<ForumThreadInfo>),
    Paused,
    Stopped,
}

pub struct ForumScraper {
    bus: Arc<ActivityBus>,
    notifications: Arc<NotificationStore>,
    client: ForumClient,
    source: String,
    cookie_writes: Mutex<()>,
}

impl ForumScraper {
    /// Build the scraper and load the persisted session cookie.
    pub async fn new(
        bus: Arc<ActivityBus>,
        notifications: Arc<NotificationStore>,
        rate: &Rate,
        policy: RatePolicy,
    ) -> ScraperResult<Arc<Self>> {
        let client = ForumClient::new(rate, policy)?;
        let cookie = bus.database().read(|c| get_setting(c, SESSION_COOKIE_KEY)).await?;
        if cookie.is_some() {
            info!("Loaded forum session cookie from settings");
        }
        client.set_cookie(cookie.filter(|c| !c.is_empty()));

        Ok(Arc::new(Self {
            bus,
            notifications,
            client,
            source: DEFAULT_SOURCE.to_string(),
            cookie_writes: Mutex::new(()),
        }))
    }

    fn db(&self) -> &Arc<Database> {
        self.bus.database()
    }

    // ---- session cookie ----

    /// Store the session cookie. Line breaks are stripped so the value is a
    /// valid header.
    pub async fn set_session_cookie(&self, cookie: &str) -> ScraperResult<()> {
        let cleaned: String = cookie.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let cleaned = cleaned.trim().to_string();

        let _guard = self.cookie_writes.lock().await;
        let value = cleaned.clone();
        self.db().write(move |c| put_setting(c, SESSION_COOKIE_KEY, &value)).await?;
        self.client.set_cookie(Some(cleaned).filter(|c| !c.is_empty()));
        info!("Forum session cookie updated");
        Ok(())
    }

    pub fn session_cookie(&self) -> Option<String> {
        self.client.cookie()
    }

    pub async fn clear_session_cookie(&self) -> ScraperResult<()> {
        let _guard = self.cookie_writes.lock().await;
        self.db().write(|c| delete_setting(c, SESSION_COOKIE_KEY)).await?;
        self.client.set_cookie(None);
        info!("Forum session cookie cleared");
        Ok(())
    }

    // ---- thread flow ----

    /// Scrape every page of a thread under a new `scraper_thread` activity.
    pub async fn scrape_thread_complete(&self, url: &str, cancel: &CancellationToken) -> ScraperResult<ThreadOutcome> {
        let url = normalize_thread_url(url);
        let activity = self
            .bus
            .start_task(
                TaskKind::ScraperThread,
                &format!("Scraping thread: {}", url),
                json_object(json!({ "url": url })),
            )
            .await?;

        self.run_thread_activity(activity.id, &url, 1, cancel)
            .instrument(info_span!("scrape_thread", activity_id = activity.id))
            .await
    }

    /// Continue a paused thread scrape from its checkpointed page.
    pub async fn resume_thread_scrape(&self, activity_id: i64, cancel: &CancellationToken) -> ScraperResult<ThreadOutcome> {
        let activity = self.bus.get(activity_id).await?;
        if activity.task_type != TaskKind::ScraperThread {
            return Err(ScraperError::NotResumable(activity_id, format!("not a thread scrape ({})", activity.task_type)));
        }
        if activity.status.is_terminal() {
            return Err(ScraperError::NotResumable(activity_id, format!("status is {}", activity.status)));
        }
        let url = activity
            .details
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ScraperError::NotResumable(activity_id, "no thread URL recorded".to_string()))?;
        let page = activity
            .checkpoint
            .as_ref()
            .and_then(|c| c.get("page"))
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;

        if activity.is_paused {
            self.bus.resume(activity_id).await?;
        }
        info!(activity_id, page, "Resuming thread scrape of {}", url);

        self.run_thread_activity(activity_id, &url, page, cancel)
            .instrument(info_span!("scrape_thread", activity_id))
            .await
    }

    async fn run_thread_activity(
        &self,
        activity_id: i64,
        url: &str,
        start_page: u32,
        cancel: &CancellationToken,
    ) -> ScraperResult<ThreadOutcome> {
        let run = Run {
            activity_id,
            nested: false,
        };

        match self.scrape_thread(run, url, start_page, cancel).await {
            Ok(ThreadOutcome::Completed(summary)) => {
                self.bus
                    .complete_task(
                        activity_id,
                        &format!(
                            "Successfully scraped thread: {} posts, {} download links found",
                            summary.posts_found, summary.links_found
                        ),
                    )
                    .await?;
                self.notify_completed(&summary).await;
                Ok(ThreadOutcome::Completed(summary))
            }
            Ok(ThreadOutcome::Paused { page, thread_id }) => {
                let halt = self
                    .bus
                    .halt(
                        activity_id,
                        cancel,
                        &format!("⏸️ Paused at page {}. Progress saved.", page),
                        json_object(json!({ "url": url, "page": page, "thread_id": thread_id })),
                    )
                    .await?;
                match halt {
                    Halt::Paused => Ok(ThreadOutcome::Paused { page, thread_id }),
                    Halt::Cancelled => {
                        info!(activity_id, "Thread scrape cancelled at page {}", page);
                        Ok(ThreadOutcome::Stopped)
                    }
                }
            }
            Ok(ThreadOutcome::Stopped) => Ok(ThreadOutcome::Stopped),
            Err(e) => {
                warn!(activity_id, "Thread scrape failed: {}", e);
                if let Err(fail) = self
                    .bus
                    .fail_task(activity_id, &format!("Failed to scrape thread: {}", e))
                    .await
                {
                    warn!(activity_id, "Could not mark activity failed: {}", fail);
                }
                Err(e)
            }
        }
    }

    async fn report(&self, run: Run, progress: i64, message: &str) {
        if run.nested {
            debug!(activity_id = run.activity_id, "{}", message);
            return;
        }
        if let Err(e) = self.bus.update_progress(run.activity_id, progress, message).await {
            warn!(activity_id = run.activity_id, "Failed to update progress: {}", e);
        }
    }

    /// Fetch, walk and persist one thread. Pause and shutdown persist whatever
    /// was extracted before returning.
    async fn scrape_thread(
        &self,
        run: Run,
        url: &str,
        start_page: u32,
        cancel: &CancellationToken,
    ) -> ScraperResult<ThreadOutcome> {
        let started = Instant::now();
        let external_id = thread_external_id(url).ok_or_else(|| ScraperError::InvalidUrl(url.to_string()))?;

        self.report(run, 10, "Fetching thread information...").await;
        let first_html = match self.client.fetch_page(url, cancel).await {
            Ok(html) => html,
            Err(ScraperError::Cancelled) => {
                return Ok(ThreadOutcome::Paused {
                    page: start_page,
                    thread_id: None,
                });
            }
            Err(e) => return Err(e),
        };
        let first = parse_thread_page(&first_html);
        let thread = self.thread_record(&external_id, url, &first)?;
        let title = thread.title.clone();

        let (thread_id, existed) = self.db().write(move |c| store::upsert_thread(c, &thread)).await?;
        self.report(run, 30, "Thread saved. Scraping posts...").await;

        let mut collected: Vec<(ParsedPost, Vec<ExtractedLink>)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_no = start_page.max(1);
        let mut pending = (page_no == 1).then_some(first);

        let end = loop {
            let page = match pending.take() {
                Some(page) => page,
                None => {
                    if cancel.is_cancelled() {
                        break WalkEnd::Paused(page_no);
                    }
                    match self.bus.control(run.activity_id).await? {
                        Control::Continue => {}
                        Control::Paused => break WalkEnd::Paused(page_no),
                        Control::Cancelled => return Ok(ThreadOutcome::Stopped),
                    }
                    match self.client.fetch_page(&page_url(url, page_no), cancel).await {
                        Ok(html) => parse_thread_page(&html),
                        Err(ScraperError::Cancelled) => break WalkEnd::Paused(page_no),
                        Err(e) => break WalkEnd::Failed(e),
                    }
                }
            };

            let on_page = page.posts.len();
            let mut fresh = 0;
            for (index, mut post) in page.posts.into_iter().enumerate() {
                if post.external_id.is_empty() {
                    post.external_id = format!("{}-p{}-{}", external_id, page_no, index);
                }
                if !seen.insert(post.external_id.clone()) {
                    continue;
                }
                let links = extract_download_links(&post.content_html);
                collected.push((post, links));
                fresh += 1;
            }
            debug!(thread_id, page = page_no, "Found {} posts on page {}", on_page, page_no);
            if fresh == 0 {
                break WalkEnd::Done;
            }

            let has_next = page.pagination.has_page_after(page_no)
                || self.client.page_exists(&page_url(url, page_no + 1)).await;
            if !has_next {
                break WalkEnd::Done;
            }
            page_no += 1;
        };

        let (new_posts, new_links) = self.persist_posts(run, thread_id, &collected).await?;
        self.report(run, 90, "Updating thread statistics...").await;
        self.db().write(move |c| store::refresh_counts(c, thread_id)).await?;

        if let Some(avg) = self.client.average_response_time() {
            debug!(thread_id, "Average forum response time {:?}", avg);
        }

        match end {
            WalkEnd::Done => Ok(ThreadOutcome::Completed(ThreadSummary {
                thread_id,
                title,
                pages: page_no,
                posts_found: collected.len(),
                links_found: collected.iter().map(|(_, links)| links.len()).sum(),
                new_posts,
                new_links,
                is_incremental: existed,
                duration_ms: started.elapsed().as_millis() as u64,
            })),
            WalkEnd::Paused(page) => {
                info!(thread_id, page, "Thread scrape paused after {} posts", collected.len());
                Ok(ThreadOutcome::Paused {
                    page,
                    thread_id: Some(thread_id),
                })
            }
            WalkEnd::Failed(e) => Err(e),
        }
    }

    fn thread_record(&self, external_id: &str, url: &str, page: &ThreadPage) -> ScraperResult<NewThread> {
        let raw_title = page.title.clone().ok_or(ScraperError::NoContent)?;
        let cleaned = clean_title(&raw_title);
        let title = if cleaned.is_empty() { raw_title.clone() } else { cleaned };

        let mut tags = extract_tags_from_title(&raw_title);
        for tag in &page.forum_tags {
            if !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                tags.push(tag.clone());
            }
        }

        let base = reqwest::Url::parse(url).ok();
        let thumbnails: Vec<String> = page
            .thumbnails
            .iter()
            .map(|src| match base.as_ref().and_then(|b| b.join(src).ok()) {
                Some(absolute) => absolute.to_string(),
                None => src.clone(),
            })
            .collect();

        Ok(NewThread {
            external_id: external_id.to_string(),
            source: self.source.clone(),
            url: url.to_string(),
            category: page.category.clone(),
            author: page.author.clone(),
            reply_count: page.reply_count,
            view_count: page.view_count,
            metadata: ThreadMetadata {
                tags,
                thumbnail_url: thumbnails.first().cloned(),
                thumbnail_urls: thumbnails,
                performer_names: performer_names(&title),
                studio_names: studio_names(&title),
                is_pinned: page.is_pinned,
                is_locked: page.is_locked,
            },
            title,
        })
    }

    /// Save posts in extraction order, each with its links. A post that fails
    /// to save is logged and skipped. Returns `(new_posts, new_links)`.
    async fn persist_posts(
        &self,
        run: Run,
        thread_id: i64,
        collected: &[(ParsedPost, Vec<ExtractedLink>)],
    ) -> ScraperResult<(usize, usize)> {
        let total = collected.len();
        self.report(run, 50, &format!("Saving {} posts...", total)).await;

        let mut post_number = self.db().read(move |c| store::next_post_number(c, thread_id)).await?;
        let (mut new_posts, mut new_links) = (0, 0);

        for (index, (post, links)) in collected.iter().enumerate() {
            let source = self.source.as_str();
            let number = post_number;
            let saved = self
                .db()
                .transaction(|c| {
                    let (post_id, inserted) = store::upsert_post(c, thread_id, source, number, post, links)?;
                    let mut added = 0;
                    for link in links {
                        match store::insert_link(c, thread_id, post_id, link, source) {
                            Ok(true) => added += 1,
                            Ok(false) => {}
                            Err(e) => warn!(thread_id, "Failed to save link {}: {}", link.url, e),
                        }
                    }
                    Ok((inserted, added))
                })
                .await;

            match saved {
                Ok((inserted, added)) => {
                    if inserted {
                        new_posts += 1;
                        post_number += 1;
                    }
                    new_links += added;
                }
                Err(e) => warn!(thread_id, "Failed to save post {}: {}", post.external_id, e),
            }

            let done = index + 1;
            if done % 10 == 0 || done == total {
                let progress = 50 + (40 * done / total.max(1)) as i64;
                self.report(run, progress, &format!("Saved {}/{} posts", done, total)).await;
            }
        }
        Ok((new_posts, new_links))
    }

    async fn notify_completed(&self, summary: &ThreadSummary) {
        let (posts, links) = if summary.is_incremental {
            (summary.new_posts, summary.new_links)
        } else {
            (summary.posts_found, summary.links_found)
        };
        if let Err(e) = self
            .notifications
            .notify_scrape_completed(
                summary.thread_id,
                &summary.title,
                posts,
                links,
                Duration::from_millis(summary.duration_ms),
                summary.is_incremental,
            )
            .await
        {
            warn!(thread_id = summary.thread_id, "Failed to send scrape notification: {}", e);
        }
    }

    // ---- forum flow ----

    /// Enumerate every thread in a forum category and scrape each in turn
    /// under one `forum_scrape` activity.
    pub async fn scrape_forum_and_save_all(
        &self,
        forum_url: &str,
        cancel: &CancellationToken,
    ) -> ScraperResult<ForumOutcome> {
        let forum_url = normalize_thread_url(forum_url);
        let activity = self
            .bus
            .start_task(
                TaskKind::ForumScrape,
                &format!("Scraping forum: {}", forum_url),
                json_object(json!({ "forum_url": forum_url })),
            )
            .await?;

        self.run_forum(activity.id, &forum_url, ForumProgress::default(), cancel)
            .instrument(info_span!("scrape_forum", activity_id = activity.id))
            .await
    }

    /// Continue a paused forum scrape from its checkpointed thread index.
    pub async fn resume_forum_scrape(&self, activity_id: i64, cancel: &CancellationToken) -> ScraperResult<ForumOutcome> {
        let activity = self.bus.get(activity_id).await?;
        if activity.task_type != TaskKind::ForumScrape {
            return Err(ScraperError::NotResumable(activity_id, format!("not a forum scrape ({})", activity.task_type)));
        }
        if activity.status.is_terminal() {
            return Err(ScraperError::NotResumable(activity_id, format!("status is {}", activity.status)));
        }
        let forum_url = activity
            .details
            .get("forum_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ScraperError::NotResumable(activity_id, "no forum URL recorded".to_string()))?;
        let progress = ForumProgress::from_checkpoint(activity.checkpoint.as_ref());

        if activity.is_paused {
            self.bus.resume(activity_id).await?;
        }
        info!(activity_id, thread_index = progress.thread_index, "Resuming forum scrape of {}", forum_url);

        self.run_forum(activity_id, &forum_url, progress, cancel)
            .instrument(info_span!("scrape_forum", activity_id))
            .await
    }

    async fn run_forum(
        &self,
        activity_id: i64,
        forum_url: &str,
        progress: ForumProgress,
        cancel: &CancellationToken,
    ) -> ScraperResult<ForumOutcome> {
        match self.forum_inner(activity_id, forum_url, progress, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(activity_id, "Forum scrape failed: {}", e);
                if let Err(fail) = self
                    .bus
                    .fail_task(activity_id, &format!("Forum scrape failed: {}", e))
                    .await
                {
                    warn!(activity_id, "Could not mark activity failed: {}", fail);
                }
                Err(e)
            }
        }
    }

    async fn forum_inner(
        &self,
        activity_id: i64,
        forum_url: &str,
        mut progress: ForumProgress,
        cancel: &CancellationToken,
    ) -> ScraperResult<ForumOutcome> {
        self.bus
            .update_progress(activity_id, 5, "Scanning forum pages for threads...")
            .await?;

        let threads = match self.list_forum_threads(activity_id, forum_url, cancel).await? {
            Listing::Complete(threads) => threads,
            Listing::Paused => {
                return self
                    .halt_forum(
                        activity_id,
                        cancel,
                        "⏸️ Task paused while scanning forum pages. Progress saved.",
                        progress.checkpoint(forum_url, 0),
                        progress.thread_index,
                    )
                    .await;
            }
            Listing::Stopped => return Ok(ForumOutcome::Stopped),
        };
        let total = threads.len();

        self.bus
            .update_progress(activity_id, 10, &format!("Found {} threads. Starting scrape...", total))
            .await?;
        info!(activity_id, "Forum listing has {} threads", total);

        while progress.thread_index < total {
            let index = progress.thread_index;
            let paused_here = |progress: &ForumProgress| {
                (
                    format!("⏸️ Task paused at thread {}/{}. Progress saved.", progress.thread_index + 1, total),
                    progress.checkpoint(forum_url, total),
                )
            };

            if cancel.is_cancelled() {
                let (message, checkpoint) = paused_here(&progress);
                return self
                    .halt_forum(activity_id, cancel, &message, checkpoint, index)
                    .await;
            }
            match self.bus.control(activity_id).await? {
                Control::Continue => {}
                Control::Paused => {
                    let (message, checkpoint) = paused_here(&progress);
                    return self
                        .halt_forum(activity_id, cancel, &message, checkpoint, index)
                        .await;
                }
                Control::Cancelled => return Ok(ForumOutcome::Stopped),
            }

            let thread = &threads[index];
            let current = 10 + (85 * index / total) as i64;
            self.bus
                .update(
                    activity_id,
                    ActivityPatch::progress(current, format!("Scraping thread {}/{}: {}", index + 1, total, thread.title)),
                )
                .await?;

            let run = Run {
                activity_id,
                nested: true,
            };
            match self.scrape_thread(run, &thread.url, 1, cancel).await {
                Ok(ThreadOutcome::Completed(summary)) => {
                    progress.success_count += 1;
                    self.notify_completed(&summary).await;
                }
                Ok(ThreadOutcome::Paused { .. }) => {
                    let (message, checkpoint) = paused_here(&progress);
                    return self
                        .halt_forum(activity_id, cancel, &message, checkpoint, index)
                        .await;
                }
                Ok(ThreadOutcome::Stopped) => return Ok(ForumOutcome::Stopped),
                Err(e) => {
                    progress.error_count += 1;
                    warn!(activity_id, "Failed to scrape {}: {}", thread.url, e);
                    self.bus
                        .console_log("warning", format!("Failed to scrape {}: {}", thread.url, e));
                }
            }

            progress.thread_index += 1;
            let done = progress.thread_index;
            self.bus
                .update_progress(
                    activity_id,
                    10 + (85 * done / total) as i64,
                    &format!("Scraped {}/{} threads", done, total),
                )
                .await?;
            if done % FORUM_CHECKPOINT_EVERY == 0 {
                self.bus
                    .save_checkpoint(activity_id, progress.checkpoint(forum_url, total))
                    .await?;
            }

            if done < total && !pace(self.client.policy().thread_delay, cancel).await {
                let (message, checkpoint) = paused_here(&progress);
                return self
                    .halt_forum(activity_id, cancel, &message, checkpoint, done)
                    .await;
            }
        }

        let summary = ForumSummary {
            threads_found: total,
            success_count: progress.success_count,
            error_count: progress.error_count,
        };
        self.bus
            .complete_task(
                activity_id,
                &format!(
                    "Forum scrape complete. Success: {}, Errors: {}",
                    summary.success_count, summary.error_count
                ),
            )
            .await?;
        Ok(ForumOutcome::Completed(summary))
    }

    async fn halt_forum(
        &self,
        activity_id: i64,
        cancel: &CancellationToken,
        message: &str,
        checkpoint: JsonMap,
        thread_index: usize,
    ) -> ScraperResult<ForumOutcome> {
        Ok(match self.bus.halt(activity_id, cancel, message, checkpoint).await? {
            Halt::Paused => ForumOutcome::Paused { thread_index },
            Halt::Cancelled => {
                info!(activity_id, "Forum scrape cancelled at thread {}", thread_index + 1);
                ForumOutcome::Stopped
            }
        })
    }

    /// Walk the forum's index pages collecting thread links. Stops at the
    /// first page without threads or without a next button.
    async fn list_forum_threads(
        &self,
        activity_id: i64,
        forum_url: &str,
        cancel: &CancellationToken,
    ) -> ScraperResult<Listing> {
        let mut threads: Vec<ForumThreadInfo> = Vec::new();
        let mut seen = HashSet::new();
        let mut page = 1;

        loop {
            match self.bus.control(activity_id).await? {
                Control::Continue => {}
                Control::Paused => return Ok(Listing::Paused),
                Control::Cancelled => return Ok(Listing::Stopped),
            }

            let url = page_url(forum_url, page);
            let html = match self.client.fetch_page(&url, cancel).await {
                Ok(html) => html,
                Err(ScraperError::Cancelled) => return Ok(Listing::Paused),
                Err(e) if page > 1 => {
                    warn!(activity_id, "Stopping forum listing at page {}: {}", page, e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let listing = parse_forum_page(&html, &url);
            if listing.threads.is_empty() {
                break;
            }
            for mut thread in listing.threads {
                thread.url = normalize_thread_url(&thread.url);
                if seen.insert(thread.url.clone()) {
                    threads.push(thread);
                }
            }
            self.bus
                .update_progress(
                    activity_id,
                    5,
                    &format!("Scanned forum page {}: {} threads found", page, threads.len()),
                )
                .await?;

            if !listing.has_next {
                break;
            }
            page += 1;
            if !pace(self.client.policy().index_page_delay, cancel).await {
                return Ok(Listing::Paused);
            }
        }
        Ok(Listing::Complete(threads))
    }

    // ---- queries ----

    pub async fn thread(&self, id: i64) -> ScraperResult<ScrapedThread> {
        self.db()
            .read(move |c| store::thread_by_id(c, id))
            .await?
            .ok_or(ScraperError::ThreadNotFound(id))
    }

    pub async fn thread_by_url(&self, url: &str) -> ScraperResult<Option<ScrapedThread>> {
        let url = normalize_thread_url(url);
        Ok(self.db().read(move |c| store::thread_by_url(c, &url)).await?)
    }

    pub async fn list_threads(&self, query: ThreadQuery) -> ScraperResult<(Vec<ScrapedThread>, i64)> {
        Ok(self.db().read(move |c| store::list_threads(c, &query)).await?)
    }

    pub async fn search_threads(
        &self,
        needle: &str,
        limit: i64,
        offset: i64,
    ) -> ScraperResult<(Vec<ScrapedThread>, i64)> {
        Ok(self
            .db()
            .read(|c| store::search_threads(c, needle, limit, offset))
            .await?)
    }

    pub async fn posts_for_thread(&self, thread_id: i64) -> ScraperResult<Vec<ScrapedPost>> {
        Ok(self.db().read(move |c| store::posts_for_thread(c, thread_id)).await?)
    }

    pub async fn links_for_thread(&self, thread_id: i64) -> ScraperResult<Vec<DownloadLink>> {
        Ok(self.db().read(move |c| store::links_for_thread(c, thread_id)).await?)
    }

    pub async fn stats(&self) -> ScraperResult<ScraperStats> {
        Ok(self.db().read(store::stats).await?)
    }

    // ---- deletion ----

    pub async fn delete_thread(&self, id: i64) -> ScraperResult<()> {
        let deleted = self.db().transaction(move |c| store::delete_threads(c, &[id])).await?;
        if deleted == 0 {
            return Err(ScraperError::ThreadNotFound(id));
        }
        info!(thread_id = id, "Deleted scraped thread");
        Ok(())
    }

    /// Delete several threads in one transaction. Returns how many existed.
    pub async fn delete_threads(&self, ids: &[i64]) -> ScraperResult<usize> {
        let deleted = self.db().transaction(|c| store::delete_threads(c, ids)).await?;
        info!("Deleted {} of {} requested threads", deleted, ids.len());
        Ok(deleted)
    }

    pub async fn delete_all_threads(&self) -> ScraperResult<usize> {
        let deleted = self.db().transaction(store::delete_all_threads).await?;
        warn!("Deleted all {} scraped threads", deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Activity, ActivityStatus};
    use crate::database::test_database;
    use crate::notifications::{Notification, NotificationFilter, Priority};
    use crate::testing::{StubResponse, StubServer};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _dir: TempDir,
        shutdown: CancellationToken,
        bus: Arc<ActivityBus>,
        notifications: Arc<NotificationStore>,
        scraper: Arc<ForumScraper>,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let shutdown = CancellationToken::new();
        let bus = ActivityBus::new(db, shutdown.clone());
        let notifications = NotificationStore::new(bus.clone());
        let scraper = ForumScraper::new(bus.clone(), notifications.clone(), &Rate::default(), RatePolicy::immediate())
            .await
            .unwrap();
        Harness {
            _dir: dir,
            shutdown,
            bus,
            notifications,
            scraper,
        }
    }

    fn post_html(id: u32, body: &str) -> String {
        format!(
            r#"<article class="message message--post" data-content="post-{id}">
                 <div class="message-main">
                   <div class="message-name"><a class="username">user{id}</a></div>
                   <div class="message-body"><div class="bbWrapper">{body}</div></div>
                 </div>
               </article>"#
        )
    }

    fn thread_html(title: &str, posts: &[(u32, &str)], next: bool) -> String {
        let posts: String = posts.iter().map(|(id, body)| post_html(*id, body)).collect();
        let nav = if next {
            r#"<a class="pageNav-jump pageNav-jump--next">Next</a>"#
        } else {
            ""
        };
        format!(r#"<html><body><h1 class="p-title-value">{title}</h1>{posts}{nav}</body></html>"#)
    }

    fn two_page_thread(path: &str) -> StubResponse {
        match path {
            "/threads/x.100" => StubResponse::html(thread_html(
                "[MILF] Jane Doe - Collection",
                &[(1, "https://gofile.io/d/aaa"), (2, "mirror https://gofile.io/d/bbb")],
                true,
            )),
            "/threads/x.100/page-2" => StubResponse::html(thread_html(
                "[MILF] Jane Doe - Collection",
                &[(3, "https://gofile.io/d/ccc")],
                false,
            )),
            _ => StubResponse::status(404),
        }
    }

    async fn activities_of(bus: &ActivityBus, kind: TaskKind) -> Vec<Activity> {
        bus.get_recent(50)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.task_type == kind)
            .collect()
    }

    async fn scrape_notifications(store: &NotificationStore) -> Vec<Notification> {
        store
            .list(NotificationFilter::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == "scrape_completed")
            .collect()
    }

    #[tokio::test]
    async fn test_two_page_thread_end_to_end() {
        let h = harness().await;
        let server = StubServer::start(|req| async move { two_page_thread(&req.path) }).await;

        let outcome = h
            .scraper
            .scrape_thread_complete(&format!("{}/threads/x.100/", server.base()), &CancellationToken::new())
            .await
            .unwrap();
        let summary = match outcome {
            ThreadOutcome::Completed(summary) => summary,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(summary.pages, 2);

        let thread = h.scraper.thread(summary.thread_id).await.unwrap();
        assert_eq!(thread.external_id, "100");
        assert_eq!(thread.title, "Jane Doe - Collection");
        assert_eq!(thread.url, format!("{}/threads/x.100", server.base()));
        assert_eq!(thread.post_count, 3);
        assert_eq!(thread.download_count, 3);
        assert_eq!(thread.metadata.tags, vec!["MILF"]);
        assert_eq!(thread.metadata.performer_names, vec!["Jane Doe"]);

        let posts = h.scraper.posts_for_thread(thread.id).await.unwrap();
        let ids: Vec<&str> = posts.iter().map(|p| p.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(posts.iter().map(|p| p.post_number).collect::<Vec<_>>(), vec![1, 2, 3]);

        let links = h.scraper.links_for_thread(thread.id).await.unwrap();
        assert_eq!(links.len(), 3);
        for (link, post) in links.iter().zip(&posts) {
            assert_eq!(link.provider, "gofile");
            assert_eq!(link.status, LinkStatus::Active);
            assert_eq!(link.thread_id, thread.id);
            assert_eq!(link.post_id, Some(post.id));
        }

        let activities = activities_of(&h.bus, TaskKind::ScraperThread).await;
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].status, ActivityStatus::Completed);
        assert_eq!(activities[0].progress, 100);
        assert_eq!(
            activities[0].message,
            "Successfully scraped thread: 3 posts, 3 download links found"
        );

        let notes = scrape_notifications(&h.notifications).await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].metadata["posts_found"], 3);
        assert_eq!(notes[0].metadata["links_found"], 3);
        assert_eq!(notes[0].metadata["is_incremental"], false);
    }

    #[tokio::test]
    async fn test_rescrape_is_incremental() {
        let h = harness().await;
        let server = StubServer::start(|req| async move { two_page_thread(&req.path) }).await;
        let url = format!("{}/threads/x.100/unread", server.base());
        let cancel = CancellationToken::new();

        h.scraper.scrape_thread_complete(&url, &cancel).await.unwrap();
        let before = h.scraper.thread_by_url(&url).await.unwrap().unwrap();
        let outcome = h.scraper.scrape_thread_complete(&url, &cancel).await.unwrap();
        let after = h.scraper.thread_by_url(&url).await.unwrap().unwrap();

        match outcome {
            ThreadOutcome::Completed(summary) => {
                assert!(summary.is_incremental);
                assert_eq!(summary.new_posts, 0);
                assert_eq!(summary.new_links, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(after.id, before.id);
        assert_eq!(after.post_count, 3);
        assert_eq!(after.first_scraped_at, before.first_scraped_at);

        let notes = scrape_notifications(&h.notifications).await;
        assert_eq!(notes.len(), 2);
        let incremental = notes.iter().find(|n| n.metadata["is_incremental"] == true).unwrap();
        assert_eq!(incremental.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_pause_between_pages_and_resume() {
        let h = harness().await;
        let bus = h.bus.clone();
        let paused_once = Arc::new(AtomicBool::new(false));
        let server = StubServer::start(move |req| {
            let bus = bus.clone();
            let paused_once = paused_once.clone();
            async move {
                // Flip the pause flag while the first page is being served.
                if req.path == "/threads/x.100" && !paused_once.swap(true, Ordering::SeqCst) {
                    let status = bus.get_status().await.unwrap();
                    for activity in status.running_tasks {
                        if activity.task_type == TaskKind::ScraperThread {
                            bus.pause(activity.id).await.unwrap();
                        }
                    }
                }
                two_page_thread(&req.path)
            }
        })
        .await;
        let url = format!("{}/threads/x.100", server.base());
        let cancel = CancellationToken::new();

        let outcome = h.scraper.scrape_thread_complete(&url, &cancel).await.unwrap();
        assert!(matches!(outcome, ThreadOutcome::Paused { page: 2, .. }));

        let activity = activities_of(&h.bus, TaskKind::ScraperThread).await.remove(0);
        assert_eq!(activity.status, ActivityStatus::Running);
        assert!(activity.is_paused);
        assert!(activity.message.starts_with("⏸️ Paused at page 2"));
        assert_eq!(activity.checkpoint.as_ref().unwrap()["page"], 2);

        let thread = h.scraper.thread_by_url(&url).await.unwrap().unwrap();
        assert_eq!(thread.post_count, 2);

        h.bus.resume(activity.id).await.unwrap();
        let outcome = h.scraper.resume_thread_scrape(activity.id, &cancel).await.unwrap();
        assert!(matches!(outcome, ThreadOutcome::Completed(_)));

        let thread = h.scraper.thread(thread.id).await.unwrap();
        assert_eq!(thread.post_count, 3);
        assert_eq!(thread.download_count, 3);
        let posts = h.scraper.posts_for_thread(thread.id).await.unwrap();
        assert_eq!(posts.iter().map(|p| p.post_number).collect::<Vec<_>>(), vec![1, 2, 3]);

        let done = h.bus.get(activity.id).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_continues_from_checkpoint_page() {
        let h = harness().await;
        let server = StubServer::start(|req| async move { two_page_thread(&req.path) }).await;
        let url = format!("{}/threads/x.100", server.base());

        // A paused scrape that already stored page 1.
        let activity = h
            .bus
            .start_task(TaskKind::ScraperThread, "Scraping thread", json_object(json!({ "url": url })))
            .await
            .unwrap();
        h.bus.pause(activity.id).await.unwrap();
        h.bus
            .record_pause(activity.id, "⏸️ Paused at page 2. Progress saved.", json_object(json!({ "page": 2 })))
            .await
            .unwrap();

        let outcome = h
            .scraper
            .resume_thread_scrape(activity.id, &CancellationToken::new())
            .await
            .unwrap();
        let summary = match outcome {
            ThreadOutcome::Completed(summary) => summary,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(summary.posts_found, 1);

        let posts = h.scraper.posts_for_thread(summary.thread_id).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].external_id, "3");

        let done = h.bus.get(activity.id).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Completed);
        assert!(!done.is_paused);
    }

    #[tokio::test]
    async fn test_auth_failure_fails_activity() {
        let h = harness().await;
        let server = StubServer::start(|_| async { StubResponse::status(403) }).await;

        let err = h
            .scraper
            .scrape_thread_complete(&server.url("/threads/locked.5"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScraperError::AuthenticationRequired));

        let activity = activities_of(&h.bus, TaskKind::ScraperThread).await.remove(0);
        assert_eq!(activity.status, ActivityStatus::Failed);
        assert!(activity.message.contains("authentication required"));
    }

    #[tokio::test]
    async fn test_missing_title_is_no_content() {
        let h = harness().await;
        let server = StubServer::start(|_| async { StubResponse::html("<html><body>maintenance</body></html>") }).await;

        let err = h
            .scraper
            .scrape_thread_complete(&server.url("/threads/empty.6"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScraperError::NoContent));
        assert_eq!(h.scraper.stats().await.unwrap().total_threads, 0);
    }

    #[tokio::test]
    async fn test_forum_scrape_counts_successes_and_errors() {
        let h = harness().await;
        let server = StubServer::start(|req| async move {
            match req.path.as_str() {
                "/forums/videos.3" => StubResponse::html(
                    r#"<div class="structItem structItem--thread"><div class="structItem-title">
                         <a href="/threads/a.1/" data-tp-primary="on">A</a></div></div>
                       <div class="structItem structItem--thread"><div class="structItem-title">
                         <a href="/threads/b.2/" data-tp-primary="on">B</a></div></div>
                       <a class="pageNav-jump pageNav-jump--next">Next</a>"#,
                ),
                "/forums/videos.3/page-2" => StubResponse::html(
                    r#"<div class="structItem structItem--thread"><div class="structItem-title">
                         <a href="/threads/c.3/" data-tp-primary="on">C</a></div></div>"#,
                ),
                "/threads/a.1" => StubResponse::html(thread_html("A", &[(10, "https://pixeldrain.com/u/x")], false)),
                "/threads/b.2" => StubResponse::html(thread_html("B", &[(20, "none")], false)),
                _ => StubResponse::status(404),
            }
        })
        .await;

        let outcome = h
            .scraper
            .scrape_forum_and_save_all(&server.url("/forums/videos.3/"), &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ForumOutcome::Completed(summary) => {
                assert_eq!(summary.threads_found, 3);
                assert_eq!(summary.success_count, 2);
                assert_eq!(summary.error_count, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let activity = activities_of(&h.bus, TaskKind::ForumScrape).await.remove(0);
        assert_eq!(activity.status, ActivityStatus::Completed);
        assert_eq!(activity.progress, 100);
        assert_eq!(activity.message, "Forum scrape complete. Success: 2, Errors: 1");
        assert!(activities_of(&h.bus, TaskKind::ScraperThread).await.is_empty());

        let stats = h.scraper.stats().await.unwrap();
        assert_eq!(stats.total_threads, 2);
        assert_eq!(stats.links_by_provider.get("pixeldrain"), Some(&1));
    }

    #[tokio::test]
    async fn test_forum_pause_records_thread_index() {
        let h = harness().await;
        let server = StubServer::start(|req| async move {
            match req.path.as_str() {
                "/forums/f.1" => StubResponse::html(
                    r#"<div class="structItem structItem--thread"><div class="structItem-title">
                         <a href="/threads/a.1/" data-tp-primary="on">A</a></div></div>"#,
                ),
                _ => StubResponse::status(404),
            }
        })
        .await;

        let activity = h
            .bus
            .start_task(
                TaskKind::ForumScrape,
                "Scraping forum",
                json_object(json!({ "forum_url": server.url("/forums/f.1") })),
            )
            .await
            .unwrap();
        h.bus
            .save_checkpoint(activity.id, json_object(json!({ "thread_index": 1, "success_count": 1 })))
            .await
            .unwrap();

        // Resuming past the last thread completes straight away with the saved counters.
        let outcome = h
            .scraper
            .resume_forum_scrape(activity.id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ForumOutcome::Completed(ForumSummary { success_count: 1, .. })));

        let second = h
            .bus
            .start_task(
                TaskKind::ForumScrape,
                "Scraping forum",
                json_object(json!({ "forum_url": server.url("/forums/f.1") })),
            )
            .await
            .unwrap();
        h.bus.pause(second.id).await.unwrap();
        h.bus.resume(second.id).await.unwrap();
        // Process shutdown keeps the record resumable.
        let cancel = h.shutdown.child_token();
        h.shutdown.cancel();
        let outcome = h.scraper.resume_forum_scrape(second.id, &cancel).await.unwrap();
        assert!(matches!(outcome, ForumOutcome::Paused { thread_index: 0 }));
        let paused = h.bus.get(second.id).await.unwrap();
        assert!(paused.is_paused);
        assert_eq!(paused.checkpoint.unwrap()["thread_index"], 0);
    }

    #[tokio::test]
    async fn test_withdrawn_job_token_fails_forum_scrape() {
        let h = harness().await;
        let activity = h
            .bus
            .start_task(
                TaskKind::ForumScrape,
                "Scraping forum",
                json_object(json!({ "forum_url": "http://127.0.0.1:9/forums/f.1" })),
            )
            .await
            .unwrap();
        let job = h.shutdown.child_token();
        job.cancel();

        let outcome = h.scraper.resume_forum_scrape(activity.id, &job).await.unwrap();
        assert!(matches!(outcome, ForumOutcome::Stopped));
        let record = h.bus.get(activity.id).await.unwrap();
        assert_eq!(record.status, ActivityStatus::Failed);
        assert_eq!(record.message, "cancelled");
        assert!(!record.is_paused);
        assert!(!h.bus.shutting_down());
    }

    #[tokio::test]
    async fn test_cancelled_forum_scrape_is_not_resumable() {
        let h = harness().await;
        let activity = h
            .bus
            .start_task(
                TaskKind::ForumScrape,
                "Scraping forum",
                json_object(json!({ "forum_url": "http://127.0.0.1:9/forums/f.1" })),
            )
            .await
            .unwrap();
        h.bus.cancel(activity.id).await.unwrap();
        let err = h
            .scraper
            .resume_forum_scrape(activity.id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScraperError::NotResumable(..)));
    }

    #[tokio::test]
    async fn test_session_cookie_round_trip() {
        let h = harness().await;
        h.scraper.set_session_cookie("  xf_user=1;\r\n xf_session=2 ").await.unwrap();
        assert_eq!(h.scraper.session_cookie().as_deref(), Some("xf_user=1; xf_session=2"));

        let reloaded = ForumScraper::new(h.bus.clone(), h.notifications.clone(), &Rate::default(), RatePolicy::immediate())
            .await
            .unwrap();
        assert_eq!(reloaded.session_cookie().as_deref(), Some("xf_user=1; xf_session=2"));

        reloaded.clear_session_cookie().await.unwrap();
        assert!(reloaded.session_cookie().is_none());
        let again = ForumScraper::new(h.bus.clone(), h.notifications.clone(), &Rate::default(), RatePolicy::immediate())
            .await
            .unwrap();
        assert!(again.session_cookie().is_none());
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let h = harness().await;
        let server = StubServer::start(|req| async move { two_page_thread(&req.path) }).await;
        let outcome = h
            .scraper
            .scrape_thread_complete(&server.url("/threads/x.100"), &CancellationToken::new())
            .await
            .unwrap();
        let ThreadOutcome::Completed(summary) = outcome else {
            panic!("scrape did not complete");
        };

        h.scraper.delete_thread(summary.thread_id).await.unwrap();
        assert!(matches!(
            h.scraper.delete_thread(summary.thread_id).await,
            Err(ScraperError::ThreadNotFound(_))
        ));
        assert_eq!(h.scraper.stats().await.unwrap(), ScraperStats::default());
    }
}
