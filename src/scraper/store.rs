//! Persistence for scraped threads, posts and download links.
//!
//! Functions here take a borrowed connection so callers choose the pool side
//! and the transaction boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use super::heuristics::ExtractedLink;
use super::parse::{Attachment, ParsedPost};
use crate::database::{now, text_enum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Dead,
    Expired,
    Unchecked,
}

text_enum!(LinkStatus {
    Active => "active",
    Dead => "dead",
    Expired => "expired",
    Unchecked => "unchecked",
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbnail_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performer_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub studio_names: Vec<String>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedThread {
    pub id: i64,
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub url: String,
    pub category: String,
    pub author: String,
    pub reply_count: i64,
    pub view_count: i64,
    pub post_count: i64,
    pub download_count: i64,
    pub metadata: ThreadMetadata,
    pub first_scraped_at: DateTime<Utc>,
    pub last_scraped_at: DateTime<Utc>,
}

const THREAD_COLUMNS: &str = "id, external_id, source, title, url, category, author, reply_count, view_count, \
     post_count, download_count, metadata, first_scraped_at, last_scraped_at";

impl ScrapedThread {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get(11)?;
        Ok(Self {
            id: row.get(0)?,
            external_id: row.get(1)?,
            source: row.get(2)?,
            title: row.get(3)?,
            url: row.get(4)?,
            category: row.get(5)?,
            author: row.get(6)?,
            reply_count: row.get(7)?,
            view_count: row.get(8)?,
            post_count: row.get(9)?,
            download_count: row.get(10)?,
            metadata: metadata
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            first_scraped_at: row.get(12)?,
            last_scraped_at: row.get(13)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedPost {
    pub id: i64,
    pub thread_id: i64,
    pub external_id: String,
    pub source: String,
    pub author: String,
    pub content: String,
    pub plain_text: String,
    pub post_number: i64,
    pub like_count: i64,
    pub posted_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    pub scraped_at: DateTime<Utc>,
}

const POST_COLUMNS: &str =
    "id, thread_id, external_id, source, author, content, plain_text, post_number, like_count, posted_at, attachments, scraped_at";

impl ScrapedPost {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let attachments: Option<String> = row.get(10)?;
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            external_id: row.get(2)?,
            source: row.get(3)?,
            author: row.get(4)?,
            content: row.get(5)?,
            plain_text: row.get(6)?,
            post_number: row.get(7)?,
            like_count: row.get(8)?,
            posted_at: row.get(9)?,
            attachments: attachments
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            scraped_at: row.get(11)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLink {
    pub id: i64,
    pub thread_id: i64,
    pub post_id: Option<i64>,
    pub provider: String,
    pub url: String,
    pub original_url: String,
    pub source: String,
    pub status: LinkStatus,
    pub download_status: String,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub(crate) const LINK_COLUMNS: &str = "id, thread_id, post_id, provider, url, original_url, source, status, \
     download_status, downloaded_at, last_checked_at, created_at";

impl DownloadLink {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            post_id: row.get(2)?,
            provider: row.get(3)?,
            url: row.get(4)?,
            original_url: row.get(5)?,
            source: row.get(6)?,
            status: row.get(7)?,
            download_status: row.get(8)?,
            downloaded_at: row.get(9)?,
            last_checked_at: row.get(10)?,
            created_at: row.get(11)?,
        })
    }
}

/// Thread fields as extracted from the first page.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub url: String,
    pub category: String,
    pub author: String,
    pub reply_count: i64,
    pub view_count: i64,
    pub metadata: ThreadMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadSort {
    #[default]
    DateDesc,
    DateAsc,
    TitleAsc,
    TitleDesc,
    ViewsDesc,
    ViewsAsc,
    RepliesDesc,
    DownloadsDesc,
}

text_enum!(ThreadSort {
    DateDesc => "date_desc",
    DateAsc => "date_asc",
    TitleAsc => "title_asc",
    TitleDesc => "title_desc",
    ViewsDesc => "views_desc",
    ViewsAsc => "views_asc",
    RepliesDesc => "replies_desc",
    DownloadsDesc => "downloads_desc",
});

impl ThreadSort {
    fn order_by(&self) -> &'static str {
        match self {
            ThreadSort::DateDesc => "last_scraped_at DESC, id DESC",
            ThreadSort::DateAsc => "last_scraped_at ASC, id ASC",
            ThreadSort::TitleAsc => "title COLLATE NOCASE ASC",
            ThreadSort::TitleDesc => "title COLLATE NOCASE DESC",
            ThreadSort::ViewsDesc => "view_count DESC, id DESC",
            ThreadSort::ViewsAsc => "view_count ASC, id ASC",
            ThreadSort::RepliesDesc => "reply_count DESC, id DESC",
            ThreadSort::DownloadsDesc => "download_count DESC, id DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadQuery {
    pub limit: i64,
    pub offset: i64,
    pub sort: ThreadSort,
    /// Only threads carrying at least one link from this provider
    pub provider: Option<String>,
}

impl Default for ThreadQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            sort: ThreadSort::default(),
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScraperStats {
    pub total_threads: i64,
    pub total_posts: i64,
    pub total_links: i64,
    pub active_links: i64,
    pub dead_links: i64,
    pub links_by_provider: BTreeMap<String, i64>,
}

/// Insert or refresh a thread by `(external_id, source)`. Returns the row id
/// and whether the thread was already known. `first_scraped_at` never moves.
pub fn upsert_thread(conn: &Connection, thread: &NewThread) -> rusqlite::Result<(i64, bool)> {
    let metadata = serde_json::to_string(&thread.metadata).unwrap_or_else(|_| "{}".to_string());
    let timestamp = now();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM scraped_threads WHERE external_id = ?1 AND source = ?2",
            params![thread.external_id, thread.source],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE scraped_threads SET title = ?1, url = ?2, category = ?3, author = ?4,
                     reply_count = ?5, view_count = ?6, metadata = ?7, last_scraped_at = ?8
                 WHERE id = ?9",
                params![
                    thread.title,
                    thread.url,
                    thread.category,
                    thread.author,
                    thread.reply_count,
                    thread.view_count,
                    metadata,
                    timestamp,
                    id
                ],
            )?;
            Ok((id, true))
        }
        None => {
            conn.execute(
                "INSERT INTO scraped_threads (external_id, source, title, url, category, author,
                     reply_count, view_count, metadata, first_scraped_at, last_scraped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    thread.external_id,
                    thread.source,
                    thread.title,
                    thread.url,
                    thread.category,
                    thread.author,
                    thread.reply_count,
                    thread.view_count,
                    metadata,
                    timestamp
                ],
            )?;
            Ok((conn.last_insert_rowid(), false))
        }
    }
}

/// Ordinal for the next post appended to a thread.
pub fn next_post_number(conn: &Connection, thread_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(post_number), 0) + 1 FROM scraped_posts WHERE thread_id = ?1",
        [thread_id],
        |row| row.get(0),
    )
}

/// Insert or refresh a post by `(external_id, source)`. An existing post keeps
/// its ordinal; content, likes and attachments are refreshed. Returns the row
/// id and whether it was newly inserted.
pub fn upsert_post(
    conn: &Connection,
    thread_id: i64,
    source: &str,
    post_number: i64,
    post: &ParsedPost,
    links: &[ExtractedLink],
) -> rusqlite::Result<(i64, bool)> {
    let attachments = serde_json::to_string(&post.attachments).unwrap_or_else(|_| "[]".to_string());
    let metadata = serde_json::json!({
        "extracted_links": links.iter().map(|l| l.url.as_str()).collect::<Vec<_>>(),
    })
    .to_string();
    let timestamp = now();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM scraped_posts WHERE external_id = ?1 AND source = ?2",
            params![post.external_id, source],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE scraped_posts SET content = ?1, plain_text = ?2, like_count = ?3,
                     attachments = ?4, metadata = ?5, scraped_at = ?6
                 WHERE id = ?7",
                params![post.content_html, post.plain_text, post.like_count, attachments, metadata, timestamp, id],
            )?;
            Ok((id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO scraped_posts (thread_id, external_id, source, author, content, plain_text,
                     post_number, like_count, posted_at, attachments, metadata, scraped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    thread_id,
                    post.external_id,
                    source,
                    post.author,
                    post.content_html,
                    post.plain_text,
                    post_number,
                    post.like_count,
                    post.posted_at,
                    attachments,
                    metadata,
                    timestamp
                ],
            )?;
            Ok((conn.last_insert_rowid(), true))
        }
    }
}

/// Record a link by `(url, source)`. Links already on file are left alone so a
/// verified status survives a re-scrape. Returns true when inserted.
pub fn insert_link(
    conn: &Connection,
    thread_id: i64,
    post_id: i64,
    link: &ExtractedLink,
    source: &str,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO scraped_download_links (thread_id, post_id, provider, url, original_url, source, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7)
         ON CONFLICT(url, source) DO NOTHING",
        params![thread_id, post_id, link.provider, link.url, source, LinkStatus::Active, now()],
    )?;
    Ok(inserted > 0)
}

/// Recompute the denormalized post and link counts. Returns `(posts, links)`.
pub fn refresh_counts(conn: &Connection, thread_id: i64) -> rusqlite::Result<(i64, i64)> {
    conn.execute(
        "UPDATE scraped_threads SET
             post_count = (SELECT COUNT(*) FROM scraped_posts WHERE thread_id = ?1),
             download_count = (SELECT COUNT(*) FROM scraped_download_links WHERE thread_id = ?1)
         WHERE id = ?1",
        [thread_id],
    )?;
    conn.query_row(
        "SELECT post_count, download_count FROM scraped_threads WHERE id = ?1",
        [thread_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

pub fn thread_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<ScrapedThread>> {
    conn.query_row(
        &format!("SELECT {} FROM scraped_threads WHERE id = ?1", THREAD_COLUMNS),
        [id],
        ScrapedThread::from_row,
    )
    .optional()
}

pub fn thread_by_url(conn: &Connection, url: &str) -> rusqlite::Result<Option<ScrapedThread>> {
    conn.query_row(
        &format!("SELECT {} FROM scraped_threads WHERE url = ?1", THREAD_COLUMNS),
        [url],
        ScrapedThread::from_row,
    )
    .optional()
}

/// One page of threads plus the total matching count.
pub fn list_threads(conn: &Connection, query: &ThreadQuery) -> rusqlite::Result<(Vec<ScrapedThread>, i64)> {
    let (filter, args): (&str, Vec<String>) = match &query.provider {
        Some(provider) => (
            "WHERE id IN (SELECT thread_id FROM scraped_download_links WHERE provider = ?1)",
            vec![provider.clone()],
        ),
        None => ("", Vec::new()),
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM scraped_threads {}", filter),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {} FROM scraped_threads {} ORDER BY {} LIMIT {} OFFSET {}",
        THREAD_COLUMNS,
        filter,
        query.sort.order_by(),
        query.limit.max(0),
        query.offset.max(0)
    );
    let mut stmt = conn.prepare(&sql)?;
    let threads = stmt
        .query_map(params_from_iter(args.iter()), ScrapedThread::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((threads, total))
}

/// Title or author substring match, most recently scraped first.
pub fn search_threads(
    conn: &Connection,
    needle: &str,
    limit: i64,
    offset: i64,
) -> rusqlite::Result<(Vec<ScrapedThread>, i64)> {
    let pattern = format!("%{}%", needle.trim());
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM scraped_threads WHERE title LIKE ?1 OR author LIKE ?1",
        [&pattern],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scraped_threads WHERE title LIKE ?1 OR author LIKE ?1
         ORDER BY last_scraped_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        THREAD_COLUMNS
    ))?;
    let threads = stmt
        .query_map(params![pattern, limit, offset], ScrapedThread::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((threads, total))
}

pub fn posts_for_thread(conn: &Connection, thread_id: i64) -> rusqlite::Result<Vec<ScrapedPost>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scraped_posts WHERE thread_id = ?1 ORDER BY post_number ASC, id ASC",
        POST_COLUMNS
    ))?;
    stmt.query_map([thread_id], ScrapedPost::from_row)?.collect()
}

pub fn links_for_thread(conn: &Connection, thread_id: i64) -> rusqlite::Result<Vec<DownloadLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scraped_download_links WHERE thread_id = ?1 ORDER BY id ASC",
        LINK_COLUMNS
    ))?;
    stmt.query_map([thread_id], DownloadLink::from_row)?.collect()
}

pub fn stats(conn: &Connection) -> rusqlite::Result<ScraperStats> {
    let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));

    let mut stats = ScraperStats {
        total_threads: count("SELECT COUNT(*) FROM scraped_threads")?,
        total_posts: count("SELECT COUNT(*) FROM scraped_posts")?,
        total_links: count("SELECT COUNT(*) FROM scraped_download_links")?,
        active_links: count("SELECT COUNT(*) FROM scraped_download_links WHERE status = 'active'")?,
        dead_links: count("SELECT COUNT(*) FROM scraped_download_links WHERE status = 'dead'")?,
        links_by_provider: BTreeMap::new(),
    };

    let mut stmt = conn.prepare("SELECT provider, COUNT(*) FROM scraped_download_links GROUP BY provider")?;
    for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
        let (provider, n) = row?;
        stats.links_by_provider.insert(provider, n);
    }
    Ok(stats)
}

/// Remove threads with their posts and links. Run inside a transaction.
pub fn delete_threads(conn: &Connection, ids: &[i64]) -> rusqlite::Result<usize> {
    let mut deleted = 0;
    for id in ids {
        conn.execute("DELETE FROM scraped_download_links WHERE thread_id = ?1", [id])?;
        conn.execute("DELETE FROM scraped_posts WHERE thread_id = ?1", [id])?;
        deleted += conn.execute("DELETE FROM scraped_threads WHERE id = ?1", [id])?;
    }
    Ok(deleted)
}

pub fn delete_all_threads(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM scraped_download_links", [])?;
    conn.execute("DELETE FROM scraped_posts", [])?;
    conn.execute("DELETE FROM scraped_threads", [])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_database;
    use tempfile::tempdir;

    fn new_thread(external_id: &str, title: &str) -> NewThread {
        NewThread {
            external_id: external_id.to_string(),
            source: "forum".to_string(),
            title: title.to_string(),
            url: format!("https://forum.example/threads/{}", external_id),
            category: String::new(),
            author: "author".to_string(),
            reply_count: 0,
            view_count: 0,
            metadata: ThreadMetadata::default(),
        }
    }

    fn post(external_id: &str, body: &str) -> ParsedPost {
        ParsedPost {
            external_id: external_id.to_string(),
            content_html: body.to_string(),
            ..ParsedPost::default()
        }
    }

    fn gofile(id: &str) -> ExtractedLink {
        ExtractedLink {
            provider: "gofile",
            url: format!("https://gofile.io/d/{}", id),
        }
    }

    #[tokio::test]
    async fn test_thread_upsert_keeps_first_scraped_at() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;

        let (id, existed) = db.write(|c| upsert_thread(c, &new_thread("100", "First"))).await.unwrap();
        assert!(!existed);
        let before = db.read(move |c| thread_by_id(c, id)).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (again, existed) = db.write(|c| upsert_thread(c, &new_thread("100", "Renamed"))).await.unwrap();
        assert_eq!(again, id);
        assert!(existed);

        let after = db.read(move |c| thread_by_id(c, id)).await.unwrap().unwrap();
        assert_eq!(after.title, "Renamed");
        assert_eq!(after.first_scraped_at, before.first_scraped_at);
        assert!(after.last_scraped_at > before.last_scraped_at);
    }

    #[tokio::test]
    async fn test_posts_and_links_are_idempotent() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;

        let counts = db
            .transaction(|c| {
                let (thread_id, _) = upsert_thread(c, &new_thread("7", "T"))?;
                for round in 0..2 {
                    let p = post("p1", &format!("round {}", round));
                    let links = [gofile("a"), gofile("b")];
                    let (post_id, _) = upsert_post(c, thread_id, "forum", 1, &p, &links)?;
                    for link in &links {
                        insert_link(c, thread_id, post_id, link, "forum")?;
                    }
                }
                refresh_counts(c, thread_id)
            })
            .await
            .unwrap();
        assert_eq!(counts, (1, 2));

        let posts = db.read(|c| posts_for_thread(c, 1)).await.unwrap();
        assert_eq!(posts[0].content, "round 1");
        let links = db.read(|c| links_for_thread(c, 1)).await.unwrap();
        assert!(links.iter().all(|l| l.status == LinkStatus::Active && l.post_id == Some(posts[0].id)));
    }

    #[tokio::test]
    async fn test_list_sort_and_provider_filter() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;

        db.transaction(|c| {
            let (a, _) = upsert_thread(c, &new_thread("1", "Banana"))?;
            let (_b, _) = upsert_thread(c, &new_thread("2", "apple"))?;
            let (post_id, _) = upsert_post(c, a, "forum", 1, &post("x", ""), &[])?;
            insert_link(c, a, post_id, &gofile("zz"), "forum")?;
            Ok(())
        })
        .await
        .unwrap();

        let query = ThreadQuery {
            sort: ThreadSort::TitleAsc,
            ..ThreadQuery::default()
        };
        let (threads, total) = db.read(move |c| list_threads(c, &query)).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(threads[0].title, "apple");

        let query = ThreadQuery {
            provider: Some("gofile".to_string()),
            ..ThreadQuery::default()
        };
        let (threads, total) = db.read(move |c| list_threads(c, &query)).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(threads[0].title, "Banana");

        let (found, total) = db.read(|c| search_threads(c, "ana", 10, 0)).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].external_id, "1");
    }

    #[tokio::test]
    async fn test_stats_and_delete() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;

        let thread_id = db
            .transaction(|c| {
                let (t, _) = upsert_thread(c, &new_thread("9", "T"))?;
                let (p, _) = upsert_post(c, t, "forum", 1, &post("q", ""), &[])?;
                insert_link(c, t, p, &gofile("one"), "forum")?;
                insert_link(
                    c,
                    t,
                    p,
                    &ExtractedLink {
                        provider: "mega",
                        url: "https://mega.nz/file/x".to_string(),
                    },
                    "forum",
                )?;
                Ok(t)
            })
            .await
            .unwrap();

        let s = db.read(stats).await.unwrap();
        assert_eq!(s.total_threads, 1);
        assert_eq!(s.total_links, 2);
        assert_eq!(s.active_links, 2);
        assert_eq!(s.links_by_provider.get("mega"), Some(&1));

        let deleted = db.transaction(move |c| delete_threads(c, &[thread_id, 999])).await.unwrap();
        assert_eq!(deleted, 1);
        let s = db.read(stats).await.unwrap();
        assert_eq!(s, ScraperStats::default());
    }
}
