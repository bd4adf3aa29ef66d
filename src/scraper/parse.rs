//! DOM extraction for forum thread pages and forum listings.
//!
//! `Html` is not `Send`, so every parser here is synchronous and returns owned
//! data; callers never hold a document across an await point.

use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::heuristics::parse_count;

lazy_static! {
    static ref THREAD_TITLE: Selector = Selector::parse("h1.p-title-value").unwrap();
    static ref THREAD_AUTHOR: Selector = Selector::parse(".p-description .username").unwrap();
    static ref BREADCRUMB: Selector = Selector::parse(".p-breadcrumbs li:nth-last-child(2) a").unwrap();
    static ref PAIRS: Selector = Selector::parse("dl.pairs").unwrap();
    static ref DT: Selector = Selector::parse("dt").unwrap();
    static ref DD: Selector = Selector::parse("dd").unwrap();
    static ref MESSAGE_IMAGE: Selector = Selector::parse(".message-main img").unwrap();
    static ref TAG_LIST: Selector = Selector::parse(".tagList a").unwrap();
    static ref STICKY: Selector = Selector::parse(".structItem--sticky").unwrap();
    static ref LOCKED: Selector = Selector::parse(".structItem--locked").unwrap();

    static ref POST: Selector = Selector::parse(".message--post").unwrap();
    static ref POST_AUTHOR: Selector = Selector::parse(".message-name .username").unwrap();
    static ref POST_BODY: Selector = Selector::parse(".message-body .bbWrapper").unwrap();
    static ref REACTIONS: Selector = Selector::parse(".reactionsBar-link").unwrap();
    static ref POSTED_AT: Selector =
        Selector::parse(".message-attribution-main time, .message-attributes-main time").unwrap();
    static ref ATTACHMENT: Selector = Selector::parse(".message-attachments .attachment").unwrap();
    static ref IMG: Selector = Selector::parse("img").unwrap();

    static ref NEXT_BUTTON: Selector = Selector::parse(".pageNav-jump--next").unwrap();
    static ref PAGE_NUMBER: Selector = Selector::parse(".pageNav-page").unwrap();

    static ref LISTING_THREAD: Selector = Selector::parse(".structItem--thread").unwrap();
    static ref LISTING_PRIMARY_LINK: Selector = Selector::parse(".structItem-title a[data-tp-primary]").unwrap();
    static ref LISTING_ANY_LINK: Selector = Selector::parse(".structItem-title a").unwrap();
    static ref LISTING_AUTHOR: Selector = Selector::parse(".structItem-cell--meta .username, .structItem-minor .username").unwrap();
    static ref LISTING_REPLIES: Selector = Selector::parse(".structItem-cell--meta dd").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// One post as rendered on a thread page.
#[derive(Debug, Clone, Default)]
pub struct ParsedPost {
    /// Empty when the forum did not render a post id.
    pub external_id: String,
    pub author: String,
    pub content_html: String,
    pub plain_text: String,
    pub like_count: i64,
    pub posted_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
}

/// Signals used to decide whether another page follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    /// A next button is present and not disabled
    pub next_enabled: bool,
    /// Highest page number rendered in the page navigation
    pub max_page: Option<u32>,
}

impl Pagination {
    pub fn has_page_after(&self, current: u32) -> bool {
        self.next_enabled || self.max_page.is_some_and(|max| max > current)
    }
}

/// Everything extracted from one thread page.
#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub title: Option<String>,
    pub author: String,
    pub category: String,
    pub view_count: i64,
    pub reply_count: i64,
    pub thumbnails: Vec<String>,
    pub forum_tags: Vec<String>,
    pub is_pinned: bool,
    pub is_locked: bool,
    pub posts: Vec<ParsedPost>,
    pub pagination: Pagination,
}

/// A thread row on a forum listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumThreadInfo {
    pub title: String,
    pub url: String,
    pub author: String,
    pub reply_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ForumListing {
    pub threads: Vec<ForumThreadInfo>,
    pub has_next: bool,
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> String {
    scope.select(selector).next().map(text_of).unwrap_or_default()
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

pub fn parse_thread_page(html: &str) -> ThreadPage {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let title = Some(first_text(root, &THREAD_TITLE)).filter(|t| !t.is_empty());

    let mut page = ThreadPage {
        title,
        author: first_text(root, &THREAD_AUTHOR),
        category: first_text(root, &BREADCRUMB),
        is_pinned: document.select(&STICKY).next().is_some(),
        is_locked: document.select(&LOCKED).next().is_some(),
        pagination: pagination(&document),
        ..ThreadPage::default()
    };

    for pairs in document.select(&PAIRS) {
        let label = first_text(pairs, &DT);
        let value = parse_count(&first_text(pairs, &DD));
        match label.as_str() {
            "Views" => page.view_count = value,
            "Replies" => page.reply_count = value,
            _ => {}
        }
    }

    for img in document.select(&MESSAGE_IMAGE) {
        if let Some(src) = img.value().attr("src")
            && is_content_image(src)
            && !page.thumbnails.iter().any(|t| t == src)
        {
            page.thumbnails.push(src.to_string());
        }
    }

    page.forum_tags = document
        .select(&TAG_LIST)
        .map(text_of)
        .filter(|tag| !tag.is_empty())
        .collect();

    page.posts = document.select(&POST).map(parse_post).collect();
    page
}

/// Smilies, avatars and inline data URIs are never thumbnails.
fn is_content_image(src: &str) -> bool {
    !src.is_empty() && !src.contains("/smilies/") && !src.contains("/avatars/") && !src.starts_with("data:image")
}

fn parse_post(post: ElementRef<'_>) -> ParsedPost {
    let external_id = post
        .value()
        .attr("data-content")
        .or_else(|| post.value().attr("id"))
        .map(|id| id.trim_start_matches("js-").trim_start_matches("post-").to_string())
        .unwrap_or_default();

    let body = post.select(&POST_BODY).next();
    let content_html = body.map(|b| b.inner_html()).unwrap_or_default();
    let plain_text = body.map(text_of).unwrap_or_default();

    let posted_at = post
        .select(&POSTED_AT)
        .next()
        .and_then(|time| time.value().attr("datetime"))
        .and_then(parse_forum_time);

    let mut attachments = Vec::new();
    for attachment in post.select(&ATTACHMENT) {
        if let Some(img) = attachment.select(&IMG).next()
            && let Some(src) = img.value().attr("src")
        {
            attachments.push(Attachment {
                kind: "image".to_string(),
                url: src.to_string(),
                thumbnail_url: img.value().attr("data-thumbnail").map(str::to_string),
            });
        }
    }
    if let Some(body) = body {
        for img in body.select(&IMG) {
            let Some(src) = img.value().attr("src") else {
                continue;
            };
            let attachment = match img.value().attr("data-url") {
                Some(full) => Attachment {
                    kind: "image".to_string(),
                    url: full.to_string(),
                    thumbnail_url: Some(src.to_string()),
                },
                None => Attachment {
                    kind: "image".to_string(),
                    url: src.to_string(),
                    thumbnail_url: None,
                },
            };
            attachments.push(attachment);
        }
    }

    ParsedPost {
        external_id,
        author: first_text(post, &POST_AUTHOR),
        content_html,
        plain_text,
        like_count: parse_count(&first_text(post, &REACTIONS)),
        posted_at,
        attachments,
    }
}

/// XenForo renders RFC 3339, sometimes without the colon in the offset.
fn parse_forum_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|t| t.and_utc())
        })
}

fn pagination(document: &Html) -> Pagination {
    let next_enabled = document
        .select(&NEXT_BUTTON)
        .next()
        .is_some_and(|button| !has_class(button, "is-disabled"));
    let max_page = document
        .select(&PAGE_NUMBER)
        .filter_map(|page| text_of(page).parse::<u32>().ok())
        .max();
    Pagination { next_enabled, max_page }
}

/// Thread rows of a forum listing page. Relative links are resolved against `page_url`.
pub fn parse_forum_page(html: &str, page_url: &str) -> ForumListing {
    let document = Html::parse_document(html);
    let base = reqwest::Url::parse(page_url).ok();

    let threads: Vec<ForumThreadInfo> = document
        .select(&LISTING_THREAD)
        .filter_map(|item| {
            let link = item
                .select(&LISTING_PRIMARY_LINK)
                .next()
                .or_else(|| item.select(&LISTING_ANY_LINK).last())?;
            let href = link.value().attr("href")?;
            let url = match &base {
                Some(base) => base.join(href).ok()?.to_string(),
                None => href.to_string(),
            };
            Some(ForumThreadInfo {
                title: text_of(link),
                url,
                author: first_text(item, &LISTING_AUTHOR),
                reply_count: parse_count(&first_text(item, &LISTING_REPLIES)),
            })
        })
        .collect();

    let has_next = !threads.is_empty() && document.select(&NEXT_BUTTON).next().is_some();
    ForumListing { threads, has_next }
}
