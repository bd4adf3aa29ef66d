//! Text heuristics applied to scraped titles and post bodies.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

/// Title tokens recognized as tags.
pub const KNOWN_TAGS: &[&str] = &[
    "XXX",
    "OnlyFans",
    "BBW",
    "T H I C C",
    "MILF",
    "Petite",
    "Teen",
    "Asian",
    "Indian",
    "Ebony",
    "Latina",
    "Feet",
    "Retired",
];

/// Words that show up in bracketed title fragments but never name a performer.
const COMMON_TERMS: &[&str] = &["NEW", "HD", "4K", "LEAKED", "EXCLUSIVE", "UPDATED", "MEGA", "PACK"];

const STUDIO_INDICATORS: &[&str] = &["official", "network", "productions", "studios", "entertainment"];

lazy_static! {
    static ref TAG_PATTERNS: Vec<(&'static str, Regex)> = KNOWN_TAGS
        .iter()
        .map(|tag| {
            let t = regex::escape(tag);
            let pattern = format!(r"(?i)\[\s*{t}\s*\]|\(\s*{t}\s*\)|\{{\s*{t}\s*\}}|【\s*{t}\s*】|\b{t}\b");
            (*tag, Regex::new(&pattern).unwrap())
        })
        .collect();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref TRAILING_SEPARATOR: Regex = Regex::new(r"\s*[-|]\s*$").unwrap();
    static ref LEADING_SEPARATOR: Regex = Regex::new(r"^\s*[-|]\s*").unwrap();
    static ref BRACKETED: Regex = Regex::new(r"\[(.*?)\]").unwrap();
    static ref AKA: Regex = Regex::new(r"(?i)\(aka\s+(.*?)\)").unwrap();
    static ref LEADING_NUMBER: Regex = Regex::new(r"^(\d+(?:\.\d+)?)\s*([kKmM])?\b").unwrap();

    /// Download providers, in reporting order.
    static ref PROVIDERS: Vec<(&'static str, Regex)> = vec![
        ("gofile", Regex::new(r"https?://(?:www\.)?gofile\.io/d/[a-zA-Z0-9_-]+").unwrap()),
        ("pixeldrain", Regex::new(r"https?://(?:www\.)?pixeldrain\.com/(?:u|l)/[a-zA-Z0-9_-]+").unwrap()),
        ("bunkr", Regex::new(r"https?://(?:www\.)?(?:bunkr|bunkrr)\.[a-z]+/[a-z]/[a-zA-Z0-9_-]+").unwrap()),
        ("cyberdrop", Regex::new(r"https?://(?:www\.)?cyberdrop\.(?:me|to|cc)/a/[a-zA-Z0-9_-]+").unwrap()),
        ("mediafire", Regex::new(r"https?://(?:www\.)?mediafire\.com/(?:file|folder)/[a-zA-Z0-9_/-]+").unwrap()),
        ("mega", Regex::new(r"https?://(?:www\.)?mega\.nz/(?:file|folder)/[a-zA-Z0-9#_-]+").unwrap()),
    ];
}

/// A provider URL found in post content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    pub provider: &'static str,
    pub url: String,
}

pub fn provider_names() -> Vec<&'static str> {
    PROVIDERS.iter().map(|(name, _)| *name).collect()
}

/// Every provider link in `content`, in order of appearance, without duplicates.
pub fn extract_download_links(content: &str) -> Vec<ExtractedLink> {
    let mut found: Vec<(usize, ExtractedLink)> = PROVIDERS
        .iter()
        .flat_map(|(provider, re)| {
            let provider = *provider;
            re.find_iter(content).map(move |m| {
                (
                    m.start(),
                    ExtractedLink {
                        provider,
                        url: m.as_str().to_string(),
                    },
                )
            })
        })
        .collect();
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .map(|(_, link)| link)
        .filter(|link| seen.insert(link.url.clone()))
        .collect()
}

/// Known tags present in `title`, case-insensitive, in `KNOWN_TAGS` order.
pub fn extract_tags_from_title(title: &str) -> Vec<String> {
    TAG_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(title))
        .map(|(tag, _)| tag.to_string())
        .collect()
}

/// Remove recognized tags, collapse whitespace and drop dangling separators.
pub fn clean_title(title: &str) -> String {
    let mut cleaned = title.to_string();
    for (_, re) in TAG_PATTERNS.iter() {
        cleaned = re.replace_all(&cleaned, " ").into_owned();
    }
    let cleaned = WHITESPACE.replace_all(&cleaned, " ");
    let cleaned = TRAILING_SEPARATOR.replace(&cleaned, "");
    let cleaned = LEADING_SEPARATOR.replace(&cleaned, "");
    cleaned.trim().to_string()
}

pub fn is_common_term(term: &str) -> bool {
    let upper = term.trim().to_uppercase();
    COMMON_TERMS.contains(&upper.as_str())
}

/// Performer-name candidates from a cleaned title: the text before ` - `,
/// bracketed tokens, the text before ` | `, then `(aka ...)` captures.
pub fn performer_names(cleaned_title: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    if let Some((before, _)) = cleaned_title.split_once(" - ") {
        candidates.push(before.trim().trim_matches(|c| c == '[' || c == ']').to_string());
    }
    candidates.extend(BRACKETED.captures_iter(cleaned_title).map(|c| c[1].to_string()));
    if let Some((before, _)) = cleaned_title.split_once(" | ") {
        candidates.push(before.to_string());
    }
    candidates.extend(AKA.captures_iter(cleaned_title).map(|c| c[1].to_string()));

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && !is_common_term(name))
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect()
}

/// Studio-name candidates: a word carrying a studio indicator plus the word before it.
pub fn studio_names(title: &str) -> Vec<String> {
    let words: Vec<&str> = title.split_whitespace().collect();
    let mut studios: Vec<String> = Vec::new();

    for (i, word) in words.iter().enumerate() {
        let lower = word.to_lowercase();
        if !STUDIO_INDICATORS.iter().any(|ind| lower.contains(ind)) {
            continue;
        }
        let name = match i {
            0 => word.to_string(),
            _ => format!("{} {}", words[i - 1], word),
        };
        let name = name.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ').to_string();
        if !name.is_empty() && !studios.contains(&name) {
            studios.push(name);
        }
    }
    studios
}

/// Thread URL without trailing `/`, `/unread` or `/latest`.
pub fn normalize_thread_url(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/');
    for suffix in ["/unread", "/latest"] {
        if let Some(stripped) = url.strip_suffix(suffix) {
            url = stripped;
        }
    }
    url.trim_end_matches('/').to_string()
}

/// Forum-side identifier: the part after the last `.` of the final path
/// segment (`threads/some-title.100` gives `100`).
pub fn thread_external_id(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let id = segment.rsplit('.').next().unwrap_or(segment);
    (!id.is_empty()).then(|| id.to_string())
}

/// URL of page `page` of a thread or forum listing.
pub fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        base.to_string()
    } else {
        format!("{}/page-{}", base.trim_end_matches('/'), page)
    }
}

/// Leading count in text like `1,234`, `12 replies` or `3.4K`; zero when absent.
pub fn parse_count(text: &str) -> i64 {
    let compact = text.trim().replace(',', "");
    let Some(caps) = LEADING_NUMBER.captures(&compact) else {
        return 0;
    };
    let value: f64 = caps[1].parse().unwrap_or(0.0);
    let scale = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("K") => 1_000.0,
        Some("m") | Some("M") => 1_000_000.0,
        _ => 1.0,
    };
    (value * scale).round() as i64
}
