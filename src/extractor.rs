//! Listing and article page parsing.
//!
//! Turns one listing page into keyword-matched [`Candidate`]s, and an article
//! page into its body text. Extraction is a pure function of the HTML and the
//! configured keywords: no clock, no network, no state carried between pages.

use crate::article::Candidate;
use crate::config::SiteConfig;
use crate::error::ExtractionError;
use crate::utils::{collapse_whitespace, truncate_chars};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

/// Numeric date with optional time, e.g. `2025-01-02`, `2025/1/2 09:30`, `2025年1月2日`.
static DATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})\s*[-/年.]\s*(\d{1,2})\s*[-/月.]\s*(\d{1,2})\s*日?(?:\s*[T ]?\s*(\d{1,2}):(\d{2})(?::(\d{2}))?)?",
    )
    .unwrap()
});

/// WordPress-style element id, e.g. `post-1234`.
static POST_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^post-(\d+)$").unwrap());

/// Paywall markers looked for in the visible title and excerpt.
const MEMBER_TEXT_MARKERS: &[&str] = &[
    "会員限定",
    "会員専用",
    "プレミアム",
    "有料会員",
    "登録会員",
    "member-only",
    "premium",
    "subscription",
    "🔒",
];

/// Paywall markers looked for in the entry's markup.
const MEMBER_MARKUP_MARKERS: &[&str] = &[
    "member-only",
    "premium",
    "subscriber-only",
    "paywall",
    "locked",
    "&#128274;",
    "🔒",
];

const NEXT_LINK_TEXTS: &[&str] = &["次へ", "Next"];

/// Phrases on an article page that mean the body is behind a login.
const LOGIN_REQUIRED_MARKERS: &[&str] = &[
    "ログインが必要です",
    "ログインしてください",
    "会員登録が必要",
    "この記事を読むには",
    "login required",
    "sign in to read",
    "subscription required",
];

/// Shorter article bodies are teasers, not the article.
const MIN_BODY_CHARS: usize = 100;

/// Maximum snippet length in characters.
const SNIPPET_CHARS: usize = 200;

/// CSS selectors used for parsing. Within each list the first hit wins.
struct Selectors {
    containers: Vec<Selector>,
    titles: Vec<Selector>,
    link: Selector,
    dates: Vec<Selector>,
    snippets: Vec<Selector>,
    next_page: Vec<Selector>,
    anchor: Selector,
    bodies: Vec<Selector>,
    paragraph: Selector,
}

impl Selectors {
    fn new() -> Self {
        let parse_all = |list: &[&str]| -> Vec<Selector> {
            list.iter().map(|s| Selector::parse(s).unwrap()).collect()
        };
        Self {
            containers: parse_all(&[
                "article",
                ".article",
                ".post",
                ".news-item",
                ".entry",
                r#"[class*="article"]"#,
            ]),
            titles: parse_all(&["h2", "h3", ".title", ".headline", "a"]),
            link: Selector::parse("a[href]").unwrap(),
            dates: parse_all(&[".date", ".published", "time", "[datetime]"]),
            snippets: parse_all(&[".excerpt", ".summary", "p"]),
            next_page: parse_all(&["a.next", r#"a[rel="next"]"#, ".pagination .next"]),
            anchor: Selector::parse("a").unwrap(),
            bodies: parse_all(&[
                ".article-content",
                ".entry-content",
                ".post-content",
                "article .content",
                r#"[class*="content"]"#,
            ]),
            paragraph: Selector::parse("p").unwrap(),
        }
    }
}

/// Everything learned from one listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    /// Keyword-matched entries, in page order.
    pub candidates: Vec<Candidate>,
    /// Article elements found on the page.
    pub entries_seen: usize,
    /// Well-formed entries that matched no keyword.
    pub unmatched: usize,
    /// Malformed entries (missing title, URL or date).
    pub skipped: usize,
    /// The page links to a further listing page.
    pub has_next_page: bool,
}

/// A well-formed listing entry before keyword matching.
struct Entry {
    id: String,
    title: String,
    url: String,
    published_date: NaiveDateTime,
    snippet: String,
    member_only: bool,
}

/// Parses listing pages into keyword-matched candidates.
pub struct ArticleExtractor {
    base_url: Url,
    keywords: Vec<String>,
    urgent_keywords: Vec<String>,
    selectors: Selectors,
}

impl ArticleExtractor {
    pub fn new(
        base_url: &str,
        keywords: Vec<String>,
        urgent_keywords: Vec<String>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            keywords,
            urgent_keywords,
            selectors: Selectors::new(),
        })
    }

    pub fn from_config(site: &SiteConfig) -> Result<Self, url::ParseError> {
        Self::new(
            &site.url,
            site.keywords.clone(),
            site.urgent_keywords.clone(),
        )
    }

    /// Extracts candidates from one listing page.
    pub fn extract(&self, html: &str) -> PageExtraction {
        let document = Html::parse_document(html);
        let mut extraction = PageExtraction {
            has_next_page: self.has_next_page(&document),
            ..PageExtraction::default()
        };

        let Some(elements) = self
            .selectors
            .containers
            .iter()
            .map(|sel| document.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
        else {
            return extraction;
        };

        extraction.entries_seen = elements.len();
        for element in elements {
            let entry = match self.parse_entry(element) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed entry");
                    extraction.skipped += 1;
                    continue;
                }
            };

            match self.match_keyword(&entry) {
                Some((keyword, is_urgent)) => extraction.candidates.push(Candidate {
                    id: entry.id,
                    title: entry.title,
                    url: entry.url,
                    published_date: entry.published_date,
                    matched_keyword: keyword,
                    is_urgent,
                    snippet: entry.snippet,
                    member_only: entry.member_only,
                }),
                None => extraction.unmatched += 1,
            }
        }

        extraction
    }

    /// Extracts the body text of an article page.
    ///
    /// Returns `None` when the page asks for a login, or when the text found is
    /// too short to be more than a teaser.
    pub fn extract_body(&self, html: &str) -> Option<String> {
        let lowered = html.to_lowercase();
        if let Some(marker) = LOGIN_REQUIRED_MARKERS
            .iter()
            .find(|m| lowered.contains(&m.to_lowercase()))
        {
            debug!(marker, "Article body requires login");
            return None;
        }

        let document = Html::parse_document(html);
        let body = first_match(document.root_element(), &self.selectors.bodies)
            .map(|el| paragraphs(el, &self.selectors.paragraph))
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| paragraphs(document.root_element(), &self.selectors.paragraph));

        if body.chars().count() < MIN_BODY_CHARS {
            debug!(chars = body.chars().count(), "Article body too short");
            return None;
        }
        Some(body)
    }

    fn parse_entry(&self, element: ElementRef<'_>) -> Result<Entry, ExtractionError> {
        let title = first_match(element, &self.selectors.titles)
            .map(|el| collapse_whitespace(&text_of(el)))
            .filter(|t| !t.is_empty())
            .ok_or(ExtractionError::MissingTitle)?;

        let href = element
            .select(&self.selectors.link)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .find(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
            .ok_or(ExtractionError::MissingUrl)?;
        let url = self
            .base_url
            .join(href)
            .map_err(|_| ExtractionError::MissingUrl)?
            .to_string();

        let date_el = first_match(element, &self.selectors.dates)
            .ok_or_else(|| ExtractionError::MissingDate("no date element".to_string()))?;
        let raw_date = date_el
            .value()
            .attr("datetime")
            .map(str::to_string)
            .unwrap_or_else(|| collapse_whitespace(&text_of(date_el)));
        let published_date =
            parse_date(&raw_date).ok_or(ExtractionError::MissingDate(raw_date))?;

        let snippet = first_match(element, &self.selectors.snippets)
            .map(|el| truncate_chars(&collapse_whitespace(&text_of(el)), SNIPPET_CHARS))
            .unwrap_or_default();

        let member_only = is_member_only(&element.html(), &title, &snippet);

        Ok(Entry {
            id: article_id(element, &url),
            title,
            url,
            published_date,
            snippet,
            member_only,
        })
    }

    /// Urgent keywords are tried first; the first hit wins.
    fn match_keyword(&self, entry: &Entry) -> Option<(String, bool)> {
        let haystack = format!("{} {}", entry.title, entry.snippet).to_lowercase();
        let hit = |kw: &&String| !kw.is_empty() && haystack.contains(&kw.to_lowercase());

        if let Some(kw) = self.urgent_keywords.iter().find(hit) {
            return Some((kw.clone(), true));
        }
        self.keywords.iter().find(hit).map(|kw| (kw.clone(), false))
    }

    fn has_next_page(&self, document: &Html) -> bool {
        if self
            .selectors
            .next_page
            .iter()
            .any(|sel| document.select(sel).next().is_some())
        {
            return true;
        }
        document.select(&self.selectors.anchor).any(|a| {
            let text = text_of(a);
            NEXT_LINK_TEXTS.iter().any(|marker| text.contains(marker))
        })
    }
}

fn first_match<'a>(element: ElementRef<'a>, selectors: &[Selector]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|sel| element.select(sel).next())
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// Paragraph texts joined by blank lines, or the element's own text if it has none.
fn paragraphs(element: ElementRef<'_>, paragraph: &Selector) -> String {
    let texts: Vec<String> = element
        .select(paragraph)
        .map(|p| collapse_whitespace(&text_of(p)))
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        collapse_whitespace(&text_of(element))
    } else {
        texts.join("\n\n")
    }
}

/// Site-provided id if the element carries one, else a hash of the URL.
fn article_id(element: ElementRef<'_>, url: &str) -> String {
    let attrs = element.value();
    if let Some(id) = attrs.attr("data-post-id").map(str::trim).filter(|s| !s.is_empty()) {
        return format!("post-{}", id);
    }
    if let Some(id) = attrs.attr("id").filter(|id| POST_ID_REGEX.is_match(id)) {
        return id.to_string();
    }
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    digest[..32].to_string()
}

fn is_member_only(markup: &str, title: &str, snippet: &str) -> bool {
    let text = format!("{} {}", title, snippet).to_lowercase();
    if MEMBER_TEXT_MARKERS.iter().any(|m| text.contains(&m.to_lowercase())) {
        return true;
    }
    let markup = markup.to_lowercase();
    MEMBER_MARKUP_MARKERS.iter().any(|m| markup.contains(m))
}

/// Parses the date formats seen on listing pages. Returns site-local time.
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }

    let caps = DATE_REGEX.captures(raw)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?;
    date.and_hms_opt(num(4).unwrap_or(0), num(5).unwrap_or(0), num(6).unwrap_or(0))
}
