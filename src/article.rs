//! Article data carried through the pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// A keyword-matched listing entry, as produced by extraction.
///
/// Contains only what the page says; nothing run-dependent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable identifier (site-provided, or derived from the URL).
    pub id: String,
    /// Headline as published.
    pub title: String,
    /// Absolute article URL.
    pub url: String,
    /// Publication time, site-local.
    pub published_date: NaiveDateTime,
    /// First keyword that matched.
    pub matched_keyword: String,
    /// Matched an urgent keyword.
    pub is_urgent: bool,
    /// Listing excerpt, possibly empty.
    pub snippet: String,
    /// Behind the paywall.
    pub member_only: bool,
}

/// An article that survived deduplication in the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: String,
    pub title: String,
    /// Title in the target language. `None` when translation is off or failed without fallback.
    pub translated_title: Option<String>,
    /// `translated_title` holds the untranslated source title.
    pub translation_fallback: bool,
    pub url: String,
    pub published_date: NaiveDateTime,
    pub matched_keyword: String,
    pub is_urgent: bool,
    pub snippet: String,
    pub member_only: bool,
    /// Article body, when `email.include_full_content` is on and the page was readable.
    #[serde(default)]
    pub full_content: Option<String>,
    /// Set once the record's message was delivered. Never reset.
    pub notified: bool,
    pub first_seen: DateTime<Utc>,
}

impl ArticleRecord {
    /// Promotes a candidate that was not seen before.
    pub fn from_candidate(candidate: Candidate, first_seen: DateTime<Utc>) -> Self {
        Self {
            id: candidate.id,
            title: candidate.title,
            translated_title: None,
            translation_fallback: false,
            url: candidate.url,
            published_date: candidate.published_date,
            matched_keyword: candidate.matched_keyword,
            is_urgent: candidate.is_urgent,
            snippet: candidate.snippet,
            member_only: candidate.member_only,
            full_content: None,
            notified: false,
            first_seen,
        }
    }

    /// Marks the record as delivered.
    pub fn mark_notified(&mut self) {
        self.notified = true;
    }

    /// Title to display: the translation if there is one, else the source title.
    pub fn display_title(&self) -> &str {
        self.translated_title.as_deref().unwrap_or(&self.title)
    }
}
