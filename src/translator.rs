//! Title translation through an OpenAI-compatible chat API, with a cache.
//!
//! [`TranslationCache`] never fails: a translator error degrades to
//! [`Translation::Fallback`] carrying the source text, and is not cached so a
//! later run can try again. Cached entries carry the time they were last used
//! and are dropped on load once they fall outside the retention horizon.

use crate::config::{ApiConfig, TranslationConfig};
use crate::error::TranslationError;
use crate::utils::{check_response_status, retention_horizon};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Refusal phrases that indicate the model declined to translate.
static REFUSAL_PHRASES: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "i'm sorry",
        "i cannot",
        "i am unable",
        "as an ai",
        "my apologies",
        "i am not programmed",
        "i do not have the ability",
    ]
});

/// Human-readable names for the language codes we expect in config.
fn language_name(code: &str) -> &str {
    match code {
        "ja" => "Japanese",
        "ko" => "Korean",
        "en" => "English",
        "zh" => "Chinese",
        other => other,
    }
}

/// The translation collaborator.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslationError>;
}

/// A message in the chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// [`Translator`] for OpenAI-compatible `/chat/completions` endpoints.
pub struct ChatTranslator {
    client: Client,
    api: ApiConfig,
}

impl ChatTranslator {
    pub fn new(api: ApiConfig, timeout: Duration) -> Result<Self, TranslationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, api })
    }

    fn system_prompt(source_lang: &str, target_lang: &str) -> String {
        format!(
            "You translate news headlines from {} to {}. \
             Reply with the translated headline only, without quotes or commentary. \
             Keep company and product names recognisable.",
            language_name(source_lang),
            language_name(target_lang)
        )
    }
}

#[async_trait]
impl Translator for ChatTranslator {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslationError> {
        if !self.api.is_configured() {
            return Err(TranslationError::Unavailable(
                "translation API key is not configured".to_string(),
            ));
        }

        let request = ChatRequest {
            model: self.api.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Self::system_prompt(source_lang, target_lang),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            temperature: 0.2,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.api.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api.key))
            .json(&request)
            .send()
            .await?;
        let response = check_response_status(response).await?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::ParseError(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .find_map(|c| c.message.and_then(|m| m.content))
            .unwrap_or_default();

        validate_translation(&content)
    }
}

/// Rejects empty output and model refusals.
fn validate_translation(content: &str) -> Result<String, TranslationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(TranslationError::Refused("Empty response".to_string()));
    }

    let lower = trimmed.to_lowercase();
    for phrase in REFUSAL_PHRASES.iter() {
        if lower.starts_with(phrase) {
            return Err(TranslationError::Refused(format!(
                "Response starts with refusal phrase: {}",
                phrase
            )));
        }
    }

    Ok(trimmed.to_string())
}

/// Outcome of a cached translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    /// Translated text (fresh or from cache).
    Translated(String),
    /// Translation failed; carries the untranslated source text.
    Fallback(String),
}

impl Translation {
    pub fn text(&self) -> &str {
        match self {
            Translation::Translated(t) | Translation::Fallback(t) => t,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Translation::Fallback(_))
    }
}

/// A cached translation and when it was last served or stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredTranslation")]
pub struct CachedTranslation {
    pub text: String,
    pub cached_at: DateTime<Utc>,
}

impl CachedTranslation {
    pub fn new(text: impl Into<String>, cached_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            cached_at,
        }
    }
}

/// Accepted shapes of a cache entry. Bare strings carry no timestamp and are
/// treated as already expired.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTranslation {
    Entry {
        text: String,
        cached_at: DateTime<Utc>,
    },
    Bare(String),
}

impl From<StoredTranslation> for CachedTranslation {
    fn from(stored: StoredTranslation) -> Self {
        match stored {
            StoredTranslation::Entry { text, cached_at } => Self { text, cached_at },
            StoredTranslation::Bare(text) => Self {
                text,
                cached_at: DateTime::<Utc>::UNIX_EPOCH,
            },
        }
    }
}

/// Serializable cache state: source text to cached translation.
pub type TranslationState = BTreeMap<String, CachedTranslation>;

/// Drops entries last used before the retention horizon.
///
/// Returns the kept entries and the number dropped.
pub fn prune_translations(
    state: &TranslationState,
    now: DateTime<Utc>,
    keep_days: u32,
) -> (TranslationState, usize) {
    let horizon = retention_horizon(now, keep_days);
    let kept: TranslationState = state
        .iter()
        .filter(|(_, entry)| horizon.is_none_or(|h| entry.cached_at >= h))
        .map(|(source, entry)| (source.clone(), entry.clone()))
        .collect();
    let evicted = state.len() - kept.len();
    (kept, evicted)
}

/// Memoizes successful translations and spaces out translator calls.
pub struct TranslationCache {
    entries: TranslationState,
    translator: Arc<dyn Translator>,
    cache_enabled: bool,
    source_lang: String,
    target_lang: String,
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl TranslationCache {
    /// Creates a cache pre-filled with `entries` from the last snapshot.
    ///
    /// Callers prune `entries` with [`prune_translations`] first.
    pub fn load(
        entries: TranslationState,
        translator: Arc<dyn Translator>,
        config: &TranslationConfig,
    ) -> Self {
        Self {
            entries: if config.cache_enabled {
                entries
            } else {
                TranslationState::new()
            },
            translator,
            cache_enabled: config.cache_enabled,
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            min_interval: Duration::from_millis(config.min_request_interval_ms),
            last_call: None,
        }
    }

    /// Translates `text`, serving from the cache when possible.
    pub async fn translate(&mut self, text: &str) -> Translation {
        let key = text.trim();
        if key.is_empty() {
            return Translation::Translated(String::new());
        }
        if let Some(hit) = self.entries.get_mut(key) {
            debug!(text = key, "Translation cache hit");
            hit.cached_at = Utc::now();
            return Translation::Translated(hit.text.clone());
        }

        self.throttle().await;
        let result = self
            .translator
            .translate(key, &self.source_lang, &self.target_lang)
            .await;
        self.last_call = Some(Instant::now());

        match result {
            Ok(translated) => {
                if self.cache_enabled {
                    self.entries.insert(
                        key.to_string(),
                        CachedTranslation::new(translated.clone(), Utc::now()),
                    );
                }
                Translation::Translated(translated)
            }
            Err(e) => {
                warn!(text = key, error = %e, "Translation failed, using source text");
                Translation::Fallback(text.to_string())
            }
        }
    }

    async fn throttle(&self) {
        if let Some(last) = self.last_call {
            tokio::time::sleep_until(last + self.min_interval).await;
        }
    }

    /// Cached entries for the next snapshot.
    pub fn export(&self) -> TranslationState {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
