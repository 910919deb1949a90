//! Error types for the newswatch pipeline.
//!
//! Uses `thiserror` for structured error definitions, one enum per concern.
//! Whether an error is fatal for a run is decided by the variant, never by
//! inspecting the message.

use thiserror::Error;

/// Why a fetch was given up on without retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The site still demands a login after one re-authentication.
    AuthRequired,
    /// The site is actively refusing us (e.g. HTTP 403 without a login prompt).
    Blocked,
    /// Any other non-retryable HTTP status.
    Status(u16),
    /// The page URL cannot be requested at all.
    InvalidUrl,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalReason::AuthRequired => write!(f, "authentication required"),
            FatalReason::Blocked => write!(f, "blocked by site"),
            FatalReason::Status(code) => write!(f, "HTTP {}", code),
            FatalReason::InvalidUrl => write!(f, "invalid URL"),
        }
    }
}

/// Error type for page retrieval.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure or timeout; worth retrying.
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// Server returned 429; retry with a longer backoff.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Do not retry; surface to the orchestrator.
    #[error("Fatal fetch failure ({reason}): {message}")]
    Fatal { reason: FatalReason, message: String },
}

impl FetchError {
    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Fatal { .. })
    }

    /// Returns true if the session is unusable even after re-authenticating.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            FetchError::Fatal {
                reason: FatalReason::AuthRequired,
                ..
            }
        )
    }
}

/// Error type for the Auth collaborator.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Login credentials are not configured.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// The site rejected the credentials, or the logged-in marker never appeared.
    #[error("Login rejected: {0}")]
    Rejected(String),

    /// HTTP request to the login endpoint failed.
    #[error("Login request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Failed to load a saved cookie file.
    #[error("Cookie file error: {0}")]
    CookieFile(String),
}

/// Error for a single listing entry that could not be turned into a record.
///
/// Always non-fatal: the entry is skipped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// The entry has no usable title.
    #[error("Entry has no title")]
    MissingTitle,

    /// The entry has no link, or the link cannot be resolved.
    #[error("Entry has no usable URL")]
    MissingUrl,

    /// The entry has no date, or the date is in an unknown format.
    #[error("Entry has no parseable date: {0}")]
    MissingDate(String),
}

/// Error type for the Translator collaborator.
#[derive(Error, Debug)]
pub enum TranslationError {
    /// HTTP request to API failed
    #[error("API request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error: {0}")]
    ApiError(String),

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Translation was refused by the model, or came back empty
    #[error("Translation refused: {0}")]
    Refused(String),

    /// Translation is switched off or not configured
    #[error("Translator unavailable: {0}")]
    Unavailable(String),
}

/// Error type for the Notifier collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Temporary SMTP/network failure; worth retrying.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// Bad credentials, bad address, or missing configuration.
    #[error("Fatal delivery failure: {0}")]
    Fatal(String),
}

impl DeliveryError {
    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Error type for loading or storing the cross-run state snapshot.
#[derive(Error, Debug)]
pub enum PersistError {
    /// Failed to read or write the snapshot file
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot is not valid JSON, or has the wrong shape
    #[error("Snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Snapshot was written by a newer schema than this build understands
    #[error("Unsupported snapshot version {found} (max supported {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Error type for configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Missing required configuration value
    #[error("Missing required config value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Config directory not found
    #[error("Could not determine config directory")]
    NoConfigDir,
}
