//! Configuration management for newswatch.
//!
//! Handles loading, saving, and validating configuration from
//! platform-specific config directories. Secrets are read from the
//! environment and take precedence over the file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application name used for config directory.
const APP_NAME: &str = "newswatch";

/// Default config filename.
const CONFIG_FILENAME: &str = "config.toml";

/// Upper bound for `state.keep_records_days` (about a century).
const MAX_KEEP_RECORDS_DAYS: u32 = 36_500;

/// Upper bound for `monitoring.run_timeout_seconds` (one day).
const MAX_RUN_TIMEOUT_SECONDS: u64 = 86_400;

/// Placeholder value for unconfigured API keys.
const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY_HERE";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target site and keyword settings.
    pub site: SiteConfig,

    /// Login settings.
    pub auth: AuthConfig,

    /// Page fetching settings.
    pub scraping: ScrapingConfig,

    /// Email notification settings.
    pub email: EmailConfig,

    /// Title translation settings.
    pub translation: TranslationConfig,

    /// Cross-run state settings.
    pub state: StateConfig,

    /// Run scheduling settings.
    pub monitoring: MonitoringConfig,

    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Target site configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Listing page URL (page 1).
    pub url: String,

    /// Login page URL. Falls back to `url` when empty.
    pub login_url: String,

    /// Template for listing pages after the first. `{base}` and `{n}` are substituted.
    pub page_url_template: String,

    /// Ordinary keywords.
    pub keywords: Vec<String>,

    /// Keywords whose match triggers an immediate notification.
    pub urgent_keywords: Vec<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            url: "https://gomuhouchi.com/".to_string(),
            login_url: String::new(),
            page_url_template: "{base}/page/{n}".to_string(),
            keywords: Vec::new(),
            urgent_keywords: Vec::new(),
        }
    }
}

impl SiteConfig {
    /// Returns the URL of listing page `n` (1-based).
    pub fn page_url(&self, n: u32) -> String {
        let base = self.url.trim_end_matches('/');
        if n <= 1 {
            return self.url.clone();
        }
        self.page_url_template
            .replace("{base}", base)
            .replace("{n}", &n.to_string())
    }

    /// Returns the effective login URL.
    pub fn login_url(&self) -> &str {
        if self.login_url.is_empty() {
            &self.url
        } else {
            &self.login_url
        }
    }
}

/// How the session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Post the login form with email and password.
    #[default]
    Form,
    /// Load a Netscape cookie file exported from a browser.
    CookieFile,
}

/// Login configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether to log in at all.
    pub enabled: bool,

    /// Login method.
    pub method: AuthMethod,

    /// Login email (overridden by `NEWSWATCH_LOGIN_EMAIL`).
    pub email: String,

    /// Login password (overridden by `NEWSWATCH_LOGIN_PASSWORD`).
    pub password: String,

    /// Cookie file for `method = "cookie_file"`.
    pub cookie_file: Option<PathBuf>,

    /// Form field carrying the user name.
    pub email_field: String,

    /// Form field carrying the password.
    pub password_field: String,

    /// Substring of the page HTML that proves we are logged in.
    pub logged_in_marker: String,

    /// How long a session is trusted before logging in again.
    pub session_lifetime_hours: u64,

    /// Scrape public pages anonymously when login fails.
    pub continue_on_failure: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: AuthMethod::Form,
            email: String::new(),
            password: String::new(),
            cookie_file: None,
            email_field: "swpm_user_name".to_string(),
            password_field: "swpm_password".to_string(),
            logged_in_marker: "logout".to_string(),
            session_lifetime_hours: 24,
            continue_on_failure: false,
        }
    }
}

impl AuthConfig {
    /// Checks if form credentials are present.
    pub fn has_credentials(&self) -> bool {
        !self.email.is_empty() && !self.password.is_empty()
    }
}

/// Page fetching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    /// Maximum attempts per page, including the first.
    pub max_retries: u32,

    /// Per-request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Minimum randomized delay before each request, in seconds.
    pub delay_between_requests_min: f64,

    /// Maximum randomized delay before each request, in seconds.
    pub delay_between_requests_max: f64,

    /// Upper bound on listing pages per run.
    pub max_pages_to_scrape: u32,

    /// Concurrent fetch workers.
    pub workers: usize,

    /// Pick a different user agent for each attempt.
    pub user_agent_rotation: bool,

    /// User agents to rotate through. The first is used when rotation is off.
    pub user_agents: Vec<String>,

    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Cap on a single retry delay in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Backoff multiplier applied after an HTTP 429.
    pub rate_limit_multiplier: u32,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout_seconds: 30,
            delay_between_requests_min: 1.0,
            delay_between_requests_max: 3.0,
            max_pages_to_scrape: 5,
            workers: 2,
            user_agent_rotation: true,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
            ],
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            rate_limit_multiplier: 4,
        }
    }
}

/// Email notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// SMTP relay host (overridden by `NEWSWATCH_SMTP_SERVER`).
    pub smtp_server: String,

    /// SMTP port (overridden by `NEWSWATCH_SMTP_PORT`).
    pub smtp_port: u16,

    /// Use STARTTLS.
    pub use_tls: bool,

    /// Sender address and SMTP user (overridden by `NEWSWATCH_EMAIL_FROM`).
    pub from: String,

    /// SMTP password (overridden by `NEWSWATCH_EMAIL_PASSWORD`).
    pub password: String,

    /// Recipients (overridden by comma-separated `NEWSWATCH_EMAIL_TO`).
    pub recipients: Vec<String>,

    /// Prefix for every subject line.
    pub subject_prefix: String,

    /// Cap on articles in one batch message.
    pub max_articles_per_email: usize,

    /// Batch normal articles. When off, each gets its own message.
    pub batch_notifications: bool,

    /// Fetch each new article's page and include its body in the message.
    pub include_full_content: bool,

    /// Send an alert email after repeated failed runs (daemon mode).
    pub send_error_notifications: bool,

    /// Consecutive failed runs before the alert is sent.
    pub error_notification_threshold: u32,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            use_tls: true,
            from: String::new(),
            password: String::new(),
            recipients: Vec::new(),
            subject_prefix: "[newswatch]".to_string(),
            max_articles_per_email: 10,
            batch_notifications: true,
            include_full_content: false,
            send_error_notifications: true,
            error_notification_threshold: 3,
        }
    }
}

/// API configuration for the OpenAI-compatible translation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API key (overridden by `NEWSWATCH_TRANSLATION_API_KEY`).
    pub key: String,

    /// Base URL for the API.
    pub base_url: String,

    /// Model identifier.
    pub model: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: API_KEY_PLACEHOLDER.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl ApiConfig {
    /// Checks if the API key is configured (not placeholder).
    pub fn is_configured(&self) -> bool {
        !self.key.is_empty() && self.key != API_KEY_PLACEHOLDER
    }
}

/// Title translation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Translate titles at all.
    pub enabled: bool,

    /// Memoize successful translations across runs.
    pub cache_enabled: bool,

    /// Show the source title in place of a failed translation.
    pub fallback_on_error: bool,

    /// Source language code.
    pub source_lang: String,

    /// Target language code.
    pub target_lang: String,

    /// Minimum spacing between translator calls, in milliseconds.
    pub min_request_interval_ms: u64,

    /// Translation API endpoint.
    pub api: ApiConfig,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_enabled: true,
            fallback_on_error: true,
            source_lang: "ja".to_string(),
            target_lang: "ko".to_string(),
            min_request_interval_ms: 500,
            api: ApiConfig::default(),
        }
    }
}

/// Cross-run state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Snapshot file carrying dedup and translation state between runs.
    pub snapshot_path: PathBuf,

    /// Append-only JSON-lines file of closed run logs.
    pub run_log_path: PathBuf,

    /// Retention horizon for dedup entries and run logs, in days.
    pub keep_records_days: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("data/state.json"),
            run_log_path: PathBuf::from("data/runs.jsonl"),
            keep_records_days: 90,
        }
    }
}

/// Run scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Wall-clock budget for one run, in seconds.
    pub run_timeout_seconds: u64,

    /// Pause between runs in daemon mode, in minutes.
    pub check_interval_minutes: u64,

    /// Daemon gives up after this many consecutive non-success runs.
    pub max_consecutive_errors: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            run_timeout_seconds: 600,
            check_interval_minutes: 60,
            max_consecutive_errors: 5,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Returns the platform-specific config directory path.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Returns the full path to the config file.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILENAME))
    }

    /// Loads configuration from the default location.
    ///
    /// If the config file doesn't exist, creates a default one.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path, then applies environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Saves configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overrides secrets and endpoints from the environment.
    ///
    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NEWSWATCH_LOGIN_EMAIL") {
            self.auth.email = v;
        }
        if let Some(v) = lookup("NEWSWATCH_LOGIN_PASSWORD") {
            self.auth.password = v;
        }
        if let Some(v) = lookup("NEWSWATCH_SMTP_SERVER") {
            self.email.smtp_server = v;
        }
        if let Some(v) = lookup("NEWSWATCH_SMTP_PORT") {
            self.email.smtp_port = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "NEWSWATCH_SMTP_PORT".to_string(),
                message: format!("'{}' is not a port number", v),
            })?;
        }
        if let Some(v) = lookup("NEWSWATCH_EMAIL_FROM") {
            self.email.from = v;
        }
        if let Some(v) = lookup("NEWSWATCH_EMAIL_PASSWORD") {
            self.email.password = v;
        }
        if let Some(v) = lookup("NEWSWATCH_EMAIL_TO") {
            self.email.recipients = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("NEWSWATCH_TRANSLATION_API_KEY") {
            self.translation.api.key = v;
        }
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.site.url.trim().is_empty() {
            return Err(ConfigError::MissingValue("site.url".to_string()));
        }

        if self.site.keywords.is_empty() && self.site.urgent_keywords.is_empty() {
            return Err(ConfigError::MissingValue(
                "site.keywords (configure at least one keyword)".to_string(),
            ));
        }

        let s = &self.scraping;
        if !s.delay_between_requests_min.is_finite() || !s.delay_between_requests_max.is_finite() {
            return Err(invalid(
                "scraping.delay_between_requests_min/max",
                "must be finite numbers of seconds",
            ));
        }
        if s.delay_between_requests_min < 0.0
            || s.delay_between_requests_min > s.delay_between_requests_max
        {
            return Err(invalid(
                "scraping.delay_between_requests_min",
                "must be non-negative and not exceed delay_between_requests_max",
            ));
        }
        if s.max_pages_to_scrape == 0 {
            return Err(invalid("scraping.max_pages_to_scrape", "must be greater than 0"));
        }
        if s.workers == 0 {
            return Err(invalid("scraping.workers", "must be greater than 0"));
        }
        if s.max_retries == 0 {
            return Err(invalid("scraping.max_retries", "must be greater than 0"));
        }
        if self.email.max_articles_per_email == 0 {
            return Err(invalid("email.max_articles_per_email", "must be greater than 0"));
        }
        if self.state.keep_records_days == 0 || self.state.keep_records_days > MAX_KEEP_RECORDS_DAYS
        {
            return Err(invalid(
                "state.keep_records_days",
                &format!("must be between 1 and {}", MAX_KEEP_RECORDS_DAYS),
            ));
        }
        let m = &self.monitoring;
        if m.run_timeout_seconds == 0 || m.run_timeout_seconds > MAX_RUN_TIMEOUT_SECONDS {
            return Err(invalid(
                "monitoring.run_timeout_seconds",
                &format!("must be between 1 and {}", MAX_RUN_TIMEOUT_SECONDS),
            ));
        }
        if self.auth.enabled
            && self.auth.method == AuthMethod::CookieFile
            && self.auth.cookie_file.is_none()
        {
            return Err(ConfigError::MissingValue(
                "auth.cookie_file (required when auth.method = \"cookie_file\")".to_string(),
            ));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
