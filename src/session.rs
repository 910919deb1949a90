//! Authenticated sessions and the login collaborators that create them.
//!
//! A [`Session`] is a cookie jar plus an expiry. It is owned by the
//! [`crate::fetcher::SiteFetcher`] for the duration of a run and replaced,
//! never mutated, when the site asks for a fresh login.

use crate::config::{AuthConfig, AuthMethod, Config};
use crate::cookies::load_cookie_file;
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

/// Submit button name expected by the membership plugin's login form.
const SUBMIT_FIELD: &str = "swpm-login";

static HIDDEN_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[type="hidden"][name]"#).unwrap());

/// An authenticated (or anonymous) cookie session with an expiry.
#[derive(Clone)]
pub struct Session {
    jar: Arc<Jar>,
    expires_at: DateTime<Utc>,
    authenticated: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("expires_at", &self.expires_at)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(jar: Arc<Jar>, expires_at: DateTime<Utc>, authenticated: bool) -> Self {
        Self {
            jar,
            expires_at,
            authenticated,
        }
    }

    /// A session without credentials, for public pages.
    pub fn anonymous(now: DateTime<Utc>, lifetime: Duration) -> Self {
        Self::new(Arc::new(Jar::default()), now + lifetime, false)
    }

    /// Returns true once `now` has reached the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn cookie_header(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}

/// The login collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Establishes a new session.
    async fn login(&self) -> Result<Session, AuthError>;
}

/// Authenticator used when login is disabled.
#[derive(Debug, Clone)]
pub struct AnonymousAuthenticator {
    lifetime: Duration,
}

impl AnonymousAuthenticator {
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }
}

impl Default for AnonymousAuthenticator {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn login(&self) -> Result<Session, AuthError> {
        Ok(Session::anonymous(Utc::now(), self.lifetime))
    }
}

/// Logs in by posting the site's login form.
pub struct FormAuthenticator {
    site_url: String,
    login_url: String,
    auth: AuthConfig,
    user_agent: String,
    timeout: std::time::Duration,
}

impl FormAuthenticator {
    pub fn new(config: &Config) -> Self {
        Self {
            site_url: config.site.url.clone(),
            login_url: config.site.login_url().to_string(),
            auth: config.auth.clone(),
            user_agent: config
                .scraping
                .user_agents
                .first()
                .cloned()
                .unwrap_or_default(),
            timeout: std::time::Duration::from_secs(config.scraping.request_timeout_seconds),
        }
    }
}

#[async_trait]
impl Authenticator for FormAuthenticator {
    async fn login(&self) -> Result<Session, AuthError> {
        if !self.auth.has_credentials() {
            return Err(AuthError::MissingCredentials(
                "set NEWSWATCH_LOGIN_EMAIL and NEWSWATCH_LOGIN_PASSWORD".to_string(),
            ));
        }

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .build()?;

        debug!(url = %self.login_url, "Fetching login form");
        let login_page = client
            .get(&self.login_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let fields = login_form_fields(&login_page, &self.auth);
        client
            .post(&self.login_url)
            .form(&fields)
            .send()
            .await?
            .error_for_status()?;

        let landing = client
            .get(&self.site_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if !is_logged_in(&landing, &self.auth.logged_in_marker) {
            return Err(AuthError::Rejected(format!(
                "logged-in marker '{}' not found after login",
                self.auth.logged_in_marker
            )));
        }

        let expires_at = Utc::now() + Duration::hours(self.auth.session_lifetime_hours as i64);
        info!(%expires_at, "Logged in");
        Ok(Session::new(jar, expires_at, true))
    }
}

/// Reuses a browser login exported as a Netscape cookie file.
pub struct CookieFileAuthenticator {
    path: PathBuf,
    site_host: String,
    lifetime: Duration,
}

impl CookieFileAuthenticator {
    pub fn new(path: PathBuf, site_host: String, lifetime: Duration) -> Self {
        Self {
            path,
            site_host,
            lifetime,
        }
    }
}

#[async_trait]
impl Authenticator for CookieFileAuthenticator {
    async fn login(&self) -> Result<Session, AuthError> {
        let loaded = load_cookie_file(&self.path, &self.site_host)
            .map_err(|e| AuthError::CookieFile(e.to_string()))?;

        let now = Utc::now();
        let mut expires_at = now + self.lifetime;
        if let Some(cookie_expiry) = loaded
            .earliest_expiry
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        {
            if cookie_expiry <= now {
                return Err(AuthError::CookieFile(format!(
                    "cookies in {} expired at {}",
                    self.path.display(),
                    cookie_expiry
                )));
            }
            expires_at = expires_at.min(cookie_expiry);
        }

        info!(cookies = loaded.count, %expires_at, "Loaded session cookies");
        Ok(Session::new(loaded.jar, expires_at, true))
    }
}

/// Picks the authenticator the configuration asks for.
pub fn build_authenticator(config: &Config) -> Result<Arc<dyn Authenticator>, AuthError> {
    let lifetime = Duration::hours(config.auth.session_lifetime_hours as i64);
    if !config.auth.enabled {
        return Ok(Arc::new(AnonymousAuthenticator::new(lifetime)));
    }

    match config.auth.method {
        AuthMethod::Form => Ok(Arc::new(FormAuthenticator::new(config))),
        AuthMethod::CookieFile => {
            let path = config.auth.cookie_file.clone().ok_or_else(|| {
                AuthError::CookieFile("auth.cookie_file is not set".to_string())
            })?;
            let host = Url::parse(&config.site.url)
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .ok_or_else(|| {
                    AuthError::CookieFile(format!("site url has no host: {}", config.site.url))
                })?;
            Ok(Arc::new(CookieFileAuthenticator::new(path, host, lifetime)))
        }
    }
}

/// Builds the login form body: hidden inputs from the page plus credentials.
fn login_form_fields(login_page: &str, auth: &AuthConfig) -> Vec<(String, String)> {
    let document = Html::parse_document(login_page);
    let mut fields: Vec<(String, String)> = document
        .select(&HIDDEN_INPUT)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .filter(|(name, _)| name != &auth.email_field && name != &auth.password_field)
        .collect();

    fields.push((auth.email_field.clone(), auth.email.clone()));
    fields.push((auth.password_field.clone(), auth.password.clone()));
    fields.push((SUBMIT_FIELD.to_string(), "Login".to_string()));
    fields
}

/// Returns true if the page carries the logged-in marker (case-insensitive).
fn is_logged_in(html: &str, marker: &str) -> bool {
    !marker.is_empty() && html.to_lowercase().contains(&marker.to_lowercase())
}
