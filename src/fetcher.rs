//! Authenticated, retrying page retrieval.
//!
//! [`SiteFetcher`] owns the run's [`Session`], classifies HTTP responses into
//! [`FetchError`] kinds, retries according to a [`RetryPolicy`] and fans
//! multi-page listings out over a small pool of workers. The HTTP layer sits
//! behind the [`Transport`] trait.

use crate::config::ScrapingConfig;
use crate::error::{AuthError, FatalReason, FetchError};
use crate::retry::{RetryPolicy, random_delay};
use crate::session::{Authenticator, Session};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::{Client, Url};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fallback user agent when none are configured.
const DEFAULT_USER_AGENT: &str = concat!("newswatch/", env!("CARGO_PKG_VERSION"));

/// A listing page to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    /// 1-based page number.
    pub page: u32,
    pub url: String,
}

/// Raw response as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
}

/// Outcome for one page of a multi-page fetch.
#[derive(Debug)]
pub struct PageResult {
    pub page: u32,
    pub url: String,
    pub result: Result<String, FetchError>,
}

/// Performs one HTTP GET with the session's cookies.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the response for any HTTP status; errors only on network failure.
    async fn get(
        &self,
        url: &str,
        session: &Session,
        user_agent: &str,
    ) -> Result<PageResponse, FetchError>;
}

/// [`Transport`] backed by reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        session: &Session,
        user_agent: &str,
    ) -> Result<PageResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Fatal {
            reason: FatalReason::InvalidUrl,
            message: format!("{}: {}", url, e),
        })?;

        let mut request = self.client.get(parsed.clone()).header(USER_AGENT, user_agent);
        if let Some(cookies) = session.cookie_header(&parsed) {
            request = request.header(COOKIE, cookies);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Transient(format!("timed out: {}", url))
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to read body: {}", e)))?;

        Ok(PageResponse { status, body })
    }
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    /// Bumped on every login so concurrent workers re-authenticate only once.
    generation: u64,
}

/// Result of a single attempt.
enum Attempt {
    Body(String),
    Unauthorized,
    Failed(FetchError),
}

/// Maps an HTTP status onto the fetch error taxonomy.
fn classify(url: &str, response: PageResponse) -> Attempt {
    match response.status {
        200..=299 => Attempt::Body(response.body),
        401 => Attempt::Unauthorized,
        403 => Attempt::Failed(FetchError::Fatal {
            reason: FatalReason::Blocked,
            message: format!("403 from {}", url),
        }),
        429 => Attempt::Failed(FetchError::RateLimited(format!("429 from {}", url))),
        408 | 500..=599 => {
            Attempt::Failed(FetchError::Transient(format!("{} from {}", response.status, url)))
        }
        status => Attempt::Failed(FetchError::Fatal {
            reason: FatalReason::Status(status),
            message: format!("{} from {}", status, url),
        }),
    }
}

fn auth_failure(err: AuthError) -> FetchError {
    FetchError::Fatal {
        reason: FatalReason::AuthRequired,
        message: err.to_string(),
    }
}

/// Page retrieval with session management, retries and a bounded worker pool.
pub struct SiteFetcher {
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    slot: Mutex<SessionSlot>,
    policy: RetryPolicy,
    user_agents: Vec<String>,
    rotate_user_agent: bool,
    ua_counter: AtomicUsize,
    delay_min: f64,
    delay_max: f64,
    workers: usize,
    continue_on_failure: bool,
    anonymous_lifetime: ChronoDuration,
}

impl SiteFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        config: &ScrapingConfig,
    ) -> Self {
        Self {
            transport,
            authenticator,
            slot: Mutex::new(SessionSlot::default()),
            policy: RetryPolicy::from_scraping(config),
            user_agents: config.user_agents.clone(),
            rotate_user_agent: config.user_agent_rotation,
            ua_counter: AtomicUsize::new(0),
            delay_min: config.delay_between_requests_min,
            delay_max: config.delay_between_requests_max,
            workers: config.workers.max(1),
            continue_on_failure: false,
            anonymous_lifetime: ChronoDuration::hours(24),
        }
    }

    /// Overrides the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Falls back to an anonymous session when login fails.
    pub fn with_continue_on_auth_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    /// Number of concurrent fetch workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drops the current session; the next fetch logs in again.
    pub async fn reset_session(&self) {
        let mut slot = self.slot.lock().await;
        slot.session = None;
    }

    /// Establishes the session now instead of on the first fetch.
    pub async fn authenticate(&self) -> Result<Session, AuthError> {
        self.ensure_session().await.map(|(session, _)| session)
    }

    async fn login(&self) -> Result<Session, AuthError> {
        match self.authenticator.login().await {
            Ok(session) => Ok(session),
            Err(e) if self.continue_on_failure => {
                warn!(error = %e, "Login failed, continuing without authentication");
                Ok(Session::anonymous(Utc::now(), self.anonymous_lifetime))
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_session(&self) -> Result<(Session, u64), AuthError> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = &slot.session {
            if !session.is_expired(Utc::now()) {
                return Ok((session.clone(), slot.generation));
            }
            info!("Session expired, logging in again");
        }

        let session = self.login().await?;
        slot.generation += 1;
        slot.session = Some(session.clone());
        Ok((session, slot.generation))
    }

    /// Replaces the session that produced a 401, unless another worker already did.
    async fn reauthenticate(&self, stale_generation: u64) -> Result<(Session, u64), AuthError> {
        let mut slot = self.slot.lock().await;
        if slot.generation != stale_generation {
            if let Some(session) = &slot.session {
                return Ok((session.clone(), slot.generation));
            }
        }

        let session = self.login().await?;
        slot.generation += 1;
        slot.session = Some(session.clone());
        Ok((session, slot.generation))
    }

    fn next_user_agent(&self) -> &str {
        if self.user_agents.is_empty() {
            return DEFAULT_USER_AGENT;
        }
        if !self.rotate_user_agent {
            return &self.user_agents[0];
        }
        let i = self.ua_counter.fetch_add(1, Ordering::Relaxed);
        &self.user_agents[i % self.user_agents.len()]
    }

    /// Fetches one page, retrying transient failures.
    ///
    /// A 401 triggers exactly one re-authentication, which does not count as an
    /// attempt. A second 401 is fatal.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let (mut session, mut generation) = self.ensure_session().await.map_err(auth_failure)?;
        let mut reauthenticated = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let user_agent = self.next_user_agent();
            let outcome = match self.transport.get(url, &session, user_agent).await {
                Ok(response) => classify(url, response),
                Err(e) => Attempt::Failed(e),
            };

            match outcome {
                Attempt::Body(body) => {
                    debug!(%url, attempt, bytes = body.len(), "Fetched");
                    return Ok(body);
                }
                Attempt::Unauthorized if !reauthenticated => {
                    warn!(%url, "Session rejected, re-authenticating");
                    reauthenticated = true;
                    attempt -= 1;
                    (session, generation) =
                        self.reauthenticate(generation).await.map_err(auth_failure)?;
                }
                Attempt::Unauthorized => {
                    return Err(FetchError::Fatal {
                        reason: FatalReason::AuthRequired,
                        message: format!("{} still requires login after re-authentication", url),
                    });
                }
                Attempt::Failed(err) if err.is_retryable() && self.policy.should_retry(attempt) => {
                    let rate_limited = matches!(err, FetchError::RateLimited(_));
                    let delay = self.policy.delay_for(attempt, rate_limited);
                    warn!(
                        %url,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Failed(err) => return Err(err),
            }
        }
    }

    /// Fetches several pages with at most `workers` requests in flight.
    ///
    /// Pages are dealt round-robin to the workers. Each worker sleeps a random
    /// delay before every request and writes only to its own result slot; the
    /// slots are merged and ordered by page number once all workers finish.
    pub async fn fetch_pages(&self, pages: Vec<PageRef>) -> Vec<PageResult> {
        if pages.is_empty() {
            return Vec::new();
        }

        let worker_count = self.workers.min(pages.len());
        let mut queues: Vec<Vec<PageRef>> = vec![Vec::new(); worker_count];
        for (i, page) in pages.into_iter().enumerate() {
            queues[i % worker_count].push(page);
        }

        let workers = queues.into_iter().enumerate().map(|(worker, queue)| async move {
            let mut slot = Vec::with_capacity(queue.len());
            for page in queue {
                random_delay(self.delay_min, self.delay_max).await;
                debug!(worker, page = page.page, url = %page.url, "Fetching page");
                let result = self.fetch(&page.url).await;
                slot.push(PageResult {
                    page: page.page,
                    url: page.url,
                    result,
                });
            }
            slot
        });

        let mut results: Vec<PageResult> = join_all(workers).await.into_iter().flatten().collect();
        results.sort_by_key(|r| r.page);
        results
    }

    /// Fetches article pages through the same worker pool, in input order.
    pub async fn fetch_articles(&self, urls: Vec<String>) -> Vec<Result<String, FetchError>> {
        let pages = urls
            .into_iter()
            .zip(1u32..)
            .map(|(url, page)| PageRef { page, url })
            .collect();
        self.fetch_pages(pages)
            .await
            .into_iter()
            .map(|r| r.result)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AnonymousAuthenticator;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    /// Serves scripted responses per URL, then 200 "ok" once the script runs out.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: StdMutex<HashMap<String, VecDeque<Result<u16, FetchError>>>>,
        user_agents: StdMutex<Vec<String>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn script(self, url: &str, steps: Vec<Result<u16, FetchError>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.to_string(), steps.into());
            self
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            url: &str,
            _session: &Session,
            user_agent: &str,
        ) -> Result<PageResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.user_agents.lock().unwrap().push(user_agent.to_string());
            let step = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|s| s.pop_front())
                .unwrap_or(Ok(200));
            step.map(|status| PageResponse {
                status,
                body: format!("body of {}", url),
            })
        }
    }

    struct CountingAuthenticator {
        logins: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn login(&self) -> Result<Session, AuthError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthError::Rejected("bad password".to_string()));
            }
            Ok(Session::anonymous(Utc::now(), ChronoDuration::hours(1)))
        }
    }

    fn config() -> ScrapingConfig {
        ScrapingConfig {
            delay_between_requests_min: 0.0,
            delay_between_requests_max: 0.0,
            user_agents: vec!["ua-1".to_string(), "ua-2".to_string()],
            ..ScrapingConfig::default()
        }
    }

    fn fetcher(transport: Arc<ScriptedTransport>, auth: Arc<dyn Authenticator>) -> SiteFetcher {
        SiteFetcher::new(transport, auth, &config()).with_policy(RetryPolicy::immediate(3))
    }

    fn counting(fail: bool) -> Arc<CountingAuthenticator> {
        Arc::new(CountingAuthenticator {
            logins: AtomicU32::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let transport = Arc::new(ScriptedTransport::default().script(
            "u",
            vec![Err(FetchError::Transient("reset".into())), Ok(503)],
        ));
        let f = fetcher(Arc::clone(&transport), Arc::new(AnonymousAuthenticator::default()));

        assert_eq!(f.fetch("u").await.unwrap(), "body of u");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let transport = Arc::new(
            ScriptedTransport::default().script("u", vec![Ok(429), Ok(429), Ok(429), Ok(429)]),
        );
        let f = fetcher(Arc::clone(&transport), Arc::new(AnonymousAuthenticator::default()));

        let err = f.fetch("u").await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::default().script("u", vec![Ok(403)]));
        let f = fetcher(Arc::clone(&transport), Arc::new(AnonymousAuthenticator::default()));

        let err = f.fetch("u").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reauthenticates_once_on_401() {
        let transport = Arc::new(ScriptedTransport::default().script("u", vec![Ok(401)]));
        let auth = counting(false);
        let f = fetcher(Arc::clone(&transport), auth.clone());

        assert!(f.fetch("u").await.is_ok());
        assert_eq!(auth.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_401_is_auth_failure() {
        let transport = Arc::new(ScriptedTransport::default().script("u", vec![Ok(401), Ok(401)]));
        let auth = counting(false);
        let f = fetcher(Arc::clone(&transport), auth.clone());

        let err = f.fetch("u").await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(auth.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_is_created_lazily_and_reused() {
        let transport = Arc::new(ScriptedTransport::default());
        let auth = counting(false);
        let f = fetcher(Arc::clone(&transport), auth.clone());
        assert_eq!(auth.logins.load(Ordering::SeqCst), 0);

        f.fetch("a").await.unwrap();
        f.fetch("b").await.unwrap();
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);

        f.reset_session().await;
        f.fetch("c").await.unwrap();
        assert_eq!(auth.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_login_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        let f = fetcher(Arc::clone(&transport), counting(true));
        assert!(f.authenticate().await.is_err());
        assert!(f.fetch("u").await.unwrap_err().is_auth_failure());

        let f = fetcher(transport, counting(true)).with_continue_on_auth_failure(true);
        let session = f.authenticate().await.unwrap();
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_user_agent_rotates_per_attempt() {
        let transport = Arc::new(ScriptedTransport::default().script("u", vec![Ok(500)]));
        let f = fetcher(Arc::clone(&transport), Arc::new(AnonymousAuthenticator::default()));
        f.fetch("u").await.unwrap();

        let seen = transport.user_agents.lock().unwrap().clone();
        assert_eq!(seen, vec!["ua-1".to_string(), "ua-2".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_pages_merges_in_page_order() {
        let transport = Arc::new(ScriptedTransport::default().script("p3", vec![Ok(404)]));
        let f = fetcher(Arc::clone(&transport), Arc::new(AnonymousAuthenticator::default()));

        let pages = (1..=5)
            .map(|n| PageRef {
                page: n,
                url: format!("p{}", n),
            })
            .collect();
        let results = f.fetch_pages(pages).await;

        let order: Vec<u32> = results.iter().map(|r| r.page).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert!(results[2].result.is_err());
        assert_eq!(results[4].result.as_deref().unwrap(), "body of p5");
    }

    #[tokio::test]
    async fn test_fetch_articles_keeps_input_order() {
        let transport = Arc::new(ScriptedTransport::default().script("b", vec![Ok(404)]));
        let f = fetcher(Arc::clone(&transport), Arc::new(AnonymousAuthenticator::default()));

        let results = f
            .fetch_articles(vec!["c".to_string(), "b".to_string(), "a".to_string()])
            .await;
        assert_eq!(results[0].as_deref().unwrap(), "body of c");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_deref().unwrap(), "body of a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_worker_waits_before_every_request() {
        let transport = Arc::new(ScriptedTransport::default());
        let config = ScrapingConfig {
            delay_between_requests_min: 2.0,
            delay_between_requests_max: 3.0,
            workers: 2,
            ..config()
        };
        let f = SiteFetcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(AnonymousAuthenticator::default()),
            &config,
        )
        .with_policy(RetryPolicy::immediate(1));

        let pages = (1..=4)
            .map(|n| PageRef {
                page: n,
                url: format!("p{}", n),
            })
            .collect();
        let start = tokio::time::Instant::now();
        let results = f.fetch_pages(pages).await;
        let elapsed = start.elapsed();

        assert!(results.iter().all(|r| r.result.is_ok()));
        // Two pages per worker, each preceded by at least the minimum delay.
        assert!(elapsed >= Duration::from_secs(4));
        // Workers wait side by side: at most two maximum delays, not four.
        assert!(elapsed <= Duration::from_millis(6_010));
    }

    #[test]
    fn test_classify() {
        let resp = |status| PageResponse {
            status,
            body: String::new(),
        };
        assert!(matches!(classify("u", resp(200)), Attempt::Body(_)));
        assert!(matches!(classify("u", resp(401)), Attempt::Unauthorized));
        assert!(matches!(
            classify("u", resp(404)),
            Attempt::Failed(FetchError::Fatal {
                reason: FatalReason::Status(404),
                ..
            })
        ));
        assert!(matches!(
            classify("u", resp(502)),
            Attempt::Failed(FetchError::Transient(_))
        ));
    }
}
