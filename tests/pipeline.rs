//! End-to-end runs of the orchestrator against in-process collaborators.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use newswatch::config::Config;
use newswatch::error::{DeliveryError, FetchError, TranslationError};
use newswatch::fetcher::{PageResponse, SiteFetcher, Transport};
use newswatch::notifier::{Message, NotificationBatcher, Notifier};
use newswatch::orchestrator::{Orchestrator, RunMode};
use newswatch::retry::RetryPolicy;
use newswatch::run_log::{RunLogWriter, RunStatus};
use newswatch::session::{AnonymousAuthenticator, Session};
use newswatch::snapshot::{MemorySnapshotStore, SnapshotStore, StateSnapshot};
use newswatch::translator::{CachedTranslation, Translator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const SITE: &str = "https://news.example/";

const PAGE_ONE: &str = r#"<html><body>
<article id="post-101">
  <h2><a href="/2025/03/new-plant">新工場の建設計画を発表</a></h2>
  <time datetime="2025-03-01T09:00:00+09:00">2025年3月1日</time>
  <p class="excerpt">タイヤ大手が新工場を建設する。</p>
</article>
<article id="post-102">
  <h2><a href="/2025/03/fire">工場で火災発生</a></h2>
  <time datetime="2025-03-01T10:00:00+09:00">2025年3月1日</time>
  <p class="excerpt">けが人なし。</p>
</article>
<article id="post-103">
  <h2><a href="/2025/03/weather">週末の天気</a></h2>
  <time datetime="2025-03-01T08:00:00+09:00">2025年3月1日</time>
  <p class="excerpt">晴れ。</p>
</article>
</body></html>"#;

const PAGE_WITH_NEXT: &str = r#"<html><body>
<article id="post-201">
  <h2><a href="/2025/04/plant">工場の稼働率が上昇</a></h2>
  <time datetime="2025-04-02T09:00:00+09:00"></time>
</article>
<div class="pagination"><a class="next" href="/page/2">次へ</a></div>
</body></html>"#;

const PAGE_TWO: &str = r#"<html><body>
<article id="post-202">
  <h2><a href="/2025/04/plant-2">第二工場の計画</a></h2>
  <time datetime="2025-04-01T09:00:00+09:00"></time>
</article>
</body></html>"#;

const ARTICLE_PAGE: &str = r#"<html><body>
<header><p>ニュースサイト</p></header>
<article><h1>新工場の建設計画を発表</h1>
<div class="entry-content">
  <p>タイヤ大手は一日、国内に新工場を建設する計画を発表した。投資額は約三百億円で、二〇二七年の稼働を目指す。</p>
  <p>新工場では電気自動車向けの高性能タイヤを生産し、年間の生産能力は約五百万本を見込む。地元での雇用も拡大する。</p>
</div></article>
</body></html>"#;

/// Serves fixed responses per URL. Unknown URLs get a 404.
#[derive(Default)]
struct FakeTransport {
    pages: Mutex<HashMap<String, (u16, String)>>,
    fallback_status: Option<u16>,
    latency: Option<Duration>,
    calls: AtomicU32,
}

impl FakeTransport {
    fn serving(pages: &[(&str, &str)]) -> Self {
        let transport = Self::default();
        {
            let mut map = transport.pages.lock().unwrap();
            for (url, body) in pages {
                map.insert(url.to_string(), (200, body.to_string()));
            }
        }
        transport
    }

    fn failing(status: u16) -> Self {
        Self {
            fallback_status: Some(status),
            ..Self::default()
        }
    }

    fn slow(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(
        &self,
        url: &str,
        _session: &Session,
        _user_agent: &str,
    ) -> Result<PageResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(status) = self.fallback_status {
            return Ok(PageResponse {
                status,
                body: String::new(),
            });
        }
        let (status, body) = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(PageResponse { status, body })
    }
}

#[derive(Default)]
struct PrefixTranslator {
    calls: AtomicU32,
}

#[async_trait]
impl Translator for PrefixTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        _target_lang: &str,
    ) -> Result<String, TranslationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("KO:{}", text))
    }
}

/// Records sent messages; fails any message whose subject contains `fail_on`.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Message>>,
    fail_on: Option<String>,
}

impl RecordingNotifier {
    fn failing_on(marker: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_on: Some(marker.to_string()),
        }
    }

    fn messages(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &Message) -> Result<(), DeliveryError> {
        if let Some(marker) = &self.fail_on {
            if message.subject.contains(marker.as_str()) {
                return Err(DeliveryError::Fatal("mailbox unavailable".to_string()));
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.site.url = SITE.to_string();
    config.site.keywords = vec!["工場".to_string()];
    config.site.urgent_keywords = vec!["火災".to_string()];
    config.auth.enabled = false;
    config.scraping.delay_between_requests_min = 0.0;
    config.scraping.delay_between_requests_max = 0.0;
    config.scraping.max_pages_to_scrape = 5;
    config.scraping.workers = 2;
    config.email.recipients = vec!["desk@example.com".to_string()];
    config.translation.enabled = true;
    config.translation.min_request_interval_ms = 0;
    config.monitoring.run_timeout_seconds = 60;
    config
}

struct Harness {
    orchestrator: Orchestrator,
    transport: Arc<FakeTransport>,
    translator: Arc<PrefixTranslator>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(
    config: Config,
    transport: FakeTransport,
    notifier: RecordingNotifier,
    store: Arc<dyn SnapshotStore>,
) -> Harness {
    let transport = Arc::new(transport);
    let translator = Arc::new(PrefixTranslator::default());
    let notifier = Arc::new(notifier);

    let fetcher = SiteFetcher::new(
        transport.clone(),
        Arc::new(AnonymousAuthenticator::default()),
        &config.scraping,
    )
    .with_policy(RetryPolicy::immediate(2));
    let batcher = NotificationBatcher::new(&config.email).with_policy(RetryPolicy::immediate(3));

    let orchestrator = Orchestrator::new(config, fetcher, notifier.clone(), store)
        .unwrap()
        .with_translator(translator.clone())
        .with_batcher(batcher);

    Harness {
        orchestrator,
        transport,
        translator,
        notifier,
    }
}

async fn saved(store: &MemorySnapshotStore) -> StateSnapshot {
    store.load().await.unwrap().expect("snapshot saved")
}

#[tokio::test]
async fn test_run_notifies_urgent_first_then_batch() {
    let store = Arc::new(MemorySnapshotStore::new());
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Success);
    assert_eq!(log.articles_found, 2);
    assert_eq!(log.new_articles, 2);
    assert_eq!(log.pages_fetched, 1);
    assert_eq!(log.messages_sent, 2);
    assert!(log.is_closed());

    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].urgent);
    assert_eq!(messages[0].article_ids, vec!["post-102"]);
    assert!(messages[0].subject.contains("[URGENT]"));
    assert_eq!(messages[1].article_ids, vec!["post-101"]);
    assert!(messages[1].text_body.contains("KO:新工場の建設計画を発表"));

    let snapshot = saved(&store).await;
    assert!(snapshot.dedup.contains_key("post-101"));
    assert!(snapshot.dedup.contains_key("post-102"));
    assert!(!snapshot.dedup.contains_key("post-103"));
    assert_eq!(
        snapshot.translations.get("工場で火災発生").map(|t| t.text.as_str()),
        Some("KO:工場で火災発生")
    );
}

#[tokio::test]
async fn test_second_run_sends_nothing() {
    let store = Arc::new(MemorySnapshotStore::new());
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    h.orchestrator.run_once().await;
    let translations = h.translator.calls.load(Ordering::SeqCst);

    let second = h.orchestrator.run_once().await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.articles_found, 2);
    assert_eq!(second.new_articles, 0);
    assert_eq!(second.messages_sent, 0);
    assert_eq!(h.notifier.messages().len(), 2);
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), translations);
}

#[tokio::test]
async fn test_stale_translations_are_dropped_from_snapshot() {
    let mut seeded = StateSnapshot::default();
    seeded.translations.insert(
        "昔の見出し".to_string(),
        CachedTranslation::new("옛 제목", Utc::now() - ChronoDuration::days(120)),
    );
    seeded.translations.insert(
        "最近の見出し".to_string(),
        CachedTranslation::new("최근 제목", Utc::now() - ChronoDuration::days(3)),
    );
    let store = Arc::new(MemorySnapshotStore::with_bytes(seeded.to_bytes().unwrap()));
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Success);

    let snapshot = saved(&store).await;
    assert!(!snapshot.translations.contains_key("昔の見出し"));
    assert!(snapshot.translations.contains_key("最近の見出し"));
    assert!(snapshot.translations.contains_key("新工場の建設計画を発表"));
}

#[tokio::test]
async fn test_full_content_is_fetched_for_new_articles() {
    let store = Arc::new(MemorySnapshotStore::new());
    let article_url = format!("{}2025/03/new-plant", SITE);
    let mut config = test_config();
    config.email.include_full_content = true;
    let h = harness(
        config,
        FakeTransport::serving(&[(SITE, PAGE_ONE), (&article_url, ARTICLE_PAGE)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    // The urgent article's page 404s; that only costs its body.
    assert_eq!(log.status, RunStatus::Success);
    // Listing wave of two, then one request per new article.
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2 + 2);

    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 2);
    assert!(!messages[0].text_body.contains("投資額"));
    assert!(messages[1].text_body.contains("投資額は約三百億円"));
    assert!(messages[1].html_body.contains("年間の生産能力"));
    assert!(!messages[1].text_body.contains("ニュースサイト"));
}

#[tokio::test]
async fn test_unbatched_notifications_send_one_message_per_article() {
    let store = Arc::new(MemorySnapshotStore::new());
    let page_two = format!("{}page/2", SITE);
    let mut config = test_config();
    config.email.batch_notifications = false;
    let h = harness(
        config,
        FakeTransport::serving(&[(SITE, PAGE_WITH_NEXT), (&page_two, PAGE_TWO)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Success);
    assert_eq!(log.messages_sent, 2);

    let messages = h.notifier.messages();
    assert_eq!(messages[0].article_ids, vec!["post-202"]);
    assert_eq!(messages[1].article_ids, vec!["post-201"]);
    assert!(messages[0].subject.contains("KO:第二工場の計画"));

    let snapshot = saved(&store).await;
    assert!(snapshot.dedup.contains_key("post-201"));
    assert!(snapshot.dedup.contains_key("post-202"));
}

#[tokio::test]
async fn test_pagination_stops_without_next_link() {
    let store = Arc::new(MemorySnapshotStore::new());
    let page_two = format!("{}page/2", SITE);
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_WITH_NEXT), (&page_two, PAGE_TWO)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Success);
    assert_eq!(log.pages_fetched, 2);
    assert_eq!(log.new_articles, 2);
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2);

    // One batch, ordered by publication date.
    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].article_ids, vec!["post-202", "post-201"]);
}

#[tokio::test]
async fn test_partial_delivery_still_persists_every_composed_id() {
    let store = Arc::new(MemorySnapshotStore::new());
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::failing_on("[URGENT]"),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::PartialFailure);
    assert_eq!(log.messages_sent, 1);
    assert_eq!(log.messages_failed, 1);
    assert!(log.error_message.is_some());

    let snapshot = saved(&store).await;
    assert!(snapshot.dedup.contains_key("post-101"));
    assert!(snapshot.dedup.contains_key("post-102"));
}

#[tokio::test]
async fn test_persist_failure_fails_run() {
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        Arc::new(MemorySnapshotStore::failing()),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.persist_failed);
    assert_eq!(log.messages_sent, 2);
}

#[tokio::test]
async fn test_all_pages_failing_fails_without_persisting() {
    let store = Arc::new(MemorySnapshotStore::new());
    let h = harness(
        test_config(),
        FakeTransport::failing(503),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Failed);
    assert_eq!(log.pages_fetched, 0);
    assert_eq!(log.pages_failed, 5);
    // Every page up to the cap, two attempts each.
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 5 * 2);
    assert!(store.bytes().is_none());
    assert!(h.notifier.messages().is_empty());
}

#[tokio::test]
async fn test_failed_pages_do_not_stop_the_listing() {
    let store = Arc::new(MemorySnapshotStore::new());
    let page_three = format!("{}page/3", SITE);
    // Page 1 and page 2 form the first wave and both 404.
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(&page_three, PAGE_TWO)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Success);
    assert_eq!(log.pages_failed, 2);
    assert_eq!(log.pages_fetched, 1);
    assert_eq!(log.articles_found, 1);
    // Page 4 shares a wave with page 3 and is discarded.
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 4);
    assert!(saved(&store).await.dedup.contains_key("post-202"));
}

#[tokio::test]
async fn test_failed_pages_give_the_same_result_for_any_worker_count() {
    let page_three = format!("{}page/3", SITE);
    for workers in [1, 2, 3, 5] {
        let mut config = test_config();
        config.scraping.workers = workers;
        let h = harness(
            config,
            FakeTransport::serving(&[(&page_three, PAGE_TWO)]),
            RecordingNotifier::default(),
            Arc::new(MemorySnapshotStore::new()),
        );

        let log = h.orchestrator.run_once().await;
        assert_eq!(log.status, RunStatus::Success, "workers = {}", workers);
        assert_eq!(log.new_articles, 1, "workers = {}", workers);
        assert_eq!(log.pages_failed, 2, "workers = {}", workers);
    }
}

#[tokio::test]
async fn test_login_wall_fails_run() {
    let store = Arc::new(MemorySnapshotStore::new());
    let h = harness(
        test_config(),
        FakeTransport::failing(401),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.error_message.unwrap().contains("requires login"));
    assert!(store.bytes().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_leaves_snapshot_untouched() {
    let mut seeded = StateSnapshot::default();
    seeded.translations.insert(
        "既存".to_string(),
        CachedTranslation::new("기존", Utc::now()),
    );
    let before = seeded.to_bytes().unwrap();
    let store = Arc::new(MemorySnapshotStore::with_bytes(before.clone()));

    let mut config = test_config();
    config.monitoring.run_timeout_seconds = 5;
    let h = harness(
        config,
        FakeTransport::serving(&[(SITE, PAGE_ONE)]).slow(Duration::from_secs(30)),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::TimedOut);
    assert_eq!(store.bytes(), Some(before));
    assert!(h.notifier.messages().is_empty());
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_run() {
    let store = Arc::new(MemorySnapshotStore::with_bytes(b"{broken".to_vec()));
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        store.clone(),
    );

    let log = h.orchestrator.run_once().await;
    assert_eq!(log.status, RunStatus::Failed);
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.bytes(), Some(b"{broken".to_vec()));
}

#[tokio::test]
async fn test_run_log_is_appended() {
    let dir = tempfile::TempDir::new().unwrap();
    let writer = RunLogWriter::new(dir.path().join("runs.jsonl"), 90);
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        Arc::new(MemorySnapshotStore::new()),
    );
    let orchestrator = h.orchestrator.with_run_log(writer.clone());

    orchestrator.run_once().await;
    orchestrator.run_once().await;

    let logs = writer.read_all().await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].new_articles, 2);
    assert_eq!(logs[1].new_articles, 0);
}

#[tokio::test(start_paused = true)]
async fn test_daemon_stops_after_consecutive_failures() {
    let mut config = test_config();
    config.monitoring.max_consecutive_errors = 3;
    config.monitoring.check_interval_minutes = 1;
    config.email.send_error_notifications = true;
    config.email.error_notification_threshold = 2;
    let h = harness(
        config,
        FakeTransport::failing(503),
        RecordingNotifier::default(),
        Arc::new(MemorySnapshotStore::new()),
    );

    let (_tx, rx) = watch::channel(false);
    let result = h.orchestrator.run_with_shutdown(RunMode::Daemon, rx).await;
    assert!(result.is_err());

    // One alert, sent when the threshold was reached.
    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].subject.contains("[ERROR]"));
    // Three runs, five pages each, two attempts per page.
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 3 * 5 * 2);
}

#[tokio::test(start_paused = true)]
async fn test_daemon_honours_shutdown_between_runs() {
    let h = harness(
        test_config(),
        FakeTransport::serving(&[(SITE, PAGE_ONE)]),
        RecordingNotifier::default(),
        Arc::new(MemorySnapshotStore::new()),
    );

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let log = h
        .orchestrator
        .run_with_shutdown(RunMode::Daemon, rx)
        .await
        .unwrap();
    assert_eq!(log.status, RunStatus::Success);
    // Page 1 and page 2 go out in the same wave; no second run.
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2);
}
