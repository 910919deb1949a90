//! One run of the monitor, and the loop that repeats it.
//!
//! A run walks `INIT → AUTH → FETCH → EXTRACT → FILTER → TRANSLATE → NOTIFY →
//! PERSIST → DONE`. Fatal errors jump to `FAILED` without persisting; the run
//! deadline jumps to `TIMED_OUT`, also without persisting. Partial delivery
//! failures still persist: every id placed in a composed message is recorded
//! as seen, delivered or not.

use crate::article::{ArticleRecord, Candidate};
use crate::config::Config;
use crate::dedup::DedupStore;
use crate::extractor::ArticleExtractor;
use crate::fetcher::{HttpTransport, PageRef, PageResult, SiteFetcher};
use crate::notifier::{NotificationBatcher, Notifier, SmtpNotifier};
use crate::run_log::{RunLog, RunLogWriter, RunStatus};
use crate::session::build_authenticator;
use crate::snapshot::{FileSnapshotStore, SnapshotStore, StateSnapshot};
use crate::translator::{
    ChatTranslator, Translation, TranslationCache, Translator, prune_translations,
};
use anyhow::Context;
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Whether the entry point runs once or loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Run the pipeline once and exit.
    Test,
    /// Run on a fixed interval until stopped.
    Daemon,
}

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Auth,
    Fetch,
    Extract,
    Filter,
    Translate,
    Notify,
    Persist,
    Done,
    Failed,
    TimedOut,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Auth => "AUTH",
            Stage::Fetch => "FETCH",
            Stage::Extract => "EXTRACT",
            Stage::Filter => "FILTER",
            Stage::Translate => "TRANSLATE",
            Stage::Notify => "NOTIFY",
            Stage::Persist => "PERSIST",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
            Stage::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Maps a terminal run status to its final stage.
fn terminal_stage(status: RunStatus) -> Stage {
    match status {
        RunStatus::Success | RunStatus::PartialFailure => Stage::Done,
        RunStatus::Failed => Stage::Failed,
        RunStatus::TimedOut => Stage::TimedOut,
    }
}

/// Drives the pipeline.
pub struct Orchestrator {
    config: Config,
    fetcher: SiteFetcher,
    extractor: ArticleExtractor,
    translator: Option<Arc<dyn Translator>>,
    notifier: Arc<dyn Notifier>,
    snapshots: Arc<dyn SnapshotStore>,
    run_logs: Option<RunLogWriter>,
    batcher: NotificationBatcher,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        fetcher: SiteFetcher,
        notifier: Arc<dyn Notifier>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<Self, url::ParseError> {
        let extractor = ArticleExtractor::from_config(&config.site)?;
        let batcher = NotificationBatcher::new(&config.email);
        Ok(Self {
            config,
            fetcher,
            extractor,
            translator: None,
            notifier,
            snapshots,
            run_logs: None,
            batcher,
        })
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.scraping.request_timeout_seconds);

        let transport = HttpTransport::new(timeout).context("Failed to build HTTP client")?;
        let authenticator =
            build_authenticator(&config).context("Invalid authentication settings")?;
        let fetcher = SiteFetcher::new(Arc::new(transport), authenticator, &config.scraping)
            .with_continue_on_auth_failure(config.auth.continue_on_failure);

        let translator: Option<Arc<dyn Translator>> = if !config.translation.enabled {
            None
        } else if !config.translation.api.is_configured() {
            warn!("Translation is enabled but no API key is configured; titles stay untranslated");
            None
        } else {
            let chat = ChatTranslator::new(config.translation.api.clone(), timeout)
                .context("Failed to build translation client")?;
            Some(Arc::new(chat))
        };

        let notifier = Arc::new(SmtpNotifier::new(config.email.clone()));
        let snapshots = Arc::new(FileSnapshotStore::new(config.state.snapshot_path.clone()));
        let run_logs = RunLogWriter::new(
            config.state.run_log_path.clone(),
            config.state.keep_records_days,
        );

        let mut orchestrator =
            Self::new(config, fetcher, notifier, snapshots).context("Invalid site.url")?;
        orchestrator.translator = translator;
        orchestrator.run_logs = Some(run_logs);
        Ok(orchestrator)
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_run_log(mut self, writer: RunLogWriter) -> Self {
        self.run_logs = Some(writer);
        self
    }

    pub fn with_batcher(mut self, batcher: NotificationBatcher) -> Self {
        self.batcher = batcher;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn enter(&self, stage: Stage) {
        debug!(stage = %stage, "Entering stage");
    }

    /// Entry point: one run in test mode, repeated runs in daemon mode.
    ///
    /// Daemon mode stops on Ctrl-C or SIGTERM between runs, and gives up with an
    /// error after `max_consecutive_errors` non-successful runs in a row.
    pub async fn run(&self, mode: RunMode) -> anyhow::Result<RunLog> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(true);
        });
        self.run_with_shutdown(mode, rx).await
    }

    /// Like [`Orchestrator::run`], with an explicit shutdown channel.
    pub async fn run_with_shutdown(
        &self,
        mode: RunMode,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<RunLog> {
        if mode == RunMode::Test {
            return Ok(self.run_once().await);
        }

        let monitoring = &self.config.monitoring;
        let interval = Duration::from_secs(monitoring.check_interval_minutes.saturating_mul(60));
        let threshold = self.config.email.error_notification_threshold.max(1);
        let mut consecutive_failures = 0u32;
        let mut alerted = false;

        info!(
            interval_minutes = monitoring.check_interval_minutes,
            "Starting daemon mode"
        );

        loop {
            let log = self.run_once().await;

            if log.status.is_success() {
                consecutive_failures = 0;
                alerted = false;
            } else {
                consecutive_failures += 1;
                warn!(
                    consecutive_failures,
                    status = %log.status,
                    "Run did not succeed"
                );

                if self.config.email.send_error_notifications
                    && !alerted
                    && consecutive_failures >= threshold
                {
                    self.send_error_alert(&log, consecutive_failures).await;
                    alerted = true;
                }

                if consecutive_failures >= monitoring.max_consecutive_errors {
                    anyhow::bail!(
                        "Stopping after {} consecutive unsuccessful runs (last: {})",
                        consecutive_failures,
                        log.error_message.as_deref().unwrap_or("no details")
                    );
                }
            }

            if *shutdown.borrow() {
                info!("Shutdown requested");
                return Ok(log);
            }

            info!(
                next_run_in_minutes = monitoring.check_interval_minutes,
                "Waiting for next run"
            );
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested");
                    return Ok(log);
                }
            }
        }
    }

    async fn send_error_alert(&self, log: &RunLog, consecutive_failures: u32) {
        let detail = format!(
            "{} consecutive unsuccessful runs.\nLast run {} ended with status {}: {}",
            consecutive_failures,
            log.run_id,
            log.status,
            log.error_message.as_deref().unwrap_or("no details")
        );
        let message = self.batcher.error_message(&detail, Utc::now());
        let report = self.batcher.deliver(self.notifier.as_ref(), &[message]).await;
        if report.all_delivered() {
            info!("Error notification sent");
        } else {
            error!("Failed to send error notification");
        }
    }

    /// Sends one test message through the configured notifier.
    pub async fn send_test_email(&self) -> Result<(), crate::error::DeliveryError> {
        let message = self.batcher.test_message(Utc::now());
        self.notifier.send(&message).await
    }

    /// Executes the pipeline once and returns the closed run log.
    pub async fn run_once(&self) -> RunLog {
        let mut log = RunLog::open(Utc::now());
        info!(run_id = %log.run_id, "Run started");

        self.enter(Stage::Init);
        let snapshot = match self.snapshots.load().await {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "Failed to load state snapshot");
                log.fail(
                    RunStatus::Failed,
                    format!("Failed to load state snapshot: {}", e),
                    Utc::now(),
                );
                self.finish(&log).await;
                return log;
            }
        };

        let budget = Duration::from_secs(self.config.monitoring.run_timeout_seconds);
        let deadline = Instant::now() + budget;
        let outcome = tokio::time::timeout_at(deadline, self.pipeline(&mut log, snapshot)).await;

        match outcome {
            Ok(Ok(status)) => log.close(status, Utc::now()),
            Ok(Err(message)) => {
                error!(error = %message, "Run failed");
                log.fail(RunStatus::Failed, message, Utc::now());
            }
            Err(_) => {
                warn!(timeout_seconds = budget.as_secs(), "Run deadline elapsed");
                log.fail(
                    RunStatus::TimedOut,
                    format!("Run exceeded {}s deadline", budget.as_secs()),
                    Utc::now(),
                );
            }
        }

        self.finish(&log).await;
        log
    }

    async fn finish(&self, log: &RunLog) {
        self.enter(terminal_stage(log.status));
        info!(
            run_id = %log.run_id,
            status = %log.status,
            articles_found = log.articles_found,
            new_articles = log.new_articles,
            duration_seconds = log.duration_seconds.unwrap_or_default(),
            "Run finished"
        );

        if let Some(writer) = &self.run_logs {
            if let Err(e) = writer.append(log).await {
                warn!(path = %writer.path().display(), error = %e, "Failed to append run log");
            }
        }
    }

    /// AUTH through PERSIST. Returns the final status, or an error message for a fatal failure.
    async fn pipeline(&self, log: &mut RunLog, snapshot: StateSnapshot) -> Result<RunStatus, String> {
        let now = Utc::now();
        let (mut dedup, evicted) =
            DedupStore::load(&snapshot.dedup, now, self.config.state.keep_records_days);
        if evicted > 0 {
            info!(evicted, "Dropped dedup entries past the retention horizon");
        }
        let (translations, evicted) =
            prune_translations(&snapshot.translations, now, self.config.state.keep_records_days);
        if evicted > 0 {
            info!(evicted, "Dropped cached translations past the retention horizon");
        }
        let mut cache = self.translator.as_ref().map(|translator| {
            TranslationCache::load(
                translations.clone(),
                Arc::clone(translator),
                &self.config.translation,
            )
        });

        self.enter(Stage::Auth);
        self.fetcher.reset_session().await;
        let session = self
            .fetcher
            .authenticate()
            .await
            .map_err(|e| format!("Authentication failed: {}", e))?;
        debug!(authenticated = session.is_authenticated(), "Session ready");

        let candidates = self.collect_candidates(log).await?;
        log.articles_found = candidates.len();

        self.enter(Stage::Filter);
        let mut records: Vec<ArticleRecord> = dedup
            .filter_new(candidates)
            .into_iter()
            .map(|c| ArticleRecord::from_candidate(c, now))
            .collect();
        log.new_articles = records.len();
        info!(
            found = log.articles_found,
            new = log.new_articles,
            "Filtered against seen articles"
        );

        if self.config.email.include_full_content && !records.is_empty() {
            self.attach_full_content(&mut records).await;
        }

        let translate = self.config.translation.enabled && !records.is_empty();
        if let Some(cache) = cache.as_mut().filter(|_| translate) {
            self.enter(Stage::Translate);
            let fallback_on_error = self.config.translation.fallback_on_error;
            for record in &mut records {
                match cache.translate(&record.title).await {
                    Translation::Translated(text) => record.translated_title = Some(text),
                    Translation::Fallback(source) => {
                        log.translations_failed += 1;
                        if fallback_on_error {
                            record.translated_title = Some(source);
                            record.translation_fallback = true;
                        }
                    }
                }
            }
        }

        self.enter(Stage::Notify);
        let messages = self.batcher.compose(&records, Utc::now());
        let report = self.batcher.deliver(self.notifier.as_ref(), &messages).await;
        let delivered: HashSet<&str> = report.delivered_ids.iter().map(String::as_str).collect();
        for record in &mut records {
            if delivered.contains(record.id.as_str()) {
                record.mark_notified();
            }
        }
        log.messages_sent = report.sent;
        log.messages_failed = report.failed.len();

        self.enter(Stage::Persist);
        for id in messages.iter().flat_map(|m| m.article_ids.iter()) {
            dedup.record(id, now);
        }
        let translations = match &cache {
            Some(cache) if self.config.translation.cache_enabled => cache.export(),
            _ => translations,
        };
        let updated = StateSnapshot::new(dedup.export(), translations, Utc::now());
        if let Err(e) = self.snapshots.save(&updated).await {
            log.persist_failed = true;
            return Err(format!(
                "Failed to persist state snapshot; this run's notifications may repeat: {}",
                e
            ));
        }
        debug!(seen = dedup.len(), "State snapshot saved");

        if report.all_delivered() {
            Ok(RunStatus::Success)
        } else {
            log.error_message = Some(format!(
                "{} of {} messages could not be delivered",
                report.failed.len(),
                messages.len()
            ));
            Ok(RunStatus::PartialFailure)
        }
    }

    /// Fetches each record's article page and keeps its body text.
    ///
    /// A page that fails to load or has no readable body leaves
    /// `full_content` empty; the run carries on.
    async fn attach_full_content(&self, records: &mut [ArticleRecord]) {
        info!(articles = records.len(), "Fetching article bodies");
        let urls = records.iter().map(|r| r.url.clone()).collect();
        let results = self.fetcher.fetch_articles(urls).await;

        for (record, result) in records.iter_mut().zip(results) {
            match result {
                Ok(html) => {
                    record.full_content = self.extractor.extract_body(&html);
                    if record.full_content.is_none() {
                        debug!(id = %record.id, "No readable article body");
                    }
                }
                Err(e) => {
                    warn!(id = %record.id, url = %record.url, error = %e, "Failed to fetch article body");
                }
            }
        }
    }

    /// Fetches listing pages in waves of `workers` pages and extracts them in page order.
    ///
    /// Stops after a page with no entries or no next-page link; pages past that
    /// point are discarded, errors included. A failed page does not end the
    /// listing, so the pages tried never depend on the worker count.
    async fn collect_candidates(&self, log: &mut RunLog) -> Result<Vec<Candidate>, String> {
        let max_pages = self.config.scraping.max_pages_to_scrape;
        let wave = self.fetcher.workers().max(1) as u32;
        let mut candidates = Vec::new();
        let mut next = 1u32;

        'listing: while next <= max_pages {
            let last = (next + wave - 1).min(max_pages);
            let pages: Vec<PageRef> = (next..=last)
                .map(|page| PageRef {
                    page,
                    url: self.config.site.page_url(page),
                })
                .collect();

            self.enter(Stage::Fetch);
            let results = self.fetcher.fetch_pages(pages).await;

            self.enter(Stage::Extract);
            for PageResult { page, url, result } in results {
                match result {
                    Ok(html) => {
                        log.pages_fetched += 1;
                        let extraction = self.extractor.extract(&html);
                        log.entries_skipped += extraction.skipped;
                        info!(
                            page,
                            entries = extraction.entries_seen,
                            matched = extraction.candidates.len(),
                            skipped = extraction.skipped,
                            "Extracted listing page"
                        );
                        candidates.extend(extraction.candidates);

                        if extraction.entries_seen == 0 || !extraction.has_next_page {
                            debug!(page, "Last listing page");
                            break 'listing;
                        }
                    }
                    Err(e) if e.is_auth_failure() => {
                        return Err(format!("Page {} requires login: {}", page, e));
                    }
                    Err(e) => {
                        warn!(page, %url, error = %e, "Listing page failed");
                        log.pages_failed += 1;
                    }
                }
            }
            next = last + 1;
        }

        if log.pages_fetched == 0 {
            return Err(format!(
                "All {} listing pages failed to load",
                log.pages_failed
            ));
        }
        Ok(candidates)
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::TimedOut.to_string(), "TIMED_OUT");
        assert_eq!(Stage::Persist.to_string(), "PERSIST");
    }

    #[test]
    fn test_terminal_stage() {
        assert_eq!(terminal_stage(RunStatus::Success), Stage::Done);
        assert_eq!(terminal_stage(RunStatus::PartialFailure), Stage::Done);
        assert_eq!(terminal_stage(RunStatus::Failed), Stage::Failed);
        assert_eq!(terminal_stage(RunStatus::TimedOut), Stage::TimedOut);
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let mut config = Config::default();
        config.site.url = "not a url".to_string();
        config.auth.enabled = false;
        assert!(Orchestrator::from_config(config).is_err());
    }
}
