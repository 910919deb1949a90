//! Message composition, batching and delivery.
//!
//! [`NotificationBatcher`] turns the run's new records into [`Message`]s:
//! one message per urgent record, and size-capped batches of the rest in
//! `(published_date, id)` order (or one message each when batching is off).
//! Delivery goes through the [`Notifier`] trait; [`SmtpNotifier`] is the
//! lettre-backed implementation.

use crate::article::ArticleRecord;
use crate::config::EmailConfig;
use crate::error::DeliveryError;
use crate::retry::RetryPolicy;
use crate::utils::{escape_html, truncate_chars};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{error, info, warn};

/// Cap on the article body shown in a message, in characters.
const FULL_CONTENT_CHARS: usize = 2000;

/// A composed notification, ready to hand to a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    /// Ids of the articles this message reports, in display order.
    pub article_ids: Vec<String>,
    pub urgent: bool,
}

/// The delivery collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), DeliveryError>;
}

/// A message that could not be delivered.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub subject: String,
    pub article_ids: Vec<String>,
    pub error: DeliveryError,
}

/// Outcome of delivering a set of messages.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Messages delivered.
    pub sent: usize,
    /// Article ids contained in delivered messages.
    pub delivered_ids: Vec<String>,
    pub failed: Vec<FailedMessage>,
}

impl DeliveryReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Partitions records into messages and delivers them with retries.
#[derive(Debug, Clone)]
pub struct NotificationBatcher {
    recipients: Vec<String>,
    subject_prefix: String,
    max_per_message: usize,
    batch: bool,
    policy: RetryPolicy,
}

impl NotificationBatcher {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            recipients: config.recipients.clone(),
            subject_prefix: config.subject_prefix.clone(),
            max_per_message: config.max_articles_per_email.max(1),
            batch: config.batch_notifications,
            policy: RetryPolicy::delivery(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builds the messages for `records`.
    ///
    /// Urgent records get one message each, ahead of the batches. Normal
    /// records are ordered by `(published_date, id)` and split into chunks of
    /// at most `max_articles_per_email`, or sent one per message when
    /// batching is off.
    pub fn compose(&self, records: &[ArticleRecord], now: DateTime<Utc>) -> Vec<Message> {
        let (mut urgent, mut normal): (Vec<&ArticleRecord>, Vec<&ArticleRecord>) =
            records.iter().partition(|r| r.is_urgent);

        let order = |a: &&ArticleRecord, b: &&ArticleRecord| {
            (a.published_date, &a.id).cmp(&(b.published_date, &b.id))
        };
        urgent.sort_by(order);
        normal.sort_by(order);

        let mut messages: Vec<Message> = urgent
            .into_iter()
            .map(|record| self.article_message(&[record], true, now))
            .collect();

        let cap = if self.batch { self.max_per_message } else { 1 };
        messages.extend(
            normal
                .chunks(cap)
                .map(|chunk| self.article_message(chunk, false, now)),
        );
        messages
    }

    /// Delivers every message, retrying transient failures per message.
    ///
    /// A message that keeps failing is recorded and the remaining messages are
    /// still attempted.
    pub async fn deliver(&self, notifier: &dyn Notifier, messages: &[Message]) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for message in messages {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match notifier.send(message).await {
                    Ok(()) => {
                        info!(subject = %message.subject, articles = message.article_ids.len(), "Notification sent");
                        report.sent += 1;
                        report.delivered_ids.extend(message.article_ids.iter().cloned());
                        break;
                    }
                    Err(e) if e.is_retryable() && self.policy.should_retry(attempt) => {
                        let delay = self.policy.delay_for(attempt, false);
                        warn!(
                            subject = %message.subject,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Send failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        error!(subject = %message.subject, attempt, error = %e, "Giving up on message");
                        report.failed.push(FailedMessage {
                            subject: message.subject.clone(),
                            article_ids: message.article_ids.clone(),
                            error: e,
                        });
                        break;
                    }
                }
            }
        }

        report
    }

    /// Alert sent after repeated failed runs.
    pub fn error_message(&self, detail: &str, now: DateTime<Utc>) -> Message {
        let when = now.format("%Y-%m-%d %H:%M:%S UTC");
        let text_body = format!(
            "The news monitor has failed repeatedly.\n\nTime: {}\nError:\n{}\n\nPlease check the system.\n",
            when, detail
        );
        let html_body = format!(
            "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"></head><body>\
             <h2 style=\"color:#dc3545\">Monitoring error</h2>\
             <p>Time: {}</p><pre>{}</pre><p>Please check the system.</p></body></html>",
            when,
            escape_html(detail)
        );
        Message {
            recipients: self.recipients.clone(),
            subject: format!("{} [ERROR] Monitoring failure", self.subject_prefix),
            html_body,
            text_body,
            article_ids: Vec::new(),
            urgent: true,
        }
    }

    /// Message used by `--test-email` to check the SMTP settings.
    pub fn test_message(&self, now: DateTime<Utc>) -> Message {
        let sample = ArticleRecord {
            id: "test-001".to_string(),
            title: "テストメール - Test Email".to_string(),
            translated_title: None,
            translation_fallback: false,
            url: "https://gomuhouchi.com".to_string(),
            published_date: now.naive_utc(),
            matched_keyword: "テスト".to_string(),
            is_urgent: false,
            snippet: "これはテストメールです。メール設定が正常に動作しています。".to_string(),
            member_only: false,
            full_content: None,
            notified: false,
            first_seen: now,
        };
        let mut message = self.article_message(&[&sample], false, now);
        message.subject = format!("{} [TEST] Email configuration check", self.subject_prefix);
        message.article_ids.clear();
        message
    }

    fn article_message(&self, records: &[&ArticleRecord], urgent: bool, now: DateTime<Utc>) -> Message {
        let count = records.len();
        let plural = if count == 1 { "" } else { "s" };
        let subject = if urgent {
            format!(
                "{} [URGENT] {}",
                self.subject_prefix,
                records.first().map(|r| r.display_title()).unwrap_or_default()
            )
        } else if !self.batch {
            format!(
                "{} {}",
                self.subject_prefix,
                records.first().map(|r| r.display_title()).unwrap_or_default()
            )
        } else {
            format!("{} {} new article{}", self.subject_prefix, count, plural)
        };

        Message {
            recipients: self.recipients.clone(),
            subject,
            html_body: render_html(records, urgent, now),
            text_body: render_text(records, urgent, now),
            article_ids: records.iter().map(|r| r.id.clone()).collect(),
            urgent,
        }
    }
}

fn render_text(records: &[&ArticleRecord], urgent: bool, now: DateTime<Utc>) -> String {
    let rule = "=".repeat(60);
    let mut out = String::new();
    if urgent {
        let _ = writeln!(out, "{}\n[URGENT] New article found\n{}", rule, rule);
    } else {
        let _ = writeln!(out, "News monitoring digest\n{}", rule);
    }
    let _ = writeln!(out, "\n{} new article(s)\n", records.len());

    for (i, record) in records.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}", i + 1, record.title);
        if let Some(translated) = record.translated_title.as_deref().filter(|t| *t != record.title) {
            let _ = writeln!(out, "    {}", translated);
        }
        let _ = writeln!(out, "    Keyword: {}", record.matched_keyword);
        if record.member_only {
            let _ = writeln!(out, "    Members only");
        }
        let _ = writeln!(out, "    Published: {}", record.published_date.format("%Y-%m-%d %H:%M"));
        let _ = writeln!(out, "    Link: {}", record.url);
        if !record.snippet.is_empty() {
            let _ = writeln!(out, "    {}", record.snippet);
        }
        if let Some(content) = &record.full_content {
            let _ = writeln!(out, "\n{}\n", truncate_chars(content, FULL_CONTENT_CHARS));
        }
        let _ = writeln!(out, "{}", "-".repeat(60));
    }

    let _ = writeln!(out, "\nChecked at {}", now.format("%Y-%m-%d %H:%M:%S UTC"));
    out
}

fn render_html(records: &[&ArticleRecord], urgent: bool, now: DateTime<Utc>) -> String {
    let header_color = if urgent { "#dc3545" } else { "#007bff" };
    let heading = if urgent {
        "Urgent: new article found"
    } else {
        "News monitoring digest"
    };

    let mut out = String::new();
    let _ = write!(
        out,
        "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"></head>\
         <body style=\"font-family:'Segoe UI',Arial,sans-serif;line-height:1.6;color:#333;max-width:800px;margin:0 auto\">\
         <div style=\"background:{};color:#fff;padding:16px\"><h2 style=\"margin:0\">{}</h2>\
         <p style=\"margin:4px 0 0\">{} new article(s)</p></div>",
        header_color,
        heading,
        records.len()
    );

    for record in records {
        let _ = write!(
            out,
            "<div style=\"border-bottom:1px solid #eee;padding:12px 0\">\
             <h3 style=\"margin:0\"><a href=\"{}\">{}</a></h3>",
            escape_html(&record.url),
            escape_html(&record.title)
        );
        if let Some(translated) = record.translated_title.as_deref().filter(|t| *t != record.title) {
            let _ = write!(out, "<p style=\"margin:2px 0;color:#555\">{}</p>", escape_html(translated));
        }
        let _ = write!(
            out,
            "<p style=\"margin:2px 0;font-size:13px\">\
             <span style=\"background:#ffc107;padding:1px 6px\">{}</span> {}",
            escape_html(&record.matched_keyword),
            record.published_date.format("%Y-%m-%d %H:%M")
        );
        if record.member_only {
            out.push_str(" <span style=\"background:#6c757d;color:#fff;padding:1px 6px\">&#128274; members only</span>");
        }
        out.push_str("</p>");
        if !record.snippet.is_empty() {
            let _ = write!(out, "<p style=\"margin:4px 0;color:#666\">{}</p>", escape_html(&record.snippet));
        }
        if let Some(content) = &record.full_content {
            let _ = write!(
                out,
                "<div style=\"margin:8px 0;white-space:pre-wrap\">{}</div>",
                escape_html(&truncate_chars(content, FULL_CONTENT_CHARS))
            );
        }
        out.push_str("</div>");
    }

    let _ = write!(
        out,
        "<p style=\"color:#999;font-size:12px\">Checked at {}</p></body></html>",
        now.format("%Y-%m-%d %H:%M:%S UTC")
    );
    out
}

/// [`Notifier`] that sends through an SMTP relay.
pub struct SmtpNotifier {
    config: EmailConfig,
}

impl SmtpNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_email(&self, message: &Message) -> Result<lettre::Message, DeliveryError> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| DeliveryError::Fatal(format!("invalid sender '{}': {}", self.config.from, e)))?;

        let mut builder = lettre::Message::builder().from(from).subject(&message.subject);
        for recipient in &message.recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| DeliveryError::Fatal(format!("invalid recipient '{}': {}", recipient, e)))?;
            builder = builder.to(to);
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                message.text_body.clone(),
                message.html_body.clone(),
            ))
            .map_err(|e| DeliveryError::Fatal(e.to_string()))
    }

    fn mailer(&self) -> Result<SmtpTransport, DeliveryError> {
        let builder = if self.config.use_tls {
            SmtpTransport::starttls_relay(&self.config.smtp_server)
                .map_err(|e| DeliveryError::Fatal(format!("SMTP relay setup failed: {}", e)))?
        } else {
            SmtpTransport::builder_dangerous(&self.config.smtp_server)
        };

        let mut builder = builder
            .port(self.config.smtp_port)
            .timeout(Some(Duration::from_secs(30)));
        if !self.config.password.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.from.clone(),
                self.config.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: &Message) -> Result<(), DeliveryError> {
        if message.recipients.is_empty() {
            return Err(DeliveryError::Fatal("no recipients configured".to_string()));
        }
        if self.config.from.is_empty() {
            return Err(DeliveryError::Fatal("email.from is not configured".to_string()));
        }

        let email = self.build_email(message)?;
        let mailer = self.mailer()?;

        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| DeliveryError::Transient(format!("send task failed: {}", e)))?
            .map(|_| ())
            .map_err(|e| {
                if e.is_permanent() {
                    DeliveryError::Fatal(e.to_string())
                } else {
                    DeliveryError::Transient(e.to_string())
                }
            })
    }
}
