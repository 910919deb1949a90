//! Run audit records and statistics.
//!
//! Every closed [`RunLog`] is appended as one JSON line to the audit file.
//! Lines older than the retention horizon are dropped on each write.

use crate::utils::retention_horizon;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        self == RunStatus::Success
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Audit record for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Keyword-matched candidates across all pages, before dedup.
    pub articles_found: usize,
    /// Candidates that were not seen before.
    pub new_articles: usize,
    #[serde(default)]
    pub pages_fetched: usize,
    #[serde(default)]
    pub pages_failed: usize,
    /// Malformed listing entries.
    #[serde(default)]
    pub entries_skipped: usize,
    #[serde(default)]
    pub translations_failed: usize,
    #[serde(default)]
    pub messages_sent: usize,
    #[serde(default)]
    pub messages_failed: usize,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    /// The snapshot could not be written back; this run's dedup work is lost.
    #[serde(default)]
    pub persist_failed: bool,
}

impl RunLog {
    /// Opens a record at the start of a run.
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            start_time: now,
            end_time: None,
            articles_found: 0,
            new_articles: 0,
            pages_fetched: 0,
            pages_failed: 0,
            entries_skipped: 0,
            translations_failed: 0,
            messages_sent: 0,
            messages_failed: 0,
            status: RunStatus::Success,
            error_message: None,
            duration_seconds: None,
            persist_failed: false,
        }
    }

    /// Closes the record with its final status.
    pub fn close(&mut self, status: RunStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
        let elapsed = now - self.start_time;
        self.duration_seconds = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
    }

    /// Closes the record as failed with a message.
    pub fn fail(&mut self, status: RunStatus, message: impl Into<String>, now: DateTime<Utc>) {
        self.error_message = Some(message.into());
        self.close(status, now);
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Appends closed run logs to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct RunLogWriter {
    path: PathBuf,
    keep_days: u32,
}

impl RunLogWriter {
    pub fn new(path: impl Into<PathBuf>, keep_days: u32) -> Self {
        Self {
            path: path.into(),
            keep_days,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `log` and drops lines that fell out of the retention horizon.
    pub async fn append(&self, log: &RunLog) -> io::Result<()> {
        let horizon = retention_horizon(log.start_time, self.keep_days);
        let mut logs: Vec<RunLog> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|l| horizon.is_none_or(|h| l.start_time >= h))
            .collect();
        logs.push(log.clone());

        let mut out = String::new();
        for entry in &logs {
            out.push_str(&serde_json::to_string(entry).map_err(io::Error::other)?);
            out.push('\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, out).await
    }

    /// Reads every record. Unparseable lines are skipped.
    pub async fn read_all(&self) -> io::Result<Vec<RunLog>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable run log line");
                    None
                }
            })
            .collect())
    }
}

/// Aggregate numbers over a window of runs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunStats {
    pub total_runs: usize,
    pub successful_runs: usize,
    /// Percentage, 0-100.
    pub success_rate: f64,
    pub new_articles: usize,
    pub avg_duration_seconds: f64,
    pub last_check: Option<DateTime<Utc>>,
}

impl RunStats {
    /// Computes statistics for runs started at or after `since`.
    pub fn compute(logs: &[RunLog], since: DateTime<Utc>) -> Self {
        let window: Vec<&RunLog> = logs.iter().filter(|l| l.start_time >= since).collect();
        if window.is_empty() {
            return Self::default();
        }

        let total_runs = window.len();
        let successful_runs = window.iter().filter(|l| l.status.is_success()).count();
        let durations: Vec<f64> = window.iter().filter_map(|l| l.duration_seconds).collect();
        let avg_duration_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Self {
            total_runs,
            successful_runs,
            success_rate: successful_runs as f64 * 100.0 / total_runs as f64,
            new_articles: window.iter().map(|l| l.new_articles).sum(),
            avg_duration_seconds,
            last_check: window.iter().map(|l| l.start_time).max(),
        }
    }
}
