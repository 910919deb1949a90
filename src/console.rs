//! Terminal output for the command-line entry point.
//!
//! Colors are used only when stdout is a terminal and `NO_COLOR` is unset.

use crate::run_log::{RunLog, RunStats, RunStatus};
use std::io::{self, IsTerminal};

/// ANSI style codes.
#[derive(Debug, Clone, Copy)]
pub enum Style {
    Bold,
    Dim,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    Gray,
}

impl Style {
    fn code(self) -> &'static str {
        match self {
            Style::Bold => "1",
            Style::Dim => "2",
            Style::Red => "31",
            Style::Green => "32",
            Style::Yellow => "33",
            Style::Blue => "34",
            Style::Magenta => "35",
            Style::Cyan => "36",
            Style::Gray => "90",
        }
    }
}

const RESET: &str = "\x1b[0m";

#[derive(Debug)]
pub struct Console {
    colors_enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let colors_enabled = std::env::var("NO_COLOR").is_err() && io::stdout().is_terminal();
        Self { colors_enabled }
    }

    pub fn with_colors(enabled: bool) -> Self {
        Self {
            colors_enabled: enabled,
        }
    }

    /// Applies ANSI styles to text if colors are enabled.
    pub fn style(&self, text: &str, styles: &[Style]) -> String {
        if !self.colors_enabled || styles.is_empty() {
            return text.to_string();
        }

        let codes: Vec<&str> = styles.iter().map(|s| s.code()).collect();
        format!("\x1b[{}m{}{}", codes.join(";"), text, RESET)
    }

    /// A bracketed label like `[INFO]`.
    pub fn label(&self, label: &str, color: Style) -> String {
        format!("[{}]", self.style(label, &[color, Style::Bold]))
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", self.label("INFO", Style::Blue), message);
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", self.label("OK", Style::Green), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", self.label("WARN", Style::Yellow), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", self.label("ERROR", Style::Red), message);
    }

    pub fn step(&self, message: &str) {
        println!("{} {}", self.label("STEP", Style::Cyan), message);
    }

    pub fn section(&self, message: &str) {
        println!();
        println!("{}", self.style(message, &[Style::Magenta, Style::Bold]));
    }

    pub fn muted(&self, text: &str) -> String {
        self.style(text, &[Style::Gray, Style::Dim])
    }

    pub fn count(&self, n: usize) -> String {
        self.style(&n.to_string(), &[Style::Green, Style::Bold])
    }

    fn status(&self, status: RunStatus) -> String {
        let color = match status {
            RunStatus::Success => Style::Green,
            RunStatus::PartialFailure => Style::Yellow,
            RunStatus::Failed | RunStatus::TimedOut => Style::Red,
        };
        self.style(&status.to_string(), &[color, Style::Bold])
    }

    /// Lines describing one finished run.
    pub fn run_summary_lines(&self, log: &RunLog) -> Vec<String> {
        let mut lines = vec![
            format!("Run {}", self.muted(&log.run_id.to_string())),
            format!("  Status:        {}", self.status(log.status)),
            format!(
                "  Pages:         {} fetched, {} failed",
                log.pages_fetched, log.pages_failed
            ),
            format!(
                "  Articles:      {} matched, {} new",
                self.count(log.articles_found),
                self.count(log.new_articles)
            ),
            format!(
                "  Messages:      {} sent, {} failed",
                log.messages_sent, log.messages_failed
            ),
        ];
        if log.entries_skipped > 0 {
            lines.push(format!("  Skipped:       {} malformed entries", log.entries_skipped));
        }
        if log.translations_failed > 0 {
            lines.push(format!(
                "  Translation:   {} titles fell back to source",
                log.translations_failed
            ));
        }
        if let Some(duration) = log.duration_seconds {
            lines.push(format!("  Duration:      {:.1}s", duration));
        }
        if let Some(message) = &log.error_message {
            lines.push(format!("  Error:         {}", message));
        }
        lines
    }

    pub fn run_summary(&self, log: &RunLog) {
        self.section("Run summary");
        for line in self.run_summary_lines(log) {
            println!("{}", line);
        }
    }

    /// Lines describing aggregate statistics over the last `days` days.
    pub fn stats_lines(&self, stats: &RunStats, days: u32) -> Vec<String> {
        let last_check = stats
            .last_check
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        vec![
            format!("Statistics for the last {} days", days),
            format!("  Total runs:    {}", self.count(stats.total_runs)),
            format!(
                "  Successful:    {} ({:.1}%)",
                stats.successful_runs, stats.success_rate
            ),
            format!("  New articles:  {}", self.count(stats.new_articles)),
            format!("  Avg duration:  {:.1}s", stats.avg_duration_seconds),
            format!("  Last check:    {}", last_check),
        ]
    }

    pub fn stats(&self, stats: &RunStats, days: u32) {
        self.section("Monitoring statistics");
        for line in self.stats_lines(stats, days) {
            println!("{}", line);
        }
    }
}
