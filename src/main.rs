//! Newswatch CLI - keyword monitor for a members-only news site.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use newswatch::config::Config;
use newswatch::console::Console;
use newswatch::orchestrator::{Orchestrator, RunMode};
use newswatch::run_log::{RunLogWriter, RunStats};
use newswatch::utils::retention_horizon;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Watches a news listing for keywords and emails new matches.
#[derive(Parser, Debug)]
#[command(name = "newswatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run once (`test`) or on the configured interval (`daemon`).
    #[arg(long, value_enum, default_value = "test")]
    mode: RunMode,

    /// Path to the config file. Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print run statistics and exit.
    #[arg(long)]
    stats: bool,

    /// Window for `--stats`, in days.
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(1..))]
    days: u32,

    /// Send a test email and exit.
    #[arg(long)]
    test_email: bool,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let console = Console::new();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    console.step("Loading configuration...");
    let first_run = !config_path.exists();
    let config = Config::load_from(&config_path).context("Failed to load configuration")?;

    if first_run {
        console.warning(&format!(
            "Created a default configuration. Please edit: {}",
            config_path.display()
        ));
        console.info("Set site.url, site.keywords and the email settings, then run again.");
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(&config.logging.level);
    config.validate().context("Invalid configuration")?;
    info!(path = %config_path.display(), "Configuration loaded");
    console.success("Configuration loaded");

    if args.stats {
        let writer = RunLogWriter::new(
            config.state.run_log_path.clone(),
            config.state.keep_records_days,
        );
        let logs = writer
            .read_all()
            .await
            .with_context(|| format!("Failed to read {}", writer.path().display()))?;
        let since = retention_horizon(Utc::now(), args.days).unwrap_or(DateTime::<Utc>::MIN_UTC);
        console.stats(&RunStats::compute(&logs, since), args.days);
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = Orchestrator::from_config(config)?;

    if args.test_email {
        return match orchestrator.send_test_email().await {
            Ok(()) => {
                console.success("Test email sent");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                console.error(&format!("Test email failed: {}", e));
                Ok(ExitCode::FAILURE)
            }
        };
    }

    console.step(match args.mode {
        RunMode::Test => "Running the pipeline once...",
        RunMode::Daemon => "Starting daemon mode (Ctrl-C to stop)...",
    });
    match orchestrator.run(args.mode).await {
        Ok(log) => {
            console.run_summary(&log);
            if args.mode == RunMode::Test && !log.status.is_success() {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            console.error(&format!("{:#}", e));
            Ok(ExitCode::FAILURE)
        }
    }
}
