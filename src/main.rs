//! # Awful Digest
//!
//! A news-and-radio digest orchestrator. Background jobs scrape articles
//! from text-only news sources and capture radio transcripts; a daily job
//! merges both into a Markdown digest. Reads go through a TTL cache that each
//! job invalidates when it finishes.
//!
//! ## Usage
//!
//! ```sh
//! awful_digest --config ./digest.yaml serve
//! awful_digest run capture_radio
//! awful_digest status
//! ```
//!
//! ## Architecture
//!
//! 1. **Scheduler**: cron tasks dispatch jobs on a fixed tick
//! 2. **Jobs**: single-flight runs with pollable status and a soft deadline
//! 3. **Store**: date-indexed JSON documents under the data directory
//! 4. **Digest**: chronological merge of a date's articles and transcripts

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cache;
mod cli;
mod config;
mod digest;
mod error;
mod jobs;
mod models;
mod operations;
mod orchestrator;
mod retry;
mod scheduler;
mod scrapers;
mod store;
mod utils;

use cli::{Cli, Command};
use models::{JobState, StartOutcome};
use orchestrator::Orchestrator;
use scrapers::{FeedRadioSource, HtmlArticleSource};
use store::JsonFileStore;
use utils::{ensure_writable_dir, parse_date, today};

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args.config, ?args.data_dir, ?args.command, "Parsed CLI arguments");

    let mut config = config::load_config(args.config.as_deref()).await?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let data_dir = PathBuf::from(&config.data_dir);
    if let Err(e) = ensure_writable_dir(&data_dir).await {
        error!(
            path = %data_dir.display(),
            error = %e,
            "Data directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let articles = HtmlArticleSource::new(
        config.sources.clone(),
        config.fetch_concurrency,
        config.request_timeout(),
    )?;
    let radio = FeedRadioSource::new(
        config.radio_feeds.clone(),
        config.fetch_concurrency,
        config.request_timeout(),
    )?;
    let orchestrator = Orchestrator::init(
        &config,
        Arc::new(JsonFileStore::new(data_dir)),
        Arc::new(articles),
        Arc::new(radio),
    )?;

    match args.command {
        Command::Serve => {
            orchestrator.start_scheduler();
            info!("Serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Interrupt received");
            orchestrator.shutdown().await;
        }
        Command::Run {
            job,
            poll_interval_secs,
        } => {
            let outcome: StartOutcome = orchestrator.trigger(&job)?;
            info!(message = %outcome.message, "Start requested");
            if let Err(e) = outcome.into_result() {
                warn!(kind = e.kind(), error = %e, "Start rejected");
                return Err(e.into());
            }

            let mut poll = tokio::time::interval(Duration::from_secs(poll_interval_secs.max(1)));
            let record = loop {
                poll.tick().await;
                let record = orchestrator.job_status(&job)?;
                if record.state.is_terminal() {
                    break record;
                }
                debug!(%job, "Still running");
            };

            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.state == JobState::Failed {
                let reason = record.error.unwrap_or_else(|| "unknown error".to_string());
                return Err(format!("{job} failed: {reason}").into());
            }
        }
        Command::Digest { date } => {
            let date = match date {
                Some(raw) => parse_date(&raw)?,
                None => today(),
            };
            let doc = orchestrator.build_digest(date).await?;
            println!("{}", doc.rendered_body);
        }
        Command::RunTask { task_id } => {
            let outcome = orchestrator.run_task(&task_id)?;
            println!("{}", outcome.into_result()?);
        }
        Command::Ack { job } => match orchestrator.acknowledge(&job)? {
            Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            None => println!("No unacknowledged result for {job}"),
        },
        Command::Articles { date } => {
            let date = date.unwrap_or_else(|| today().to_string());
            let articles = orchestrator.articles_for(&date).await?;
            println!("{}", serde_json::to_string_pretty(&articles)?);
        }
        Command::Transcripts { date } => {
            let date = date.unwrap_or_else(|| today().to_string());
            let items = orchestrator.transcriptions_for(&date).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::Show { date } => {
            let date = date.unwrap_or_else(|| today().to_string());
            match orchestrator.digest_for(&date).await? {
                Some(doc) => println!("{}", doc.rendered_body),
                None => println!("No digest stored for {date}"),
            }
        }
        Command::Status => {
            let report = orchestrator.status_report().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Invalidate => {
            let removed = orchestrator.invalidate_cache();
            println!("Removed {removed} cache entries");
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    Ok(())
}
