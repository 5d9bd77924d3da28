//! Command-line interface definitions for Awful Digest.
//!
//! Global options can be given as flags or through environment variables.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the Awful Digest orchestrator.
///
/// # Examples
///
/// ```sh
/// # Run the scheduler until Ctrl-C
/// awful_digest --config ./digest.yaml serve
///
/// # Scrape once and wait for the result
/// awful_digest run scrape_articles
///
/// # Rebuild an earlier digest
/// awful_digest digest --date 2025-05-06
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a config.yaml file
    #[arg(short, long, env = "AWFUL_DIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the config file
    #[arg(short, long, env = "AWFUL_DIGEST_DATA_DIR")]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler until interrupted
    Serve,

    /// Start a job and poll its status until it finishes
    Run {
        /// scrape_articles, capture_radio or create_digest
        job: String,

        /// Seconds between status polls
        #[arg(long, default_value_t = 2)]
        poll_interval_secs: u64,
    },

    /// Build the digest for a date (today by default) in the foreground
    Digest {
        /// Date as YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },

    /// Run a scheduled task now, outside its cron schedule
    RunTask {
        /// Task id from the schedule, e.g. daily-digest
        task_id: String,
    },

    /// Print the result of a job's last finished run (once)
    Ack {
        job: String,
    },

    /// Print the stored articles of a date as JSON
    Articles {
        #[arg(long)]
        date: Option<String>,
    },

    /// Print the stored radio transcripts of a date as JSON
    Transcripts {
        #[arg(long)]
        date: Option<String>,
    },

    /// Print a previously built digest
    Show {
        #[arg(long)]
        date: Option<String>,
    },

    /// Print dashboard, job and scheduler status as JSON
    Status,

    /// Clear every cached entry
    Invalidate,
}
