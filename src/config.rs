//! Runtime configuration loaded from an optional YAML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration with the standard daily schedule and no ingestion
//! sources.
//!
//! ```yaml
//! data_dir: /var/lib/awful_digest
//! job_deadline_secs: 1800
//! cache:
//!   articles_ttl_secs: 300
//!   digest_ttl_secs: 900
//! schedule:
//!   - id: morning-scrape
//!     name: Morning article scrape
//!     cron: "0 0 6 * * *"
//!     job: scrape_articles
//! sources:
//!   - name: cnn
//!     index_url: https://lite.cnn.com
//!     link_selector: ".card--lite a[href]"
//!     title_selector: ".headline--lite"
//!     content_selector: ".article--lite"
//! radio_feeds:
//!   - name: kxyz
//!     feed_url: https://transcripts.example.org/kxyz.rss
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::models::JobName;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DigestConfig {
    pub data_dir: String,
    /// How often the scheduler checks for due tasks.
    pub tick_interval_secs: u64,
    /// Soft deadline after which a running job is marked failed.
    pub job_deadline_secs: u64,
    /// Number of scheduler history entries retained.
    pub history_capacity: usize,
    pub request_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub cache: CacheTtls,
    pub schedule: Vec<ScheduleEntry>,
    pub sources: Vec<ArticleSourceConfig>,
    pub radio_feeds: Vec<RadioFeedConfig>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            tick_interval_secs: 30,
            job_deadline_secs: 30 * 60,
            history_capacity: 50,
            request_timeout_secs: 20,
            fetch_concurrency: 8,
            cache: CacheTtls::default(),
            schedule: default_schedule(),
            sources: Vec::new(),
            radio_feeds: Vec::new(),
        }
    }
}

impl DigestConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-domain cache lifetimes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheTtls {
    pub articles_ttl_secs: u64,
    pub transcriptions_ttl_secs: u64,
    pub digest_ttl_secs: u64,
    pub dashboard_ttl_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            articles_ttl_secs: 5 * 60,
            transcriptions_ttl_secs: 5 * 60,
            digest_ttl_secs: 15 * 60,
            dashboard_ttl_secs: 60,
        }
    }
}

impl CacheTtls {
    pub fn articles(&self) -> Duration {
        Duration::from_secs(self.articles_ttl_secs)
    }

    pub fn transcriptions(&self) -> Duration {
        Duration::from_secs(self.transcriptions_ttl_secs)
    }

    pub fn digest(&self) -> Duration {
        Duration::from_secs(self.digest_ttl_secs)
    }

    pub fn dashboard(&self) -> Duration {
        Duration::from_secs(self.dashboard_ttl_secs)
    }
}

/// A scheduled task as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub name: String,
    /// Six-field cron expression, `sec min hour day-of-month month day-of-week`,
    /// evaluated in local time.
    pub cron: String,
    pub job: JobName,
}

/// An HTML news source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArticleSourceConfig {
    pub name: String,
    pub index_url: String,
    pub link_selector: String,
    pub title_selector: String,
    pub content_selector: String,
}

/// A radio stream's transcript feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RadioFeedConfig {
    pub name: String,
    pub feed_url: String,
}

fn default_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            id: "morning-scrape".to_string(),
            name: "Morning article scrape".to_string(),
            cron: "0 0 6 * * *".to_string(),
            job: JobName::ScrapeArticles,
        },
        ScheduleEntry {
            id: "morning-radio".to_string(),
            name: "Morning radio capture".to_string(),
            cron: "0 15 6 * * *".to_string(),
            job: JobName::CaptureRadio,
        },
        ScheduleEntry {
            id: "daily-digest".to_string(),
            name: "Daily digest".to_string(),
            cron: "0 0 7 * * *".to_string(),
            job: JobName::CreateDigest,
        },
    ]
}

pub fn parse_config(yaml: &str) -> AppResult<DigestConfig> {
    if yaml.trim().is_empty() {
        return Ok(DigestConfig::default());
    }
    serde_yaml::from_str(yaml).map_err(|e| AppError::validation(format!("invalid config: {e}")))
}

/// Load the configuration file, or the defaults when no path is given.
#[instrument(level = "info")]
pub async fn load_config(path: Option<&Path>) -> AppResult<DigestConfig> {
    let Some(path) = path else {
        info!("No config file given; using defaults");
        return Ok(DigestConfig::default());
    };

    let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::validation(format!("cannot read config {}: {e}", path.display()))
    })?;
    let config = parse_config(&yaml)?;
    info!(
        path = %path.display(),
        tasks = config.schedule.len(),
        sources = config.sources.len(),
        radio_feeds = config.radio_feeds.len(),
        "Loaded configuration"
    );
    Ok(config)
}
