//! Data models shared by the cache, the job manager, the scheduler and the
//! digest builder.
//!
//! - [`Article`] and [`Transcription`]: ingested items, keyed by date
//! - [`DigestDocument`]: the merged daily output, one per date
//! - [`JobName`], [`JobState`], [`JobRecord`], [`StartOutcome`]: background job
//!   bookkeeping exposed to polling clients
//! - [`ExecutionLogEntry`]: one line of scheduler history

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// A scraped news article.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Article {
    /// Stable identifier; scrapers use the canonical URL.
    pub id: String,
    pub title: String,
    pub url: String,
    /// Name of the configured source that produced the article.
    pub source: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
}

impl Article {
    /// Extract the domain name (before .com/.org/etc) from the article URL.
    /// For example: "https://lite.cnn.com/article" -> "cnn"
    pub fn source_tag(&self) -> Option<String> {
        let parsed = url::Url::parse(&self.url).ok()?;
        let host = parsed.host_str()?;
        let parts: Vec<&str> = host.split('.').collect();
        if parts.len() >= 2 {
            Some(parts[parts.len() - 2].to_string())
        } else {
            None
        }
    }
}

/// A transcript of one radio broadcast segment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Transcription {
    pub id: String,
    /// Name of the radio stream the segment was captured from.
    pub stream: String,
    pub text: String,
    #[serde(default)]
    pub duration_secs: u64,
    pub captured_at: DateTime<Utc>,
}

/// The digest assembled for a single date.
///
/// `rendered_body` depends only on the article and transcription sets, so
/// rebuilding with unchanged inputs produces the same bytes. `generated_at`
/// is the only field that moves between rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DigestDocument {
    pub date: NaiveDate,
    pub articles_count: usize,
    pub transcriptions_count: usize,
    pub rendered_body: String,
    pub generated_at: DateTime<Utc>,
}

/// The fixed set of background operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    ScrapeArticles,
    CaptureRadio,
    CreateDigest,
}

impl JobName {
    pub const ALL: [JobName; 3] = [
        JobName::ScrapeArticles,
        JobName::CaptureRadio,
        JobName::CreateDigest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::ScrapeArticles => "scrape_articles",
            JobName::CaptureRadio => "capture_radio",
            JobName::CreateDigest => "create_digest",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        JobName::ALL
            .into_iter()
            .find(|job| job.as_str() == s.trim())
            .ok_or_else(|| {
                AppError::validation(format!(
                    "unknown job '{}' (expected one of: {})",
                    s,
                    JobName::ALL.map(|j| j.as_str()).join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    /// `succeeded` and `failed` stay put until the next accepted start.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Status snapshot of one job, as returned to polling clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobRecord {
    pub job: JobName,
    pub state: JobState,
    /// Number of accepted starts so far; 0 while the job has never run.
    pub run: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub result_consumed: bool,
}

impl JobRecord {
    pub fn idle(job: JobName) -> Self {
        Self {
            job,
            state: JobState::Idle,
            run: 0,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            result_consumed: false,
        }
    }
}

/// Answer to a start request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StartOutcome {
    pub accepted: bool,
    pub message: String,
}

impl StartOutcome {
    /// Turn a rejected start into [`AppError::Conflict`].
    pub fn into_result(self) -> AppResult<String> {
        if self.accepted {
            Ok(self.message)
        } else {
            Err(AppError::Conflict(self.message))
        }
    }
}

/// One entry of the scheduler's execution history.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutionLogEntry {
    pub job: JobName,
    /// Scheduled task that dispatched the run.
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Set when the dispatch was rejected because the job was already running.
    #[serde(default)]
    pub skipped: bool,
    pub details: String,
}
