//! Radio transcript feeds.
//!
//! Speech-to-text runs upstream of this crate: the transcription service
//! publishes one RSS feed per radio stream, each `<item>` carrying the
//! transcript of a captured segment in its `<description>`. Capturing a
//! stream therefore means fetching its feed and turning items into
//! [`Transcription`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::{RadioSource, normalize_whitespace};
use crate::config::RadioFeedConfig;
use crate::error::{AppError, AppResult};
use crate::models::Transcription;
use crate::retry::{FetchAsync, HttpFetch, RetryFetch};
use crate::utils::truncate_for_log;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    guid: Option<TextNode>,
    #[serde(rename = "pubDate", default)]
    pub_date: Option<String>,
    #[serde(rename = "itunes:duration", default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug)]
pub struct FeedRadioSource {
    feeds: Vec<RadioFeedConfig>,
    fetch: RetryFetch<HttpFetch>,
    concurrency: usize,
}

impl FeedRadioSource {
    pub fn new(feeds: Vec<RadioFeedConfig>, concurrency: usize, request_timeout: Duration) -> AppResult<Self> {
        for feed in &feeds {
            url::Url::parse(&feed.feed_url).map_err(|e| {
                AppError::validation(format!("stream '{}': bad feed_url: {e}", feed.name))
            })?;
        }
        let fetch = RetryFetch::new(HttpFetch::new(request_timeout)?, 3, Duration::from_secs(1));
        Ok(Self {
            feeds,
            fetch,
            concurrency: concurrency.max(1),
        })
    }

    #[instrument(level = "info", skip_all, fields(stream = %feed.name))]
    async fn capture_stream(&self, feed: &RadioFeedConfig) -> AppResult<Vec<Transcription>> {
        let xml = self.fetch.fetch(&feed.feed_url).await?;
        let items = parse_feed(&feed.name, &xml, Utc::now())?;
        info!(count = items.len(), "Captured transcripts");
        Ok(items)
    }
}

#[async_trait]
impl RadioSource for FeedRadioSource {
    async fn capture_radio_streams(&self) -> AppResult<Vec<Transcription>> {
        let results: Vec<(String, AppResult<Vec<Transcription>>)> = stream::iter(self.feeds.clone())
            .map(|feed| async move { (feed.name.clone(), self.capture_stream(&feed).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut transcriptions = Vec::new();
        let mut failures = Vec::new();
        for (stream, result) in results {
            match result {
                Ok(items) => transcriptions.extend(items),
                Err(e) => {
                    error!(%stream, error = %e, "Capture failed; skipping stream");
                    failures.push(format!("{stream}: {e}"));
                }
            }
        }

        if !self.feeds.is_empty() && failures.len() == self.feeds.len() {
            return Err(AppError::collaborator(format!(
                "every radio stream failed ({})",
                failures.join("; ")
            )));
        }
        Ok(transcriptions)
    }
}

/// Turn a transcript feed into transcriptions. Items without transcript text
/// are skipped; items without a parseable `pubDate` are stamped `now`.
fn parse_feed(stream: &str, xml: &str, now: DateTime<Utc>) -> AppResult<Vec<Transcription>> {
    let rss: Rss = quick_xml::de::from_str(xml).map_err(|e| {
        AppError::collaborator(format!(
            "stream '{stream}': unreadable feed ({e}): {}",
            truncate_for_log(xml, 120)
        ))
    })?;

    let mut out = Vec::new();
    for item in rss.channel.items {
        let text = normalize_whitespace(item.description.as_deref().unwrap_or_default());
        if text.is_empty() {
            debug!(title = ?item.title, "Feed item has no transcript; skipping");
            continue;
        }

        let captured_at = match item.pub_date.as_deref().map(DateTime::parse_from_rfc2822) {
            Some(Ok(ts)) => ts.with_timezone(&Utc),
            Some(Err(e)) => {
                warn!(error = %e, "Unparseable pubDate; using capture time");
                now
            }
            None => now,
        };
        let id = item
            .guid
            .as_ref()
            .map(|guid| guid.value.trim().to_string())
            .filter(|guid| !guid.is_empty())
            .unwrap_or_else(|| content_id(stream, &item, &text));

        out.push(Transcription {
            id,
            stream: stream.to_string(),
            text,
            duration_secs: item.duration.as_deref().and_then(parse_duration).unwrap_or(0),
            captured_at,
        });
    }
    Ok(out)
}

/// Id for an item without a guid, derived from what the feed published so
/// the same segment maps to the same id on every capture.
fn content_id(stream: &str, item: &FeedItem, text: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [
        stream,
        item.title.as_deref().unwrap_or_default(),
        item.pub_date.as_deref().unwrap_or_default(),
        text,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{stream}:{}", &digest[..16])
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS` into seconds. Values that overflow
/// are rejected.
fn parse_duration(raw: &str) -> Option<u64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.iter().try_fold(0u64, |acc, part| {
        acc.checked_mul(60)?.checked_add(part.parse::<u64>().ok()?)
    })
}
