//! Daily digest assembly.
//!
//! The builder reads a date's articles and transcriptions through the shared
//! cache (falling back to the store on a miss), orders both sets
//! chronologically and renders a Markdown document:
//!
//! ```text
//! # Digest for 2025-05-06
//!
//! - Articles: 2
//! - Radio transcripts: 1
//!
//! ## Articles
//! ### Council passes budget
//! ...
//! ## Radio transcripts
//! ### Kxyz at 07:00 UTC (2m 30s)
//! ...
//! ```
//!
//! The body is a pure function of the two input sets, so rebuilding a date
//! whose inputs did not change yields the same bytes.

use chrono::{NaiveDate, Utc};
use std::fmt::{self, Write};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::cache::{CacheStore, keys};
use crate::config::CacheTtls;
use crate::error::{AppError, AppResult};
use crate::models::{Article, DigestDocument, Transcription};
use crate::store::DigestStore;
use crate::utils::{slugify_title, today, upcase};

/// Characters of article content quoted under each headline.
const EXCERPT_CHARS: usize = 400;

pub struct DigestBuilder {
    cache: Arc<CacheStore>,
    store: Arc<dyn DigestStore>,
    ttls: CacheTtls,
}

impl DigestBuilder {
    pub fn new(cache: Arc<CacheStore>, store: Arc<dyn DigestStore>, ttls: CacheTtls) -> Self {
        Self { cache, store, ttls }
    }

    pub async fn articles_for(&self, date: NaiveDate) -> AppResult<Vec<Article>> {
        self.cache
            .get_or_load(&keys::articles(date), self.ttls.articles(), || {
                self.store.get_articles(date)
            })
            .await
    }

    pub async fn transcriptions_for(&self, date: NaiveDate) -> AppResult<Vec<Transcription>> {
        self.cache
            .get_or_load(&keys::transcriptions(date), self.ttls.transcriptions(), || {
                self.store.get_transcriptions(date)
            })
            .await
    }

    /// The stored digest for `date`, if one was built.
    pub async fn digest_for(&self, date: NaiveDate) -> AppResult<Option<DigestDocument>> {
        self.cache
            .get_or_load(&keys::digest(date), self.ttls.digest(), || {
                self.store.get_digest(date)
            })
            .await
    }

    /// Build, store and return the digest for `date`.
    ///
    /// Articles and transcriptions are read through the cache, ordered by
    /// timestamp (ties broken by id) and rendered to Markdown. The document
    /// replaces any earlier digest of the date in the store, and the cached
    /// `digest:{date}` entry is dropped afterwards.
    ///
    /// # Arguments
    ///
    /// * `date` - Local calendar date; must not be in the future
    ///
    /// # Returns
    ///
    /// The stored document, a validation error for a future date, or the
    /// store's error.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let doc = builder.build_for_date(today()).await?;
    /// println!("{}", doc.rendered_body);
    /// ```
    #[instrument(level = "info", skip(self))]
    pub async fn build_for_date(&self, date: NaiveDate) -> AppResult<DigestDocument> {
        if date > today() {
            return Err(AppError::validation(format!(
                "cannot build a digest for {date}: the date is in the future"
            )));
        }

        let (mut articles, mut transcriptions) =
            tokio::try_join!(self.articles_for(date), self.transcriptions_for(date))?;
        articles.sort_by(|a, b| a.scraped_at.cmp(&b.scraped_at).then_with(|| a.id.cmp(&b.id)));
        transcriptions.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let doc = DigestDocument {
            date,
            articles_count: articles.len(),
            transcriptions_count: transcriptions.len(),
            rendered_body: render_digest(date, &articles, &transcriptions),
            generated_at: Utc::now(),
        };

        self.store.save_digest(date, &doc).await?;
        self.cache.invalidate(&keys::digest(date));
        info!(
            %date,
            articles = doc.articles_count,
            transcriptions = doc.transcriptions_count,
            bytes = doc.rendered_body.len(),
            "Built digest"
        );
        Ok(doc)
    }
}

/// Render the Markdown body. Inputs must already be in display order.
pub fn render_digest(date: NaiveDate, articles: &[Article], transcriptions: &[Transcription]) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_digest(&mut out, date, articles, transcriptions);
    out
}

fn write_digest(
    out: &mut String,
    date: NaiveDate,
    articles: &[Article],
    transcriptions: &[Transcription],
) -> fmt::Result {
    writeln!(out, "# Digest for {date}\n")?;
    writeln!(out, "- Articles: {}", articles.len())?;
    writeln!(out, "- Radio transcripts: {}\n", transcriptions.len())?;

    writeln!(out, "## Articles\n")?;
    if articles.is_empty() {
        writeln!(out, "_No articles were collected for this date._\n")?;
    }
    for article in articles {
        writeln!(out, "### {}", article.title)?;
        let tag = article
            .source_tag()
            .map(|tag| format!("`{tag}` · "))
            .unwrap_or_default();
        writeln!(
            out,
            "<small>{}{} · {}</small>\n",
            tag,
            article.source,
            article.scraped_at.format("%H:%M UTC")
        )?;
        if !article.content.is_empty() {
            writeln!(out, "> {}\n", excerpt(&article.content, EXCERPT_CHARS))?;
        }
        writeln!(out, "[Read the full story]({})\n", article.url)?;
    }

    writeln!(out, "## Radio transcripts\n")?;
    if transcriptions.is_empty() {
        writeln!(out, "_No radio transcripts were captured for this date._\n")?;
    }
    for item in transcriptions {
        write!(
            out,
            "### {} at {}",
            upcase(&item.stream),
            item.captured_at.format("%H:%M UTC")
        )?;
        if item.duration_secs > 0 {
            write!(out, " ({})", format_duration(item.duration_secs))?;
        }
        writeln!(out, "\n")?;
        writeln!(out, "{}\n", item.text)?;
    }

    if !articles.is_empty() {
        writeln!(out, "## Contents\n")?;
        for article in articles {
            writeln!(out, "- [{}](#{})", article.title, slugify_title(&article.title))?;
        }
    }
    Ok(())
}

/// At most `max_chars` characters of `text`, with an ellipsis when cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}…", text[..end].trim_end()),
        None => text.to_string(),
    }
}

fn format_duration(secs: u64) -> String {
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, _) => format!("{h}h {m}m"),
    }
}
