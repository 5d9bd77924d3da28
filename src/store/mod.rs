//! Date-indexed persistence for articles, transcriptions and digests.
//!
//! The orchestrator only needs a document store with one collection per
//! kind and one document per date. Two implementations ship with the crate:
//!
//! - [`json::JsonFileStore`]: JSON files under a data directory
//! - [`memory::MemoryStore`]: process-local maps, used by tests
//!
//! ```text
//! data_dir/
//! ├── articles/2025-05-06.json
//! ├── transcriptions/2025-05-06.json
//! └── digests/2025-05-06.json
//! ```

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::models::{Article, DigestDocument, Transcription};

pub mod json;
#[cfg(test)]
pub mod memory;

pub use json::JsonFileStore;
#[cfg(test)]
pub use memory::MemoryStore;

/// Totals across every stored date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreTotals {
    pub articles: usize,
    pub transcriptions: usize,
    pub digests: usize,
}

#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Articles stored for `date`; empty when nothing was scraped that day.
    async fn get_articles(&self, date: NaiveDate) -> AppResult<Vec<Article>>;

    /// Replace the article collection for `date`.
    async fn put_articles(&self, date: NaiveDate, articles: &[Article]) -> AppResult<()>;

    async fn get_transcriptions(&self, date: NaiveDate) -> AppResult<Vec<Transcription>>;

    async fn put_transcriptions(&self, date: NaiveDate, items: &[Transcription]) -> AppResult<()>;

    /// Store the digest for `date`, overwriting any previous one.
    async fn save_digest(&self, date: NaiveDate, doc: &DigestDocument) -> AppResult<()>;

    async fn get_digest(&self, date: NaiveDate) -> AppResult<Option<DigestDocument>>;

    async fn totals(&self) -> AppResult<StoreTotals>;
}
