//! JSON file persistence with a date-based directory structure.
//!
//! Each collection is a directory and each date a single JSON document:
//! `{data_dir}/{collection}/{date}.json`. Documents are written to a
//! temporary sibling first and renamed into place, so a reader never sees a
//! partially written file.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, error, info, instrument};

use super::{DigestStore, StoreTotals};
use crate::error::AppResult;
use crate::models::{Article, DigestDocument, Transcription};

const ARTICLES: &str = "articles";
const TRANSCRIPTIONS: &str = "transcriptions";
const DIGESTS: &str = "digests";

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, collection: &str, date: NaiveDate) -> PathBuf {
        self.root.join(collection).join(format!("{date}.json"))
    }

    #[instrument(level = "debug", skip(self), fields(root = %self.root.display()))]
    async fn read_document<T: DeserializeOwned>(
        &self,
        collection: &str,
        date: NaiveDate,
    ) -> AppResult<Option<T>> {
        let path = self.document_path(collection, date);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No document for date");
                Ok(None)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read document");
                Err(e.into())
            }
        }
    }

    #[instrument(level = "info", skip(self, value), fields(root = %self.root.display()))]
    async fn write_document<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        date: NaiveDate,
        value: &T,
    ) -> AppResult<()> {
        let dir = self.root.join(collection);
        if let Err(e) = fs::create_dir_all(&dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create collection dir");
            return Err(e.into());
        }

        let json = serde_json::to_vec_pretty(value)?;
        let path = self.document_path(collection, date);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        info!(path = %path.display(), "Wrote JSON document");
        Ok(())
    }

    /// Every readable document of a collection. A missing collection
    /// directory is an empty collection.
    async fn documents(&self, collection: &str) -> AppResult<Vec<PathBuf>> {
        let dir = self.root.join(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    async fn count_items(&self, collection: &str) -> AppResult<usize> {
        let mut total = 0;
        for path in self.documents(collection).await? {
            let bytes = fs::read(&path).await?;
            let items: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;
            total += items.len();
        }
        Ok(total)
    }
}

#[async_trait]
impl DigestStore for JsonFileStore {
    async fn get_articles(&self, date: NaiveDate) -> AppResult<Vec<Article>> {
        Ok(self.read_document(ARTICLES, date).await?.unwrap_or_default())
    }

    async fn put_articles(&self, date: NaiveDate, articles: &[Article]) -> AppResult<()> {
        self.write_document(ARTICLES, date, articles).await
    }

    async fn get_transcriptions(&self, date: NaiveDate) -> AppResult<Vec<Transcription>> {
        Ok(self
            .read_document(TRANSCRIPTIONS, date)
            .await?
            .unwrap_or_default())
    }

    async fn put_transcriptions(&self, date: NaiveDate, items: &[Transcription]) -> AppResult<()> {
        self.write_document(TRANSCRIPTIONS, date, items).await
    }

    async fn save_digest(&self, date: NaiveDate, doc: &DigestDocument) -> AppResult<()> {
        self.write_document(DIGESTS, date, doc).await
    }

    async fn get_digest(&self, date: NaiveDate) -> AppResult<Option<DigestDocument>> {
        self.read_document(DIGESTS, date).await
    }

    async fn totals(&self) -> AppResult<StoreTotals> {
        Ok(StoreTotals {
            articles: self.count_items(ARTICLES).await?,
            transcriptions: self.count_items(TRANSCRIPTIONS).await?,
            digests: self.documents(DIGESTS).await?.len(),
        })
    }
}
