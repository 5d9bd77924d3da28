//! Process-local [`DigestStore`], used by tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{DigestStore, StoreTotals};
use crate::error::{AppError, AppResult};
use crate::models::{Article, DigestDocument, Transcription};

#[derive(Debug, Default)]
struct Collections {
    articles: BTreeMap<NaiveDate, Vec<Article>>,
    transcriptions: BTreeMap<NaiveDate, Vec<Transcription>>,
    digests: BTreeMap<NaiveDate, DigestDocument>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
    /// When set, every call fails with this message.
    failure: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, or clear the failure with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }

    fn check(&self) -> AppResult<()> {
        match self.failure.lock().as_ref() {
            Some(msg) => Err(AppError::collaborator(msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DigestStore for MemoryStore {
    async fn get_articles(&self, date: NaiveDate) -> AppResult<Vec<Article>> {
        self.check()?;
        Ok(self.inner.lock().articles.get(&date).cloned().unwrap_or_default())
    }

    async fn put_articles(&self, date: NaiveDate, articles: &[Article]) -> AppResult<()> {
        self.check()?;
        self.inner.lock().articles.insert(date, articles.to_vec());
        Ok(())
    }

    async fn get_transcriptions(&self, date: NaiveDate) -> AppResult<Vec<Transcription>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .transcriptions
            .get(&date)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_transcriptions(&self, date: NaiveDate, items: &[Transcription]) -> AppResult<()> {
        self.check()?;
        self.inner.lock().transcriptions.insert(date, items.to_vec());
        Ok(())
    }

    async fn save_digest(&self, date: NaiveDate, doc: &DigestDocument) -> AppResult<()> {
        self.check()?;
        self.inner.lock().digests.insert(date, doc.clone());
        Ok(())
    }

    async fn get_digest(&self, date: NaiveDate) -> AppResult<Option<DigestDocument>> {
        self.check()?;
        Ok(self.inner.lock().digests.get(&date).cloned())
    }

    async fn totals(&self) -> AppResult<StoreTotals> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(StoreTotals {
            articles: inner.articles.values().map(Vec::len).sum(),
            transcriptions: inner.transcriptions.values().map(Vec::len).sum(),
            digests: inner.digests.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 6).unwrap()
    }

    #[tokio::test]
    async fn test_missing_date_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.get_articles(date()).await.unwrap().is_empty());
        assert!(store.get_digest(date()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_totals_span_dates() {
        let store = MemoryStore::new();
        let t = Transcription {
            id: "t1".to_string(),
            stream: "kxyz".to_string(),
            text: "hello".to_string(),
            duration_secs: 30,
            captured_at: Utc.with_ymd_and_hms(2025, 5, 6, 7, 0, 0).unwrap(),
        };
        store.put_transcriptions(date(), &[t.clone()]).await.unwrap();
        store
            .put_transcriptions(date().succ_opt().unwrap(), &[t.clone(), t])
            .await
            .unwrap();

        let totals = store.totals().await.unwrap();
        assert_eq!(totals.transcriptions, 3);
        assert_eq!(totals.articles, 0);
    }

    #[tokio::test]
    async fn test_fail_with_surfaces_collaborator_error() {
        let store = MemoryStore::new();
        store.fail_with(Some("connection refused"));
        let err = store.get_articles(date()).await.unwrap_err();
        assert!(matches!(err, AppError::Collaborator(ref m) if m == "connection refused"));

        store.fail_with(None);
        assert!(store.get_articles(date()).await.is_ok());
    }
}
