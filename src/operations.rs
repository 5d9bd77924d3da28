//! The three job bodies registered with the [`JobManager`](crate::jobs::JobManager).
//!
//! Ingestion jobs group what the collaborator returned by local calendar
//! date and merge it into the stored collection for that date, so running a
//! scrape twice in one day never duplicates an article.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use itertools::Itertools;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::digest::DigestBuilder;
use crate::error::AppResult;
use crate::jobs::JobOperation;
use crate::models::{Article, Transcription};
use crate::scrapers::{ArticleSource, RadioSource};
use crate::store::DigestStore;
use crate::utils::today;

fn local_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Local).date_naive()
}

fn counts_by<'a, T>(items: &'a [T], key: impl Fn(&'a T) -> &'a str) -> BTreeMap<&'a str, usize> {
    items.iter().map(key).counts().into_iter().collect()
}

pub struct ScrapeArticlesOp {
    source: Arc<dyn ArticleSource>,
    store: Arc<dyn DigestStore>,
}

impl ScrapeArticlesOp {
    pub fn new(source: Arc<dyn ArticleSource>, store: Arc<dyn DigestStore>) -> Self {
        Self { source, store }
    }
}

#[async_trait]
impl JobOperation for ScrapeArticlesOp {
    #[instrument(level = "info", skip_all, name = "scrape_articles")]
    async fn run(&self) -> AppResult<Value> {
        let scraped = self.source.scrape_articles().await?;
        let per_source = counts_by(&scraped, |a| a.source.as_str());

        let mut by_date: HashMap<NaiveDate, Vec<Article>> = HashMap::new();
        for article in scraped.iter().cloned() {
            by_date.entry(local_date(article.scraped_at)).or_default().push(article);
        }

        let mut new_articles = 0;
        for (date, fresh) in by_date {
            let existing = self.store.get_articles(date).await?;
            let before = existing.len();
            let merged: Vec<Article> = existing
                .into_iter()
                .chain(fresh)
                .unique_by(|a| a.url.clone())
                .collect();
            new_articles += merged.len().saturating_sub(before);
            self.store.put_articles(date, &merged).await?;
            info!(%date, stored = merged.len(), added = merged.len().saturating_sub(before), "Merged articles");
        }

        Ok(json!({
            "total_articles": scraped.len(),
            "new_articles": new_articles,
            "sources": per_source,
        }))
    }
}

pub struct CaptureRadioOp {
    source: Arc<dyn RadioSource>,
    store: Arc<dyn DigestStore>,
}

impl CaptureRadioOp {
    pub fn new(source: Arc<dyn RadioSource>, store: Arc<dyn DigestStore>) -> Self {
        Self { source, store }
    }
}

#[async_trait]
impl JobOperation for CaptureRadioOp {
    #[instrument(level = "info", skip_all, name = "capture_radio")]
    async fn run(&self) -> AppResult<Value> {
        let captured = self.source.capture_radio_streams().await?;
        let per_stream = counts_by(&captured, |t| t.stream.as_str());

        let mut by_date: HashMap<NaiveDate, Vec<Transcription>> = HashMap::new();
        for item in captured.iter().cloned() {
            by_date.entry(local_date(item.captured_at)).or_default().push(item);
        }

        let mut new_transcriptions = 0;
        for (date, fresh) in by_date {
            let existing = self.store.get_transcriptions(date).await?;
            let before = existing.len();
            let merged: Vec<Transcription> = existing
                .into_iter()
                .chain(fresh)
                .unique_by(|t| t.id.clone())
                .collect();
            new_transcriptions += merged.len().saturating_sub(before);
            self.store.put_transcriptions(date, &merged).await?;
            info!(%date, stored = merged.len(), added = merged.len().saturating_sub(before), "Merged transcriptions");
        }

        Ok(json!({
            "total_transcriptions": captured.len(),
            "new_transcriptions": new_transcriptions,
            "streams": per_stream,
        }))
    }
}

/// Builds today's digest.
pub struct CreateDigestOp {
    builder: Arc<DigestBuilder>,
}

impl CreateDigestOp {
    pub fn new(builder: Arc<DigestBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl JobOperation for CreateDigestOp {
    async fn run(&self) -> AppResult<Value> {
        let doc = self.builder.build_for_date(today()).await?;
        Ok(json!({
            "date": doc.date,
            "articles_count": doc.articles_count,
            "transcriptions_count": doc.transcriptions_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::CacheTtls;
    use crate::error::AppError;
    use crate::store::MemoryStore;
    use chrono::Duration;

    struct FixedArticles(Vec<Article>);

    #[async_trait]
    impl ArticleSource for FixedArticles {
        async fn scrape_articles(&self) -> AppResult<Vec<Article>> {
            Ok(self.0.clone())
        }
    }

    struct FixedRadio(Vec<Transcription>);

    #[async_trait]
    impl RadioSource for FixedRadio {
        async fn capture_radio_streams(&self) -> AppResult<Vec<Transcription>> {
            Ok(self.0.clone())
        }
    }

    struct DownRadio;

    #[async_trait]
    impl RadioSource for DownRadio {
        async fn capture_radio_streams(&self) -> AppResult<Vec<Transcription>> {
            Err(AppError::collaborator("stream kxyz returned 502"))
        }
    }

    fn article(n: usize, source: &str, scraped_at: DateTime<Utc>) -> Article {
        let url = format!("https://text.{source}.org/story-{n}");
        Article {
            id: url.clone(),
            title: format!("Story {n}"),
            url,
            source: source.to_string(),
            scraped_at,
            content: "Body.".to_string(),
        }
    }

    fn transcription(id: &str, captured_at: DateTime<Utc>) -> Transcription {
        Transcription {
            id: id.to_string(),
            stream: "kxyz".to_string(),
            text: format!("Transcript {id}."),
            duration_secs: 60,
            captured_at,
        }
    }

    #[tokio::test]
    async fn test_scrape_stores_articles_by_date() {
        let now = Utc::now();
        let articles: Vec<Article> = (0..12)
            .map(|n| article(n, if n % 3 == 0 { "npr" } else { "cnn" }, now))
            .collect();
        let store = Arc::new(MemoryStore::new());
        let op = ScrapeArticlesOp::new(Arc::new(FixedArticles(articles)), store.clone());

        let result = op.run().await.unwrap();
        assert_eq!(result["total_articles"], 12);
        assert_eq!(result["new_articles"], 12);
        assert_eq!(result["sources"]["cnn"], 8);
        assert_eq!(result["sources"]["npr"], 4);
        assert_eq!(store.get_articles(local_date(now)).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_repeated_scrape_does_not_duplicate() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let first = ScrapeArticlesOp::new(
            Arc::new(FixedArticles(vec![article(1, "cnn", now), article(2, "cnn", now)])),
            store.clone(),
        );
        first.run().await.unwrap();

        let second = ScrapeArticlesOp::new(
            Arc::new(FixedArticles(vec![article(2, "cnn", now), article(3, "cnn", now)])),
            store.clone(),
        );
        let result = second.run().await.unwrap();
        assert_eq!(result["total_articles"], 2);
        assert_eq!(result["new_articles"], 1);

        let stored = store.get_articles(local_date(now)).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].title, "Story 1");
    }

    #[tokio::test]
    async fn test_capture_groups_by_date_and_dedupes() {
        let now = Utc::now();
        let yesterday = now - Duration::days(1);
        let store = Arc::new(MemoryStore::new());
        let op = CaptureRadioOp::new(
            Arc::new(FixedRadio(vec![
                transcription("a", now),
                transcription("a", now),
                transcription("b", yesterday),
            ])),
            store.clone(),
        );

        let result = op.run().await.unwrap();
        assert_eq!(result["total_transcriptions"], 3);
        assert_eq!(result["new_transcriptions"], 2);
        assert_eq!(result["streams"]["kxyz"], 3);
        assert_eq!(store.get_transcriptions(local_date(now)).await.unwrap().len(), 1);
        assert_eq!(store.get_transcriptions(local_date(yesterday)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collaborator_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        let op = CaptureRadioOp::new(Arc::new(DownRadio), store);
        let err = op.run().await.unwrap_err();
        assert_eq!(err.to_string(), "collaborator error: stream kxyz returned 502");
    }

    #[tokio::test]
    async fn test_create_digest_builds_today() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .put_articles(today(), &[article(1, "cnn", now)])
            .await
            .unwrap();
        let builder = Arc::new(DigestBuilder::new(
            Arc::new(CacheStore::new()),
            store.clone(),
            CacheTtls::default(),
        ));

        let result = CreateDigestOp::new(builder).run().await.unwrap();
        assert_eq!(result["date"], today().to_string());
        assert_eq!(result["articles_count"], 1);
        assert_eq!(result["transcriptions_count"], 0);
        assert!(store.get_digest(today()).await.unwrap().is_some());
    }
}
