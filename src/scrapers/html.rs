//! Configurable HTML article scraper.
//!
//! Each configured source names an index page and three CSS selectors:
//! links on the index page, the headline on an article page and the body
//! blocks on an article page. Relative links are resolved against the index
//! URL. This works well for text-only news sites whose markup is minimal and
//! consistent.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::{ArticleSource, normalize_whitespace};
use crate::config::ArticleSourceConfig;
use crate::error::{AppError, AppResult};
use crate::models::Article;
use crate::retry::{FetchAsync, HttpFetch, RetryFetch};

#[derive(Debug)]
pub struct HtmlArticleSource {
    sources: Vec<ArticleSourceConfig>,
    fetch: RetryFetch<HttpFetch>,
    concurrency: usize,
}

impl HtmlArticleSource {
    /// Build the scraper, rejecting sources with an invalid URL or selector.
    pub fn new(
        sources: Vec<ArticleSourceConfig>,
        concurrency: usize,
        request_timeout: Duration,
    ) -> AppResult<Self> {
        for source in &sources {
            Url::parse(&source.index_url).map_err(|e| {
                AppError::validation(format!("source '{}': bad index_url: {e}", source.name))
            })?;
            for selector in [
                &source.link_selector,
                &source.title_selector,
                &source.content_selector,
            ] {
                parse_selector(selector)?;
            }
        }

        let fetch = RetryFetch::new(HttpFetch::new(request_timeout)?, 3, Duration::from_secs(1));
        Ok(Self {
            sources,
            fetch,
            concurrency: concurrency.max(1),
        })
    }

    /// Discover article URLs from a source's index page.
    #[instrument(level = "info", skip_all, fields(source = %source.name))]
    async fn index_articles(&self, source: &ArticleSourceConfig) -> AppResult<Vec<String>> {
        let html = self.fetch.fetch(&source.index_url).await?;
        let urls = parse_index(&html, &source.index_url, &source.link_selector)?;
        info!(count = urls.len(), index = %source.index_url, "Indexed article URLs");
        debug!(urls = ?urls, "Article URLs");
        Ok(urls)
    }

    /// Fetch all articles of one source concurrently. Failed fetches are
    /// logged and skipped without failing the batch.
    #[instrument(level = "info", skip_all, fields(source = %source.name))]
    async fn fetch_articles(&self, source: &ArticleSourceConfig, urls: Vec<String>) -> Vec<Article> {
        let articles: Vec<Article> = stream::iter(urls)
            .map(|url| async move {
                match self.fetch_article(source, &url).await {
                    Ok(Some(article)) => Some(article),
                    Ok(None) => {
                        warn!(%url, "Article page produced no content");
                        None
                    }
                    Err(e) => {
                        error!(%url, error = %e, "Article fetch failed");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|article| async move { article })
            .collect()
            .await;

        info!(count = articles.len(), "Fetched article contents");
        articles
    }

    async fn fetch_article(&self, source: &ArticleSourceConfig, url: &str) -> AppResult<Option<Article>> {
        let body = self.fetch.fetch(url).await?;
        let Some((title, content)) =
            parse_article(&body, &source.title_selector, &source.content_selector)?
        else {
            return Ok(None);
        };

        debug!(%url, bytes = content.len(), "Parsed article");
        Ok(Some(Article {
            id: url.to_string(),
            title,
            url: url.to_string(),
            source: source.name.clone(),
            scraped_at: Utc::now(),
            content,
        }))
    }
}

#[async_trait]
impl ArticleSource for HtmlArticleSource {
    async fn scrape_articles(&self) -> AppResult<Vec<Article>> {
        let mut articles = Vec::new();
        let mut failures = Vec::new();

        for source in &self.sources {
            match self.index_articles(source).await {
                Ok(urls) => articles.extend(self.fetch_articles(source, urls).await),
                Err(e) => {
                    error!(source = %source.name, error = %e, "Indexing failed; skipping source");
                    failures.push(format!("{}: {e}", source.name));
                }
            }
        }

        if !self.sources.is_empty() && failures.len() == self.sources.len() {
            return Err(AppError::collaborator(format!(
                "every article source failed ({})",
                failures.join("; ")
            )));
        }
        Ok(articles)
    }
}

fn parse_selector(selector: &str) -> AppResult<Selector> {
    Selector::parse(selector)
        .map_err(|e| AppError::validation(format!("bad CSS selector '{selector}': {e}")))
}

/// Absolute, de-duplicated article URLs linked from an index page.
fn parse_index(html: &str, base: &str, link_selector: &str) -> AppResult<Vec<String>> {
    let base = Url::parse(base)
        .map_err(|e| AppError::validation(format!("bad index url '{base}': {e}")))?;
    let selector = parse_selector(link_selector)?;
    let document = Html::parse_document(html);

    let urls = document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|url| url.to_string())
        .unique()
        .collect();
    Ok(urls)
}

/// Headline and body text of an article page, or `None` when the body
/// selector matched nothing.
fn parse_article(
    html: &str,
    title_selector: &str,
    content_selector: &str,
) -> AppResult<Option<(String, String)>> {
    let title_selector = parse_selector(title_selector)?;
    let content_selector = parse_selector(content_selector)?;
    let document = Html::parse_document(html);

    let content = document
        .select(&content_selector)
        .map(|element| normalize_whitespace(&element.text().collect::<Vec<_>>().join(" ")))
        .filter(|block| !block.is_empty())
        .join("\n\n");
    if content.is_empty() {
        return Ok(None);
    }

    let title = document
        .select(&title_selector)
        .next()
        .map(|element| normalize_whitespace(&element.text().collect::<String>()))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    Ok(Some((title, content)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
        <html><body>
          <div class="card--lite"><a href="/2025/05/06/politics/budget">Budget</a></div>
          <div class="card--lite"><a href="/2025/05/06/weather/storm">Storm</a></div>
          <div class="card--lite"><a href="/2025/05/06/politics/budget">Budget again</a></div>
          <div class="card--lite"><a href="mailto:tips@example.com">Tips</a></div>
          <div class="other"><a href="/ignored">Ignored</a></div>
        </body></html>
    "#;

    const ARTICLE: &str = r#"
        <html><body>
          <h2 class="headline--lite">  Council passes
             budget </h2>
          <p class="paragraph--lite">The council voted 7-2.</p>
          <p class="paragraph--lite">   </p>
          <p class="paragraph--lite">Spending rises   4%.</p>
        </body></html>
    "#;

    #[test]
    fn test_parse_index_resolves_and_dedupes() {
        let urls = parse_index(INDEX, "https://lite.example.com", ".card--lite a[href]").unwrap();
        assert_eq!(
            urls,
            vec![
                "https://lite.example.com/2025/05/06/politics/budget".to_string(),
                "https://lite.example.com/2025/05/06/weather/storm".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_article() {
        let (title, content) = parse_article(ARTICLE, ".headline--lite", ".paragraph--lite")
            .unwrap()
            .unwrap();
        assert_eq!(title, "Council passes budget");
        assert_eq!(content, "The council voted 7-2.\n\nSpending rises 4%.");
    }

    #[test]
    fn test_parse_article_without_body() {
        let parsed = parse_article("<html><h2>Only a title</h2></html>", "h2", "p").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_bad_selector_is_rejected() {
        let source = ArticleSourceConfig {
            name: "broken".to_string(),
            index_url: "https://example.com".to_string(),
            link_selector: "a[[".to_string(),
            title_selector: "h1".to_string(),
            content_selector: "p".to_string(),
        };
        let err = HtmlArticleSource::new(vec![source], 4, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
