//! Ingestion collaborators invoked from inside background jobs.
//!
//! The orchestrator only depends on the two traits below. The crate ships
//! one configurable implementation of each:
//!
//! | Trait | Implementation | Method |
//! |-------|----------------|--------|
//! | [`ArticleSource`] | [`html::HtmlArticleSource`] | index page + CSS selectors |
//! | [`RadioSource`] | [`radio::FeedRadioSource`] | RSS transcript feeds |
//!
//! Both follow the same two-phase pattern: discover what is available, then
//! fetch it concurrently, logging and skipping individual failures. A call
//! only fails as a whole when every configured source failed.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AppResult;
use crate::models::{Article, Transcription};

pub mod html;
pub mod radio;

pub use html::HtmlArticleSource;
pub use radio::FeedRadioSource;

#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn scrape_articles(&self) -> AppResult<Vec<Article>>;
}

#[async_trait]
pub trait RadioSource: Send + Sync {
    async fn capture_radio_streams(&self) -> AppResult<Vec<Transcription>>;
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Collapse runs of whitespace (including newlines left by markup) into
/// single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a \n\n b\tc  "), "a b c");
        assert_eq!(normalize_whitespace(""), "");
    }
}
