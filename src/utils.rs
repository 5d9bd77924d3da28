//! Utility functions for string manipulation, dates and file system checks.

use chrono::{Local, NaiveDate};
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (on a character boundary)
/// with an ellipsis and byte count indicator appended.
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(+{} bytes)", &s[..end], s.len() - end)
}

/// Convert a title to a URL-friendly slug for Markdown anchors.
///
/// ```ignore
/// assert_eq!(slugify_title("Hello World"), "hello-world");
/// assert_eq!(slugify_title("Test-Article!"), "test-article");
/// ```
pub fn slugify_title(title: &str) -> String {
    title
        .to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ' && c != '-', "")
        .replace(' ', "-")
}

/// Capitalize the first character of a string ("kxyz" -> "Kxyz").
pub fn upcase(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
    }
}

/// Today's date in local time; digests are grouped by the local calendar.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Parse a `YYYY-MM-DD` date coming from a caller.
///
/// # Arguments
///
/// * `raw` - The date string; surrounding whitespace is ignored
///
/// # Returns
///
/// The date, or a validation error naming the expected format.
///
/// ```ignore
/// assert!(parse_date("2025-05-06").is_ok());
/// assert!(parse_date("06/05/2025").is_err());
/// ```
pub fn parse_date(raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| AppError::validation(format!("invalid date '{raw}' (expected YYYY-MM-DD): {e}")))
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a scratch file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> AppResult<()> {
    fs::create_dir_all(path).await?;
    let scratch_path = path.join("..__write_check__");
    fs::write(&scratch_path, b"").await?;
    let _ = fs::remove_file(&scratch_path).await;
    info!("Data directory is writable");
    Ok(())
}
