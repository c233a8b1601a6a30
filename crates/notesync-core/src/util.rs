//! Shared utility functions used across multiple modules.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a Unix millisecond timestamp into a UTC date time.
pub fn millis_to_datetime(timestamp_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp_ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Run `future` with a deadline, mapping elapsed deadlines to [`Error::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, after: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| Error::timeout(operation, after))?
}
