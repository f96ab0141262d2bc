//! Helpers for moving blocking work off the async runtime.
//!
//! Isolation contexts, git worktrees and manifest files are all managed
//! through synchronous APIs. The async components hand that work to the
//! blocking pool through these helpers.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run `f` on the blocking pool and flatten the join error into [`Error`].
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Like [`blocking`], giving up with [`Error::Timeout`] after `limit`.
///
/// The closure keeps running on the pool after a timeout; only the
/// caller stops waiting for it.
pub async fn blocking_with_timeout<F, T>(limit: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(limit, spawn_blocking(f)).await {
        Ok(joined) => joined.map_err(|e| Error::TaskJoin(e.to_string()))?,
        Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Shorten task output for log lines and error messages.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", &text[..cut]),
    }
}
