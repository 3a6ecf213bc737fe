//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run a synchronous closure on the blocking pool.
///
/// A panic inside `f` surfaces as `Error::TaskJoin` instead of tearing down
/// the caller.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))
}

/// Truncate `text` to at most `max` characters, appending an ellipsis when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}
