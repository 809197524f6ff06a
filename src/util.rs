//! Small helpers shared across modules.

use std::sync::Arc;

/// Current wall-clock time as milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Source of "now" in epoch milliseconds.
///
/// Session expiry is compared against wall-clock time (the validator hands out
/// absolute expiry timestamps), so everything that needs the time goes through
/// a `Clock` instead of calling [`now_ms`] directly. Tests swap in a manual
/// clock to step past expiry without sleeping.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> u64 + Send + Sync>);

impl Clock {
    /// The system wall clock.
    pub fn system() -> Self {
        Self(Arc::new(now_ms))
    }

    /// A clock driven by the given cell. Only used by tests.
    #[cfg(test)]
    pub fn manual(cell: Arc<std::sync::atomic::AtomicU64>) -> Self {
        Self(Arc::new(move || {
            cell.load(std::sync::atomic::Ordering::SeqCst)
        }))
    }

    pub fn now(&self) -> u64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// Shorten a token for logs and the activity journal: first 8 chars + `...`.
///
/// - `"abc"` → `"abc"`
/// - `"0123456789abcdef"` → `"01234567..."`
pub fn truncate_token(token: &str) -> String {
    if token.chars().count() > 8 {
        let head: String = token.chars().take(8).collect();
        format!("{head}...")
    } else {
        token.to_string()
    }
}
