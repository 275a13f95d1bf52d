//! Status reporting seam.
//!
//! The engine never renders anything.  Background work that fails in a way
//! the user should see hands the structured details to a [`StatusReporter`],
//! which owns turning them into a message.

use std::time::Duration;

use tracing::warn;

use crate::error::SyncError;

pub trait StatusReporter: Send + Sync {
    /// The upstream quota is exhausted until `reset_epoch_millis`.
    fn rate_limited(&self, retry_after: Duration, reset_epoch_millis: i64);

    /// A background refresh failed for a non-quota reason.
    fn refresh_failed(&self, _resource: &str, _error: &SyncError) {}
}

/// "try again in N minutes", rounded up, never less than one minute.
pub fn rate_limit_message(retry_after: Duration) -> String {
    let minutes = retry_after.as_secs().div_ceil(60).max(1);
    let unit = if minutes == 1 { "minute" } else { "minutes" };
    format!("GitHub API rate limit exceeded, try again in {minutes} {unit}")
}

/// Reporter that only writes log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn rate_limited(&self, retry_after: Duration, reset_epoch_millis: i64) {
        warn!(
            retry_after_secs = retry_after.as_secs(),
            reset_epoch_millis,
            "{}",
            rate_limit_message(retry_after)
        );
    }

    fn refresh_failed(&self, resource: &str, error: &SyncError) {
        warn!(resource, error = %error, "background refresh failed, keeping cached data");
    }
}
