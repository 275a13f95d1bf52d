//! Error taxonomy for the sync engine.
//!
//! [`SyncError`] is `Clone` so that a single coalesced upstream result can be
//! handed to every waiter.  Transport failures are flattened to strings for
//! the same reason.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Upstream answered 403 with `X-RateLimit-Remaining: 0`.
    ///
    /// Never retried by the engine; carried unmodified up to the status
    /// reporter.
    #[error("upstream rate limit exceeded (resets at {reset_epoch_millis} ms)")]
    RateLimited { reset_epoch_millis: i64 },

    /// Non-2xx (and non-304) response.
    #[error("upstream returned HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// The request never produced a response (DNS, TLS, connection reset...).
    #[error("network failure: {0}")]
    Network(String),

    /// A 2xx response whose body could not be interpreted.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("gist resolution failed: {0}")]
    Gist(String),

    /// A configured base URL could not be turned into a request URL.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

impl SyncError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// HTTP status associated with the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(403),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn reset_epoch_millis(&self) -> Option<i64> {
        match self {
            Self::RateLimited { reset_epoch_millis } => Some(*reset_epoch_millis),
            _ => None,
        }
    }
}
