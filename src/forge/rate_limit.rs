//! Upstream API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Limit` / `X-RateLimit-Reset`
//! (or the standardised `RateLimit-*` names) from every forge response,
//! success or failure, and detects the exhausted-quota 403.  The on-demand
//! quota report returned by `GET /rate_limit` lives here too.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Fallback window used when an exhausted-quota response omits the reset time.
const DEFAULT_RESET_WINDOW_MS: i64 = 60 * 60 * 1000;

/// Unauthenticated callers get this many requests per hour; anything higher
/// means the token was accepted.
const UNAUTHENTICATED_LIMIT: u64 = 60;

/// Usage percentage above which [`RateLimitReport::warn_if_low`] warns by
/// default.
pub const DEFAULT_LOW_QUOTA_PERCENT: f64 = 80.0;

/// Point-in-time copy of the rate-limit window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset_epoch_millis: Option<i64>,
    pub last_updated_epoch_millis: Option<i64>,
}

impl RateLimitSnapshot {
    /// Percentage of the quota already consumed, if both bounds are known.
    pub fn percent_used(&self) -> Option<f64> {
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                Some(limit.saturating_sub(remaining) as f64 / limit as f64 * 100.0)
            }
            _ => None,
        }
    }
}

/// Shared rate-limit state updated after every forge API response.
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    inner: Arc<Mutex<RateLimitSnapshot>>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn reset(&self) {
        self.write(|s| *s = RateLimitSnapshot::default());
    }

    /// Update state from HTTP response headers.
    ///
    /// Fields absent from `headers` keep their previous value.  Returns
    /// `true` if any rate-limit header was present.
    pub fn update_from_headers(&self, headers: &HeaderMap, now_millis: i64) -> bool {
        let remaining = header_u64(headers, "X-RateLimit-Remaining", "RateLimit-Remaining");
        let limit = header_u64(headers, "X-RateLimit-Limit", "RateLimit-Limit");
        let reset = header_u64(headers, "X-RateLimit-Reset", "RateLimit-Reset");

        if remaining.is_none() && limit.is_none() && reset.is_none() {
            return false;
        }

        self.write(|s| {
            if remaining.is_some() {
                s.remaining = remaining;
            }
            if limit.is_some() {
                s.limit = limit;
            }
            if let Some(secs) = reset {
                s.reset_epoch_millis = Some(epoch_secs_to_millis(secs));
            }
            s.last_updated_epoch_millis = Some(now_millis);
        });

        debug!(?remaining, ?limit, ?reset, "rate limit headers recorded");
        true
    }

    /// Time left until the window resets, or zero if it already has (or is
    /// unknown).
    pub fn retry_after(&self, now_millis: i64) -> Duration {
        let reset = self.snapshot().reset_epoch_millis.unwrap_or(0);
        Duration::from_millis(reset.saturating_sub(now_millis).max(0) as u64)
    }

    fn write(&self, f: impl FnOnce(&mut RateLimitSnapshot)) {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Fail with [`SyncError::RateLimited`] when `status` is 403 and the quota is
/// reported as exactly exhausted.
pub fn check_rate_limit(status: u16, headers: &HeaderMap, now_millis: i64) -> Result<(), SyncError> {
    if status != 403 {
        return Ok(());
    }
    let exhausted = headers
        .get("X-RateLimit-Remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    if !exhausted {
        return Ok(());
    }

    let reset_epoch_millis = header_u64(headers, "X-RateLimit-Reset", "RateLimit-Reset")
        .map(epoch_secs_to_millis)
        .unwrap_or(now_millis + DEFAULT_RESET_WINDOW_MS);

    warn!(reset_epoch_millis, "upstream rate limit exhausted");
    Err(SyncError::RateLimited { reset_epoch_millis })
}

// ---------------------------------------------------------------------------
// On-demand report
// ---------------------------------------------------------------------------

/// Body of `GET /rate_limit`; only the core window is read.
#[derive(Debug, Deserialize)]
pub(crate) struct RateLimitBody {
    pub resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RateLimitResources {
    pub core: CoreWindow,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CoreWindow {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds.
    pub reset: i64,
}

/// The core quota window as reported by the forge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitReport {
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch_millis: i64,
    pub authenticated: bool,
    /// Rounded to one decimal place.
    pub percent_used: f64,
}

impl From<CoreWindow> for RateLimitReport {
    fn from(core: CoreWindow) -> Self {
        let percent_used = if core.limit == 0 {
            0.0
        } else {
            let used = core.limit.saturating_sub(core.remaining) as f64 / core.limit as f64 * 100.0;
            (used * 10.0).round() / 10.0
        };
        Self {
            limit: core.limit,
            remaining: core.remaining,
            reset_epoch_millis: core.reset.saturating_mul(1000),
            authenticated: core.limit > UNAUTHENTICATED_LIMIT,
            percent_used,
        }
    }
}

impl RateLimitReport {
    /// Log a warning when more than `threshold_percent` of the quota is used.
    /// Returns whether it warned.
    pub fn warn_if_low(&self, threshold_percent: f64) -> bool {
        if self.percent_used <= threshold_percent {
            return false;
        }
        warn!(
            percent_used = self.percent_used,
            remaining = self.remaining,
            limit = self.limit,
            reset_epoch_millis = self.reset_epoch_millis,
            "upstream rate limit {:.1}% used ({}/{} remaining)",
            self.percent_used,
            self.remaining,
            self.limit
        );
        true
    }
}

fn epoch_secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}

fn header_u64(headers: &HeaderMap, primary: &str, alias: &str) -> Option<u64> {
    headers
        .get(primary)
        .or_else(|| headers.get(alias))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, v.parse().unwrap());
        }
        map
    }

    #[test]
    fn default_is_unknown() {
        let state = RateLimitState::new();
        assert_eq!(state.snapshot(), RateLimitSnapshot::default());
    }

    #[test]
    fn update_from_github_headers() {
        let state = RateLimitState::new();
        let h = headers(&[
            ("X-RateLimit-Remaining", "42"),
            ("X-RateLimit-Limit", "60"),
            ("X-RateLimit-Reset", "1700000000"),
        ]);

        assert!(state.update_from_headers(&h, 5));
        let snap = state.snapshot();
        assert_eq!(snap.remaining, Some(42));
        assert_eq!(snap.limit, Some(60));
        assert_eq!(snap.reset_epoch_millis, Some(1_700_000_000_000));
        assert_eq!(snap.last_updated_epoch_millis, Some(5));
    }

    #[test]
    fn update_from_ietf_headers() {
        let state = RateLimitState::new();
        let h = headers(&[("RateLimit-Remaining", "10"), ("RateLimit-Reset", "1800000000")]);

        state.update_from_headers(&h, 0);
        assert_eq!(state.snapshot().remaining, Some(10));
        assert_eq!(state.snapshot().reset_epoch_millis, Some(1_800_000_000_000));
    }

    #[test]
    fn headerless_response_leaves_state_untouched() {
        let state = RateLimitState::new();
        state.update_from_headers(&headers(&[("X-RateLimit-Remaining", "7")]), 1);
        assert!(!state.update_from_headers(&HeaderMap::new(), 2));
        let snap = state.snapshot();
        assert_eq!(snap.remaining, Some(7));
        assert_eq!(snap.last_updated_epoch_millis, Some(1));
    }

    #[test]
    fn percent_used() {
        let snap = RateLimitSnapshot {
            remaining: Some(15),
            limit: Some(60),
            ..Default::default()
        };
        assert_eq!(snap.percent_used(), Some(75.0));
        assert_eq!(RateLimitSnapshot::default().percent_used(), None);
    }

    fn report(limit: u64, remaining: u64) -> RateLimitReport {
        RateLimitReport::from(CoreWindow {
            limit,
            remaining,
            reset: 1_700_000_000,
        })
    }

    #[test]
    fn report_from_core_window() {
        let r = report(5000, 4321);
        assert_eq!(r.reset_epoch_millis, 1_700_000_000_000);
        assert!(r.authenticated);
        assert_eq!(r.percent_used, 13.6);

        let anon = report(60, 60);
        assert!(!anon.authenticated);
        assert_eq!(anon.percent_used, 0.0);
        assert_eq!(report(0, 0).percent_used, 0.0);
    }

    #[test]
    fn warns_only_above_threshold() {
        assert!(!report(60, 12).warn_if_low(DEFAULT_LOW_QUOTA_PERCENT));
        assert!(report(60, 11).warn_if_low(DEFAULT_LOW_QUOTA_PERCENT));
        assert!(report(5000, 4000).warn_if_low(10.0));
        assert!(!report(5000, 4999).warn_if_low(50.0));
    }

    #[test]
    fn retry_after_when_future() {
        let state = RateLimitState::new();
        state.update_from_headers(&headers(&[("X-RateLimit-Reset", "100")]), 0);
        assert_eq!(state.retry_after(70_000), Duration::from_secs(30));
    }

    #[test]
    fn retry_after_when_past() {
        let state = RateLimitState::new();
        state.update_from_headers(&headers(&[("X-RateLimit-Reset", "1")]), 0);
        assert_eq!(state.retry_after(5_000), Duration::ZERO);
    }

    #[test]
    fn exhausted_403_is_rate_limited() {
        let h = headers(&[("X-RateLimit-Remaining", "0"), ("X-RateLimit-Reset", "1700000000")]);
        let err = check_rate_limit(403, &h, 0).unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(err.reset_epoch_millis(), Some(1_700_000_000_000));
    }

    #[test]
    fn exhausted_403_without_reset_defaults_to_one_hour() {
        let h = headers(&[("X-RateLimit-Remaining", "0")]);
        let err = check_rate_limit(403, &h, 1_000).unwrap_err();
        assert_eq!(err.reset_epoch_millis(), Some(1_000 + 3_600_000));
    }

    #[test]
    fn absurd_reset_header_saturates() {
        let state = RateLimitState::new();
        state.update_from_headers(&headers(&[("X-RateLimit-Reset", "18446744073709551615")]), 0);
        assert_eq!(state.snapshot().reset_epoch_millis, Some(i64::MAX));
    }

    #[test]
    fn plain_403_is_not_rate_limited() {
        let h = headers(&[("X-RateLimit-Remaining", "12")]);
        assert!(check_rate_limit(403, &h, 0).is_ok());
        assert!(check_rate_limit(403, &HeaderMap::new(), 0).is_ok());
    }

    #[test]
    fn zero_remaining_on_success_is_not_rate_limited() {
        let h = headers(&[("X-RateLimit-Remaining", "0")]);
        assert!(check_rate_limit(200, &h, 0).is_ok());
    }
}
