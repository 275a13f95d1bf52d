//! Bearer-token recovery from durable storage.
//!
//! The token record is written by the sign-in flow as
//! `{"token": "...", "timestamp": <epoch millis>}`.  A record is only used
//! when the signed-in identity authenticated through the expected provider,
//! and it is purged when it is malformed, dated in the future, or older than
//! the configured maximum age.  Resolution never fails: every problem
//! degrades to unauthenticated requests.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache::store::Store;
use crate::clock::SharedClock;
use crate::config::CredentialsConfig;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// The signed-in identity as seen by the engine.
pub trait IdentitySession: Send + Sync {
    /// Provider ids the current user authenticated with, or `None` when
    /// nobody is signed in.
    fn provider_ids(&self) -> Option<Vec<String>>;
}

/// Fixed identity, for front ends without a live sign-in session.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    providers: Option<Vec<String>>,
}

impl StaticIdentity {
    pub fn signed_out() -> Self {
        Self { providers: None }
    }

    pub fn signed_in<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            providers: Some(providers.into_iter().map(Into::into).collect()),
        }
    }

    /// Empty provider list means signed out.
    pub fn from_config(config: &CredentialsConfig) -> Self {
        if config.signed_in_providers.is_empty() {
            Self::signed_out()
        } else {
            Self::signed_in(config.signed_in_providers.iter().cloned())
        }
    }
}

impl IdentitySession for StaticIdentity {
    fn provider_ids(&self) -> Option<Vec<String>> {
        self.providers.clone()
    }
}

#[derive(Serialize)]
struct TokenRecord<'a> {
    token: &'a str,
    timestamp: i64,
}

pub struct TokenResolver {
    store: Arc<dyn Store>,
    identity: Arc<dyn IdentitySession>,
    clock: SharedClock,
    token_key: String,
    expected_provider: String,
    max_age_millis: i64,
}

impl TokenResolver {
    pub fn new(
        store: Arc<dyn Store>,
        identity: Arc<dyn IdentitySession>,
        clock: SharedClock,
        config: &CredentialsConfig,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            token_key: config.token_key.clone(),
            expected_provider: config.expected_provider.clone(),
            max_age_millis: config.max_token_age_millis(),
        }
    }

    /// Return a usable bearer token, or `None` for unauthenticated access.
    pub fn resolve_token(&self) -> Option<String> {
        match self.identity.provider_ids() {
            None => {
                debug!("no signed-in identity, using unauthenticated requests");
                return None;
            }
            Some(providers) if !providers.iter().any(|p| *p == self.expected_provider) => {
                debug!(
                    expected = %self.expected_provider,
                    "identity not authenticated via expected provider, using unauthenticated requests"
                );
                return None;
            }
            Some(_) => {}
        }

        let raw = match self.store.get(&self.token_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(key = %self.token_key, "no stored access token, sign in again to capture one");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "token store unreadable");
                return None;
            }
        };

        let now = self.clock.now_millis();
        let Some((token, timestamp)) = parse_record(&raw) else {
            warn!(key = %self.token_key, "stored token record malformed, discarding");
            self.purge();
            return None;
        };
        if timestamp > now {
            warn!(timestamp, "stored token is dated in the future, discarding");
            self.purge();
            return None;
        }
        match now.checked_sub(timestamp) {
            Some(age) if age <= self.max_age_millis => {
                info!(
                    age_days = age / DAY_MS,
                    token = %fingerprint(&token),
                    "using authenticated requests"
                );
                Some(token)
            }
            age => {
                warn!(age_days = ?age.map(|a| a / DAY_MS), "stored token expired, discarding");
                self.purge();
                None
            }
        }
    }

    /// Persist `token` stamped with the current time.
    pub fn store_token(&self, token: &str) -> Result<()> {
        anyhow::ensure!(!token.trim().is_empty(), "token must not be empty");
        let record = TokenRecord {
            token: token.trim(),
            timestamp: self.clock.now_millis(),
        };
        let json = serde_json::to_string(&record).context("failed to serialise token record")?;
        self.store
            .set(&self.token_key, &json)
            .context("failed to persist token record")
    }

    /// Delete the stored token record.
    pub fn purge(&self) {
        if let Err(e) = self.store.remove(&self.token_key) {
            warn!(error = %e, "failed to purge token record");
        }
    }
}

/// `Some((token, timestamp))` when the record has a non-empty string token
/// and a numeric timestamp that is a non-negative epoch millisecond value
/// representable as `i64`.
fn parse_record(raw: &str) -> Option<(String, i64)> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let token = value.get("token")?.as_str()?;
    let timestamp = value.get("timestamp")?.as_f64()?;
    // 2^63 itself is out of range, hence the strict bound.
    if token.is_empty() || !timestamp.is_finite() || timestamp < 0.0 || timestamp >= i64::MAX as f64 {
        return None;
    }
    Some((token.to_string(), timestamp as i64))
}

/// Short SHA-256 prefix identifying a token in logs without revealing it.
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}
