//! Authenticated, rate-limit-aware request wrapper.
//!
//! Every outbound request goes through [`ForgeClient::request`], which
//! attaches the bearer token (when one resolves), records the rate-limit
//! headers of the response into the shared state, and turns an
//! exhausted-quota 403 into [`SyncError::RateLimited`].  No retries happen
//! here.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::{debug, warn};

use super::rate_limit::check_rate_limit;
use super::{HttpResponse, Transport};
use crate::config::UpstreamConfig;
use crate::context::EngineContext;
use crate::credentials::token::TokenResolver;
use crate::error::SyncError;
use crate::metrics::{Endpoint, EndpointLabels};

#[derive(Clone)]
pub struct ForgeClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenResolver>,
    context: Arc<EngineContext>,
    accept: HeaderValue,
    api_url: String,
}

impl ForgeClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenResolver>,
        context: Arc<EngineContext>,
        upstream: &UpstreamConfig,
    ) -> Self {
        let accept = HeaderValue::from_str(&upstream.accept).unwrap_or_else(|_| {
            warn!(accept = %upstream.accept, "invalid Accept header in config, using application/json");
            HeaderValue::from_static("application/json")
        });
        Self {
            transport,
            tokens,
            context,
            accept,
            api_url: upstream.api_url.clone(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// GET `url`.  A non-2xx response is returned as-is for the caller to
    /// interpret, except for the exhausted-quota 403.  The request is sent
    /// even when the last known quota is zero; only the response decides.
    pub async fn request(
        &self,
        url: &str,
        extra_headers: &HeaderMap,
    ) -> Result<HttpResponse, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, self.accept.clone());

        let token = self.tokens.resolve_token();
        if let Some(token) = &token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("stored token is not a valid header value, sending unauthenticated"),
            }
        }
        for (name, value) in extra_headers {
            headers.insert(name.clone(), value.clone());
        }

        let metrics = &self.context.metrics.metrics;
        metrics
            .upstream_api_calls
            .get_or_create(&EndpointLabels {
                endpoint: Endpoint::classify(url, &self.api_url),
            })
            .inc();
        debug!(url, authenticated = token.is_some(), "upstream request");

        let resp = self.transport.get(url, &headers).await?;

        let now = self.context.now_millis();
        if self.context.rate_limit.update_from_headers(&resp.headers, now) {
            let snapshot = self.context.rate_limit.snapshot();
            if let Some(remaining) = snapshot.remaining {
                metrics
                    .upstream_api_rate_limit_remaining
                    .set(remaining.min(i64::MAX as u64) as i64);
            }
            debug!(
                remaining = ?snapshot.remaining,
                limit = ?snapshot.limit,
                percent_used = ?snapshot.percent_used(),
                "rate limit"
            );
        }

        check_rate_limit(resp.status, &resp.headers, now)?;
        Ok(resp)
    }
}
