use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use reqwest::Url;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    Tree,
    Contents,
    Branches,
    Gist,
    RateLimit,
    Raw,
    Other,
}

impl Endpoint {
    /// Classify a request URL for labelling.  Anything on a different origin
    /// than `api_base` is raw content; API paths are matched by segment
    /// after the base path.
    pub fn classify(url: &str, api_base: &str) -> Self {
        let (Ok(url), Ok(base)) = (Url::parse(url), Url::parse(api_base)) else {
            return Self::Other;
        };
        if url.origin() != base.origin() {
            return Self::Raw;
        }
        let Some(rest) = url.path().strip_prefix(base.path().trim_end_matches('/')) else {
            return Self::Other;
        };
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            ["repos", _, _, "git", "trees", ..] => Self::Tree,
            ["repos", _, _, "contents", ..] => Self::Contents,
            ["repos", _, _, "branches", ..] => Self::Branches,
            ["gists", ..] => Self::Gist,
            ["rate_limit"] => Self::RateLimit,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheOutcome {
    Fresh,
    Stale,
    Miss,
    Corrupt,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub outcome: CacheOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RevalidationOutcome {
    Unchanged,
    Updated,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RevalidationLabels {
    pub outcome: RevalidationOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the engine.
pub struct Metrics {
    // -- upstream API --
    pub upstream_api_calls: Family<EndpointLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,
    pub coalesced_requests: Family<ResourceLabels, Counter>,

    // -- listings --
    pub listing_cache_lookups: Family<CacheLabels, Counter>,
    pub listing_fetch_duration_seconds: Histogram,
    pub strategy_fallbacks: Counter,
    pub revalidations: Family<RevalidationLabels, Counter>,

    // -- eviction --
    pub evictions: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let upstream_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "reposync_upstream_api_calls",
            "Upstream API call count by endpoint",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "reposync_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        let coalesced_requests = Family::<ResourceLabels, Counter>::default();
        registry.register(
            "reposync_coalesced_requests",
            "Requests served by joining an identical in-flight request",
            coalesced_requests.clone(),
        );

        let listing_cache_lookups = Family::<CacheLabels, Counter>::default();
        registry.register(
            "reposync_listing_cache_lookups",
            "File listing cache lookups by outcome",
            listing_cache_lookups.clone(),
        );

        let listing_fetch_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "reposync_listing_fetch_duration_seconds",
            "Latency of a full listing fetch including strategy fallback",
            listing_fetch_duration_seconds.clone(),
        );

        let strategy_fallbacks = Counter::default();
        registry.register(
            "reposync_strategy_fallbacks",
            "Listings that fell back from the tree to the contents strategy",
            strategy_fallbacks.clone(),
        );

        let revalidations = Family::<RevalidationLabels, Counter>::default();
        registry.register(
            "reposync_revalidations",
            "Background revalidations by outcome",
            revalidations.clone(),
        );

        let evictions = Counter::default();
        registry.register(
            "reposync_evictions",
            "File listings evicted by the entry cap",
            evictions.clone(),
        );

        Self {
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
            coalesced_requests,
            listing_cache_lookups,
            listing_fetch_duration_seconds,
            strategy_fallbacks,
            revalidations,
            evictions,
        }
    }

    pub fn record_lookup(&self, outcome: CacheOutcome) {
        self.listing_cache_lookups
            .get_or_create(&CacheLabels { outcome })
            .inc();
    }

    pub fn record_revalidation(&self, outcome: RevalidationOutcome) {
        self.revalidations
            .get_or_create(&RevalidationLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, held by the engine context.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all engine metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)
            .context("failed to encode metrics")?;
        Ok(out)
    }
}
