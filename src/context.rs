//! Process-wide shared state.
//!
//! Everything that must be unique per running engine lives here: the clock,
//! the last observed rate-limit snapshot, the coalescing maps, the directory
//! listing cache, and the metrics registry.  Tests build a fresh context per
//! case instead of sharing module globals.

use crate::clock::SharedClock;
use crate::coordination::inflight::Coalescer;
use crate::forge::rate_limit::RateLimitState;
use crate::forge::Branch;
use crate::listing::{DirCache, TreeFetch};
use crate::metrics::{MetricsRegistry, ResourceLabels};

pub struct EngineContext {
    pub clock: SharedClock,
    pub rate_limit: RateLimitState,
    pub metrics: MetricsRegistry,
    pub trees: Coalescer<TreeFetch>,
    pub branches: Coalescer<Vec<Branch>>,
    pub dir_cache: DirCache,
}

impl EngineContext {
    pub fn new(clock: SharedClock) -> Self {
        let metrics = MetricsRegistry::new();
        let joins = |resource: &str| {
            metrics
                .metrics
                .coalesced_requests
                .get_or_create(&ResourceLabels {
                    resource: resource.to_string(),
                })
                .clone()
        };
        let trees = Coalescer::new("tree", joins("tree"));
        let branches = Coalescer::new("branches", joins("branches"));

        Self {
            clock,
            rate_limit: RateLimitState::default(),
            metrics,
            trees,
            branches,
            dir_cache: DirCache::default(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Drop all transient state: rate-limit snapshot, in-flight maps, and
    /// cached directory listings.
    pub fn reset(&self) {
        self.rate_limit.reset();
        self.trees.clear();
        self.branches.clear();
        self.dir_cache.clear();
    }
}
