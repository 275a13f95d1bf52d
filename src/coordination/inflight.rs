//! In-flight request coalescing.
//!
//! Concurrent callers asking for the same resource identity share one
//! upstream round trip.  The entry for a key is removed exactly once, when
//! the shared future settles, whether it succeeded or failed; the next call
//! with that key starts a fresh request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use prometheus_client::metrics::counter::Counter;
use tracing::debug;

use crate::error::SyncError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, SyncError>>>;

/// An in-flight request tagged with the generation that started it, so a
/// request that settles after [`Coalescer::clear`] leaves a newer entry for
/// the same key alone.
struct Entry<T> {
    generation: u64,
    shared: SharedResult<T>,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, Entry<T>>>>;

pub struct Coalescer<T> {
    resource: &'static str,
    in_flight: InFlightMap<T>,
    next_generation: AtomicU64,
    joins: Counter,
}

fn lock<T>(map: &Mutex<HashMap<String, Entry<T>>>) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(resource: &'static str, joins: Counter) -> Self {
        Self {
            resource,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            joins,
        }
    }

    /// Run `factory` for `key` unless a request for `key` is already in
    /// flight, in which case wait for and clone that request's result.
    pub async fn coalesce<F, Fut>(&self, key: &str, factory: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let shared = {
            let mut map = lock(&self.in_flight);
            if let Some(existing) = map.get(key) {
                debug!(resource = self.resource, key, "joining in-flight request");
                self.joins.inc();
                existing.shared.clone()
            } else {
                let in_flight = Arc::clone(&self.in_flight);
                let owned_key = key.to_string();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let request = factory();
                let shared = async move {
                    let result = request.await;
                    let mut map = lock(&in_flight);
                    if map.get(&owned_key).is_some_and(|e| e.generation == generation) {
                        map.remove(&owned_key);
                    }
                    result
                }
                .boxed()
                .shared();
                map.insert(
                    key.to_string(),
                    Entry {
                        generation,
                        shared: shared.clone(),
                    },
                );
                shared
            }
        };
        shared.await
    }

    /// Number of distinct keys currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Forget every in-flight entry.  Callers already waiting still receive
    /// their result.
    pub fn clear(&self) {
        lock(&self.in_flight).clear();
    }
}
