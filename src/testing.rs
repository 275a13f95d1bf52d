//! Scripted upstream and a pre-wired engine for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::cache::store::{MemoryStore, Store};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::context::EngineContext;
use crate::credentials::{StaticIdentity, TokenResolver};
use crate::engine::{Engine, EngineParts};
use crate::error::SyncError;
use crate::forge::{ForgeClient, GitHub, HttpResponse, Transport};
use crate::status::StatusReporter;
use crate::sync::SyncOrchestrator;

pub const NOW: i64 = 1_700_000_000_000;

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    network_error: Option<String>,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self::text(status, body).header("Content-Type", "application/json")
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
            network_error: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::text(status, "")
    }

    pub fn network_error(message: &str) -> Self {
        Self {
            network_error: Some(message.to_string()),
            ..Self::status(0)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn into_response(self) -> Result<HttpResponse, SyncError> {
        if let Some(message) = self.network_error {
            return Err(SyncError::Network(message));
        }
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Ok(HttpResponse {
            status: self.status,
            headers,
            body: Bytes::from(self.body),
        })
    }
}

// ---------------------------------------------------------------------------
// Fake transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: HeaderMap,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Answers each URL from its queue of replies.  The last reply queued for a
/// URL repeats forever; unrouted URLs get a 404.  Every call yields once
/// before answering so concurrent callers overlap.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeTransport {
    pub fn route(&self, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Discard anything queued for `url` and answer with `reply` from now on.
    pub fn reset_route(&self, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), VecDeque::from([reply]));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests().iter().filter(|r| r.url == url).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.requests().iter().filter(|r| r.url.starts_with(prefix)).count()
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &str, headers: &HeaderMap) -> Result<HttpResponse, SyncError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.clone(),
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.next_reply(url)
            .unwrap_or_else(|| Reply::json(404, r#"{"message": "Not Found"}"#))
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingReporter {
    rate_limits: Mutex<Vec<(Duration, i64)>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn rate_limits(&self) -> Vec<(Duration, i64)> {
        self.rate_limits.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

impl StatusReporter for RecordingReporter {
    fn rate_limited(&self, retry_after: Duration, reset_epoch_millis: i64) {
        self.rate_limits
            .lock()
            .unwrap()
            .push((retry_after, reset_epoch_millis));
    }

    fn refresh_failed(&self, resource: &str, _error: &SyncError) {
        self.failures.lock().unwrap().push(resource.to_string());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.upstream.api_url = "https://api.test".to_string();
    config.upstream.raw_url = "https://raw.test".to_string();
    config.upstream.gist_raw_url = "https://gist.test".to_string();
    config
}

pub struct Harness {
    pub config: Config,
    pub clock: ManualClock,
    pub transport: Arc<FakeTransport>,
    pub store: Arc<MemoryStore>,
    pub reporter: Arc<RecordingReporter>,
    pub context: Arc<EngineContext>,
    pub tokens: Arc<TokenResolver>,
    pub client: ForgeClient,
    pub github: GitHub,
    pub sync: SyncOrchestrator,
}

impl Harness {
    /// Nobody signed in: every request goes out unauthenticated.
    pub fn new() -> Self {
        Self::with_identity(StaticIdentity::signed_out())
    }

    /// Signed in through the expected provider.
    pub fn signed_in() -> Self {
        Self::with_identity(StaticIdentity::signed_in(["github.com"]))
    }

    pub fn with_identity(identity: StaticIdentity) -> Self {
        let config = test_config();
        let clock = ManualClock::new(NOW);
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(RecordingReporter::default());

        let engine = Engine::assemble(
            config.clone(),
            EngineParts {
                transport: transport.clone(),
                cache_store: store.clone(),
                token_store: Arc::new(MemoryStore::new()),
                identity: Arc::new(identity),
                clock: Arc::new(clock.clone()),
                reporter: reporter.clone(),
            },
        );

        Self {
            config,
            clock,
            transport,
            store,
            reporter,
            client: engine.github.client().clone(),
            context: engine.context,
            tokens: engine.tokens,
            github: engine.github,
            sync: engine.sync,
        }
    }

    pub fn store_value(&self, key: &str) -> Option<String> {
        self.store.get(key).unwrap()
    }

    pub fn store_set(&self, key: &str, value: &str) {
        self.store.set(key, value).unwrap();
    }
}
