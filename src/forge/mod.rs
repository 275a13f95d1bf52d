//! Forge access layer.
//!
//! Provides the [`Transport`] trait that performs raw GETs, the
//! [`ForgeClient`] wrapper that adds credentials and rate-limit accounting to
//! every request, and the [`GitHub`] endpoint surface built on top of it.
//! No URL construction or response parsing for the remote API leaks outside
//! this module and [`crate::listing`].

pub mod client;
pub mod github;
pub mod http;
pub mod rate_limit;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use crate::error::SyncError;

pub use client::ForgeClient;
pub use github::{Branch, GitHub};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| SyncError::InvalidResponse(format!("malformed JSON body: {e}")))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs a single GET.  Implementations must not interpret the status
/// code; a non-2xx answer is still `Ok`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, headers: &HeaderMap) -> Result<HttpResponse, SyncError>;
}

// ---------------------------------------------------------------------------
// Resource identity
// ---------------------------------------------------------------------------

/// One branch of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// `owner/repo`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// `owner/repo@branch`, the canonical identity used in cache and
    /// in-flight keys.
    pub fn identity(&self) -> String {
        format!("{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identity())
    }
}
