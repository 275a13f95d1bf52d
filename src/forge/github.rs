//! GitHub endpoint surface.
//!
//! URL construction for every remote endpoint the engine consumes, plus the
//! operations that are not listing strategies: paginated branch listing, raw
//! file fetches, gist resolution, and the on-demand quota check.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rate_limit::{RateLimitBody, RateLimitReport};
use super::{ForgeClient, RepoRef};
use crate::config::Config;
use crate::error::SyncError;

static GIST_POINTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https://gist\.githubusercontent\.com/\S+/raw/\S+$").expect("valid regex")
});

static GIST_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^https://gist\.github\.com/([\w-]+)/([a-f0-9]+)/?(?:#file-([\w.-]+))?(?:\?file=([\w.-]+))?$",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub protected: bool,
}

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct GitHub {
    client: ForgeClient,
    api_url: String,
    raw_url: String,
    gist_raw_url: String,
    per_page: usize,
    max_pages: usize,
}

impl GitHub {
    pub fn new(client: ForgeClient, config: &Config) -> Self {
        Self {
            client,
            api_url: config.upstream.api_url.clone(),
            raw_url: config.upstream.raw_url.clone(),
            gist_raw_url: config.upstream.gist_raw_url.clone(),
            per_page: config.branches.per_page,
            max_pages: config.branches.max_pages,
        }
    }

    pub fn client(&self) -> &ForgeClient {
        &self.client
    }

    // -- URLs ---------------------------------------------------------------

    /// `GET /repos/{owner}/{repo}/git/trees/{branch}?recursive=1`
    pub fn tree_url(&self, repo: &RepoRef) -> Result<Url, SyncError> {
        build_url(
            &self.api_url,
            &["repos", repo.owner.as_str(), repo.repo.as_str(), "git", "trees", repo.branch.as_str()],
            &[("recursive", "1")],
        )
    }

    /// `GET /repos/{owner}/{repo}/contents/{path}?ref={branch}`
    pub fn contents_url(&self, repo: &RepoRef, path: &str) -> Result<Url, SyncError> {
        let mut segments = vec!["repos", repo.owner.as_str(), repo.repo.as_str(), "contents"];
        segments.extend(path.split('/'));
        build_url(&self.api_url, &segments, &[("ref", repo.branch.as_str())])
    }

    /// `GET /repos/{owner}/{repo}/branches?per_page=N&page=P`
    pub fn branches_url(&self, owner: &str, repo: &str, page: usize) -> Result<Url, SyncError> {
        let per_page = self.per_page.to_string();
        let page = page.to_string();
        build_url(
            &self.api_url,
            &["repos", owner, repo, "branches"],
            &[("per_page", per_page.as_str()), ("page", page.as_str())],
        )
    }

    /// `GET {raw}/{owner}/{repo}/{branch}/{path}`
    pub fn raw_file_url(&self, repo: &RepoRef, path: &str) -> Result<Url, SyncError> {
        let mut segments = vec![repo.owner.as_str(), repo.repo.as_str(), repo.branch.as_str()];
        segments.extend(path.split('/'));
        build_url(&self.raw_url, &segments, &[])
    }

    // -- Branches -----------------------------------------------------------

    /// List branch names, one page at a time, stopping at the first short
    /// page or after `max_pages`.  Concurrent calls for the same repository
    /// share one pagination run.
    ///
    /// Only a rate-limit error is returned; any other failure ends pagination
    /// early and yields the branches collected so far.
    pub async fn get_branches(&self, owner: &str, repo: &str) -> Result<Vec<Branch>, SyncError> {
        let key = format!("branches:{owner}/{repo}");
        let this = self.clone();
        let (owner, repo) = (owner.to_string(), repo.to_string());
        self.client
            .context()
            .branches
            .coalesce(&key, move || async move { this.fetch_branch_pages(&owner, &repo).await })
            .await
    }

    async fn fetch_branch_pages(&self, owner: &str, repo: &str) -> Result<Vec<Branch>, SyncError> {
        let mut branches = Vec::new();

        for page in 1..=self.max_pages {
            let url = self.branches_url(owner, repo, page)?;
            let resp = match self.client.request(url.as_str(), &HeaderMap::new()).await {
                Ok(resp) => resp,
                Err(e) if e.is_rate_limit() => return Err(e),
                Err(e) => {
                    warn!(owner, repo, page, error = %e, "branch listing failed");
                    break;
                }
            };
            if !resp.is_success() {
                warn!(owner, repo, page, status = resp.status, "branch listing returned non-success");
                break;
            }
            let batch: Vec<Branch> = match resp.json() {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(owner, repo, page, error = %e, "branch page unparseable");
                    break;
                }
            };

            let short_page = batch.len() < self.per_page;
            branches.extend(batch);
            if short_page {
                break;
            }
        }

        debug!(owner, repo, count = branches.len(), "branches listed");
        Ok(branches)
    }

    // -- Raw content --------------------------------------------------------

    /// Fetch the raw text of one file.  Any failure is returned to the
    /// caller.
    pub async fn fetch_raw_file(&self, repo: &RepoRef, path: &str) -> Result<String, SyncError> {
        let url = self.raw_file_url(repo, path)?;
        let resp = self.client.request(url.as_str(), &HeaderMap::new()).await?;
        if !resp.is_success() {
            return Err(SyncError::Http {
                status: resp.status,
                url: url.to_string(),
            });
        }
        Ok(resp.text())
    }

    // -- Gists --------------------------------------------------------------

    /// Turn a gist page URL into a raw-content URL.
    ///
    /// Raw pointers pass through unchanged.  A URL naming a file (by
    /// `#file-` fragment or `?file=` query) maps directly; otherwise the gist
    /// metadata is fetched and the first markdown file (or else the first
    /// file) is chosen.
    pub async fn resolve_gist_raw_url(&self, gist_url: &str) -> Result<String, SyncError> {
        let gist_url = gist_url.trim();
        if GIST_POINTER_RE.is_match(gist_url) {
            return Ok(gist_url.to_string());
        }

        let caps = GIST_URL_RE
            .captures(gist_url)
            .ok_or_else(|| SyncError::Gist(format!("invalid gist URL format: {gist_url}")))?;
        let user = &caps[1];
        let gist_id = &caps[2];
        let named_file = caps.get(3).or_else(|| caps.get(4)).map(|m| m.as_str());

        let file = match named_file {
            Some(file) => file.to_string(),
            None => self.pick_gist_file(gist_id).await?,
        };

        let url = build_url(&self.gist_raw_url, &[user, gist_id, "raw", file.as_str()], &[])?;
        Ok(url.to_string())
    }

    async fn pick_gist_file(&self, gist_id: &str) -> Result<String, SyncError> {
        let url = build_url(&self.api_url, &["gists", gist_id], &[])?;
        let resp = self.client.request(url.as_str(), &HeaderMap::new()).await?;
        if !resp.is_success() {
            return Err(SyncError::Http {
                status: resp.status,
                url: url.to_string(),
            });
        }

        let body: serde_json::Value = resp.json()?;
        let files = body
            .get("files")
            .and_then(|f| f.as_object())
            .ok_or_else(|| SyncError::InvalidResponse("gist metadata has no files map".into()))?;

        files
            .keys()
            .find(|name| name.ends_with(".md"))
            .or_else(|| files.keys().next())
            .cloned()
            .ok_or_else(|| SyncError::Gist(format!("no files found in gist {gist_id}")))
    }

    /// Resolve `gist_url` and fetch its raw text.
    pub async fn fetch_gist_content(&self, gist_url: &str) -> Result<String, SyncError> {
        let raw_url = self.resolve_gist_raw_url(gist_url).await?;
        let resp = self.client.request(&raw_url, &HeaderMap::new()).await?;
        if !resp.is_success() {
            return Err(SyncError::Http {
                status: resp.status,
                url: raw_url,
            });
        }
        Ok(resp.text())
    }

    // -- Quota ----------------------------------------------------------------

    /// `GET /rate_limit`.  Does not count against the quota upstream, and the
    /// response headers refresh the shared rate-limit state like any other
    /// call.
    pub async fn check_rate_limit(&self) -> Result<RateLimitReport, SyncError> {
        let url = build_url(&self.api_url, &["rate_limit"], &[])?;
        let resp = self.client.request(url.as_str(), &HeaderMap::new()).await?;
        if !resp.is_success() {
            return Err(SyncError::Http {
                status: resp.status,
                url: url.to_string(),
            });
        }
        let body: RateLimitBody = resp.json()?;
        let report = RateLimitReport::from(body.resources.core);
        debug!(
            remaining = report.remaining,
            limit = report.limit,
            authenticated = report.authenticated,
            "rate limit checked"
        );
        Ok(report)
    }

    /// Check the quota and warn when more than `threshold_percent` is used.
    pub async fn warn_if_low_rate_limit(&self, threshold_percent: f64) -> Result<bool, SyncError> {
        Ok(self.check_rate_limit().await?.warn_if_low(threshold_percent))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `true` if `url` is a gist page URL or a raw gist pointer.
pub fn is_gist_url(url: &str) -> bool {
    GIST_POINTER_RE.is_match(url) || GIST_URL_RE.is_match(url)
}

/// `true` if a file's text is nothing but a gist reference.
pub fn is_gist_pointer(text: &str) -> bool {
    is_gist_url(text.trim())
}

/// Append percent-encoded `segments` to `base` and add `query`.  Empty
/// segments are dropped so stray slashes in paths do not produce `//`.
fn build_url(base: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, SyncError> {
    let mut url = Url::parse(base).map_err(|e| SyncError::InvalidUrl(format!("{base}: {e}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(format!("{base} cannot be a base URL")))?;
        path.pop_if_empty();
        path.extend(segments.iter().filter(|s| !s.is_empty()));
    }
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}
