//! Stale-while-revalidate read path.
//!
//! [`SyncOrchestrator::load_files`] answers from the listing cache whenever
//! it can.  A fresh record is returned as-is.  A stale record is returned
//! immediately and a background task revalidates it with the stored ETag.
//! With nothing cached, the listing is fetched in the foreground, tree
//! strategy first and contents walk on any failure.
//!
//! Branch switches do not cancel anything.  Each load marks its listing key
//! as the current focus; a background refresh that finishes for a key that
//! is no longer in focus still updates its own cache record but does not
//! notify its caller.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::listing::{listing_key, ListingRecord};
use crate::cache::lru::CacheStats;
use crate::cache::policy::domain;
use crate::cache::{EvictionController, ListingCache, Lookup, SessionCache};
use crate::config::ListingConfig;
use crate::error::SyncError;
use crate::forge::github::is_gist_pointer;
use crate::forge::{Branch, GitHub, RepoRef};
use crate::listing::{list_via_contents, list_via_tree, retain_files, FileEntry, ListingResult};
use crate::metrics::{CacheOutcome, RevalidationOutcome};
use crate::status::StatusReporter;

/// Called at most once, from a background refresh, with a changed listing.
pub type UpdateCallback = Box<dyn FnOnce(Vec<FileEntry>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Fresh,
    /// Served from cache while a revalidation runs.
    Stale,
    /// Fetched from upstream because nothing usable was cached.
    Fetched,
}

#[derive(Debug)]
pub struct LoadedFiles {
    pub files: Vec<FileEntry>,
    pub state: CacheState,
    /// The background revalidation, when one was started.
    pub revalidation: Option<JoinHandle<()>>,
}

struct Inner {
    github: GitHub,
    listing: ListingConfig,
    listings: ListingCache,
    session: SessionCache,
    eviction: EvictionController,
    reporter: Arc<dyn StatusReporter>,
    focus: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        github: GitHub,
        listing: ListingConfig,
        listings: ListingCache,
        session: SessionCache,
        eviction: EvictionController,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                github,
                listing,
                listings,
                session,
                eviction,
                reporter,
                focus: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &SessionCache {
        &self.inner.session
    }

    // -----------------------------------------------------------------------
    // File listings
    // -----------------------------------------------------------------------

    /// The markdown files of `repo`'s branch.
    ///
    /// Only a foreground fetch can fail.  `on_update` is handed to the
    /// background revalidation of a stale record and is dropped otherwise.
    pub async fn load_files(
        &self,
        repo: &RepoRef,
        on_update: Option<UpdateCallback>,
    ) -> Result<LoadedFiles, SyncError> {
        let key = listing_key(repo);
        self.set_focus(&key);
        let metrics = &self.inner.github.client().context().metrics.metrics;

        let loaded = match self.inner.listings.lookup(repo) {
            Lookup::Fresh(record) => {
                metrics.record_lookup(CacheOutcome::Fresh);
                debug!(repo = %repo, count = record.files.len(), "listing served fresh from cache");
                LoadedFiles {
                    files: record.files,
                    state: CacheState::Fresh,
                    revalidation: None,
                }
            }
            Lookup::Stale(record) => {
                metrics.record_lookup(CacheOutcome::Stale);
                debug!(repo = %repo, "listing stale, revalidating in background");
                let files = record.files.clone();
                let this = self.clone();
                let repo = repo.clone();
                let handle = tokio::spawn(async move {
                    this.revalidate(repo, record, on_update).await;
                });
                LoadedFiles {
                    files,
                    state: CacheState::Stale,
                    revalidation: Some(handle),
                }
            }
            lookup @ (Lookup::Miss | Lookup::Corrupt) => {
                metrics.record_lookup(if lookup == Lookup::Miss {
                    CacheOutcome::Miss
                } else {
                    CacheOutcome::Corrupt
                });
                let files = match self.fetch_listing(repo, None).await? {
                    ListingResult::Files { files, etag } => {
                        self.inner.listings.write(repo, &files, etag.as_deref());
                        files
                    }
                    ListingResult::NotModified { .. } => {
                        return Err(SyncError::InvalidResponse(
                            "not-modified answer to an unconditional listing".into(),
                        ))
                    }
                };
                LoadedFiles {
                    files,
                    state: CacheState::Fetched,
                    revalidation: None,
                }
            }
        };

        self.inner.eviction.record_access(&key);
        if loaded.state == CacheState::Fetched {
            self.inner.eviction.enforce_limit();
        }
        Ok(loaded)
    }

    /// Drop the cached listing for `repo` so the next load fetches.
    pub fn invalidate_files(&self, repo: &RepoRef) {
        self.inner.listings.remove(repo);
    }

    async fn revalidate(&self, repo: RepoRef, cached: ListingRecord, on_update: Option<UpdateCallback>) {
        let key = listing_key(&repo);
        let metrics = &self.inner.github.client().context().metrics.metrics;

        let outcome = self.fetch_listing(&repo, cached.etag.as_deref()).await;
        match outcome {
            Ok(ListingResult::NotModified { .. }) => {
                self.inner.listings.touch(&repo, cached);
                metrics.record_revalidation(RevalidationOutcome::Unchanged);
                debug!(repo = %repo, "listing unchanged upstream");
            }
            Ok(ListingResult::Files { files, etag }) => {
                self.inner.listings.write(&repo, &files, etag.as_deref());
                self.inner.eviction.enforce_limit();
                metrics.record_revalidation(RevalidationOutcome::Updated);

                if files == cached.files {
                    debug!(repo = %repo, "listing refetched with identical files");
                } else if !self.is_focused(&key) {
                    debug!(repo = %repo, "listing updated for a superseded load, not notifying");
                } else if let Some(callback) = on_update {
                    info!(repo = %repo, count = files.len(), "listing updated in background");
                    callback(files);
                }
            }
            Err(e) => {
                metrics.record_revalidation(RevalidationOutcome::Failed);
                match e.reset_epoch_millis() {
                    Some(reset) => {
                        let now = self.inner.github.client().context().now_millis();
                        let retry_after = Duration::from_millis(reset.saturating_sub(now).max(0) as u64);
                        warn!(repo = %repo, retry_after_secs = retry_after.as_secs(), "revalidation hit rate limit");
                        self.inner.reporter.rate_limited(retry_after, reset);
                    }
                    None => {
                        warn!(repo = %repo, error = %e, "revalidation failed, keeping cached listing");
                        self.inner.reporter.refresh_failed(&key, &e);
                    }
                }
            }
        }
    }

    /// Tree strategy, falling back to the contents walk on any error.  When
    /// both fail, the contents error is returned.
    async fn fetch_listing(&self, repo: &RepoRef, etag: Option<&str>) -> Result<ListingResult, SyncError> {
        let github = &self.inner.github;
        let metrics = &github.client().context().metrics.metrics;
        let path = self.inner.listing.path_for_branch(&repo.branch);
        let started = Instant::now();

        let result = match list_via_tree(github, repo, path, etag).await {
            Ok(result) => Ok(result),
            Err(tree_err) => {
                warn!(repo = %repo, path, error = %tree_err, "tree listing failed, falling back to contents walk");
                metrics.strategy_fallbacks.inc();
                list_via_contents(github, repo, path, &self.inner.listing)
                    .await
                    .map(|files| ListingResult::Files { files, etag: None })
            }
        };

        metrics
            .listing_fetch_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        result.map(|listing| match listing {
            ListingResult::Files { files, etag } => ListingResult::Files {
                files: retain_files(files),
                etag,
            },
            not_modified => not_modified,
        })
    }

    fn set_focus(&self, key: &str) {
        let mut focus = self.inner.focus.lock().unwrap_or_else(|p| p.into_inner());
        *focus = Some(key.to_string());
    }

    fn is_focused(&self, key: &str) -> bool {
        let focus = self.inner.focus.lock().unwrap_or_else(|p| p.into_inner());
        focus.as_deref() == Some(key)
    }

    // -----------------------------------------------------------------------
    // Branches and content
    // -----------------------------------------------------------------------

    /// Branch list for `owner/repo`, cached for the session.  Empty results
    /// are not cached since they usually mean the listing failed.
    pub async fn load_branches(&self, owner: &str, repo: &str) -> Result<Vec<Branch>, SyncError> {
        let scope = format!("{owner}/{repo}");
        if let Some(branches) = self
            .inner
            .session
            .get_cache::<Vec<Branch>>(domain::BRANCHES, Some(&scope))
        {
            debug!(repo = %scope, count = branches.len(), "branches served from cache");
            return Ok(branches);
        }

        let branches = self.inner.github.get_branches(owner, repo).await?;
        if !branches.is_empty() {
            self.inner
                .session
                .set_cache(domain::BRANCHES, &branches, Some(&scope));
        }
        Ok(branches)
    }

    /// Text of one file.  A file whose whole content is a gist link is
    /// replaced by the gist's content.
    pub async fn read_file(&self, repo: &RepoRef, path: &str) -> Result<String, SyncError> {
        let scope = format!("{}:{path}", repo.identity());
        let text = match self
            .inner
            .session
            .get_cache::<String>(domain::RAW_FILE, Some(&scope))
        {
            Some(text) => text,
            None => {
                let text = self.inner.github.fetch_raw_file(repo, path).await?;
                self.inner
                    .session
                    .set_cache(domain::RAW_FILE, &text, Some(&scope));
                text
            }
        };

        if is_gist_pointer(&text) {
            debug!(repo = %repo, path, "file is a gist pointer, following");
            return self.read_gist(text.trim()).await;
        }
        Ok(text)
    }

    pub async fn read_gist(&self, gist_url: &str) -> Result<String, SyncError> {
        let gist_url = gist_url.trim();
        if let Some(text) = self
            .inner
            .session
            .get_cache::<String>(domain::GIST, Some(gist_url))
        {
            return Ok(text);
        }
        let text = self.inner.github.fetch_gist_content(gist_url).await?;
        self.inner
            .session
            .set_cache(domain::GIST, &text, Some(gist_url));
        Ok(text)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        self.inner.eviction.stats()
    }

    /// Wipe every cached record and the transient engine state.
    pub fn clear_all(&self) {
        self.inner.session.clear_all();
        self.inner.github.client().context().reset();
    }
}
