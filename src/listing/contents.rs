//! Per-directory contents walk.
//!
//! Lists a folder with one `contents/{path}` request per directory and
//! recurses into subdirectories a bounded batch at a time.  Results are
//! concatenated in discovery order: a directory's own markdown files first,
//! then each subdirectory's results in the order the API returned them.  Any
//! failing directory fails the whole walk.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::{try_join_all, BoxFuture, FutureExt};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use super::{is_markdown, normalize_path, FileEntry, FileKind};
use crate::config::ListingConfig;
use crate::error::SyncError;
use crate::forge::{GitHub, RepoRef};

#[derive(Debug, Deserialize)]
struct ContentsItem {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    path: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

impl ContentsItem {
    fn into_entry(self) -> Option<FileEntry> {
        let kind = match self.kind.as_str() {
            "file" => FileKind::File,
            "dir" => FileKind::Dir,
            // symlinks and submodules
            _ => return None,
        };
        Some(FileEntry {
            kind,
            name: self.name,
            path: self.path,
            content_hash: self.sha,
            download_url: self.download_url,
        })
    }
}

// ---------------------------------------------------------------------------
// Directory cache
// ---------------------------------------------------------------------------

/// Short-lived cache of single-directory listings, keyed by
/// `owner/repo@branch:path`.
#[derive(Debug, Default)]
pub struct DirCache {
    entries: Mutex<HashMap<String, (i64, Vec<FileEntry>)>>,
}

impl DirCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (i64, Vec<FileEntry>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A listing stored less than `ttl_millis` ago.  A zero TTL disables
    /// the cache.
    pub fn get(&self, key: &str, now_millis: i64, ttl_millis: i64) -> Option<Vec<FileEntry>> {
        if ttl_millis <= 0 {
            return None;
        }
        let entries = self.lock();
        let (stored_at, listing) = entries.get(key)?;
        (now_millis - stored_at < ttl_millis).then(|| listing.clone())
    }

    pub fn insert(&self, key: &str, now_millis: i64, listing: Vec<FileEntry>) {
        self.lock().insert(key.to_string(), (now_millis, listing));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Walk
// ---------------------------------------------------------------------------

/// Every markdown file under `path`, recursively.
pub async fn list_via_contents(
    github: &GitHub,
    repo: &RepoRef,
    path: &str,
    config: &ListingConfig,
) -> Result<Vec<FileEntry>, SyncError> {
    let walk = Walk {
        github,
        repo,
        batch_size: config.contents_batch_size.max(1),
        ttl_millis: config.dir_cache_ttl_millis(),
    };
    let files = walk.directory(normalize_path(path).to_string()).await?;
    debug!(repo = %repo, path, count = files.len(), "contents listing");
    Ok(files)
}

struct Walk<'a> {
    github: &'a GitHub,
    repo: &'a RepoRef,
    batch_size: usize,
    ttl_millis: i64,
}

impl<'a> Walk<'a> {
    fn directory(&'a self, path: String) -> BoxFuture<'a, Result<Vec<FileEntry>, SyncError>> {
        async move {
            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            for entry in self.list_one(&path).await? {
                match entry.kind {
                    FileKind::File if is_markdown(&entry.name) => files.push(entry),
                    FileKind::File => {}
                    FileKind::Dir => subdirs.push(entry.path),
                }
            }

            for batch in subdirs.chunks(self.batch_size) {
                let nested = try_join_all(batch.iter().map(|dir| self.directory(dir.clone()))).await?;
                files.extend(nested.into_iter().flatten());
            }
            Ok(files)
        }
        .boxed()
    }

    async fn list_one(&self, path: &str) -> Result<Vec<FileEntry>, SyncError> {
        let context = self.github.client().context();
        let key = format!("{}:{path}", self.repo.identity());
        if let Some(hit) = context.dir_cache.get(&key, context.now_millis(), self.ttl_millis) {
            debug!(key, "directory cache hit");
            return Ok(hit);
        }

        let url = self.github.contents_url(self.repo, path)?;
        let resp = self.github.client().request(url.as_str(), &HeaderMap::new()).await?;
        if !resp.is_success() {
            return Err(SyncError::Http {
                status: resp.status,
                url: url.to_string(),
            });
        }

        let items: Vec<ContentsItem> = resp.json()?;
        let listing: Vec<FileEntry> = items.into_iter().filter_map(ContentsItem::into_entry).collect();
        context.dir_cache.insert(&key, context.now_millis(), listing.clone());
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::{list_via_tree, ListingResult};
    use crate::testing::{Harness, Reply};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn contents_url(path: &str) -> String {
        format!("https://api.test/repos/acme/widgets/contents/{path}?ref=main")
    }

    fn item(kind: &str, path: &str) -> serde_json::Value {
        let download_url = (kind == "file").then(|| format!("https://raw.test/{path}"));
        json!({
            "type": kind,
            "name": path.rsplit('/').next().unwrap(),
            "path": path,
            "sha": format!("sha-{path}"),
            "download_url": download_url,
        })
    }

    /// prompts/{a.md, b.md, notes.txt, x/, y/}
    /// prompts/x/{c.md, z/}   prompts/x/z/{d.md}   prompts/y/{e.md}
    fn route_fixture(h: &Harness) {
        h.transport.route(
            &contents_url("prompts"),
            Reply::json(
                200,
                &json!([
                    item("file", "prompts/a.md"),
                    item("dir", "prompts/x"),
                    item("file", "prompts/notes.txt"),
                    item("dir", "prompts/y"),
                    item("file", "prompts/b.md"),
                    {"type": "symlink", "name": "l", "path": "prompts/l"}
                ])
                .to_string(),
            ),
        );
        h.transport.route(
            &contents_url("prompts/x"),
            Reply::json(
                200,
                &json!([item("dir", "prompts/x/z"), item("file", "prompts/x/c.md")]).to_string(),
            ),
        );
        h.transport.route(
            &contents_url("prompts/x/z"),
            Reply::json(200, &json!([item("file", "prompts/x/z/d.md")]).to_string()),
        );
        h.transport.route(
            &contents_url("prompts/y"),
            Reply::json(200, &json!([item("file", "prompts/y/e.md")]).to_string()),
        );
    }

    fn paths(files: &[FileEntry]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    #[tokio::test]
    async fn walks_nested_directories_in_discovery_order() {
        let h = Harness::new();
        route_fixture(&h);

        let repo = RepoRef::new("acme", "widgets", "main");
        let files = list_via_contents(&h.github, &repo, "prompts", &h.config.listing)
            .await
            .unwrap();
        assert_eq!(
            paths(&files),
            vec![
                "prompts/a.md",
                "prompts/b.md",
                "prompts/x/c.md",
                "prompts/x/z/d.md",
                "prompts/y/e.md"
            ]
        );
        assert_eq!(files[0].download_url.as_deref(), Some("https://raw.test/prompts/a.md"));
        assert!(files.iter().all(FileEntry::is_file));
    }

    #[tokio::test]
    async fn matches_tree_strategy_on_same_fixture() {
        let h = Harness::new();
        route_fixture(&h);
        h.transport.route(
            "https://api.test/repos/acme/widgets/git/trees/main?recursive=1",
            Reply::json(
                200,
                &json!({"tree": [
                    {"type": "tree", "path": "prompts"},
                    {"type": "blob", "path": "prompts/a.md"},
                    {"type": "blob", "path": "prompts/b.md"},
                    {"type": "blob", "path": "prompts/notes.txt"},
                    {"type": "tree", "path": "prompts/x"},
                    {"type": "blob", "path": "prompts/x/c.md"},
                    {"type": "tree", "path": "prompts/x/z"},
                    {"type": "blob", "path": "prompts/x/z/d.md"},
                    {"type": "tree", "path": "prompts/y"},
                    {"type": "blob", "path": "prompts/y/e.md"}
                ]})
                .to_string(),
            ),
        );

        let repo = RepoRef::new("acme", "widgets", "main");
        let walked = list_via_contents(&h.github, &repo, "prompts", &h.config.listing)
            .await
            .unwrap();
        let ListingResult::Files { files: tree, .. } =
            list_via_tree(&h.github, &repo, "prompts", None).await.unwrap()
        else {
            panic!("expected files");
        };

        let a: BTreeSet<_> = paths(&walked).into_iter().collect();
        let b: BTreeSet<_> = paths(&tree).into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[tokio::test]
    async fn one_failing_directory_fails_the_walk() {
        let h = Harness::new();
        route_fixture(&h);
        h.transport.reset_route(&contents_url("prompts/y"), Reply::status(500));

        let repo = RepoRef::new("acme", "widgets", "main");
        let err = list_via_contents(&h.github, &repo, "prompts", &h.config.listing)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn subdirectories_run_in_bounded_batches() {
        let h = Harness::new();
        let dirs: Vec<serde_json::Value> =
            (0..7).map(|i| item("dir", &format!("prompts/d{i}"))).collect();
        h.transport
            .route(&contents_url("prompts"), Reply::json(200, &json!(dirs).to_string()));
        for i in 0..7 {
            h.transport.route(
                &contents_url(&format!("prompts/d{i}")),
                Reply::json(200, &json!([item("file", &format!("prompts/d{i}/f.md"))]).to_string()),
            );
        }

        let repo = RepoRef::new("acme", "widgets", "main");
        let files = list_via_contents(&h.github, &repo, "prompts", &h.config.listing)
            .await
            .unwrap();
        assert_eq!(files.len(), 7);
        assert_eq!(files[6].path, "prompts/d6/f.md");
        assert_eq!(h.transport.max_concurrency(), 3);
    }

    #[tokio::test]
    async fn directory_cache_serves_repeat_walks() {
        let h = Harness::new();
        route_fixture(&h);
        let repo = RepoRef::new("acme", "widgets", "main");

        list_via_contents(&h.github, &repo, "prompts", &h.config.listing).await.unwrap();
        let first = h.transport.requests().len();
        list_via_contents(&h.github, &repo, "prompts", &h.config.listing).await.unwrap();
        assert_eq!(h.transport.requests().len(), first);

        h.clock.advance(h.config.listing.dir_cache_ttl_millis());
        list_via_contents(&h.github, &repo, "prompts", &h.config.listing).await.unwrap();
        assert_eq!(h.transport.requests().len(), first * 2);
    }

    #[test]
    fn dir_cache_respects_ttl() {
        let cache = DirCache::default();
        cache.insert("k", 1_000, Vec::new());
        assert!(cache.get("k", 1_500, 1_000).is_some());
        assert!(cache.get("k", 2_000, 1_000).is_none());
        assert!(cache.get("k", 1_000, 0).is_none());
    }
}
