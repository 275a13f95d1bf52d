//! Recursive tree strategy.
//!
//! One `git/trees/{branch}?recursive=1` request per branch, filtered down to
//! markdown blobs under the requested folder.  A stored ETag is sent as
//! `If-None-Match` and a `304` is reported as [`ListingResult::NotModified`].

use reqwest::header::{HeaderMap, HeaderValue, IF_NONE_MATCH};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{is_markdown, normalize_path, FileEntry, FileKind, ListingResult};
use crate::error::SyncError;
use crate::forge::{ForgeClient, GitHub, RepoRef};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeBody {
    tree: Vec<TreeNode>,
    #[serde(default)]
    truncated: bool,
}

/// Unfiltered outcome of one tree request, shared between coalesced
/// callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeFetch {
    Tree {
        nodes: Vec<TreeNode>,
        etag: Option<String>,
    },
    NotModified,
}

/// List markdown files under `path` on `repo`'s branch.
///
/// Concurrent calls for the same branch and validator share one request.
/// Conditional and unconditional calls never share, so a `304` only reaches
/// callers that sent an ETag.
pub async fn list_via_tree(
    github: &GitHub,
    repo: &RepoRef,
    path: &str,
    etag: Option<&str>,
) -> Result<ListingResult, SyncError> {
    let key = match etag {
        Some(tag) => format!("tree:{}#{tag}", repo.identity()),
        None => format!("tree:{}", repo.identity()),
    };
    let url = github.tree_url(repo)?;
    let client = github.client().clone();
    let validator = etag.map(str::to_string);

    let fetched = github
        .client()
        .context()
        .trees
        .coalesce(&key, move || async move {
            fetch_tree(&client, url.as_str(), validator.as_deref()).await
        })
        .await?;

    match fetched {
        TreeFetch::NotModified => Ok(ListingResult::NotModified {
            etag: etag.unwrap_or_default().to_string(),
        }),
        TreeFetch::Tree { nodes, etag } => {
            let files = markdown_under(&nodes, normalize_path(path));
            debug!(repo = %repo, path, count = files.len(), "tree listing");
            Ok(ListingResult::Files { files, etag })
        }
    }
}

async fn fetch_tree(
    client: &ForgeClient,
    url: &str,
    etag: Option<&str>,
) -> Result<TreeFetch, SyncError> {
    let mut headers = HeaderMap::new();
    if let Some(tag) = etag {
        match HeaderValue::from_str(tag) {
            Ok(value) => {
                headers.insert(IF_NONE_MATCH, value);
            }
            Err(_) => warn!(etag = tag, "stored ETag is not a valid header value, fetching unconditionally"),
        }
    }

    let resp = client.request(url, &headers).await?;

    if resp.status == 304 {
        if headers.contains_key(IF_NONE_MATCH) {
            return Ok(TreeFetch::NotModified);
        }
        return Err(SyncError::InvalidResponse(format!(
            "304 for unconditional request to {url}"
        )));
    }
    if !resp.is_success() {
        return Err(SyncError::Http {
            status: resp.status,
            url: url.to_string(),
        });
    }

    let body: TreeBody = resp.json()?;
    if body.truncated {
        warn!(url, "tree listing truncated upstream, results are partial");
    }

    Ok(TreeFetch::Tree {
        nodes: body.tree,
        etag: resp.header("ETag").map(str::to_string),
    })
}

/// Blobs whose path is `{folder}/<anything>.md`, case-insensitively.  An
/// empty folder matches every markdown blob.
fn markdown_under(nodes: &[TreeNode], folder: &str) -> Vec<FileEntry> {
    let prefix = format!("{}/", folder.to_lowercase());

    nodes
        .iter()
        .filter(|node| node.kind == "blob")
        .filter(|node| {
            let lower = node.path.to_lowercase();
            let rest = if folder.is_empty() {
                Some(lower.as_str())
            } else {
                lower.strip_prefix(&prefix)
            };
            rest.is_some_and(is_markdown)
        })
        .map(|node| FileEntry {
            kind: FileKind::File,
            name: node.path.rsplit('/').next().unwrap_or(&node.path).to_string(),
            path: node.path.clone(),
            content_hash: node.sha.clone(),
            download_url: None,
        })
        .collect()
}
