//! File listing strategies.
//!
//! Two independent ways to enumerate markdown files under a folder of a
//! branch: a single recursive tree request ([`tree`]) that supports ETag
//! revalidation, and a per-directory contents walk ([`contents`]).  Both
//! produce the same normalised [`FileEntry`] shape.  Choosing between them
//! is the orchestrator's job.

pub mod contents;
pub mod tree;

use serde::{Deserialize, Serialize};

pub use contents::{list_via_contents, DirCache};
pub use tree::{list_via_tree, TreeFetch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

/// One entry of a normalised listing.  `path` is relative to the
/// repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub name: String,
    pub path: String,
    #[serde(rename = "sha", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl FileEntry {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// Outcome of a listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingResult {
    Files {
        files: Vec<FileEntry>,
        etag: Option<String>,
    },
    /// The conditional request confirmed the stored listing is current.
    NotModified { etag: String },
}

/// Keep only files with a usable path.
pub fn retain_files(files: Vec<FileEntry>) -> Vec<FileEntry> {
    files
        .into_iter()
        .filter(|f| f.is_file() && !f.path.is_empty())
        .collect()
}

/// `true` for names ending in `.md`, case-insensitively.
pub(crate) fn is_markdown(name: &str) -> bool {
    name.len() > 3 && name.to_ascii_lowercase().ends_with(".md")
}

/// Trim leading and trailing slashes so `"/prompts/"` and `"prompts"` name
/// the same folder.
pub(crate) fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}
