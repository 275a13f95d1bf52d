//! Repository content sync and cache engine.
//!
//! Lists and reads markdown files from forge-hosted repositories while
//! keeping upstream API usage low: concurrent identical requests are
//! coalesced, listings are served stale-while-revalidate with ETag
//! revalidation, and the upstream rate-limit window is tracked from every
//! response.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordination;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod forge;
pub mod listing;
pub mod metrics;
pub mod status;
pub mod sync;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineParts};
pub use error::SyncError;
pub use forge::RepoRef;
pub use listing::FileEntry;
pub use sync::{CacheState, LoadedFiles, SyncOrchestrator};
