//! Local persistence for fetched data.
//!
//! Provides the [`Store`](store::Store) key-value seam, the domain-keyed
//! [`SessionCache`] with its static TTL policy table, the per-branch
//! [`ListingCache`], and the LRU [`EvictionController`] capping how many
//! listings are kept.

pub mod listing;
pub mod lru;
pub mod policy;
pub mod session;
pub mod store;

pub use listing::{ListingCache, Lookup};
pub use lru::EvictionController;
pub use session::SessionCache;
