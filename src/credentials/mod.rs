//! Credential handling for upstream forge access.
//!
//! The engine never signs anyone in.  It only recovers a previously captured
//! access token and decides whether it is still safe to use.

pub mod token;

pub use token::{IdentitySession, StaticIdentity, TokenResolver};
