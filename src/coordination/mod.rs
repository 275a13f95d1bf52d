//! Coordination between concurrent callers.

pub mod inflight;
