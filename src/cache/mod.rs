//! Request deduplication and short-term caching
//!
//! The cache is the only shared mutable state in the crate. It is injected
//! into every node through [`crate::context::ContextEnv`] rather than living
//! in a hidden global, so tests can substitute a fresh instance and callers
//! control its teardown with [`DedupCache::clear`].

pub mod dedup;

pub use dedup::{CacheKey, CacheParams, CachePolicy, CacheStats, DedupCache, NodeId};
