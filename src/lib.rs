//! Ledger context graph
//!
//! Client-side framework for reading and writing the state of on-chain
//! programs as a graph of cached, deduplicated context nodes:
//!
//! - [`cache`]: in-flight request coalescing and TTL caching keyed by node
//! - [`context`]: node types (plain, account, iterative) and the `Context` trait
//! - [`template`]: transaction templates with assembly, execution and chaining
//! - [`tree`]: read-only introspection of a graph
//!
//! The graph talks to the ledger only through [`ledger::AccountReader`] and
//! [`ledger::LedgerWriter`]; [`memory::InMemoryLedger`] implements both.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod inspect;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod observability;
pub mod template;
pub mod tree;

pub use cache::{CacheKey, CachePolicy, CacheStats, DedupCache, NodeId};
pub use config::FrameworkConfig;
pub use context::{
    AccountContext, AddressResolver, AddressState, Context, ContextEnv, ContextNode, Decoder,
    IterativeAccountContext, NodeSpec, ParentLink, SharedSigner, Snapshot,
};
pub use error::{ContextError, DecodeError, Landed, Result, SubmissionDiagnostic};
pub use ledger::{AccountReader, LedgerWriter, SendOptions};
pub use template::{
    EventDecoders, ExecuteOverrides, ExecutionResult, InstructionBundle, TemplateConfig,
    TemplateContext,
};
pub use tree::{describe, to_tree_string};

// Re-export commonly used types
pub use solana_sdk::{pubkey::Pubkey, signature::Signature};
