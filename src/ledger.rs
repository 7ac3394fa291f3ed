//! Remote ledger primitives
//!
//! The graph never talks to an RPC endpoint directly. It consumes two
//! narrow traits, one for reads and one for writes, and stays agnostic to
//! how they reach the network.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use solana_sdk::{
    account::Account, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::VersionedTransaction,
};

/// Read side: fetch raw accounts by address
#[async_trait]
pub trait AccountReader: Send + Sync + std::fmt::Debug {
    /// Fetch one account; `Ok(None)` when it does not exist
    async fn fetch_account(&self, address: &Pubkey, no_cache: bool) -> Result<Option<Account>>;

    /// Fetch several accounts, preserving input order
    ///
    /// The default fans out to [`AccountReader::fetch_account`]; readers
    /// backed by a batching endpoint should override it.
    async fn fetch_multiple_accounts(
        &self,
        addresses: &[Pubkey],
        no_cache: bool,
    ) -> Result<Vec<Option<Account>>> {
        try_join_all(
            addresses
                .iter()
                .map(|address| self.fetch_account(address, no_cache)),
        )
        .await
    }
}

/// Options forwarded to the write primitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Skip the ledger's own preflight simulation
    pub skip_preflight: bool,
    /// Delivery retries performed by the transport, not by this crate
    pub max_retries: Option<usize>,
    /// Simulate locally before sending, failing early on a rejected simulation
    pub simulate_first: bool,
}

/// Confirmed outcome of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub signature: Signature,
    pub slot: u64,
    pub logs: Vec<String>,
    pub succeeded: bool,
    /// Ledger error string when `succeeded` is false
    pub error: Option<String>,
}

/// Outcome of a simulation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationOutcome {
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
    /// Ledger error string when the simulation was rejected
    pub error: Option<String>,
}

/// Write side: blockhash, simulation and submission
#[async_trait]
pub trait LedgerWriter: Send + Sync + std::fmt::Debug {
    /// Blockhash to compile the next message against
    async fn latest_blockhash(&self) -> Result<Hash>;

    /// Simulate a signed transaction without landing it
    async fn simulate(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome>;

    /// Send a signed transaction and wait for its confirmation
    async fn submit(&self, tx: &VersionedTransaction, options: &SendOptions)
        -> Result<SubmitOutcome>;
}
