//! In-memory ledger
//!
//! Implements both ledger primitives over a local account map. It backs the
//! `ctx-inspect` tool and is the mock remote for tests: every read is counted
//! per address, reads can be delayed or failed per address, and submissions
//! are recorded and answered by a replaceable script.

use crate::error::{ContextError, Result};
use crate::ledger::{AccountReader, LedgerWriter, SendOptions, SimulationOutcome, SubmitOutcome};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use solana_sdk::{
    account::Account, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::VersionedTransaction,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// What the script sees for each simulation or submission
#[derive(Debug)]
pub struct SubmitRequest<'a> {
    pub tx: &'a VersionedTransaction,
    /// Number of submissions recorded before this one
    pub index: usize,
    pub simulated: bool,
}

/// Scripted ledger response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedOutcome {
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub units_consumed: Option<u64>,
}

impl ScriptedOutcome {
    pub fn success(logs: Vec<String>) -> Self {
        Self {
            logs,
            error: None,
            units_consumed: Some(5_000),
        }
    }

    pub fn failure(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            logs,
            error: Some(error.into()),
            units_consumed: None,
        }
    }
}

/// Submission handler; may mutate the ledger to model program effects
pub type SubmitScript =
    Arc<dyn Fn(&InMemoryLedger, &SubmitRequest<'_>) -> ScriptedOutcome + Send + Sync>;

/// Local account store implementing [`AccountReader`] and [`LedgerWriter`]
pub struct InMemoryLedger {
    accounts: DashMap<Pubkey, Account>,
    fetches: DashMap<Pubkey, usize>,
    latency: DashMap<Pubkey, Duration>,
    read_failures: DashMap<Pubkey, String>,
    submissions: Mutex<Vec<VersionedTransaction>>,
    simulations: AtomicUsize,
    slot: AtomicU64,
    script: RwLock<Option<SubmitScript>>,
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("accounts", &self.accounts.len())
            .field("submissions", &self.submissions.lock().len())
            .field("slot", &self.slot.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            fetches: DashMap::new(),
            latency: DashMap::new(),
            read_failures: DashMap::new(),
            submissions: Mutex::new(Vec::new()),
            simulations: AtomicUsize::new(0),
            slot: AtomicU64::new(1),
            script: RwLock::new(None),
        }
    }

    /// Store or replace an account
    pub fn set_account(&self, address: Pubkey, account: Account) {
        self.accounts.insert(address, account);
    }

    /// Store an account with the given owner and data, rent-exempt sized
    pub fn set_data(&self, address: Pubkey, owner: Pubkey, data: Vec<u8>) {
        let lamports = 890_880 + 6_960 * data.len() as u64;
        self.set_account(
            address,
            Account {
                lamports,
                data,
                owner,
                executable: false,
                rent_epoch: 0,
            },
        );
    }

    pub fn remove_account(&self, address: &Pubkey) -> Option<Account> {
        self.accounts.remove(address).map(|(_, account)| account)
    }

    pub fn account(&self, address: &Pubkey) -> Option<Account> {
        self.accounts.get(address).map(|entry| entry.clone())
    }

    /// Delay every read of `address`
    pub fn set_latency(&self, address: Pubkey, latency: Duration) {
        self.latency.insert(address, latency);
    }

    /// Make reads of `address` fail until [`InMemoryLedger::clear_read_failure`]
    pub fn fail_reads(&self, address: Pubkey, message: impl Into<String>) {
        self.read_failures.insert(address, message.into());
    }

    pub fn clear_read_failure(&self, address: &Pubkey) {
        self.read_failures.remove(address);
    }

    /// Number of remote reads of one address
    pub fn fetch_count(&self, address: &Pubkey) -> usize {
        self.fetches.get(address).map(|count| *count).unwrap_or(0)
    }

    /// Number of remote reads across all addresses
    pub fn total_fetches(&self) -> usize {
        self.fetches.iter().map(|entry| *entry.value()).sum()
    }

    pub fn reset_fetch_counts(&self) {
        self.fetches.clear();
    }

    /// Replace the submission handler
    pub fn on_submit<F>(&self, script: F)
    where
        F: Fn(&InMemoryLedger, &SubmitRequest<'_>) -> ScriptedOutcome + Send + Sync + 'static,
    {
        *self.script.write() = Some(Arc::new(script));
    }

    /// Transactions submitted so far, in order
    pub fn submissions(&self) -> Vec<VersionedTransaction> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn simulation_count(&self) -> usize {
        self.simulations.load(Ordering::Relaxed)
    }

    pub fn current_slot(&self) -> u64 {
        self.slot.load(Ordering::Relaxed)
    }

    fn run_script(&self, request: &SubmitRequest<'_>) -> ScriptedOutcome {
        let script = self.script.read().clone();
        match script {
            Some(script) => script(self, request),
            None => ScriptedOutcome::success(vec![]),
        }
    }
}

#[async_trait]
impl AccountReader for InMemoryLedger {
    async fn fetch_account(&self, address: &Pubkey, _no_cache: bool) -> Result<Option<Account>> {
        *self.fetches.entry(*address).or_insert(0) += 1;
        trace!(address = %address, "in-memory fetch");

        let latency = self.latency.get(address).map(|entry| *entry);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.read_failures.get(address).map(|entry| entry.clone());
        if let Some(message) = failure {
            return Err(ContextError::rpc(message));
        }
        Ok(self.account(address))
    }
}

#[async_trait]
impl LedgerWriter for InMemoryLedger {
    async fn latest_blockhash(&self) -> Result<Hash> {
        Ok(Hash::new_unique())
    }

    async fn simulate(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome> {
        self.simulations.fetch_add(1, Ordering::Relaxed);
        let outcome = self.run_script(&SubmitRequest {
            tx,
            index: self.submission_count(),
            simulated: true,
        });
        Ok(SimulationOutcome {
            logs: outcome.logs,
            units_consumed: outcome.units_consumed,
            error: outcome.error,
        })
    }

    async fn submit(&self, tx: &VersionedTransaction, _options: &SendOptions) -> Result<SubmitOutcome> {
        let index = self.submission_count();
        let outcome = self.run_script(&SubmitRequest {
            tx,
            index,
            simulated: false,
        });
        self.submissions.lock().push(tx.clone());
        let slot = self.slot.fetch_add(1, Ordering::Relaxed) + 1;
        let signature = tx.signatures.first().copied().unwrap_or_else(Signature::default);

        Ok(SubmitOutcome {
            signature,
            slot,
            logs: outcome.logs,
            succeeded: outcome.error.is_none(),
            error: outcome.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_counts_and_absence() {
        let ledger = InMemoryLedger::new();
        let present = Pubkey::new_unique();
        let missing = Pubkey::new_unique();
        ledger.set_data(present, Pubkey::new_unique(), vec![1, 2, 3]);

        let account = ledger.fetch_account(&present, false).await.unwrap();
        assert_eq!(account.map(|a| a.data), Some(vec![1, 2, 3]));
        assert!(ledger.fetch_account(&missing, false).await.unwrap().is_none());

        let batch = ledger
            .fetch_multiple_accounts(&[missing, present], true)
            .await
            .unwrap();
        assert!(batch[0].is_none());
        assert!(batch[1].is_some());

        assert_eq!(ledger.fetch_count(&present), 2);
        assert_eq!(ledger.total_fetches(), 4);
    }

    #[tokio::test]
    async fn test_read_failure_injection() {
        let ledger = InMemoryLedger::new();
        let address = Pubkey::new_unique();
        ledger.fail_reads(address, "node is behind");

        let err = ledger.fetch_account(&address, false).await.unwrap_err();
        assert!(err.is_retryable());

        ledger.clear_read_failure(&address);
        assert!(ledger.fetch_account(&address, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_submission() {
        let ledger = InMemoryLedger::new();
        ledger.on_submit(|_, request| {
            if request.index == 0 {
                ScriptedOutcome::failure("insufficient funds", vec!["Program log: no".into()])
            } else {
                ScriptedOutcome::success(vec!["Program log: yes".into()])
            }
        });

        let tx = VersionedTransaction::default();
        let first = ledger.submit(&tx, &SendOptions::default()).await.unwrap();
        assert!(!first.succeeded);
        assert_eq!(first.error.as_deref(), Some("insufficient funds"));

        let second = ledger.submit(&tx, &SendOptions::default()).await.unwrap();
        assert!(second.succeeded);
        assert!(second.slot > first.slot);
        assert_eq!(ledger.submission_count(), 2);
    }
}
