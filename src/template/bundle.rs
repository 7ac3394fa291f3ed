//! Instruction bundles and their compilation into signed transactions
//!
//! Bundles compile to v0 messages so that templates can reference address
//! lookup tables. Signers are picked out of the available set by the
//! message's required-signer keys, in message order.

use crate::context::SharedSigner;
use crate::error::{ContextError, DecodeError, Result};
use crate::ledger::AccountReader;
#[allow(deprecated)]
use solana_sdk::address_lookup_table::{state::AddressLookupTable, AddressLookupTableAccount};
use solana_sdk::{
    compute_budget,
    hash::Hash,
    instruction::Instruction,
    message::{v0, VersionedMessage},
    pubkey::Pubkey,
    signer::Signer,
    transaction::VersionedTransaction,
};
use tracing::debug;

/// Ordered instructions plus the lookup tables they may be compiled against
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionBundle {
    pub instructions: Vec<Instruction>,
    pub lookup_tables: Vec<AddressLookupTableAccount>,
}

impl InstructionBundle {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Programs invoked, in instruction order
    pub fn program_ids(&self) -> Vec<Pubkey> {
        self.instructions.iter().map(|ix| ix.program_id).collect()
    }
}

/// Keys that must sign a message, in message order
pub fn required_signers(message: &VersionedMessage) -> &[Pubkey] {
    let keys = message.static_account_keys();
    let count = (message.header().num_required_signatures as usize).min(keys.len());
    &keys[..count]
}

/// Compile and sign `bundle` with `payer` as fee payer
///
/// `available` may hold more signers than the message needs; extras are
/// ignored. A required signer that is not available is a signing error.
pub fn compile(
    template: &str,
    bundle: &InstructionBundle,
    payer: &SharedSigner,
    available: &[SharedSigner],
    blockhash: Hash,
) -> Result<VersionedTransaction> {
    if bundle.is_empty() {
        return Err(ContextError::InstructionBuild {
            template: template.to_string(),
            reason: "bundle has no instructions".to_string(),
        });
    }
    sanity_check_ix_order(&bundle.instructions).map_err(|reason| ContextError::InstructionBuild {
        template: template.to_string(),
        reason,
    })?;

    let message = v0::Message::try_compile(
        &payer.pubkey(),
        &bundle.instructions,
        &bundle.lookup_tables,
        blockhash,
    )
    .map_err(|e| ContextError::InstructionBuild {
        template: template.to_string(),
        reason: e.to_string(),
    })?;
    let message = VersionedMessage::V0(message);

    let signers = required_signers(&message)
        .iter()
        .map(|key| {
            std::iter::once(payer)
                .chain(available)
                .find(|signer| signer.pubkey() == *key)
                .cloned()
                .ok_or_else(|| ContextError::Signing(format!("missing signer {}", key)))
        })
        .collect::<Result<Vec<SharedSigner>>>()?;

    debug!(
        template,
        instructions = bundle.len(),
        lookup_tables = bundle.lookup_tables.len(),
        signers = signers.len(),
        "compiled bundle"
    );
    VersionedTransaction::try_new(message, &signers).map_err(|e| ContextError::Signing(e.to_string()))
}

/// Parse address lookup table account state
pub fn decode_lookup_table(key: Pubkey, data: &[u8]) -> Result<AddressLookupTableAccount> {
    let table = AddressLookupTable::deserialize(data)
        .map_err(|e| ContextError::decode(key, DecodeError::Malformed(e.to_string())))?;
    Ok(AddressLookupTableAccount {
        key,
        addresses: table.addresses.to_vec(),
    })
}

/// Fetch and parse lookup tables with one batched read
pub async fn fetch_lookup_tables(
    reader: &dyn AccountReader,
    template: &str,
    keys: &[Pubkey],
    no_cache: bool,
) -> Result<Vec<AddressLookupTableAccount>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let accounts = reader.fetch_multiple_accounts(keys, no_cache).await?;
    keys.iter()
        .zip(accounts)
        .map(|(key, account)| {
            let account = account.ok_or_else(|| {
                ContextError::invalid_context(template, format!("lookup table {} does not exist", key))
            })?;
            decode_lookup_table(*key, &account.data)
        })
        .collect()
}

/// Compute budget instructions must lead the bundle and appear at most once
/// per kind
#[cfg(debug_assertions)]
pub fn sanity_check_ix_order(instructions: &[Instruction]) -> std::result::Result<(), String> {
    let budget_id = compute_budget::id();
    let mut seen_other = false;
    let mut kinds = Vec::new();

    for (idx, ix) in instructions.iter().enumerate() {
        if ix.program_id != budget_id {
            seen_other = true;
            continue;
        }
        if seen_other {
            return Err(format!(
                "compute budget instruction at position {} follows program instructions",
                idx
            ));
        }
        let kind = ix.data.first().copied();
        if kinds.contains(&kind) {
            return Err(format!("duplicate compute budget instruction at position {}", idx));
        }
        kinds.push(kind);
    }
    Ok(())
}

/// No-op in release builds
#[cfg(not(debug_assertions))]
#[inline]
pub fn sanity_check_ix_order(_instructions: &[Instruction]) -> std::result::Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLedger;
    #[allow(deprecated)]
    use solana_sdk::address_lookup_table::{program as lookup_table_program, state::LookupTableMeta};
    use solana_sdk::{
        compute_budget::ComputeBudgetInstruction,
        instruction::AccountMeta,
        signature::Keypair,
        signer::Signer,
    };
    use std::borrow::Cow;
    use std::sync::Arc;

    fn shared(keypair: Keypair) -> SharedSigner {
        Arc::new(keypair)
    }

    fn ix_signed_by(signer: Pubkey) -> Instruction {
        Instruction::new_with_bytes(
            Pubkey::new_unique(),
            &[1],
            vec![AccountMeta::new(signer, true), AccountMeta::new(Pubkey::new_unique(), false)],
        )
    }

    #[test]
    fn test_compile_selects_required_signers() {
        let payer = shared(Keypair::new());
        let authority = shared(Keypair::new());
        let unused = shared(Keypair::new());
        let bundle = InstructionBundle {
            instructions: vec![ix_signed_by(authority.pubkey())],
            lookup_tables: vec![],
        };

        let tx = compile(
            "withdraw",
            &bundle,
            &payer,
            &[unused, authority.clone()],
            Hash::new_unique(),
        )
        .unwrap();
        assert_eq!(tx.signatures.len(), 2);
        assert_eq!(required_signers(&tx.message), &[payer.pubkey(), authority.pubkey()]);
        assert!(tx.verify_with_results().iter().all(|ok| *ok));
    }

    #[test]
    fn test_missing_signer_and_empty_bundle() {
        let payer = shared(Keypair::new());
        let bundle = InstructionBundle {
            instructions: vec![ix_signed_by(Pubkey::new_unique())],
            lookup_tables: vec![],
        };
        let err = compile("withdraw", &bundle, &payer, &[], Hash::new_unique()).unwrap_err();
        assert_eq!(err.category(), "signing");

        let err = compile("withdraw", &InstructionBundle::default(), &payer, &[], Hash::new_unique())
            .unwrap_err();
        assert_eq!(err.category(), "instruction");
    }

    #[test]
    fn test_ix_order_check() {
        let budget = ComputeBudgetInstruction::set_compute_unit_limit(200_000);
        let program = ix_signed_by(Pubkey::new_unique());
        assert!(sanity_check_ix_order(&[budget.clone(), program.clone()]).is_ok());
        if cfg!(debug_assertions) {
            assert!(sanity_check_ix_order(&[program, budget.clone()]).is_err());
            assert!(sanity_check_ix_order(&[budget.clone(), budget]).is_err());
        }
    }

    #[tokio::test]
    async fn test_fetch_lookup_tables() {
        let ledger = InMemoryLedger::new();
        let key = Pubkey::new_unique();
        let addresses = vec![Pubkey::new_unique(), Pubkey::new_unique()];
        let data = AddressLookupTable {
            meta: LookupTableMeta::new(Pubkey::new_unique()),
            addresses: Cow::Owned(addresses.clone()),
        }
        .serialize_for_tests()
        .unwrap();
        ledger.set_data(key, lookup_table_program::id(), data);

        let tables = fetch_lookup_tables(&ledger, "swap", &[key], false).await.unwrap();
        assert_eq!(tables[0].addresses, addresses);

        let missing = fetch_lookup_tables(&ledger, "swap", &[Pubkey::new_unique()], false)
            .await
            .unwrap_err();
        assert_eq!(missing.category(), "invalid_context");

        let garbage = Pubkey::new_unique();
        ledger.set_data(garbage, Pubkey::new_unique(), vec![7; 5]);
        let err = fetch_lookup_tables(&ledger, "swap", &[garbage], false).await.unwrap_err();
        assert_eq!(err.category(), "decode");
    }
}
