//! Ledger dumps for the `ctx-inspect` tool
//!
//! A dump is a JSON document with the accounts to seed an in-memory ledger
//! with and the shape of the graph to build over them:
//!
//! ```json
//! {
//!   "accounts": [{ "address": "...", "owner": "...", "data": "<base64>" }],
//!   "graph": {
//!     "label": "program",
//!     "children": [
//!       { "label": "config", "address": "...", "account": true },
//!       { "label": "vault", "seeds": ["vault"], "program": "...", "account": true },
//!       { "label": "entries", "items": ["...", "..."] }
//!     ]
//!   }
//! }
//! ```

use crate::context::{
    AccountContext, AddressResolver, ChildSeed, Context, ContextEnv, ContextNode, Decoder,
    IterativeAccountContext, NodeSpec,
};
use crate::context::decode::strip_discriminator;
use crate::error::ContextError;
use crate::memory::InMemoryLedger;
use anyhow::{bail, Context as _, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use solana_sdk::{account::Account, pubkey::Pubkey};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerDump {
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
    pub graph: GraphEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountEntry {
    pub address: String,
    pub owner: String,
    #[serde(default)]
    pub lamports: Option<u64>,
    /// Base64 account data
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub executable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphEntry {
    pub label: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// UTF-8 seeds of a program-derived address, with `program`
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default)]
    pub program: Option<String>,
    /// Fetch the account at the node's address
    #[serde(default)]
    pub account: bool,
    /// Base64 discriminator stripped from account data
    #[serde(default)]
    pub discriminator: Option<String>,
    /// Addresses of an iterative node's children
    #[serde(default)]
    pub items: Option<Vec<String>>,
    #[serde(default)]
    pub children: Vec<GraphEntry>,
}

fn parse_pubkey(value: &str, what: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).with_context(|| format!("invalid {} address {:?}", what, value))
}

impl LedgerDump {
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("failed to parse ledger dump")
    }

    /// In-memory ledger holding every dumped account
    pub fn seed_ledger(&self) -> Result<InMemoryLedger> {
        let ledger = InMemoryLedger::new();
        for entry in &self.accounts {
            let address = parse_pubkey(&entry.address, "account")?;
            let owner = parse_pubkey(&entry.owner, "owner")?;
            let data = STANDARD
                .decode(entry.data.trim())
                .with_context(|| format!("account {} has invalid base64 data", entry.address))?;
            match entry.lamports {
                Some(lamports) => ledger.set_account(
                    address,
                    Account {
                        lamports,
                        data,
                        owner,
                        executable: entry.executable,
                        rent_epoch: 0,
                    },
                ),
                None => ledger.set_data(address, owner, data),
            }
        }
        Ok(ledger)
    }

    /// Validate the graph and build it over `env`
    pub fn build_graph(&self, env: Arc<ContextEnv>) -> Result<Arc<dyn Context>> {
        let plan = NodePlan::from_entry(&self.graph)?;
        Ok(plan.build_root(env))
    }
}

/// Graph entry with every address parsed
#[derive(Debug, Clone)]
struct NodePlan {
    label: String,
    kind: Option<String>,
    address: AddressResolver,
    account: bool,
    discriminator: Option<Vec<u8>>,
    items: Option<Vec<Pubkey>>,
    children: Vec<NodePlan>,
}

type RawRecord = Vec<u8>;

impl NodePlan {
    fn from_entry(entry: &GraphEntry) -> Result<Self> {
        let address = match (&entry.address, &entry.program) {
            (Some(_), Some(_)) => bail!("node {} has both an address and seeds", entry.label),
            (Some(address), None) => AddressResolver::fixed(parse_pubkey(address, &entry.label)?),
            (None, Some(program)) => {
                let program = parse_pubkey(program, "program")?;
                let seeds: Vec<&[u8]> = entry.seeds.iter().map(|seed| seed.as_bytes()).collect();
                AddressResolver::program_address(&seeds, &program)
            }
            (None, None) => AddressResolver::none(),
        };
        if entry.account && matches!(address, AddressResolver::Absent) {
            bail!("account node {} has no address", entry.label);
        }
        let discriminator = entry
            .discriminator
            .as_deref()
            .map(|d| STANDARD.decode(d))
            .transpose()
            .with_context(|| format!("node {} has an invalid discriminator", entry.label))?;
        let items = entry
            .items
            .as_ref()
            .map(|items| {
                items
                    .iter()
                    .map(|item| parse_pubkey(item, &entry.label))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let children = entry
            .children
            .iter()
            .map(NodePlan::from_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            label: entry.label.clone(),
            kind: entry.kind.clone(),
            address,
            account: entry.account,
            discriminator,
            items,
            children,
        })
    }

    fn build_root(self, env: Arc<ContextEnv>) -> Arc<dyn Context> {
        let spec = NodeSpec::root(env, self.label.clone());
        self.build(spec)
    }

    fn build(self, spec: NodeSpec) -> Arc<dyn Context> {
        let mut spec = spec.address_resolver(self.address.clone());
        if let Some(kind) = &self.kind {
            spec = spec.kind(kind.clone());
        }
        for child in self.children {
            let name = child.label.clone();
            spec = spec.child_dyn(name, move |seed: ChildSeed| {
                let child_spec = seed.spec(child.label.clone());
                child.build(child_spec)
            });
        }

        let decoder = raw_decoder(self.discriminator.clone());
        if let Some(items) = self.items {
            return IterativeAccountContext::new(
                spec,
                move |_, _| {
                    let items = items.clone();
                    async move { Ok::<_, ContextError>(Some(items)) }
                },
                move |seed, address| {
                    AccountContext::new(seed.spec("item").address(address), decoder.clone())
                },
            );
        }
        if self.account {
            return AccountContext::builder(spec, decoder)
                .describe(|data: &RawRecord| vec![("record_len".to_string(), data.len().to_string())])
                .build();
        }
        ContextNode::new(spec)
    }
}

fn raw_decoder(discriminator: Option<Vec<u8>>) -> Decoder<RawRecord> {
    match discriminator {
        Some(discriminator) => Decoder::new(move |data: &[u8]| {
            strip_discriminator(&discriminator, data).map(<[u8]>::to_vec)
        }),
        None => Decoder::new(|data: &[u8]| Ok(data.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::to_tree_string;

    fn dump_json(config: &Pubkey, entries: &[Pubkey]) -> String {
        let program = Pubkey::new_unique();
        serde_json::json!({
            "accounts": [
                { "address": config.to_string(), "owner": program.to_string(), "data": STANDARD.encode([1u8, 2, 3, 4]) },
                { "address": entries[0].to_string(), "owner": program.to_string(), "data": STANDARD.encode([9u8]), "lamports": 42 }
            ],
            "graph": {
                "label": "program",
                "children": [
                    { "label": "config", "address": config.to_string(), "account": true, "discriminator": STANDARD.encode([1u8, 2]) },
                    { "label": "vault", "seeds": ["vault"], "program": program.to_string(), "kind": "vault" },
                    { "label": "entries", "items": entries.iter().map(|e| e.to_string()).collect::<Vec<_>>() }
                ]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_build_and_resolve_dump() {
        let config = Pubkey::new_unique();
        let entries = vec![Pubkey::new_unique(), Pubkey::new_unique()];
        let dump = LedgerDump::from_json(&dump_json(&config, &entries)).unwrap();
        let ledger = Arc::new(dump.seed_ledger().unwrap());
        assert_eq!(ledger.account(&entries[0]).unwrap().lamports, 42);

        let root = dump.build_graph(ContextEnv::new(ledger.clone()).shared()).unwrap();
        root.clone().resolve_account_tree(false).await.unwrap();

        let tree = to_tree_string(root.as_ref());
        assert!(tree.contains("record_len=2"), "{}", tree);
        assert!(tree.contains(&entries[1].to_string()));
        assert_eq!(root.children_of_kind("vault").len(), 1);
        assert_eq!(ledger.fetch_count(&config), 1);
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let json = r#"{ "graph": { "label": "x", "address": "not-a-key", "account": true } }"#;
        let dump = LedgerDump::from_json(json).unwrap();
        let env = ContextEnv::new(Arc::new(InMemoryLedger::new())).shared();
        assert!(dump.build_graph(env.clone()).is_err());

        let json = r#"{ "graph": { "label": "x", "account": true } }"#;
        assert!(LedgerDump::from_json(json).unwrap().build_graph(env).is_err());
    }
}
