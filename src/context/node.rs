//! Plain context node: an address and static children, no remote snapshot

use super::{Context, NodeCore, NodeSpec};
use crate::error::Result;
use solana_sdk::pubkey::Pubkey;
use std::any::Any;
use std::sync::{Arc, Weak};

/// Grouping or program-level node
#[derive(Debug)]
pub struct ContextNode {
    core: NodeCore,
}

impl ContextNode {
    pub fn new(spec: NodeSpec) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this: Weak<dyn Context> = this.clone();
            Self {
                core: spec.into_core(this),
            }
        })
    }

    pub async fn resolve_address(&self, no_cache: bool) -> Result<Option<Pubkey>> {
        self.core.resolve_address(no_cache).await
    }
}

impl Context for ContextNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::context::{downcast_node, AddressState, ContextEnv, ParentLink};
    use crate::error::ContextError;
    use crate::memory::InMemoryLedger;
    use solana_sdk::signature::Keypair;
    use solana_sdk::signer::Signer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn env() -> Arc<ContextEnv> {
        ContextEnv::new(Arc::new(InMemoryLedger::new())).shared()
    }

    #[tokio::test]
    async fn test_graph_navigation() {
        let program = Pubkey::new_unique();
        let root = ContextNode::new(
            NodeSpec::root(env(), "program")
                .address(program)
                .child("fund", |seed| ContextNode::new(seed.spec("fund").kind("fund")))
                .child("jito", |seed| {
                    ContextNode::new(seed.spec("jito").kind("restaking-vault"))
                })
                .child("solv", |seed| {
                    ContextNode::new(seed.spec("solv").kind("restaking-vault"))
                }),
        );

        let names: Vec<_> = root.children().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["fund", "jito", "solv"]);
        assert_eq!(root.children_of_kind("restaking-vault").len(), 2);
        assert!(root.child("missing").is_none());

        let fund = root.child("fund").unwrap();
        assert_eq!(fund.core().path(), "program/fund");
        let parent = fund.core().parent().downcast::<ContextNode>("fund").unwrap();
        assert_eq!(parent.resolve_address(false).await.unwrap(), Some(program));
        assert!(downcast_node::<ContextNode>(fund).is_some());
    }

    #[tokio::test]
    async fn test_derived_address_is_cached_and_pinned() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mint = Pubkey::new_unique();
        let counter = calls.clone();
        let node = ContextNode::new(NodeSpec::root(env(), "mint").derive_address(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(mint))
            }
        }));

        assert_eq!(node.core().peek_address(), AddressState::Unresolved);
        let (a, b) = tokio::join!(node.resolve_address(false), node.resolve_address(false));
        assert_eq!((a.unwrap(), b.unwrap()), (Some(mint), Some(mint)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        node.core().invalidate();
        assert_eq!(node.resolve_address(false).await.unwrap(), Some(mint));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.core().peek_address(), AddressState::Resolved(mint));

        node.resolve_address(true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undetermined_address_expires() {
        let env = ContextEnv::new(Arc::new(InMemoryLedger::new()))
            .with_policy(CachePolicy {
                null_address_ttl: Duration::from_secs(5),
                ..CachePolicy::default()
            })
            .shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let node = ContextNode::new(NodeSpec::root(env, "gated").derive_address(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }));

        assert_eq!(node.resolve_address(false).await.unwrap(), None);
        assert_eq!(node.core().peek_address(), AddressState::Absent);
        assert_eq!(node.resolve_address(false).await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        node.resolve_address(false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_derivation_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let node = ContextNode::new(NodeSpec::root(env(), "flaky").derive_address(move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ContextError::rpc("timeout"))
                } else {
                    Ok(Some(Pubkey::default()))
                }
            }
        }));

        assert!(node.resolve_address(false).await.is_err());
        assert_eq!(
            node.resolve_address(false).await.unwrap(),
            Some(Pubkey::default())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_address_derived_from_parent() {
        let authority = Pubkey::new_unique();
        let root = ContextNode::new(
            NodeSpec::root(env(), "program")
                .address(authority)
                .child("pda", |seed| {
                    ContextNode::new(seed.spec("pda").derive_address(|parent: ParentLink| async move {
                        let parent = parent.downcast::<ContextNode>("pda")?;
                        let base = parent.resolve_address(false).await?;
                        Ok::<_, ContextError>(base.map(|base| {
                            Pubkey::find_program_address(&[b"pda", base.as_ref()], &base).0
                        }))
                    }))
                }),
        );

        let pda = downcast_node::<ContextNode>(root.child("pda").unwrap()).unwrap();
        let expected = Pubkey::find_program_address(&[b"pda", authority.as_ref()], &authority).0;
        assert_eq!(pda.resolve_address(false).await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_detached_child() {
        let root = ContextNode::new(
            NodeSpec::root(env(), "program")
                .child("orphan", |seed| ContextNode::new(seed.spec("orphan"))),
        );
        let orphan = root.child("orphan").unwrap();
        drop(root);

        let err = orphan.core().parent().require("orphan").err().unwrap();
        assert_eq!(err.category(), "detached");
        assert_eq!(orphan.core().path(), "orphan");
    }

    #[test]
    fn test_fee_payer_inherited_from_ancestor() {
        let payer = Arc::new(Keypair::new());
        let root = ContextNode::new(
            NodeSpec::root(env(), "program")
                .fee_payer(payer.clone())
                .child("fund", |seed| ContextNode::new(seed.spec("fund"))),
        );
        let fund = root.child("fund").unwrap();
        let inherited = fund.core().inherited_fee_payer().unwrap();
        assert_eq!(inherited.pubkey(), payer.pubkey());
    }
}
