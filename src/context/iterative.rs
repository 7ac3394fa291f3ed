//! Iterative account context
//!
//! Derives a list of addresses from its parent and keeps one child node per
//! address. Each refresh diffs the new list against the current child set:
//! surviving children are reused with their cached state intact, vanished
//! ones are dropped and their cache entries cleared, new ones are built.

use super::{
    read_keys, resolve_subtrees, AccountContext, ChildEntry, ChildSeed, Context, NodeCore,
    NodeSpec, ParentLink,
};
use crate::error::Result;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use solana_sdk::pubkey::Pubkey;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Outcome of diffing two address lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildSetPlan {
    /// Next child set, duplicates removed, first occurrence kept
    pub order: Vec<Pubkey>,
    pub reused: Vec<Pubkey>,
    pub added: Vec<Pubkey>,
    pub dropped: Vec<Pubkey>,
}

/// Diff the current child addresses against a freshly derived list
pub fn plan_child_set(previous: &[Pubkey], next: &[Pubkey]) -> ChildSetPlan {
    let known: HashSet<&Pubkey> = previous.iter().collect();
    let mut seen = HashSet::with_capacity(next.len());
    let mut plan = ChildSetPlan::default();

    for address in next {
        if !seen.insert(*address) {
            continue;
        }
        plan.order.push(*address);
        if known.contains(address) {
            plan.reused.push(*address);
        } else {
            plan.added.push(*address);
        }
    }
    plan.dropped = previous
        .iter()
        .filter(|address| !seen.contains(*address))
        .copied()
        .collect();
    plan
}

type ListFn =
    Arc<dyn Fn(ParentLink, bool) -> BoxFuture<'static, Result<Option<Vec<Pubkey>>>> + Send + Sync>;
type InstantiateFn<C> = Arc<dyn Fn(ChildSeed, Pubkey) -> Arc<C> + Send + Sync>;

/// Node with one dynamic child per derived address
pub struct IterativeAccountContext<C> {
    core: NodeCore,
    list: ListFn,
    instantiate: InstantiateFn<C>,
    items: RwLock<Vec<(Pubkey, Arc<C>)>>,
}

impl<C> std::fmt::Debug for IterativeAccountContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterativeAccountContext")
            .field("core", &self.core)
            .field("items", &self.items.read().len())
            .finish_non_exhaustive()
    }
}

impl<C: Context> IterativeAccountContext<C> {
    /// `list` receives this node's parent and the no-cache flag; returning
    /// `None` means the list cannot be determined yet. `instantiate` builds
    /// the child for one address and must not access this node.
    pub fn new<L, Fut, I>(spec: NodeSpec, list: L, instantiate: I) -> Arc<Self>
    where
        L: Fn(ParentLink, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Vec<Pubkey>>>> + Send + 'static,
        I: Fn(ChildSeed, Pubkey) -> Arc<C> + Send + Sync + 'static,
    {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this: Weak<dyn Context> = this.clone();
            Self {
                core: spec.into_core(this),
                list: Arc::new(move |parent, no_cache| list(parent, no_cache).boxed()),
                instantiate: Arc::new(instantiate),
                items: RwLock::new(Vec::new()),
            }
        })
    }

    /// Derive the address list through the cache
    pub async fn resolve_address_list(&self, no_cache: bool) -> Result<Option<Vec<Pubkey>>> {
        let env = self.core.env();
        let list = self.list.clone();
        let parent = self.core.parent().clone();
        let (key, alternatives) = read_keys(self.core.id(), "addresses", no_cache);
        env.cache()
            .deduplicated(
                key,
                &alternatives,
                env.policy().interval(no_cache),
                move || list(parent, no_cache),
            )
            .await
    }

    /// Refresh the address list and reconcile the child set
    ///
    /// An undetermined list empties the child set rather than failing.
    pub async fn resolve(&self, no_cache: bool) -> Result<Vec<Arc<C>>> {
        let addresses = self.resolve_address_list(no_cache).await?.unwrap_or_default();
        Ok(self.reconcile(&addresses))
    }

    fn reconcile(&self, addresses: &[Pubkey]) -> Vec<Arc<C>> {
        let previous: Vec<Pubkey> = self.items.read().iter().map(|(address, _)| *address).collect();
        let plan = plan_child_set(&previous, addresses);

        let built: HashMap<Pubkey, Arc<C>> = plan
            .added
            .iter()
            .map(|address| (*address, (self.instantiate)(self.core.seed(), *address)))
            .collect();

        let dropped = {
            let mut items = self.items.write();
            let mut current: HashMap<Pubkey, Arc<C>> = items.drain(..).collect();
            let mut built = built;
            for address in &plan.order {
                let child = current
                    .remove(address)
                    .or_else(|| built.remove(address))
                    .unwrap_or_else(|| (self.instantiate)(self.core.seed(), *address));
                items.push((*address, child));
            }
            current.into_values().collect::<Vec<_>>()
        };

        for child in &dropped {
            child.invalidate_tree();
        }
        debug!(
            node = %self.core.id(),
            label = %self.core.label(),
            reused = plan.reused.len(),
            added = plan.added.len(),
            dropped = dropped.len(),
            "child set reconciled"
        );
        self.current()
    }

    /// Current children in list order, without refreshing
    pub fn current(&self) -> Vec<Arc<C>> {
        self.items.read().iter().map(|(_, child)| child.clone()).collect()
    }

    pub fn get(&self, address: &Pubkey) -> Option<Arc<C>> {
        self.items
            .read()
            .iter()
            .find(|(candidate, _)| candidate == address)
            .map(|(_, child)| child.clone())
    }

    pub fn addresses(&self) -> Vec<Pubkey> {
        self.items.read().iter().map(|(address, _)| *address).collect()
    }
}

impl<R, V> IterativeAccountContext<AccountContext<R, V>>
where
    R: Send + Sync + 'static,
    V: Send + 'static,
{
    /// Refresh the child set, then resolve every child's view concurrently
    pub async fn resolve_values(&self, no_cache: bool) -> Result<Vec<Option<V>>> {
        let children = self.resolve(no_cache).await?;
        try_join_all(children.iter().map(|child| child.resolve(no_cache))).await
    }
}

impl<C: Context> Context for IterativeAccountContext<C> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    /// Static children first, then one entry per address named by the address
    fn children(&self) -> Vec<ChildEntry> {
        let mut children = self.core.static_children().to_vec();
        children.extend(self.items.read().iter().map(|(address, child)| ChildEntry {
            name: address.to_string(),
            node: child.clone() as Arc<dyn Context>,
        }));
        children
    }

    fn properties(&self) -> Vec<(String, String)> {
        vec![("items".to_string(), self.items.read().len().to_string())]
    }

    fn resolve_account_tree(self: Arc<Self>, no_cache: bool) -> BoxFuture<'static, Result<()>> {
        async move {
            futures::try_join!(self.core.resolve_address(no_cache), self.resolve(no_cache))?;
            resolve_subtrees(self.children(), no_cache).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextEnv, Decoder};
    use crate::error::ContextError;
    use crate::memory::InMemoryLedger;
    use proptest::prelude::*;

    fn keys(n: usize) -> Vec<Pubkey> {
        (0..n).map(|_| Pubkey::new_unique()).collect()
    }

    #[test]
    fn test_plan_child_set() {
        let k = keys(4);
        let (a, b, c, d) = (k[0], k[1], k[2], k[3]);
        let plan = plan_child_set(&[a, b, c], &[b, c, d, b]);
        assert_eq!(plan.order, vec![b, c, d]);
        assert_eq!(plan.reused, vec![b, c]);
        assert_eq!(plan.added, vec![d]);
        assert_eq!(plan.dropped, vec![a]);

        let empty = plan_child_set(&[a, b], &[]);
        assert!(empty.order.is_empty());
        assert_eq!(empty.dropped, vec![a, b]);
    }

    fn pool() -> impl Strategy<Value = Vec<Pubkey>> {
        Just(keys(8))
    }

    proptest! {
        #[test]
        fn prop_plan_partitions_lists(
            pool in pool(),
            prev_idx in proptest::collection::vec(0usize..8, 0..8),
            next_idx in proptest::collection::vec(0usize..8, 0..12),
        ) {
            let mut previous: Vec<Pubkey> = Vec::new();
            for i in prev_idx {
                if !previous.contains(&pool[i]) {
                    previous.push(pool[i]);
                }
            }
            let next: Vec<Pubkey> = next_idx.iter().map(|i| pool[*i]).collect();
            let plan = plan_child_set(&previous, &next);

            // order is `next` without duplicates, first occurrence first
            let mut expected = Vec::new();
            for address in &next {
                if !expected.contains(address) {
                    expected.push(*address);
                }
            }
            prop_assert_eq!(&plan.order, &expected);
            prop_assert_eq!(plan.reused.len() + plan.added.len(), plan.order.len());
            for address in &plan.reused {
                prop_assert!(previous.contains(address));
            }
            for address in &plan.added {
                prop_assert!(!previous.contains(address));
            }
            for address in &previous {
                prop_assert_eq!(plan.dropped.contains(address), !next.contains(address));
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Entry(u8);

    fn entry_decoder() -> Decoder<Entry> {
        Decoder::new(|data: &[u8]| {
            data.first()
                .map(|b| Entry(*b))
                .ok_or(crate::error::DecodeError::TooShort { len: 0, min: 1 })
        })
    }

    #[tokio::test]
    async fn test_children_follow_list() {
        let ledger = Arc::new(InMemoryLedger::new());
        let env = ContextEnv::new(ledger.clone()).shared();
        let k = keys(4);
        for (i, address) in k.iter().enumerate() {
            ledger.set_data(*address, Pubkey::new_unique(), vec![i as u8]);
        }

        let list = Arc::new(RwLock::new(Some(vec![k[0], k[1], k[2]])));
        let source = list.clone();
        let entries = IterativeAccountContext::new(
            NodeSpec::root(env, "entries"),
            move |_, _| {
                let current = source.read().clone();
                async move { Ok::<_, ContextError>(current) }
            },
            |seed, address| AccountContext::new(seed.spec("entry").address(address), entry_decoder()),
        );

        let values = entries.resolve_values(false).await.unwrap();
        assert_eq!(values, vec![Some(Entry(0)), Some(Entry(1)), Some(Entry(2))]);
        let first_b = entries.get(&k[1]).unwrap();

        *list.write() = Some(vec![k[1], k[2], k[3]]);
        let children = entries.resolve(true).await.unwrap();
        assert_eq!(entries.addresses(), vec![k[1], k[2], k[3]]);
        assert!(Arc::ptr_eq(&children[0], &first_b));
        assert!(entries.get(&k[0]).is_none());
        // Reused children keep their snapshots: no refetch for B
        assert!(children[0].peek_account().is_some());
        assert!(children[2].peek_account().is_none());
        assert_eq!(ledger.fetch_count(&k[1]), 1);

        *list.write() = None;
        assert!(entries.resolve(true).await.unwrap().is_empty());
        assert!(entries.children().is_empty());
    }
}
