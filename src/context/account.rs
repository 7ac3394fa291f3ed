//! Account context: fetch and decode one remote record
//!
//! `resolve_account` yields the decoded [`Snapshot`], `resolve` reshapes it
//! through the node's projection into the view callers work with. Both go
//! through the dedup cache under the node's own keys.

use super::{
    cached_key, read_keys, resolve_subtrees, Context, Decoder, NodeCore, NodeSpec, ParentLink,
};
use crate::error::{ContextError, Result};
use futures::future::{BoxFuture, FutureExt};
use solana_sdk::{account::Account, pubkey::Pubkey};
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Decoded record plus the ledger metadata attached to every account
///
/// Replaced wholesale on refresh, never mutated.
#[derive(Debug)]
pub struct Snapshot<R> {
    pub address: Pubkey,
    pub record: Arc<R>,
    pub owner: Pubkey,
    pub lamports: u64,
    pub data_len: usize,
    pub executable: bool,
}

impl<R> Clone for Snapshot<R> {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            record: self.record.clone(),
            owner: self.owner,
            lamports: self.lamports,
            data_len: self.data_len,
            executable: self.executable,
        }
    }
}

impl<R> Snapshot<R> {
    /// Decode `account`, attributing failures to `address`
    pub fn decode(decoder: &Decoder<R>, address: Pubkey, account: Account) -> Result<Self> {
        let record = decoder
            .decode(&account.data)
            .map_err(|e| ContextError::decode(address, e))?;
        Ok(Self {
            address,
            record: Arc::new(record),
            owner: account.owner,
            lamports: account.lamports,
            data_len: account.data.len(),
            executable: account.executable,
        })
    }

    pub fn record(&self) -> &R {
        &self.record
    }
}

/// What a projection sees
pub struct ProjectionInput<R> {
    /// Parent of the account node, for joining sibling state
    pub parent: ParentLink,
    /// The account node itself
    pub node: ParentLink,
    pub snapshot: Snapshot<R>,
    pub no_cache: bool,
}

/// Reshapes a snapshot into a caller-facing view
pub type Projector<R, V> =
    Arc<dyn Fn(ProjectionInput<R>) -> BoxFuture<'static, Result<V>> + Send + Sync>;

type DescribeFn<R> = Arc<dyn Fn(&R) -> Vec<(String, String)> + Send + Sync>;

/// Node bound to one remote account
pub struct AccountContext<R, V = R> {
    core: NodeCore,
    decoder: Decoder<R>,
    projector: Projector<R, V>,
    describe: Option<DescribeFn<R>>,
}

impl<R, V> std::fmt::Debug for AccountContext<R, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountContext")
            .field("core", &self.core)
            .field("decoder", &self.decoder)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AccountContext`]
pub struct AccountContextBuilder<R, V> {
    spec: NodeSpec,
    decoder: Decoder<R>,
    projector: Projector<R, V>,
    describe: Option<DescribeFn<R>>,
}

impl<R, V> AccountContextBuilder<R, V>
where
    R: Send + Sync + 'static,
    V: Send + 'static,
{
    /// Replace the projection
    pub fn project<W, F, Fut>(self, projector: F) -> AccountContextBuilder<R, W>
    where
        F: Fn(ProjectionInput<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<W>> + Send + 'static,
    {
        AccountContextBuilder {
            spec: self.spec,
            decoder: self.decoder,
            projector: Arc::new(move |input| projector(input).boxed()),
            describe: self.describe,
        }
    }

    /// Salient record fields shown by tree introspection
    pub fn describe<F>(mut self, describe: F) -> Self
    where
        F: Fn(&R) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.describe = Some(Arc::new(describe));
        self
    }

    pub fn build(self) -> Arc<AccountContext<R, V>> {
        let Self {
            spec,
            decoder,
            projector,
            describe,
        } = self;
        Arc::new_cyclic(|this: &Weak<AccountContext<R, V>>| {
            let this: Weak<dyn Context> = this.clone();
            AccountContext {
                core: spec.into_core(this),
                decoder,
                projector,
                describe,
            }
        })
    }
}

impl<R> AccountContext<R, R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Account node whose view is the decoded record itself
    pub fn new(spec: NodeSpec, decoder: Decoder<R>) -> Arc<Self> {
        Self::builder(spec, decoder).build()
    }

    pub fn builder(spec: NodeSpec, decoder: Decoder<R>) -> AccountContextBuilder<R, R> {
        AccountContextBuilder {
            spec,
            decoder,
            projector: Arc::new(|input: ProjectionInput<R>| {
                let record = (*input.snapshot.record).clone();
                async move { Ok::<_, ContextError>(record) }.boxed()
            }),
            describe: None,
        }
    }
}

impl<R, V> AccountContext<R, V>
where
    R: Send + Sync + 'static,
    V: Send + 'static,
{
    /// Account node with a custom projection
    pub fn with_projection<F, Fut>(spec: NodeSpec, decoder: Decoder<R>, projector: F) -> Arc<Self>
    where
        F: Fn(ProjectionInput<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        AccountContextBuilder {
            spec,
            decoder,
            projector: Arc::new(move |input| projector(input).boxed()),
            describe: None,
        }
        .build()
    }

    pub async fn resolve_address(&self, no_cache: bool) -> Result<Option<Pubkey>> {
        self.core.resolve_address(no_cache).await
    }

    /// Fetch and decode the account
    ///
    /// `Ok(None)` when the address is undetermined (no remote call is made)
    /// or the account does not exist. Bytes that do not decode are an error.
    pub async fn resolve_account(&self, no_cache: bool) -> Result<Option<Snapshot<R>>> {
        let Some(address) = self.core.resolve_address(false).await? else {
            trace!(node = %self.core.id(), label = %self.core.label(), "no address, skipping fetch");
            return Ok(None);
        };

        let env = self.core.env();
        let reader = env.reader().clone();
        let decoder = self.decoder.clone();
        let metrics = env.metrics().cloned();
        let (key, alternatives) = read_keys(self.core.id(), "account", no_cache);

        env.cache()
            .deduplicated(
                key,
                &alternatives,
                env.policy().interval(no_cache),
                move || async move {
                    if let Some(metrics) = &metrics {
                        metrics.remote_fetches.inc();
                    }
                    let account = reader.fetch_account(&address, no_cache).await?;
                    account
                        .map(|account| Snapshot::decode(&decoder, address, account))
                        .transpose()
                },
            )
            .await
            .inspect_err(|e| env.record_error(e))
    }

    /// Projected view of the account, `Ok(None)` when it does not exist
    pub async fn resolve(&self, no_cache: bool) -> Result<Option<V>> {
        let Some(snapshot) = self.resolve_account(no_cache).await? else {
            return Ok(None);
        };
        let input = ProjectionInput {
            parent: self.core.parent().clone(),
            node: self.core.link(),
            snapshot,
            no_cache,
        };
        (self.projector)(input).await.map(Some)
    }

    /// Snapshot that must exist, for instruction builders
    pub async fn require_account(&self) -> Result<Snapshot<R>> {
        self.resolve_account(false).await?.ok_or_else(|| {
            ContextError::invalid_context(self.core.path(), "account does not exist")
        })
    }

    /// View that must exist, for instruction builders
    pub async fn require(&self) -> Result<V> {
        self.resolve(false)
            .await?
            .ok_or_else(|| ContextError::invalid_context(self.core.path(), "account does not exist"))
    }

    /// Last settled snapshot, without resolving
    ///
    /// `None` when never resolved (or invalidated), `Some(None)` when the
    /// account was found absent.
    pub fn peek_account(&self) -> Option<Option<Snapshot<R>>> {
        self.core
            .env()
            .cache()
            .peek::<Option<Snapshot<R>>>(&cached_key(self.core.id(), "account"))
    }
}

impl<R, V> Context for AccountContext<R, V>
where
    R: Send + Sync + 'static,
    V: Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn properties(&self) -> Vec<(String, String)> {
        match self.peek_account() {
            None => vec![("account".to_string(), "<unresolved>".to_string())],
            Some(None) => vec![("account".to_string(), "<absent>".to_string())],
            Some(Some(snapshot)) => {
                let mut properties = vec![
                    ("owner".to_string(), snapshot.owner.to_string()),
                    ("lamports".to_string(), snapshot.lamports.to_string()),
                    ("data_len".to_string(), snapshot.data_len.to_string()),
                ];
                if let Some(describe) = &self.describe {
                    properties.extend(describe(&snapshot.record));
                }
                properties
            }
        }
    }

    fn resolve_account_tree(self: Arc<Self>, no_cache: bool) -> BoxFuture<'static, Result<()>> {
        async move {
            let subtrees = resolve_subtrees(self.children(), no_cache);
            futures::try_join!(self.resolve_account(no_cache), subtrees)?;
            Ok(())
        }
        .boxed()
    }
}
