//! Context graph
//!
//! A graph of lazily-addressed, lazily-fetched nodes. Every node type embeds
//! a [`NodeCore`] (identity, parent link, address resolution, static
//! children) and implements the object-safe [`Context`] trait, so the graph
//! can be walked without knowing concrete node types. Concrete kinds of
//! remote account are configuration of the generic node types (a decoder, a
//! projection, a child topology), not new types.
//!
//! Nodes are built top-down from a [`NodeSpec`]. Parents own their children
//! through `Arc`; children hold a weak [`ParentLink`] back, so a child never
//! keeps its parent alive.

pub mod account;
pub mod decode;
pub mod iterative;
pub mod node;

pub use account::{AccountContext, ProjectionInput, Projector, Snapshot};
pub use decode::Decoder;
pub use iterative::{plan_child_set, ChildSetPlan, IterativeAccountContext};
pub use node::ContextNode;

use crate::cache::{CacheKey, CacheParams, CachePolicy, DedupCache, NodeId};
use crate::config::{ExecutionConfig, FrameworkConfig};
use crate::error::{ContextError, Result};
use crate::ledger::{AccountReader, LedgerWriter, SendOptions};
use crate::metrics::ContextMetrics;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use smallvec::smallvec;
use solana_sdk::{pubkey::Pubkey, signer::Signer};
use std::any::Any;
use std::borrow::Cow;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Signer shared between templates and nodes
pub type SharedSigner = Arc<dyn Signer + Send + Sync>;

/// Dependencies injected into every node of a graph
#[derive(Debug)]
pub struct ContextEnv {
    reader: Arc<dyn AccountReader>,
    writer: Option<Arc<dyn LedgerWriter>>,
    cache: Arc<DedupCache>,
    policy: CachePolicy,
    execution: ExecutionConfig,
    metrics: Option<Arc<ContextMetrics>>,
}

impl ContextEnv {
    /// Read-only environment with a fresh cache and default policy
    pub fn new(reader: Arc<dyn AccountReader>) -> Self {
        Self {
            reader,
            writer: None,
            cache: Arc::new(DedupCache::new()),
            policy: CachePolicy::default(),
            execution: ExecutionConfig::default(),
            metrics: None,
        }
    }

    pub fn from_config(config: &FrameworkConfig, reader: Arc<dyn AccountReader>) -> Self {
        Self::new(reader)
            .with_policy(config.cache_policy())
            .with_execution(config.execution.clone())
    }

    pub fn with_writer(mut self, writer: Arc<dyn LedgerWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Share a cache with another environment
    pub fn with_cache(mut self, cache: Arc<DedupCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ContextMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn reader(&self) -> &Arc<dyn AccountReader> {
        &self.reader
    }

    /// Write primitive, required by template execution
    pub fn writer(&self) -> Result<&Arc<dyn LedgerWriter>> {
        self.writer.as_ref().ok_or_else(|| {
            ContextError::Configuration("no ledger writer configured".to_string())
        })
    }

    pub fn cache(&self) -> &Arc<DedupCache> {
        &self.cache
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Send options implied by the execution configuration
    pub fn send_options(&self) -> SendOptions {
        self.execution.send_options()
    }

    pub fn metrics(&self) -> Option<&Arc<ContextMetrics>> {
        self.metrics.as_ref()
    }

    pub(crate) fn record_error(&self, err: &ContextError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(err.category());
        }
    }
}

/// Object-safe contract shared by every node type
pub trait Context: Send + Sync + 'static {
    fn core(&self) -> &NodeCore;

    /// Upcast for [`downcast_node`]
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Named children in declaration order
    fn children(&self) -> Vec<ChildEntry> {
        self.core().static_children().to_vec()
    }

    /// Salient properties for introspection; must not trigger remote calls
    fn properties(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Resolve this node and all descendants concurrently, failing fast
    fn resolve_account_tree(self: Arc<Self>, no_cache: bool) -> BoxFuture<'static, Result<()>> {
        async move {
            let subtrees = resolve_subtrees(self.children(), no_cache);
            futures::try_join!(self.core().resolve_address(no_cache), subtrees)?;
            Ok(())
        }
        .boxed()
    }

    fn child(&self, name: &str) -> Option<Arc<dyn Context>> {
        self.children()
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.node)
    }

    /// Children tagged with `kind`, in declaration order
    fn children_of_kind(&self, kind: &str) -> Vec<Arc<dyn Context>> {
        self.children()
            .into_iter()
            .filter(|entry| entry.node.core().kind() == Some(kind))
            .map(|entry| entry.node)
            .collect()
    }

    /// Drop every cache entry owned by this node and its descendants
    fn invalidate_tree(&self) {
        self.core().invalidate();
        for entry in self.children() {
            entry.node.invalidate_tree();
        }
    }
}

/// Concurrently resolve the trees rooted at `children`
pub fn resolve_subtrees(children: Vec<ChildEntry>, no_cache: bool) -> BoxFuture<'static, Result<()>> {
    async move {
        try_join_all(
            children
                .into_iter()
                .map(|entry| entry.node.resolve_account_tree(no_cache)),
        )
        .await?;
        Ok(())
    }
    .boxed()
}

/// Key of a read plus the sibling variant it keeps coherent
///
/// Reads are cached per `(node, method, cached|fresh)`. A fresh read also
/// refreshes the cached variant when it settles.
pub(crate) fn read_keys(
    node: NodeId,
    method: &'static str,
    no_cache: bool,
) -> (CacheKey, Vec<CacheParams>) {
    let key = CacheKey::new(node, method);
    if no_cache {
        (key.param(FRESH), vec![smallvec![Cow::Borrowed(CACHED)]])
    } else {
        (key.param(CACHED), Vec::new())
    }
}

const CACHED: &str = "cached";
const FRESH: &str = "fresh";

/// Key under which the last cached-variant read of `method` is stored
pub(crate) fn cached_key(node: NodeId, method: &'static str) -> CacheKey {
    CacheKey::new(node, method).param(CACHED)
}

/// Recover the concrete type of a node
pub fn downcast_node<T: Context>(node: Arc<dyn Context>) -> Option<Arc<T>> {
    node.into_any().downcast::<T>().ok()
}

/// A named child of a node
#[derive(Clone)]
pub struct ChildEntry {
    pub name: String,
    pub node: Arc<dyn Context>,
}

impl std::fmt::Debug for ChildEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildEntry")
            .field("name", &self.name)
            .field("node", &self.node.core().id())
            .finish()
    }
}

/// Weak link from a node to the node one level up
#[derive(Clone, Default)]
pub struct ParentLink(Option<Weak<dyn Context>>);

impl std::fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(node) => write!(f, "ParentLink({})", node.core().id()),
            None if self.0.is_some() => f.write_str("ParentLink(<dropped>)"),
            None => f.write_str("ParentLink(<root>)"),
        }
    }
}

impl ParentLink {
    pub fn root() -> Self {
        Self(None)
    }

    pub fn from_weak(node: Weak<dyn Context>) -> Self {
        Self(Some(node))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_none()
    }

    /// The linked node, if any and still alive
    pub fn get(&self) -> Option<Arc<dyn Context>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }

    /// The linked node, or an error naming the node `from` that needs it
    pub fn require(&self, from: &str) -> Result<Arc<dyn Context>> {
        match &self.0 {
            None => Err(ContextError::invalid_context(from, "node has no parent")),
            Some(weak) => weak.upgrade().ok_or_else(|| {
                warn!(node = from, "parent dropped before resolution");
                ContextError::Detached(from.to_string())
            }),
        }
    }

    /// The linked node as a concrete type
    pub fn downcast<T: Context>(&self, from: &str) -> Result<Arc<T>> {
        let node = self.require(from)?;
        let label = node.core().label().to_string();
        downcast_node::<T>(node).ok_or_else(|| {
            ContextError::invalid_context(
                from,
                format!("parent {} is not a {}", label, std::any::type_name::<T>()),
            )
        })
    }
}

type DeriveFn = Arc<dyn Fn(ParentLink) -> BoxFuture<'static, Result<Option<Pubkey>>> + Send + Sync>;

/// How a node finds its address
#[derive(Clone)]
pub enum AddressResolver {
    /// The node has no address (grouping node)
    Absent,
    /// Well-known address
    Fixed(Pubkey),
    /// Derived from ancestor state; `None` while it cannot be determined
    Derived(DeriveFn),
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => f.write_str("Absent"),
            Self::Fixed(address) => write!(f, "Fixed({})", address),
            Self::Derived(_) => f.write_str("Derived"),
        }
    }
}

impl AddressResolver {
    pub fn fixed(address: Pubkey) -> Self {
        Self::Fixed(address)
    }

    pub fn none() -> Self {
        Self::Absent
    }

    pub fn derived<F, Fut>(derive: F) -> Self
    where
        F: Fn(ParentLink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Pubkey>>> + Send + 'static,
    {
        Self::Derived(Arc::new(move |parent| derive(parent).boxed()))
    }

    /// Program-derived address from static seeds
    pub fn program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Self {
        Self::Fixed(Pubkey::find_program_address(seeds, program_id).0)
    }
}

/// Address of a node as currently known, without triggering resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    Unresolved,
    /// Resolution ran and found no address
    Absent,
    Resolved(Pubkey),
}

impl std::fmt::Display for AddressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => f.write_str("<unresolved>"),
            Self::Absent => f.write_str("<none>"),
            Self::Resolved(address) => write!(f, "{}", address),
        }
    }
}

type ChildFactory = Box<dyn FnOnce(ChildSeed) -> Arc<dyn Context> + Send>;

/// What a child factory receives: the shared environment and its parent
#[derive(Debug, Clone)]
pub struct ChildSeed {
    env: Arc<ContextEnv>,
    parent: ParentLink,
}

impl ChildSeed {
    /// Start the spec of a child node
    pub fn spec(self, label: impl Into<String>) -> NodeSpec {
        NodeSpec {
            env: self.env,
            label: label.into(),
            kind: None,
            parent: self.parent,
            address: AddressResolver::Absent,
            fee_payer: None,
            children: Vec::new(),
        }
    }

    pub fn env(&self) -> &Arc<ContextEnv> {
        &self.env
    }

    pub fn parent(&self) -> &ParentLink {
        &self.parent
    }
}

/// Construction parameters shared by every node type
pub struct NodeSpec {
    env: Arc<ContextEnv>,
    label: String,
    kind: Option<String>,
    parent: ParentLink,
    address: AddressResolver,
    fee_payer: Option<SharedSigner>,
    children: Vec<(String, ChildFactory)>,
}

impl NodeSpec {
    pub fn root(env: Arc<ContextEnv>, label: impl Into<String>) -> Self {
        ChildSeed {
            env,
            parent: ParentLink::root(),
        }
        .spec(label)
    }

    /// Tag used by [`Context::children_of_kind`]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn address(mut self, address: Pubkey) -> Self {
        self.address = AddressResolver::Fixed(address);
        self
    }

    pub fn address_resolver(mut self, resolver: AddressResolver) -> Self {
        self.address = resolver;
        self
    }

    pub fn derive_address<F, Fut>(self, derive: F) -> Self
    where
        F: Fn(ParentLink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Pubkey>>> + Send + 'static,
    {
        self.address_resolver(AddressResolver::derived(derive))
    }

    /// Default fee payer for templates at or below this node
    pub fn fee_payer(mut self, signer: SharedSigner) -> Self {
        self.fee_payer = Some(signer);
        self
    }

    /// Add a static child, built once the parent exists
    pub fn child<C, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        C: Context,
        F: FnOnce(ChildSeed) -> Arc<C> + Send + 'static,
    {
        self.children
            .push((name.into(), Box::new(move |seed: ChildSeed| factory(seed) as Arc<dyn Context>)));
        self
    }

    /// Add a static child whose node type is only known at runtime
    pub fn child_dyn<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(ChildSeed) -> Arc<dyn Context> + Send + 'static,
    {
        self.children.push((name.into(), Box::new(factory)));
        self
    }

    pub(crate) fn into_core(self, this: Weak<dyn Context>) -> NodeCore {
        let link = ParentLink::from_weak(this);
        let children = self
            .children
            .into_iter()
            .map(|(name, factory)| ChildEntry {
                name,
                node: factory(ChildSeed {
                    env: self.env.clone(),
                    parent: link.clone(),
                }),
            })
            .collect();

        NodeCore {
            id: NodeId::next(),
            label: self.label,
            kind: self.kind,
            parent: self.parent,
            this: link,
            env: self.env,
            address: self.address,
            pinned: RwLock::new(None),
            fee_payer: self.fee_payer,
            children,
        }
    }
}

/// State and behavior common to every node
pub struct NodeCore {
    id: NodeId,
    label: String,
    kind: Option<String>,
    parent: ParentLink,
    this: ParentLink,
    env: Arc<ContextEnv>,
    address: AddressResolver,
    pinned: RwLock<Option<Pubkey>>,
    fee_payer: Option<SharedSigner>,
    children: Vec<ChildEntry>,
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("address", &self.peek_address())
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl NodeCore {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn parent(&self) -> &ParentLink {
        &self.parent
    }

    /// Link to this node, as handed to its children
    pub fn link(&self) -> ParentLink {
        self.this.clone()
    }

    /// Seed for building a child of this node after construction
    pub fn seed(&self) -> ChildSeed {
        ChildSeed {
            env: self.env.clone(),
            parent: self.link(),
        }
    }

    pub fn env(&self) -> &Arc<ContextEnv> {
        &self.env
    }

    pub fn static_children(&self) -> &[ChildEntry] {
        &self.children
    }

    /// Labels from the root down to this node, joined with `/`
    pub fn path(&self) -> String {
        match self.parent.get() {
            Some(parent) => format!("{}/{}", parent.core().path(), self.label),
            None => self.label.clone(),
        }
    }

    fn address_key(&self) -> CacheKey {
        CacheKey::new(self.id, "address")
    }

    /// Resolve this node's address
    ///
    /// Fixed addresses never touch the cache. A derived address is pinned
    /// once it resolves; an undetermined (`None`) result is remembered for
    /// the policy's null-address TTL. `no_cache` forces re-derivation.
    pub async fn resolve_address(&self, no_cache: bool) -> Result<Option<Pubkey>> {
        let derive = match &self.address {
            AddressResolver::Absent => return Ok(None),
            AddressResolver::Fixed(address) => return Ok(Some(*address)),
            AddressResolver::Derived(derive) => derive.clone(),
        };

        if !no_cache {
            if let Some(address) = *self.pinned.read() {
                return Ok(Some(address));
            }
        }

        let interval = if no_cache {
            Duration::ZERO
        } else {
            self.env.policy().null_address_ttl
        };
        let parent = self.parent.clone();
        let resolved: Option<Pubkey> = self
            .env
            .cache()
            .deduplicated(self.address_key(), &[], interval, move || derive(parent))
            .await?;

        match resolved {
            Some(address) => {
                let previous = self.pinned.write().replace(address);
                if previous.is_some_and(|previous| previous != address) {
                    warn!(node = %self.id, label = %self.label, %address, "derived address changed");
                }
                trace!(node = %self.id, label = %self.label, %address, "address resolved");
            }
            None => debug!(node = %self.id, label = %self.label, "address undetermined"),
        }
        Ok(resolved)
    }

    /// Current address knowledge, without resolving
    pub fn peek_address(&self) -> AddressState {
        match &self.address {
            AddressResolver::Absent => AddressState::Absent,
            AddressResolver::Fixed(address) => AddressState::Resolved(*address),
            AddressResolver::Derived(_) => {
                if let Some(address) = *self.pinned.read() {
                    return AddressState::Resolved(address);
                }
                match self.env.cache().peek::<Option<Pubkey>>(&self.address_key()) {
                    Some(None) => AddressState::Absent,
                    Some(Some(address)) => AddressState::Resolved(address),
                    None => AddressState::Unresolved,
                }
            }
        }
    }

    /// Resolved address, or an invalid-context error naming this node
    pub async fn require_address(&self) -> Result<Pubkey> {
        self.resolve_address(false)
            .await?
            .ok_or_else(|| ContextError::invalid_context(self.path(), "address is not determined"))
    }

    /// Fee payer declared on this node or the nearest ancestor
    pub fn inherited_fee_payer(&self) -> Option<SharedSigner> {
        match &self.fee_payer {
            Some(signer) => Some(signer.clone()),
            None => self
                .parent
                .get()
                .and_then(|parent| parent.core().inherited_fee_payer()),
        }
    }

    /// Drop the cache entries owned by this node; pinned addresses survive
    pub fn invalidate(&self) -> usize {
        let removed = self.env.cache().invalidate_node(self.id);
        trace!(node = %self.id, label = %self.label, removed, "invalidated");
        removed
    }
}
