//! In-flight request table with time-boxed memoization
//!
//! Every asynchronous read in the graph runs through
//! [`DedupCache::deduplicated`], keyed by `(node, method, params)`:
//!
//! - a settled value younger than the call's interval is returned as-is
//! - a pending call younger than the interval is joined, not repeated
//! - otherwise the producer runs, and its pending future is published
//!   before the first poll so concurrent callers coalesce onto it
//! - failures clear the entry; they are never replayed
//!
//! A zero interval bypasses both lookups, always runs the producer, and
//! overwrites whatever the entry held.

use crate::error::{ContextError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use smallvec::SmallVec;
use std::any::Any;
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a context node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parameter tuple of a cached call
pub type CacheParams = SmallVec<[Cow<'static, str>; 2]>;

/// Composite key of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node: NodeId,
    pub method: &'static str,
    pub params: CacheParams,
}

impl CacheKey {
    pub fn new(node: NodeId, method: &'static str) -> Self {
        Self {
            node,
            method,
            params: SmallVec::new(),
        }
    }

    /// Append one parameter to the tuple
    pub fn param(mut self, value: impl Into<Cow<'static, str>>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Same node and method, different parameter tuple
    pub fn with_params(&self, params: CacheParams) -> Self {
        Self {
            node: self.node,
            method: self.method,
            params,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}({})", self.node, self.method, self.params.join(","))
    }
}

/// Time bounds applied by the nodes when they call into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Age after which a cached read triggers a real refetch
    pub cache_ttl: Duration,
    /// Window in which a no-cache read may still join a very recent call
    pub dedup_window: Duration,
    /// How long an address that resolved to nothing is remembered
    pub null_address_ttl: Duration,
}

impl CachePolicy {
    /// Interval to pass to [`DedupCache::deduplicated`] for a read
    pub fn interval(&self, no_cache: bool) -> Duration {
        if no_cache {
            self.dedup_window
        } else {
            self.cache_ttl
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(10),
            dedup_window: Duration::ZERO,
            null_address_ttl: Duration::from_secs(10),
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls answered from a settled entry
    pub hits: u64,
    /// Calls that joined an in-flight producer
    pub coalesced: u64,
    /// Calls that started a producer
    pub misses: u64,
    /// Zero-interval calls
    pub bypassed: u64,
    /// Producers that failed
    pub failures: u64,
    /// Entries currently stored
    pub entries: usize,
}

type CachedValue = Arc<dyn Any + Send + Sync>;
type PendingFuture = Shared<BoxFuture<'static, Result<CachedValue>>>;

enum Slot {
    Pending {
        ticket: u64,
        started: Instant,
        future: PendingFuture,
    },
    Ready {
        ticket: u64,
        settled: Instant,
        value: CachedValue,
    },
}

enum Lookup {
    Hit(CachedValue),
    Wait { ticket: u64, future: PendingFuture },
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    coalesced: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
    failures: AtomicU64,
}

/// Keyed in-flight table plus memoized results
///
/// At most one producer runs per key at any time for callers within the
/// interval. A zero-interval call supersedes the current entry; when the
/// superseded producer settles it no longer writes, so a slow stale read
/// can never overwrite a fresher one.
pub struct DedupCache {
    entries: DashMap<CacheKey, Slot>,
    next_ticket: AtomicU64,
    counters: CacheCounters,
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("entries", &self.entries.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            counters: CacheCounters::default(),
        }
    }

    /// Run `producer` at most once per key and interval
    ///
    /// `alternative_params` name sibling entries of the same node and method
    /// that are refreshed with this call's value when it settles, keeping a
    /// no-cache variant and its cached variant coherent.
    ///
    /// `producer` is invoked on the first poll of the published future, once
    /// the entry lock is released, so it may read the cache itself.
    pub async fn deduplicated<T, F, Fut>(
        &self,
        key: CacheKey,
        alternative_params: &[CacheParams],
        interval: Duration,
        producer: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let value = match self.lookup(&key, interval, producer) {
            Lookup::Hit(value) => value,
            Lookup::Wait { ticket, future } => {
                let outcome = future.await;
                self.settle(&key, alternative_params, ticket, &outcome);
                outcome?
            }
        };

        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            ContextError::internal(format!("cache entry {} holds an unexpected type", key))
        })
    }

    fn lookup<T, F, Fut>(&self, key: &CacheKey, interval: Duration, producer: F) -> Lookup
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let now = Instant::now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if !interval.is_zero() {
                    match occupied.get() {
                        Slot::Ready { settled, value, .. }
                            if now.saturating_duration_since(*settled) < interval =>
                        {
                            self.counters.hits.fetch_add(1, Ordering::Relaxed);
                            trace!(key = %key, "cache hit");
                            return Lookup::Hit(value.clone());
                        }
                        Slot::Pending {
                            ticket,
                            started,
                            future,
                        } if now.saturating_duration_since(*started) < interval => {
                            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                            debug!(key = %key, ticket = *ticket, "joined in-flight call");
                            return Lookup::Wait {
                                ticket: *ticket,
                                future: future.clone(),
                            };
                        }
                        _ => {}
                    }
                }
                let (ticket, future) = self.start(producer, interval);
                occupied.insert(Slot::Pending {
                    ticket,
                    started: now,
                    future: future.clone(),
                });
                Lookup::Wait { ticket, future }
            }
            Entry::Vacant(vacant) => {
                let (ticket, future) = self.start(producer, interval);
                vacant.insert(Slot::Pending {
                    ticket,
                    started: now,
                    future: future.clone(),
                });
                Lookup::Wait { ticket, future }
            }
        }
    }

    fn start<T, F, Fut>(&self, producer: F, interval: Duration) -> (u64, PendingFuture)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if interval.is_zero() {
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let future = async move { producer().await.map(|value| Arc::new(value) as CachedValue) }
            .boxed()
            .shared();
        (ticket, future)
    }

    /// Record the outcome of a producer, if its entry was not superseded
    ///
    /// Every waiter calls this; only the first one for a ticket has effect.
    fn settle(
        &self,
        key: &CacheKey,
        alternative_params: &[CacheParams],
        ticket: u64,
        outcome: &Result<CachedValue>,
    ) {
        match outcome {
            Ok(value) => {
                let settled = Instant::now();
                let wrote = match self.entries.get_mut(key) {
                    Some(mut slot) => match &*slot {
                        Slot::Pending { ticket: current, .. } if *current == ticket => {
                            *slot = Slot::Ready {
                                ticket,
                                settled,
                                value: value.clone(),
                            };
                            true
                        }
                        _ => false,
                    },
                    None => false,
                };

                if wrote {
                    for params in alternative_params {
                        self.entries.insert(
                            key.with_params(params.clone()),
                            Slot::Ready {
                                ticket,
                                settled,
                                value: value.clone(),
                            },
                        );
                    }
                }
            }
            Err(err) => {
                let removed = self.entries.remove_if(key, |_, slot| {
                    matches!(slot, Slot::Pending { ticket: current, .. } if *current == ticket)
                });
                if removed.is_some() {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, error = %err, "cleared failed call");
                }
            }
        }
    }

    /// Last settled value for a key, regardless of age
    ///
    /// Never triggers a producer; used by diagnostics.
    pub fn peek<T: Clone + 'static>(&self, key: &CacheKey) -> Option<T> {
        match self.entries.get(key).as_deref() {
            Some(Slot::Ready { value, .. }) => value.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    /// Whether a producer is currently running for a key
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        matches!(self.entries.get(key).as_deref(), Some(Slot::Pending { .. }))
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry owned by a node
    pub fn invalidate_node(&self, node: NodeId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.node != node);
        before.saturating_sub(self.entries.len())
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
