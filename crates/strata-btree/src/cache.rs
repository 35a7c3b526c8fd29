//! The btree node cache.
//!
//! Node shells live forever; data buffers come and go. Lookup is by the
//! first pointer of the node's key through sharded hash tables; the LRU
//! and free lists feed allocation and the shrinker. Allocation order:
//! reuse a freeable node, revive a freed shell, make a new shell while
//! under the capacity budget, and, only for the single holder of the
//! cannibalize lock, evict a live node as a last resort.
//!
//! The reserve keeps enough nodes allocatable that any single key
//! insert (root to leaf, plus a split at every level) can always get
//! the nodes it needs; the shrinker never reclaims below it.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_closure::Closure;
use strata_error::{Result, StrataError};
use strata_types::{BtreeId, ExtentPtr, KeyVal};
use tracing::{debug, trace, warn};

use crate::bset::NodeData;
use crate::node::{
    Node, NODE_ACCESSED, NODE_DIRTY, NODE_NOEVICT, NODE_WRITE_ERROR, NODE_WRITE_IN_FLIGHT,
};
use crate::sixlock::LockType;

const HASH_SHARDS: usize = 16;

/// Flushes a dirty node to disk. Installed by the btree layer; the
/// cache calls it when reaping dirty nodes with flush requested.
pub type NodeFlusher = Box<dyn Fn(&Arc<Node>) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct NodeCacheConfig {
    /// Maximum nodes holding a data buffer.
    pub capacity: usize,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self { capacity: 512 }
    }
}

#[derive(Default)]
struct CacheLists {
    /// Hashed nodes, most recently added at the front.
    lru: VecDeque<Arc<Node>>,
    /// Unhashed nodes whose data buffer is still attached.
    freeable: Vec<Arc<Node>>,
    /// Bare shells.
    freed: Vec<Arc<Node>>,
    /// Nodes currently holding a data buffer (including ones handed to
    /// a caller and not yet hashed).
    used: usize,
}

/// Counters exposed through the observable surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCacheStats {
    pub used: usize,
    pub reserve: usize,
    pub freeable: usize,
    pub freed_shells: usize,
    pub shrinker_scans: u64,
    pub shrinker_freed: u64,
    pub cannibalized: u64,
}

pub struct NodeCache {
    shards: Vec<RwLock<HashMap<ExtentPtr, Arc<Node>>>>,
    lists: Mutex<CacheLists>,
    config: NodeCacheConfig,
    reserve: AtomicUsize,
    shrinker_disabled: AtomicBool,
    /// Single-holder token gating cannibalization.
    cannibalize_held: Mutex<bool>,
    cannibalize_cv: Condvar,
    cannibalize_wait: strata_closure::WaitList,
    flusher: NodeFlusher,
    shrinker_scans: AtomicU64,
    shrinker_freed: AtomicU64,
    cannibalized: AtomicU64,
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("used", &self.lists.lock().used)
            .field("reserve", &self.reserve.load(Ordering::Relaxed))
            .finish()
    }
}

/// Proof of cannibalize-lock ownership; released on drop.
pub struct CannibalizeGuard {
    cache: Arc<NodeCache>,
}

impl std::fmt::Debug for CannibalizeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CannibalizeGuard")
    }
}

impl Drop for CannibalizeGuard {
    fn drop(&mut self) {
        self.cache.cannibalize_unlock();
    }
}

fn shard_of(ptr: &ExtentPtr) -> usize {
    let mut h = ptr.offset ^ (u64::from(ptr.dev.0) << 56) ^ (u64::from(ptr.gen.0) << 48);
    h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> 32) as usize % HASH_SHARDS
}

impl NodeCache {
    #[must_use]
    pub fn new(config: NodeCacheConfig, flusher: NodeFlusher) -> Self {
        Self {
            shards: (0..HASH_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            lists: Mutex::new(CacheLists::default()),
            config,
            reserve: AtomicUsize::new(16),
            shrinker_disabled: AtomicBool::new(false),
            cannibalize_held: Mutex::new(false),
            cannibalize_cv: Condvar::new(),
            cannibalize_wait: strata_closure::WaitList::new(),
            flusher,
            shrinker_scans: AtomicU64::new(0),
            shrinker_freed: AtomicU64::new(0),
            cannibalized: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn stats(&self) -> NodeCacheStats {
        let lists = self.lists.lock();
        NodeCacheStats {
            used: lists.used,
            reserve: self.reserve.load(Ordering::Relaxed),
            freeable: lists.freeable.len(),
            freed_shells: lists.freed.len(),
            shrinker_scans: self.shrinker_scans.load(Ordering::Relaxed),
            shrinker_freed: self.shrinker_freed.load(Ordering::Relaxed),
            cannibalized: self.cannibalized.load(Ordering::Relaxed),
        }
    }

    pub fn set_shrinker_disabled(&self, disabled: bool) {
        self.shrinker_disabled.store(disabled, Ordering::Release);
    }

    /// Recompute the reserve from the rooted trees: a base allowance
    /// plus headroom for a split at every level of every rooted tree.
    pub fn recalc_reserve(&self, roots: &[(BtreeId, Option<u8>)]) {
        let mut reserve = 16_usize;
        if roots
            .iter()
            .find(|(id, _)| *id == BtreeId::Extents)
            .is_none_or(|(_, level)| level.is_none())
        {
            reserve += 8;
        }
        for (_, level) in roots {
            if let Some(level) = level {
                reserve += usize::from((*level).min(1)) * 8;
            }
        }
        self.reserve.store(reserve, Ordering::Release);
    }

    #[must_use]
    pub fn reserve(&self) -> usize {
        self.reserve.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.lists.lock().used
    }

    fn can_free(&self, lists: &CacheLists) -> usize {
        lists.used.saturating_sub(self.reserve())
    }

    // ── Hash table ──────────────────────────────────────────────────────

    /// Lookup by the first pointer of a node key.
    #[must_use]
    pub fn find(&self, ptr: &ExtentPtr) -> Option<Arc<Node>> {
        self.shards[shard_of(ptr)].read().get(ptr).map(Arc::clone)
    }

    /// Make a node visible. Fails if another fill won the race; the
    /// caller discards its node and retries the lookup.
    pub fn hash_insert(&self, node: &Arc<Node>) -> Result<()> {
        let Some(ptr) = node.hash_ptr() else {
            return Err(StrataError::Inconsistent(
                "hash_insert on unhashed node".to_owned(),
            ));
        };
        let mut shard = self.shards[shard_of(&ptr)].write();
        if shard.contains_key(&ptr) {
            return Err(StrataError::Retry);
        }
        shard.insert(ptr, Arc::clone(node));
        drop(shard);

        self.lists.lock().lru.push_front(Arc::clone(node));
        Ok(())
    }

    /// Remove a node from the hash table and zero its identity so
    /// relocks against it fail. Caller holds the write lock and the
    /// node must be clean.
    pub fn hash_remove(&self, node: &Arc<Node>) {
        debug_assert!(!node.is_dirty());
        if let Some(ptr) = node.hash_ptr() {
            self.shards[shard_of(&ptr)].write().remove(&ptr);
        }
        node.zero_hash();
    }

    // ── Reaping ─────────────────────────────────────────────────────────

    /// Try to take exclusive ownership of a node for eviction. On
    /// success the node's intent and write locks are held.
    fn reap(&self, node: &Arc<Node>, flush: bool) -> bool {
        if !node.lock.try_lock(LockType::Intent) {
            return false;
        }
        if !node.lock.try_lock(LockType::Write) {
            node.lock.unlock(LockType::Intent);
            return false;
        }

        let blocked = node.test_flag(NODE_WRITE_ERROR)
            || node.test_flag(NODE_NOEVICT)
            || !node.write_blocked.is_empty()
            || (!flush && (node.is_dirty() || node.test_flag(NODE_WRITE_IN_FLIGHT)));

        if blocked {
            node.lock.unlock(LockType::Write);
            node.lock.unlock(LockType::Intent);
            return false;
        }

        if node.is_dirty() {
            // Flush without post-write compaction: the node is about to
            // be evicted.
            if let Err(err) = (self.flusher)(node) {
                warn!(
                    target: "strata::btree::cache",
                    event = "reap_flush_failed",
                    error = %err
                );
                node.set_flag(NODE_WRITE_ERROR);
                node.lock.unlock(LockType::Write);
                node.lock.unlock(LockType::Intent);
                return false;
            }
            node.clear_flag(NODE_DIRTY);
        }
        true
    }

    fn release_reaped(node: &Arc<Node>) {
        node.lock.unlock(LockType::Write);
        node.lock.unlock(LockType::Intent);
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Produce a node with fresh data and intent+write held.
    ///
    /// Fails with `NoMem` when the budget is exhausted and the caller
    /// does not hold the cannibalize lock.
    pub fn alloc(&self, cannibalize: Option<&CannibalizeGuard>) -> Result<Arc<Node>> {
        let mut lists = self.lists.lock();

        // A node freed by a structural change keeps its buffer; cheapest
        // reuse first.
        if let Some(at) = lists
            .freeable
            .iter()
            .position(|node| self.reap(node, false))
        {
            let node = lists.freeable.swap_remove(at);
            drop(lists);
            return Ok(Self::reset_for_reuse(&node));
        }

        let under_budget = lists.used < self.config.capacity;
        if under_budget {
            // Revive a bare shell before minting a new one.
            if let Some(at) = lists.freed.iter().position(|node| self.reap(node, false)) {
                let node = lists.freed.swap_remove(at);
                lists.used += 1;
                drop(lists);
                node.attach_data(NodeData::new());
                return Ok(Self::reset_for_reuse(&node));
            }

            let node = Arc::new(Node::new_shell());
            assert!(node.lock.try_lock(LockType::Intent));
            assert!(node.lock.try_lock(LockType::Write));
            node.attach_data(NodeData::new());
            lists.used += 1;
            drop(lists);
            return Ok(node);
        }

        if cannibalize.is_some() {
            let node = self.cannibalize_one(&mut lists)?;
            drop(lists);
            self.cannibalized.fetch_add(1, Ordering::Relaxed);
            debug!(target: "strata::btree::cache", event = "cannibalize");
            self.hash_remove(&node);
            return Ok(Self::reset_for_reuse(&node));
        }

        Err(StrataError::NoMem)
    }

    fn reset_for_reuse(node: &Arc<Node>) -> Arc<Node> {
        node.reset_flags();
        node.set_written(0);
        node.with_data_mut(|data| *data = NodeData::new());
        Arc::clone(node)
    }

    /// Evict any reapable node from the LRU tail, flushing if that is
    /// what it takes.
    fn cannibalize_one(&self, lists: &mut CacheLists) -> Result<Arc<Node>> {
        for flush in [false, true] {
            if let Some(at) = lists
                .lru
                .iter()
                .rev()
                .position(|node| self.reap(node, flush))
            {
                let at = lists.lru.len() - 1 - at;
                let node = lists.lru.remove(at).unwrap_or_else(|| unreachable!());
                return Ok(node);
            }
        }
        // Every node is locked by someone. Rare; let the caller back
        // off and retry.
        warn!(target: "strata::btree::cache", event = "cannibalize_empty_handed");
        Err(StrataError::NoMem)
    }

    /// Return a node that lost a fill race (or was split away) to the
    /// freeable list. Drops the intent+write the caller held.
    pub fn release_to_freeable(&self, node: &Arc<Node>) {
        node.zero_hash();
        self.lists.lock().freeable.push(Arc::clone(node));
        Self::release_reaped(node);
    }

    /// Detach a node that was unhashed by a structural change.
    pub fn node_freed(&self, node: &Arc<Node>) {
        let mut lists = self.lists.lock();
        if let Some(at) = lists.lru.iter().position(|n| Arc::ptr_eq(n, node)) {
            lists.lru.remove(at);
        }
        lists.freeable.push(Arc::clone(node));
    }

    // ── Shrinker ────────────────────────────────────────────────────────

    /// Best-effort reclaim of up to `nr` node data buffers. Returns the
    /// number freed.
    pub fn scan(&self, nr: usize) -> usize {
        if self.shrinker_disabled.load(Ordering::Acquire) {
            return 0;
        }
        if *self.cannibalize_held.lock() {
            // Someone is reclaiming by force; stay out of the way.
            return 0;
        }
        self.shrinker_scans.fetch_add(1, Ordering::Relaxed);

        let mut lists = self.lists.lock();
        let nr = nr.min(self.can_free(&lists));
        let mut freed = 0_usize;

        // Pass 1: freeable nodes, data already severed from the tree.
        let mut at = 0;
        while at < lists.freeable.len() && freed < nr {
            let node = Arc::clone(&lists.freeable[at]);
            if self.reap(&node, false) {
                lists.freeable.swap_remove(at);
                node.free_data();
                node.reset_flags();
                lists.used -= 1;
                lists.freed.push(Arc::clone(&node));
                Self::release_reaped(&node);
                freed += 1;
            } else {
                at += 1;
            }
        }

        // Pass 2: the LRU, oldest first, skipping recently used nodes.
        let mut remaining = lists.lru.len();
        while freed < nr && remaining > 0 {
            remaining -= 1;
            let Some(node) = lists.lru.pop_back() else {
                break;
            };
            if node.test_flag(NODE_ACCESSED) {
                node.clear_flag(NODE_ACCESSED);
                lists.lru.push_front(node);
                continue;
            }
            if self.reap(&node, false) {
                self.hash_remove(&node);
                node.free_data();
                node.reset_flags();
                lists.used -= 1;
                lists.freed.push(Arc::clone(&node));
                Self::release_reaped(&node);
                freed += 1;
            } else {
                lists.lru.push_front(node);
            }
        }
        drop(lists);

        self.shrinker_freed.fetch_add(freed as u64, Ordering::Relaxed);
        trace!(
            target: "strata::btree::cache",
            event = "shrinker_scan",
            requested = nr,
            freed = freed
        );
        freed
    }

    /// How much `scan` could currently reclaim.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        if self.shrinker_disabled.load(Ordering::Acquire) || *self.cannibalize_held.lock() {
            return 0;
        }
        self.can_free(&self.lists.lock())
    }

    // ── Cannibalize lock ────────────────────────────────────────────────

    /// Take the process-wide "one reclaimer at a time" token.
    ///
    /// With no closure this is try-only. With a closure the caller is
    /// parked on the wait queue and retried once (the race with an
    /// unlocking holder), after which it must unwind and come back when
    /// the closure fires.
    pub fn cannibalize_lock(
        self: &Arc<Self>,
        cl: Option<&Closure>,
    ) -> Result<CannibalizeGuard> {
        {
            let mut held = self.cannibalize_held.lock();
            if !*held {
                *held = true;
                trace!(target: "strata::btree::cache", event = "cannibalize_lock");
                return Ok(CannibalizeGuard {
                    cache: Arc::clone(self),
                });
            }
        }

        let Some(cl) = cl else {
            trace!(target: "strata::btree::cache", event = "cannibalize_lock_fail");
            return Err(StrataError::NoMem);
        };

        self.cannibalize_wait.wait(cl);

        // Try again after joining the waitlist; the holder may have
        // released in between.
        let mut held = self.cannibalize_held.lock();
        if !*held {
            *held = true;
            drop(held);
            self.cannibalize_wait.wake_all();
            return Ok(CannibalizeGuard {
                cache: Arc::clone(self),
            });
        }
        drop(held);
        Err(StrataError::Retry)
    }

    /// Block until the token is available.
    pub fn cannibalize_lock_blocking(self: &Arc<Self>) -> CannibalizeGuard {
        let mut held = self.cannibalize_held.lock();
        while *held {
            self.cannibalize_cv.wait(&mut held);
        }
        *held = true;
        drop(held);
        CannibalizeGuard {
            cache: Arc::clone(self),
        }
    }

    fn cannibalize_unlock(&self) {
        let mut held = self.cannibalize_held.lock();
        *held = false;
        drop(held);
        self.cannibalize_cv.notify_one();
        self.cannibalize_wait.wake_all();
        trace!(target: "strata::btree::cache", event = "cannibalize_unlock");
    }

    // ── Invariant checks (tests) ────────────────────────────────────────

    /// Invariant: data ⇒ on lru or freeable; no data ⇒ freed or
    /// freeable-pending; dirty ⇒ not freed.
    #[must_use]
    pub fn verify_lists(&self) -> bool {
        let lists = self.lists.lock();
        lists.lru.iter().all(|n| n.has_data())
            && lists.freeable.iter().all(|n| n.has_data())
            && lists.freed.iter().all(|n| !n.has_data() && !n.is_dirty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{Bkey, Bpos, Bval, DeviceIdx, Extent, Gen, KeyType};

    fn test_cache(capacity: usize) -> Arc<NodeCache> {
        Arc::new(NodeCache::new(
            NodeCacheConfig { capacity },
            Box::new(|_node| Ok(())),
        ))
    }

    fn node_key(offset: u64) -> KeyVal {
        KeyVal::new(
            Bkey::new(Bpos::new(0, offset), 0, KeyType::Extent),
            Bval::Extent(Extent::single(ExtentPtr {
                dev: DeviceIdx(0),
                gen: Gen(1),
                offset,
            })),
        )
    }

    fn alloc_hashed(cache: &Arc<NodeCache>, offset: u64) -> Arc<Node> {
        let node = cache.alloc(None).unwrap();
        node.set_meta(node_key(offset), 0, BtreeId::Extents);
        cache.hash_insert(&node).unwrap();
        node.lock.unlock(LockType::Write);
        node.lock.unlock(LockType::Intent);
        node
    }

    #[test]
    fn find_after_insert() {
        let cache = test_cache(8);
        let node = alloc_hashed(&cache, 64);
        let ptr = node.hash_ptr().unwrap();
        assert!(Arc::ptr_eq(&cache.find(&ptr).unwrap(), &node));
    }

    #[test]
    fn insert_race_detected() {
        let cache = test_cache(8);
        let _a = alloc_hashed(&cache, 64);

        let b = cache.alloc(None).unwrap();
        b.set_meta(node_key(64), 0, BtreeId::Extents);
        assert!(matches!(cache.hash_insert(&b), Err(StrataError::Retry)));
        cache.release_to_freeable(&b);
        assert!(cache.verify_lists());
    }

    #[test]
    fn alloc_fails_over_budget_without_cannibalize() {
        let cache = test_cache(2);
        let _a = alloc_hashed(&cache, 1);
        let _b = alloc_hashed(&cache, 2);
        assert!(matches!(cache.alloc(None), Err(StrataError::NoMem)));
    }

    #[test]
    fn cannibalize_evicts_lru() {
        let cache = test_cache(2);
        let a = alloc_hashed(&cache, 1);
        let _b = alloc_hashed(&cache, 2);
        let a_ptr = a.hash_ptr().unwrap();

        let guard = cache.cannibalize_lock(None).unwrap();
        let node = cache.alloc(Some(&guard)).unwrap();
        drop(guard);

        // The oldest node was evicted and unhashed.
        assert!(cache.find(&a_ptr).is_none());
        assert!(node.hash_ptr().is_none());
        assert_eq!(cache.stats().cannibalized, 1);
        node.lock.unlock(LockType::Write);
        node.lock.unlock(LockType::Intent);
    }

    #[test]
    fn cannibalize_lock_is_exclusive() {
        let cache = test_cache(4);
        let guard = cache.cannibalize_lock(None).unwrap();
        assert!(matches!(
            cache.cannibalize_lock(None),
            Err(StrataError::NoMem)
        ));
        drop(guard);
        assert!(cache.cannibalize_lock(None).is_ok());
    }

    #[test]
    fn cannibalize_waiter_fires_on_unlock() {
        let cache = test_cache(4);
        let guard = cache.cannibalize_lock(None).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let cl = Closure::new();
        let err = cache.cannibalize_lock(Some(&cl));
        assert!(matches!(err, Err(StrataError::Retry)));
        let fired2 = Arc::clone(&fired);
        cl.continue_with(None, move |cl| {
            fired2.store(true, Ordering::SeqCst);
            cl.put();
        });

        assert!(!fired.load(Ordering::SeqCst));
        drop(guard);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn shrinker_respects_reserve() {
        let cache = test_cache(64);
        cache.recalc_reserve(&[(BtreeId::Extents, Some(0))]);
        let reserve = cache.reserve();
        assert_eq!(reserve, 16);

        let nodes: Vec<_> = (0..32).map(|i| alloc_hashed(&cache, i + 1)).collect();
        let freed = cache.scan(usize::MAX);
        assert_eq!(freed, 32 - reserve);
        assert_eq!(cache.used(), reserve);
        assert!(cache.verify_lists());
        drop(nodes);
    }

    #[test]
    fn shrinker_skips_accessed_nodes_once() {
        let cache = test_cache(64);
        cache.recalc_reserve(&[]);
        let node = alloc_hashed(&cache, 1);
        for i in 2..=32_u64 {
            alloc_hashed(&cache, i);
        }
        node.set_flag(NODE_ACCESSED);

        cache.scan(1);
        // The accessed node survived the pass that freed one other.
        assert!(cache.find(&node.hash_ptr().unwrap()).is_some());
        assert!(!node.test_flag(NODE_ACCESSED));
    }

    #[test]
    fn shrinker_leaves_dirty_nodes() {
        let cache = test_cache(64);
        cache.recalc_reserve(&[]);
        let node = alloc_hashed(&cache, 1);
        for i in 2..=40_u64 {
            alloc_hashed(&cache, i);
        }
        node.set_flag(NODE_DIRTY);

        cache.scan(usize::MAX);
        assert!(cache.find(&node.hash_ptr().unwrap()).is_some());
        assert!(node.is_dirty());
        assert!(cache.verify_lists());
    }

    #[test]
    fn reserve_grows_with_tree_depth() {
        let cache = test_cache(64);
        cache.recalc_reserve(&[(BtreeId::Extents, Some(2)), (BtreeId::Inodes, Some(0))]);
        // 16 base + 8 for the deep extents tree.
        assert_eq!(cache.reserve(), 24);

        cache.recalc_reserve(&[(BtreeId::Extents, None)]);
        assert_eq!(cache.reserve(), 24);
    }
}
