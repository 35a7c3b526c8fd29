#![forbid(unsafe_code)]
//! The copy-on-write btree engine.
//!
//! Persistent metadata (extent mappings and inodes) lives in on-disk
//! btrees whose nodes are bucket-backed, checksummed bset runs. This
//! crate provides the in-memory side: the node cache with its shrinker
//! and cannibalize reclaim path ([`cache`]), the six-mode per-node lock
//! ([`sixlock`]), the iterator machinery with linked iterators and
//! relock-retry ([`iter`]), and the insert path with extent overlap
//! splitting and node splits ([`update`]).

pub mod bset;
pub mod cache;
pub mod iter;
pub mod node;
pub mod sixlock;
pub mod update;

pub use bset::{NodeData, NodeIter, BTREE_NODE_SECTORS, MAX_BSETS, NODE_MAX_KEYS};
pub use cache::{CannibalizeGuard, NodeCache, NodeCacheConfig, NodeCacheStats};
pub use iter::BtreeIter;
pub use node::Node;
pub use sixlock::{LockType, SixLock};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_alloc::DeviceSet;
use strata_error::{Result, StrataError};
use strata_journal::{Journal, JournalEntry};
use strata_types::{
    Bkey, Bpos, BtreeId, Bval, Extent, KeyType, KeyVal, SECTOR_SHIFT,
};
use tracing::{debug, info, trace};

use crate::node::{NODE_DIRTY, NODE_NOEVICT, NODE_WRITE_IN_FLIGHT};

/// Workspace-visible counters for the btree engine.
#[derive(Debug, Default)]
pub struct BtreeStats {
    pub node_fills: AtomicU64,
    pub traverse_retries: AtomicU64,
    pub inserts: AtomicU64,
    pub splits: AtomicU64,
    pub compactions: AtomicU64,
    pub race_faults: AtomicU64,
}

#[derive(Debug, Clone)]
struct RootInfo {
    node: Arc<Node>,
    level: u8,
}

/// One cache set's btrees: roots, node cache, and the device/journal
/// handles node I/O goes through.
pub struct Btree {
    pub devs: Arc<DeviceSet>,
    pub journal: Arc<Journal>,
    pub cache: Arc<NodeCache>,
    roots: Mutex<HashMap<BtreeId, RootInfo>>,
    pub stats: BtreeStats,
    /// Fail every nth node-identity check to exercise the retry
    /// protocol. Zero disables; only tests turn this on.
    fault_every: AtomicU64,
    fault_counter: AtomicU64,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("cache", &self.cache)
            .finish()
    }
}

/// Serialize a node's current data and write it to its pointer.
///
/// Used by dirty flushes and by freshly created nodes; the caller holds
/// a lock strong enough to keep the data stable (read for a flush,
/// write for a new node).
pub(crate) fn write_node_data(devs: &DeviceSet, node: &Arc<Node>) -> Result<()> {
    let Some(ptr) = node.hash_ptr() else {
        return Err(StrataError::Inconsistent(
            "write of unhashed btree node".to_owned(),
        ));
    };
    let Some(device) = devs.device(ptr.dev) else {
        return Err(StrataError::Inconsistent(format!(
            "btree node points at missing device {}",
            ptr.dev.0
        )));
    };

    let encoded = node
        .with_data(NodeData::encode)
        .ok_or_else(|| StrataError::Inconsistent("btree node has no data".to_owned()))??;

    node.set_flag(NODE_WRITE_IN_FLIGHT);
    let result = device.dev.write_sectors(ptr.offset, &encoded);
    node.clear_flag(NODE_WRITE_IN_FLIGHT);
    result?;

    #[expect(clippy::cast_possible_truncation)]
    let sectors = (encoded.len() >> SECTOR_SHIFT as usize) as u32;
    node.set_written(sectors);
    node.clear_flag(NODE_DIRTY);
    // The written runs are immutable now; future inserts open a new one.
    node.with_data_mut(NodeData::seal);
    trace!(
        target: "strata::btree::io",
        event = "node_write",
        dev = ptr.dev.0,
        offset = ptr.offset,
        sectors = sectors
    );
    Ok(())
}

impl Btree {
    /// Bring up the btrees: fresh roots for every tree id.
    ///
    /// Opening an existing cache set would reconstruct roots from the
    /// journal instead; replay is out of scope here.
    pub fn new(
        devs: Arc<DeviceSet>,
        journal: Arc<Journal>,
        config: NodeCacheConfig,
    ) -> Result<Arc<Self>> {
        let flusher_devs = Arc::clone(&devs);
        let cache = Arc::new(NodeCache::new(
            config,
            Box::new(move |node| write_node_data(&flusher_devs, node)),
        ));

        let btree = Arc::new(Self {
            devs,
            journal,
            cache,
            roots: Mutex::new(HashMap::new()),
            stats: BtreeStats::default(),
            fault_every: AtomicU64::new(0),
            fault_counter: AtomicU64::new(0),
        });

        for id in BtreeId::ALL {
            let root = btree.make_node(id, 0, Bpos::MAX, NodeData::new())?;
            root.set_flag(NODE_NOEVICT);
            root.lock.unlock(LockType::Write);
            root.lock.unlock(LockType::Intent);
            btree.journal.update(JournalEntry::RootSwap {
                btree: id,
                level: 0,
                key: root.meta().key,
            })?;
            btree.roots.lock().insert(id, RootInfo { node: root, level: 0 });
            info!(target: "strata::btree", event = "root_created", btree = id.as_str());
        }
        btree.recalc_reserve();
        Ok(btree)
    }

    /// Inject a relock failure on every nth locked node lookup.
    pub fn set_race_fault_every(&self, every: u64) {
        self.fault_every.store(every, Ordering::Relaxed);
    }

    pub(crate) fn race_fault(&self) -> bool {
        let every = self.fault_every.load(Ordering::Relaxed);
        if every == 0 {
            return false;
        }
        let n = self.fault_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let fire = n % every == 0;
        if fire {
            self.stats.race_faults.fetch_add(1, Ordering::Relaxed);
        }
        fire
    }

    /// Current root of a tree.
    pub fn root(&self, id: BtreeId) -> Result<(Arc<Node>, u8)> {
        self.roots
            .lock()
            .get(&id)
            .map(|info| (Arc::clone(&info.node), info.level))
            .ok_or_else(|| StrataError::Inconsistent(format!("btree {} has no root", id.as_str())))
    }

    /// Swap in a new root (tree grew or shrank); journaled. The new
    /// root is pinned against eviction; the old root's pin is dropped
    /// by whoever retires it.
    pub(crate) fn set_root(&self, id: BtreeId, node: Arc<Node>, level: u8) -> Result<()> {
        self.journal.update(JournalEntry::RootSwap {
            btree: id,
            level,
            key: node.meta().key,
        })?;
        node.set_flag(NODE_NOEVICT);
        self.roots.lock().insert(id, RootInfo { node, level });
        self.recalc_reserve();
        debug!(
            target: "strata::btree",
            event = "root_swap",
            btree = id.as_str(),
            level = level
        );
        Ok(())
    }

    pub(crate) fn recalc_reserve(&self) {
        let roots = self.roots.lock();
        let summary: Vec<(BtreeId, Option<u8>)> = BtreeId::ALL
            .iter()
            .map(|id| (*id, roots.get(id).map(|info| info.level)))
            .collect();
        drop(roots);
        self.cache.recalc_reserve(&summary);
    }

    /// Allocate, key and hash a fresh node at `level` whose range ends
    /// at `max_key`, holding its intent+write locks. The node is
    /// written out before it becomes visible.
    pub(crate) fn make_node(
        self: &Arc<Self>,
        id: BtreeId,
        level: u8,
        max_key: Bpos,
        data: NodeData,
    ) -> Result<Arc<Node>> {
        let extent = self.devs.alloc_btree_node(BTREE_NODE_SECTORS)?;
        let key = KeyVal::new(
            Bkey::new(max_key, 0, KeyType::Extent),
            Bval::Extent(extent),
        );

        let node = loop {
            match self.cache.alloc(None) {
                Ok(node) => break node,
                Err(StrataError::NoMem) => {
                    let guard = self.cache.cannibalize_lock_blocking();
                    match self.cache.alloc(Some(&guard)) {
                        Ok(node) => break node,
                        Err(StrataError::NoMem) => {
                            // Everything reapable is locked right now.
                            drop(guard);
                            std::thread::yield_now();
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        };

        node.set_meta(key, level, id);
        node.with_data_mut(|d| *d = data);
        write_node_data(&self.devs, &node)?;
        if let Err(err) = self.cache.hash_insert(&node) {
            self.cache.release_to_freeable(&node);
            return Err(err);
        }
        Ok(node)
    }

    /// Flush one dirty node.
    pub fn flush_node(&self, node: &Arc<Node>) -> Result<()> {
        if !node.is_dirty() {
            return Ok(());
        }
        write_node_data(&self.devs, node)
    }

    /// Flush every dirty node reachable from the roots. Used at sync
    /// points and teardown.
    pub fn flush_all(&self) -> Result<()> {
        for id in BtreeId::ALL {
            let (root, level) = self.root(id)?;
            self.flush_recursive(&root, level)?;
        }
        Ok(())
    }

    fn flush_recursive(&self, node: &Arc<Node>, level: u8) -> Result<()> {
        if level > 0 {
            let children: Vec<KeyVal> = node
                .with_data(|data| {
                    let mut out = Vec::new();
                    let mut it = data.iter_at(Bpos::MIN, false);
                    while let Some(kv) = it.peek(data) {
                        out.push(kv);
                        it.advance(data);
                    }
                    out
                })
                .unwrap_or_default();
            for child_key in children {
                if let Some(ptr) = child_key.v.as_extent().and_then(|e| e.first_ptr()) {
                    if let Some(child) = self.cache.find(ptr) {
                        self.flush_recursive(&child, level - 1)?;
                    }
                }
            }
        }
        node.lock.lock(LockType::Read);
        let result = self.flush_node(node);
        node.lock.unlock(LockType::Read);
        result
    }

    /// Read a node's contents from disk into its data buffer.
    pub(crate) fn read_node_data(&self, node: &Arc<Node>) -> Result<()> {
        let Some(ptr) = node.hash_ptr() else {
            return Err(StrataError::Inconsistent(
                "read of unhashed btree node".to_owned(),
            ));
        };
        let Some(device) = self.devs.device(ptr.dev) else {
            return Err(StrataError::Inconsistent(format!(
                "btree node points at missing device {}",
                ptr.dev.0
            )));
        };

        let mut buf = vec![0_u8; (BTREE_NODE_SECTORS as usize) << SECTOR_SHIFT as usize];
        device.dev.read_sectors(ptr.offset, &mut buf)?;
        let data = NodeData::decode(&buf)?;
        #[expect(clippy::cast_possible_truncation)]
        let sectors = data.encode().map(|e| (e.len() >> SECTOR_SHIFT as usize) as u32)?;
        node.attach_data(data);
        node.set_written(sectors);
        self.stats.node_fills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Iterator over `id` starting at `pos`, read locks everywhere.
    #[must_use]
    pub fn iter(self: &Arc<Self>, id: BtreeId, pos: Bpos) -> BtreeIter {
        BtreeIter::new(Arc::clone(self), id, pos, 0)
    }

    /// Iterator taking an intent lock on the leaf, for updates.
    #[must_use]
    pub fn iter_intent(self: &Arc<Self>, id: BtreeId, pos: Bpos) -> BtreeIter {
        BtreeIter::new(Arc::clone(self), id, pos, 1)
    }

    /// Convenience lookup: the first key at or after `pos`.
    pub fn lookup(self: &Arc<Self>, id: BtreeId, pos: Bpos) -> Result<Option<KeyVal>> {
        let mut iter = self.iter(id, pos);
        let got = iter.peek()?;
        iter.unlock();
        Ok(got)
    }

    /// Keys of an extent value, for tests and debug output.
    #[must_use]
    pub fn extent_of(kv: &KeyVal) -> Option<&Extent> {
        kv.v.as_extent()
    }
}
