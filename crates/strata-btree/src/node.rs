//! In-memory btree node objects.
//!
//! A node shell is never freed while the cache set lives; only its data
//! buffer is detachable (reclaimed by the shrinker, reattached on
//! reuse). The node's identity in the cache hash table is the first
//! pointer of its own key; unhashing zeroes the key so stale lookups
//! and relocks fail.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use strata_closure::WaitList;
use strata_types::{Bkey, Bpos, BtreeId, Bval, ExtentPtr, KeyType, KeyVal};

use crate::bset::NodeData;
use crate::sixlock::SixLock;

pub const NODE_DIRTY: u32 = 1 << 0;
pub const NODE_WRITE_IN_FLIGHT: u32 = 1 << 1;
pub const NODE_READ_ERROR: u32 = 1 << 2;
pub const NODE_WRITE_ERROR: u32 = 1 << 3;
pub const NODE_NOEVICT: u32 = 1 << 4;
pub const NODE_ACCESSED: u32 = 1 << 5;

#[derive(Debug, Clone)]
pub struct NodeMeta {
    /// The pointer key this node is reached by; its first pointer is
    /// the hash identity. `Bval::None` = unhashed.
    pub key: KeyVal,
    pub level: u8,
    pub btree_id: BtreeId,
}

/// A cached btree node: six-lock, flags, detachable data.
#[derive(Debug)]
pub struct Node {
    pub lock: SixLock,
    flags: AtomicU32,
    meta: Mutex<NodeMeta>,
    data: Mutex<Option<NodeData>>,
    /// Sectors of the on-disk node already written.
    written: AtomicU32,
    /// Writers blocked on this node being flushed.
    pub write_blocked: WaitList,
}

impl Default for Node {
    fn default() -> Self {
        Self::new_shell()
    }
}

impl Node {
    #[must_use]
    pub fn new_shell() -> Self {
        Self {
            lock: SixLock::new(),
            flags: AtomicU32::new(0),
            meta: Mutex::new(NodeMeta {
                key: KeyVal::new(
                    Bkey::new(Bpos::MIN, 0, KeyType::Extent),
                    Bval::None,
                ),
                level: 0,
                btree_id: BtreeId::Extents,
            }),
            data: Mutex::new(None),
            written: AtomicU32::new(0),
            write_blocked: WaitList::new(),
        }
    }

    // ── Flags ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn test_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn reset_flags(&self) {
        self.flags.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.test_flag(NODE_DIRTY)
    }

    // ── Identity ────────────────────────────────────────────────────────

    #[must_use]
    pub fn meta(&self) -> NodeMeta {
        self.meta.lock().clone()
    }

    pub fn set_meta(&self, key: KeyVal, level: u8, btree_id: BtreeId) {
        *self.meta.lock() = NodeMeta {
            key,
            level,
            btree_id,
        };
    }

    /// First pointer of the node's key; `None` once unhashed.
    #[must_use]
    pub fn hash_ptr(&self) -> Option<ExtentPtr> {
        self.meta
            .lock()
            .key
            .v
            .as_extent()
            .and_then(|e| e.first_ptr().copied())
    }

    /// Zero the identity so future lookups and relocks against this
    /// node fail.
    pub fn zero_hash(&self) {
        self.meta.lock().key.v = Bval::None;
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.meta.lock().level
    }

    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        self.meta.lock().btree_id
    }

    /// Upper bound of this node's key range.
    #[must_use]
    pub fn max_key(&self) -> Bpos {
        self.meta.lock().key.k.p
    }

    // ── Data buffer ─────────────────────────────────────────────────────

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.lock().is_some()
    }

    pub fn attach_data(&self, data: NodeData) {
        *self.data.lock() = Some(data);
    }

    /// Detach the data buffer (shrinker reclaim).
    pub fn free_data(&self) -> Option<NodeData> {
        self.written.store(0, Ordering::Release);
        self.data.lock().take()
    }

    /// Run `f` on the node's data. The caller must hold an appropriate
    /// six-lock; the inner mutex only makes the access data-race free.
    pub fn with_data<R>(&self, f: impl FnOnce(&NodeData) -> R) -> Option<R> {
        self.data.lock().as_ref().map(f)
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut NodeData) -> R) -> Option<R> {
        self.data.lock().as_mut().map(f)
    }

    #[must_use]
    pub fn written(&self) -> u32 {
        self.written.load(Ordering::Acquire)
    }

    pub fn set_written(&self, sectors: u32) {
        self.written.store(sectors, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{DeviceIdx, Extent, Gen};

    fn node_key(offset: u64) -> KeyVal {
        KeyVal::new(
            Bkey::new(Bpos::new(0, 1024), 0, KeyType::Extent),
            Bval::Extent(Extent::single(ExtentPtr {
                dev: DeviceIdx(0),
                gen: Gen(1),
                offset,
            })),
        )
    }

    #[test]
    fn hash_identity_follows_key() {
        let node = Node::new_shell();
        assert!(node.hash_ptr().is_none());

        node.set_meta(node_key(64), 0, BtreeId::Extents);
        assert_eq!(node.hash_ptr().unwrap().offset, 64);

        node.zero_hash();
        assert!(node.hash_ptr().is_none());
    }

    #[test]
    fn flags_are_independent() {
        let node = Node::new_shell();
        node.set_flag(NODE_DIRTY);
        node.set_flag(NODE_ACCESSED);
        assert!(node.is_dirty());
        node.clear_flag(NODE_DIRTY);
        assert!(!node.is_dirty());
        assert!(node.test_flag(NODE_ACCESSED));
    }

    #[test]
    fn data_detaches() {
        let node = Node::new_shell();
        node.attach_data(NodeData::new());
        node.set_written(4);
        assert!(node.has_data());

        let data = node.free_data().unwrap();
        assert_eq!(data.nsets(), 1);
        assert!(!node.has_data());
        assert_eq!(node.written(), 0);
    }
}
