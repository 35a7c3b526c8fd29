//! The btree iterator.
//!
//! An iterator holds a path of locked nodes from the root down to the
//! leaf containing its position: intent locks below `locks_want`, read
//! locks above. Per-level lock sequences are snapshotted so dropped
//! locks can be revalidated; any relock failure restarts the descent
//! from the deepest still-valid ancestor (here: the root, which is
//! always valid to re-resolve).
//!
//! Iterators may be linked into a ring. Linked iterators share locks on
//! the same node (the six-lock hold count is incremented instead of
//! re-acquired), structural changes drop every linked iterator from an
//! affected node, and `cond_resched` unlocks the whole ring before
//! yielding.
//!
//! Lookup of a child node follows the node-cache protocol: a cached hit
//! drops the parent's read lock before taking an intent lock on the
//! child (a writer holding the child's intent may want to upgrade the
//! parent to write, and holding the parent read would deadlock); the fill
//! path keeps the parent read lock across the unhashed-check-and-insert
//! but never across disk I/O.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_types::{Bkey, Bpos, BtreeId, Bval, ExtentPtr, KeyType, KeyVal, BTREE_MAX_DEPTH};
use tracing::trace;

use crate::bset::NodeIter;
use crate::cache::CannibalizeGuard;
use crate::node::{Node, NODE_ACCESSED, NODE_READ_ERROR};
use crate::sixlock::LockType;
use crate::Btree;

#[derive(Default)]
pub(crate) struct LevelState {
    pub(crate) node: Option<Arc<Node>>,
    /// Held lock type; `None` with a node present means "dropped but
    /// relockable via `seq`".
    pub(crate) lock: Option<LockType>,
    pub(crate) seq: u64,
    pub(crate) iter: NodeIter,
}

pub(crate) struct IterState {
    pub(crate) live: bool,
    pub(crate) btree_id: BtreeId,
    pub(crate) is_extents: bool,
    pub(crate) pos: Bpos,
    pub(crate) locks_want: u8,
    pub(crate) done: bool,
    pub(crate) last_key: Option<Bkey>,
    pub(crate) levels: [LevelState; BTREE_MAX_DEPTH],
}

#[derive(Default)]
pub(crate) struct IterGroup {
    pub(crate) iters: Vec<IterState>,
}

/// A btree iterator; see the module docs.
pub struct BtreeIter {
    btree: Arc<Btree>,
    grp: Arc<Mutex<IterGroup>>,
    slot: usize,
}

impl std::fmt::Debug for BtreeIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeIter").field("slot", &self.slot).finish()
    }
}

fn want_type(st: &IterState, level: usize) -> LockType {
    if (level as u8) < st.locks_want {
        LockType::Intent
    } else {
        LockType::Read
    }
}

/// Whether another linked iterator already holds a lock on `node` that
/// `ty` may share.
fn lock_is_shared(grp: &IterGroup, slot: usize, node: &Arc<Node>, ty: LockType) -> bool {
    grp.iters.iter().enumerate().any(|(i, other)| {
        i != slot
            && other.live
            && other.levels.iter().any(|ls| {
                ls.node.as_ref().is_some_and(|n| Arc::ptr_eq(n, node))
                    && match (ls.lock, ty) {
                        (Some(LockType::Read | LockType::Intent), LockType::Read)
                        | (Some(LockType::Intent), LockType::Intent) => true,
                        _ => false,
                    }
            })
    })
}

/// Acquire `ty` on `node` (sharing with linked iterators when legal)
/// and record it at `level`.
fn acquire_and_set(
    grp: &mut IterGroup,
    slot: usize,
    node: &Arc<Node>,
    level: usize,
    ty: LockType,
) {
    if lock_is_shared(grp, slot, node, ty) {
        node.lock.increment(ty);
    } else {
        node.lock.lock(ty);
    }
    let st = &mut grp.iters[slot];
    let iter = node
        .with_data(|d| d.iter_at(st.pos, st.is_extents))
        .unwrap_or_default();
    st.levels[level] = LevelState {
        node: Some(Arc::clone(node)),
        lock: Some(ty),
        seq: node.lock.seq(),
        iter,
    };
}

fn unlock_level(grp: &mut IterGroup, slot: usize, level: usize) {
    let ls = &mut grp.iters[slot].levels[level];
    if let (Some(node), Some(ty)) = (ls.node.as_ref(), ls.lock.take()) {
        ls.seq = node.lock.seq();
        node.lock.unlock(ty);
    }
}

fn unlock_slot(grp: &mut IterGroup, slot: usize) {
    for level in 0..BTREE_MAX_DEPTH {
        unlock_level(grp, slot, level);
    }
}

fn clear_slot(grp: &mut IterGroup, slot: usize) {
    unlock_slot(grp, slot);
    for ls in &mut grp.iters[slot].levels {
        *ls = LevelState::default();
    }
}

/// Drop the parent's read lock (keeping its seq) before blocking on an
/// exclusive child lock.
fn unlock_parent_read(grp: &mut IterGroup, slot: usize, level: usize) {
    if level < BTREE_MAX_DEPTH && grp.iters[slot].levels[level].lock == Some(LockType::Read) {
        unlock_level(grp, slot, level);
    }
}

/// Re-take a dropped lock at `level` if nothing wrote the node since.
fn relock_level(grp: &mut IterGroup, slot: usize, level: usize) -> bool {
    if level >= BTREE_MAX_DEPTH {
        return false;
    }
    let st = &grp.iters[slot];
    let ls = &st.levels[level];
    if ls.lock.is_some() {
        return true;
    }
    let Some(node) = ls.node.clone() else {
        return false;
    };
    if node.hash_ptr().is_none() {
        return false;
    }
    let ty = want_type(st, level);
    let seq = ls.seq;
    if node.lock.relock(ty, seq) {
        grp.iters[slot].levels[level].lock = Some(ty);
        true
    } else {
        false
    }
}

/// Re-seek every linked iterator's cursor on `node` after its contents
/// were rearranged under a held write lock.
pub(crate) fn fix_node_iters(grp: &mut IterGroup, node: &Arc<Node>) {
    let fixes: Vec<(usize, usize, Bpos, bool)> = grp
        .iters
        .iter()
        .enumerate()
        .filter(|(_, st)| st.live)
        .flat_map(|(slot, st)| {
            st.levels
                .iter()
                .enumerate()
                .filter(|(_, ls)| ls.node.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)))
                .map(move |(level, _)| (slot, level, st.pos, st.is_extents))
        })
        .collect();
    for (slot, level, pos, is_extents) in fixes {
        node.with_data(|d| grp.iters[slot].levels[level].iter.fix(d, pos, is_extents));
    }
}

/// Drop every linked iterator's reference to `node` (it was freed by a
/// structural change); they re-traverse on next use.
pub(crate) fn drop_node(grp: &mut IterGroup, node: &Arc<Node>) {
    for slot in 0..grp.iters.len() {
        if !grp.iters[slot].live {
            continue;
        }
        for level in 0..BTREE_MAX_DEPTH {
            let matches = grp.iters[slot].levels[level]
                .node
                .as_ref()
                .is_some_and(|n| Arc::ptr_eq(n, node));
            if matches {
                unlock_level(grp, slot, level);
                grp.iters[slot].levels[level] = LevelState::default();
            }
        }
    }
}

/// Invariant check: every held lock's snapshotted `seq >> 1` matches
/// the node's current sequence, which makes the snapshots of any two
/// linked iterators on the same node equal to each other.
pub(crate) fn verify_linked_seqs(grp: &IterGroup) -> bool {
    grp.iters.iter().filter(|st| st.live).all(|st| {
        st.levels.iter().all(|ls| match (&ls.node, ls.lock) {
            (Some(node), Some(_)) => ls.seq >> 1 == node.lock.seq() >> 1,
            _ => true,
        })
    })
}

impl BtreeIter {
    #[must_use]
    pub fn new(btree: Arc<Btree>, id: BtreeId, pos: Bpos, locks_want: u8) -> Self {
        let grp = Arc::new(Mutex::new(IterGroup::default()));
        Self::into_group(btree, grp, id, pos, locks_want)
    }

    /// A new iterator linked with this one: same ring, shared locks.
    #[must_use]
    pub fn linked(&self, id: BtreeId, pos: Bpos, locks_want: u8) -> Self {
        Self::into_group(
            Arc::clone(&self.btree),
            Arc::clone(&self.grp),
            id,
            pos,
            locks_want,
        )
    }

    fn into_group(
        btree: Arc<Btree>,
        grp: Arc<Mutex<IterGroup>>,
        id: BtreeId,
        pos: Bpos,
        locks_want: u8,
    ) -> Self {
        let slot = {
            let mut group = grp.lock();
            group.iters.push(IterState {
                live: true,
                btree_id: id,
                is_extents: id == BtreeId::Extents,
                pos,
                locks_want: locks_want.min(BTREE_MAX_DEPTH as u8),
                done: false,
                last_key: None,
                levels: Default::default(),
            });
            group.iters.len() - 1
        };
        Self { btree, grp, slot }
    }

    #[must_use]
    pub fn btree(&self) -> &Arc<Btree> {
        &self.btree
    }

    #[must_use]
    pub fn pos(&self) -> Bpos {
        self.grp.lock().iters[self.slot].pos
    }

    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        self.grp.lock().iters[self.slot].btree_id
    }

    pub fn set_pos(&mut self, pos: Bpos) {
        let mut grp = self.grp.lock();
        let st = &mut grp.iters[self.slot];
        st.pos = pos;
        st.done = false;
        st.last_key = None;
        if let Some(node) = st.levels[0].node.clone() {
            if st.levels[0].lock.is_some() {
                let (pos, is_extents) = (st.pos, st.is_extents);
                node.with_data(|d| grp.iters[self.slot].levels[0].iter.fix(d, pos, is_extents));
            }
        }
    }

    /// Drop every held lock; the path stays relockable.
    pub fn unlock(&mut self) {
        unlock_slot(&mut self.grp.lock(), self.slot);
    }

    /// Adjust intent coverage. Returns false if the locks held do not
    /// already satisfy it; everything is dropped and the caller must
    /// re-traverse.
    pub fn set_locks_want(&mut self, locks_want: u8) -> bool {
        let locks_want = locks_want.min(BTREE_MAX_DEPTH as u8);
        let mut grp = self.grp.lock();
        let st = &grp.iters[self.slot];
        let satisfied = st.locks_want == locks_want
            && (0..usize::from(locks_want)).all(|level| {
                st.levels[level].node.is_none() || st.levels[level].lock == Some(LockType::Intent)
            });
        grp.iters[self.slot].locks_want = locks_want;
        if satisfied {
            return true;
        }
        clear_slot(&mut grp, self.slot);
        false
    }

    /// Unlock the whole ring, then yield the thread.
    pub fn cond_resched(&self) {
        {
            let mut grp = self.grp.lock();
            for slot in 0..grp.iters.len() {
                unlock_slot(&mut grp, slot);
            }
        }
        std::thread::yield_now();
    }

    // ── Traversal ───────────────────────────────────────────────────────

    /// Walk from the root to the leaf containing `pos`, taking locks
    /// per `locks_want`. Retries internally on relock failures and
    /// handles node-cache exhaustion by taking the cannibalize lock.
    pub fn traverse(&mut self) -> Result<()> {
        loop {
            match self.traverse_inner(None) {
                Err(StrataError::NoMem) => {
                    let guard = self.btree.cache.cannibalize_lock_blocking();
                    match self.traverse_inner(Some(&guard)) {
                        // Even the cannibalize holder can come up empty
                        // if every node is locked; back off and retry.
                        Err(StrataError::NoMem) => {
                            drop(guard);
                            std::thread::yield_now();
                        }
                        other => return other,
                    }
                }
                other => return other,
            }
        }
    }

    fn traverse_inner(&mut self, guard: Option<&CannibalizeGuard>) -> Result<()> {
        let mut grp = self.grp.lock();
        let slot = self.slot;
        let id = grp.iters[slot].btree_id;

        'restart: loop {
            clear_slot(&mut grp, slot);

            let (root, root_level) = self.btree.root(id)?;
            let root_level = usize::from(root_level);
            let ty = want_type(&grp.iters[slot], root_level);
            acquire_and_set(&mut grp, slot, &root, root_level, ty);

            // The root can be swapped while we were blocking on it.
            let (cur_root, cur_level) = self.btree.root(id)?;
            if !Arc::ptr_eq(&cur_root, &root)
                || usize::from(cur_level) != root_level
                || root.hash_ptr().is_none()
            {
                self.btree.stats.traverse_retries.fetch_add(1, Ordering::Relaxed);
                continue 'restart;
            }

            let mut level = root_level;
            while level > 0 {
                let node = grp.iters[slot].levels[level]
                    .node
                    .clone()
                    .unwrap_or_else(|| unreachable!("descent holds the path"));
                let (pos, is_extents) = {
                    let st = &grp.iters[slot];
                    (st.pos, st.is_extents)
                };
                let child_key = node
                    .with_data(|d| {
                        let mut it = d.iter_at(pos, is_extents);
                        loop {
                            match it.peek(d) {
                                Some(kv) if kv.k.ty == KeyType::Deleted => it.advance(d),
                                other => break other,
                            }
                        }
                    })
                    .flatten();

                let Some(child_key) = child_key else {
                    // Past the rightmost key; only reachable at the end
                    // of the key space.
                    grp.iters[slot].done = true;
                    unlock_slot(&mut grp, slot);
                    return Ok(());
                };

                let child_ty = want_type(&grp.iters[slot], level - 1);
                match self.get_node(&mut grp, &child_key, level - 1, child_ty, guard) {
                    Ok(()) => level -= 1,
                    Err(StrataError::Retry) => {
                        self.btree.stats.traverse_retries.fetch_add(1, Ordering::Relaxed);
                        continue 'restart;
                    }
                    Err(err) => {
                        unlock_slot(&mut grp, slot);
                        return Err(err);
                    }
                }
            }

            grp.iters[slot].done = false;
            debug_assert!(verify_linked_seqs(&grp));
            return Ok(());
        }
    }

    /// Find (or fill) and lock the child at `level` reached by
    /// `child_key`, recording it in the path.
    fn get_node(
        &self,
        grp: &mut IterGroup,
        child_key: &KeyVal,
        level: usize,
        ty: LockType,
        guard: Option<&CannibalizeGuard>,
    ) -> Result<()> {
        let slot = self.slot;
        let Some(ptr) = child_key.v.as_extent().and_then(|e| e.first_ptr().copied()) else {
            return Err(StrataError::Inconsistent(
                "interior key carries no pointer".to_owned(),
            ));
        };

        loop {
            if let Some(node) = self.btree.cache.find(&ptr) {
                // Taking an exclusive child lock while holding the
                // parent read-locked can deadlock against a writer
                // upgrading the parent; drop the parent read first and
                // revalidate it afterwards.
                if ty != LockType::Read {
                    unlock_parent_read(grp, slot, level + 1);
                }
                acquire_and_set(grp, slot, &node, level, ty);

                let identity_ok = node.hash_ptr() == Some(ptr)
                    && usize::from(node.level()) == level
                    && !self.btree.race_fault();
                if !identity_ok {
                    unlock_level(grp, slot, level);
                    grp.iters[slot].levels[level] = LevelState::default();
                    if relock_level(grp, slot, level + 1) {
                        continue;
                    }
                    return Err(StrataError::Retry);
                }

                if !node.test_flag(NODE_ACCESSED) {
                    node.set_flag(NODE_ACCESSED);
                }
                if node.test_flag(NODE_READ_ERROR) {
                    unlock_level(grp, slot, level);
                    grp.iters[slot].levels[level] = LevelState::default();
                    return Err(StrataError::Io(std::io::Error::other(
                        "btree node read error",
                    )));
                }
                return Ok(());
            }

            // Slow path: read the node in. The parent stays locked
            // until the new node is hashed (a concurrent split could
            // otherwise free the node we are about to read), but never
            // across the disk read itself.
            let node = self.btree.cache.alloc(guard)?;
            node.set_meta(child_key.clone(), level as u8, grp.iters[slot].btree_id);
            match self.btree.cache.hash_insert(&node) {
                Ok(()) => {}
                Err(StrataError::Retry) => {
                    // Raced with a concurrent fill.
                    self.btree.cache.release_to_freeable(&node);
                    continue;
                }
                Err(err) => {
                    self.btree.cache.release_to_freeable(&node);
                    return Err(err);
                }
            }

            unlock_parent_read(grp, slot, level + 1);

            let read_result = self.btree.read_node_data(&node);
            node.lock.unlock(LockType::Write);
            match read_result {
                Ok(()) => {}
                Err(err) => {
                    node.set_flag(NODE_READ_ERROR);
                    node.lock.unlock(LockType::Intent);
                    return Err(err);
                }
            }

            if ty == LockType::Read {
                node.lock.downgrade();
            }
            let st = &mut grp.iters[slot];
            let iter = node
                .with_data(|d| d.iter_at(st.pos, st.is_extents))
                .unwrap_or_default();
            st.levels[level] = LevelState {
                node: Some(Arc::clone(&node)),
                lock: Some(ty),
                seq: node.lock.seq(),
                iter,
            };
            trace!(target: "strata::btree::iter", event = "node_fill", level = level);
            return Ok(());
        }
    }

    // ── Key iteration ───────────────────────────────────────────────────

    /// The next live key at or after `pos`.
    pub fn peek(&mut self) -> Result<Option<KeyVal>> {
        loop {
            self.traverse()?;
            let mut grp = self.grp.lock();
            let st = &mut grp.iters[self.slot];
            if st.done {
                return Ok(None);
            }
            let leaf = st.levels[0]
                .node
                .clone()
                .ok_or_else(|| StrataError::Inconsistent("traverse left no leaf".to_owned()))?;

            let found = leaf
                .with_data(|d| {
                    let it = &mut st.levels[0].iter;
                    loop {
                        match it.peek(d) {
                            Some(kv) if kv.k.ty == KeyType::Deleted => it.advance(d),
                            other => break other,
                        }
                    }
                })
                .flatten();

            match found {
                Some(kv) => {
                    st.last_key = Some(kv.k);
                    return Ok(Some(kv));
                }
                None => {
                    let max = leaf.max_key();
                    if max >= Bpos::MAX {
                        st.done = true;
                        return Ok(None);
                    }
                    st.pos = if st.is_extents { max } else { max.successor() };
                    drop(grp);
                }
            }
        }
    }

    /// Like `peek`, but on the extents tree gaps between extents are
    /// returned as zero-valued hole keys so callers can walk a dense
    /// position space.
    pub fn peek_with_holes(&mut self) -> Result<Option<KeyVal>> {
        if !self.grp.lock().iters[self.slot].is_extents {
            return self.peek();
        }

        loop {
            self.traverse()?;
            let mut grp = self.grp.lock();
            let st = &mut grp.iters[self.slot];
            if st.done {
                return Ok(None);
            }
            let leaf = st.levels[0]
                .node
                .clone()
                .ok_or_else(|| StrataError::Inconsistent("traverse left no leaf".to_owned()))?;

            let found = leaf
                .with_data(|d| {
                    let it = &mut st.levels[0].iter;
                    loop {
                        match it.peek(d) {
                            Some(kv) if kv.k.ty == KeyType::Deleted => it.advance(d),
                            other => break other,
                        }
                    }
                })
                .flatten();

            match found {
                Some(kv) if kv.k.ty.is_extent() || kv.k.ty == KeyType::Cookie => {
                    let start = kv.k.start();
                    if start > st.pos {
                        let hole = Self::hole_key(st.pos, Some(start));
                        st.last_key = Some(hole.k);
                        return Ok(Some(hole));
                    }
                    st.last_key = Some(kv.k);
                    return Ok(Some(kv));
                }
                Some(kv) => {
                    // Discard tombstones and other non-extent keys read
                    // as holes up to their end.
                    let hole = Self::hole_key(st.pos, Some(kv.k.p));
                    st.last_key = Some(hole.k);
                    return Ok(Some(hole));
                }
                None => {
                    let max = leaf.max_key();
                    if max >= Bpos::MAX {
                        let hole = Self::hole_key(st.pos, None);
                        st.last_key = Some(hole.k);
                        return Ok(Some(hole));
                    }
                    st.pos = max;
                    drop(grp);
                }
            }
        }
    }

    /// A synthesized hole from `pos` up to `end` (same-inode boundary
    /// or the u32 size cap, whichever is closer).
    fn hole_key(pos: Bpos, end: Option<Bpos>) -> KeyVal {
        let end_offset = match end {
            Some(end) if end.inode == pos.inode => end.offset,
            _ => u64::MAX,
        };
        let size = end_offset
            .saturating_sub(pos.offset)
            .min(u64::from(u32::MAX))
            .max(1);
        #[expect(clippy::cast_possible_truncation)]
        let size32 = size as u32;
        KeyVal::new(
            Bkey::new(
                Bpos::new(pos.inode, pos.offset + size),
                size32,
                KeyType::Deleted,
            ),
            Bval::None,
        )
    }

    /// Step past the key the last peek returned.
    pub fn advance_pos(&mut self) {
        let mut grp = self.grp.lock();
        let st = &mut grp.iters[self.slot];
        st.pos = match st.last_key.take() {
            Some(k) if st.is_extents => k.p,
            Some(k) => st.btree_id.successor(k.p),
            None => st.pos.successor(),
        };
        if st.levels[0].lock.is_some() {
            if let Some(node) = st.levels[0].node.clone() {
                let (pos, is_extents) = (st.pos, st.is_extents);
                node.with_data(|d| grp.iters[self.slot].levels[0].iter.fix(d, pos, is_extents));
            }
        }
    }

    // ── Internal access for the update path ─────────────────────────────

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut IterGroup, usize) -> R) -> R {
        let mut grp = self.grp.lock();
        f(&mut grp, self.slot)
    }

    pub(crate) fn node_ptr(key: &KeyVal) -> Option<ExtentPtr> {
        key.v.as_extent().and_then(|e| e.first_ptr().copied())
    }
}

impl Drop for BtreeIter {
    fn drop(&mut self) {
        let mut grp = self.grp.lock();
        unlock_slot(&mut grp, self.slot);
        let st = &mut grp.iters[self.slot];
        st.live = false;
        for ls in &mut st.levels {
            *ls = LevelState::default();
        }
    }
}
