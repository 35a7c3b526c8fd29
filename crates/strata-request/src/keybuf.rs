//! The writeback keybuf: an ordered interval index of dirty keys
//! awaiting background writeback.
//!
//! Foreground writes consult it before choosing a path: any overlap
//! with a key whose writeback has not started forces the write into
//! writeback mode, and those not-yet-started keys are dropped on the
//! spot so the foreground write subsumes them. The writeback worker
//! pulls pending keys oldest-position-first and marks them started.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use strata_types::{Bkey, Bpos, KeyVal};
use tracing::trace;

#[derive(Debug, Clone)]
struct KeybufEntry {
    kv: KeyVal,
    started: bool,
}

/// Ordered index of dirty ranges, keyed by extent end position.
#[derive(Debug, Default)]
pub struct Keybuf {
    keys: Mutex<BTreeMap<Bpos, KeybufEntry>>,
}

impl Keybuf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a dirty key. Replaces any entry at the same end position.
    pub fn add(&self, kv: KeyVal) {
        self.keys.lock().insert(
            kv.k.p,
            KeybufEntry {
                kv,
                started: false,
            },
        );
    }

    /// Whether any tracked key overlaps `[start, end)` of one inode.
    ///
    /// Overlapping keys whose writeback has not started are dropped, so
    /// the caller's foreground write takes over their ranges. Returns
    /// true if any overlapping key was found at all, started or not.
    pub fn check_overlapping(&self, start: Bpos, end: Bpos) -> bool {
        let probe = Bkey::new(end, size_between(start, end), strata_types::KeyType::Extent);
        let mut keys = self.keys.lock();

        // Keys are end-addressed: overlap requires end > start, and the
        // scan can stop once positions outrun any possible overlap.
        let overlapping: Vec<Bpos> = keys
            .range(start.successor()..)
            .take_while(|(p, _)| {
                p.inode == start.inode
                    && p.offset <= end.offset.saturating_add(u64::from(u32::MAX))
            })
            .filter(|(_, entry)| entry.kv.k.overlaps(&probe))
            .map(|(p, _)| *p)
            .collect();

        let found = !overlapping.is_empty();
        for p in overlapping {
            let started = keys.get(&p).is_some_and(|entry| entry.started);
            if !started {
                keys.remove(&p);
                trace!(
                    target: "strata::request::keybuf",
                    event = "overlap_dropped",
                    inode = p.inode,
                    offset = p.offset
                );
            }
        }
        found
    }

    /// Whether a key ending at `p` is already tracked.
    #[must_use]
    pub fn contains(&self, p: Bpos) -> bool {
        self.keys.lock().contains_key(&p)
    }

    /// Next key whose writeback has not started, marked started.
    #[must_use]
    pub fn next_pending(&self) -> Option<KeyVal> {
        let mut keys = self.keys.lock();
        let p = keys
            .iter()
            .find(|(_, entry)| !entry.started)
            .map(|(p, _)| *p)?;
        let entry = keys.get_mut(&p)?;
        entry.started = true;
        Some(entry.kv.clone())
    }

    /// Writeback of `kv` finished (or was abandoned).
    pub fn del(&self, kv: &KeyVal) {
        self.keys.lock().remove(&kv.k.p);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

#[expect(clippy::cast_possible_truncation)]
fn size_between(start: Bpos, end: Bpos) -> u32 {
    debug_assert_eq!(start.inode, end.inode);
    (end.offset - start.offset).min(u64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{Bval, KeyType};

    fn dirty_kv(inode: u64, end: u64, size: u32) -> KeyVal {
        KeyVal::new(
            Bkey::new(Bpos::new(inode, end), size, KeyType::Extent),
            Bval::None,
        )
    }

    #[test]
    fn overlap_drops_unstarted_keys() {
        let keybuf = Keybuf::new();
        keybuf.add(dirty_kv(5, 128, 128));

        // Foreground write over (64, 192]: overlaps, key unstarted.
        assert!(keybuf.check_overlapping(Bpos::new(5, 64), Bpos::new(5, 192)));
        assert!(keybuf.is_empty());
    }

    #[test]
    fn overlap_keeps_started_keys() {
        let keybuf = Keybuf::new();
        keybuf.add(dirty_kv(5, 128, 128));
        let pending = keybuf.next_pending().unwrap();
        assert_eq!(pending.k.p, Bpos::new(5, 128));

        assert!(keybuf.check_overlapping(Bpos::new(5, 64), Bpos::new(5, 192)));
        assert_eq!(keybuf.len(), 1);
    }

    #[test]
    fn no_overlap_reports_false() {
        let keybuf = Keybuf::new();
        keybuf.add(dirty_kv(5, 64, 64));
        assert!(!keybuf.check_overlapping(Bpos::new(5, 64), Bpos::new(5, 128)));
        assert!(!keybuf.check_overlapping(Bpos::new(6, 0), Bpos::new(6, 128)));
        assert_eq!(keybuf.len(), 1);
    }

    #[test]
    fn pending_scan_is_in_key_order() {
        let keybuf = Keybuf::new();
        keybuf.add(dirty_kv(1, 256, 64));
        keybuf.add(dirty_kv(1, 64, 64));

        let first = keybuf.next_pending().unwrap();
        assert_eq!(first.k.p.offset, 64);
        let second = keybuf.next_pending().unwrap();
        assert_eq!(second.k.p.offset, 256);
        assert!(keybuf.next_pending().is_none());

        keybuf.del(&first);
        keybuf.del(&second);
        assert!(keybuf.is_empty());
    }
}
