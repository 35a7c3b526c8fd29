//! Bsets and the intra-node cursor.
//!
//! A btree node's keys live in 1..[`MAX_BSETS`] sorted runs: every run
//! but the last was written to disk and is immutable; the last accepts
//! sorted inserts. Lookups merge the runs with [`NodeIter`]; compaction
//! merges them physically. Across all runs of one node, extent keys
//! never overlap (the update path compacts before editing ranges), and
//! for duplicate positions the newest run wins.

use serde::{Deserialize, Serialize};
use strata_error::{Result, StrataError};
use strata_types::{Bpos, KeyType, KeyVal, SECTOR_SHIFT};

/// Immutable runs per node before compaction is forced.
pub const MAX_BSETS: usize = 3;

/// Split threshold: live keys above this split the node. The encoded
/// cap below leaves room for transiently overfull interior nodes.
pub const NODE_MAX_KEYS: usize = 128;

/// On-disk size of a serialized node, in sectors.
pub const BTREE_NODE_SECTORS: u32 = 256;

const BSET_MAGIC: u32 = 0x5342_5354;

/// One sorted run of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bset {
    keys: Vec<KeyVal>,
}

impl Bset {
    /// Index of the first key at or after `pos`.
    ///
    /// Extent keys are end-addressed, so for the extents comparator a
    /// key whose position equals `pos` is entirely before it and is
    /// skipped.
    #[must_use]
    pub fn search(&self, pos: Bpos, is_extents: bool) -> usize {
        self.keys.partition_point(|kv| {
            if is_extents {
                kv.k.p <= pos
            } else {
                kv.k.p < pos
            }
        })
    }

    #[must_use]
    pub fn keys(&self) -> &[KeyVal] {
        &self.keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A node's keys: immutable runs plus one mutable run at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    bsets: Vec<Bset>,
}

impl NodeData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bsets: vec![Bset::default()],
        }
    }

    #[must_use]
    pub fn nsets(&self) -> usize {
        self.bsets.len()
    }

    #[must_use]
    pub fn bsets(&self) -> &[Bset] {
        &self.bsets
    }

    #[must_use]
    pub fn live_keys(&self) -> usize {
        // Duplicate positions across runs shadow each other; compaction
        // keeps this count honest, and duplicates are rare in between.
        self.bsets.iter().map(Bset::len).sum()
    }

    /// Greatest key position present, if any.
    #[must_use]
    pub fn max_key(&self) -> Option<Bpos> {
        self.bsets
            .iter()
            .filter_map(|set| set.keys.last())
            .map(|kv| kv.k.p)
            .max()
    }

    /// Merge every run into one, newest-run-wins on duplicate
    /// positions. The result is the new mutable run.
    pub fn compact(&mut self) {
        if self.bsets.len() == 1 {
            return;
        }
        let mut merged: Vec<KeyVal> = Vec::with_capacity(self.live_keys());
        // Reverse order so the newest occurrence of a position lands
        // first and wins the dedup.
        for set in self.bsets.iter().rev() {
            merged.extend(set.keys.iter().cloned());
        }
        merged.sort_by(|a, b| a.k.p.cmp(&b.k.p));
        merged.dedup_by(|next, first| next.k.p == first.k.p && next.k.ty == first.k.ty);
        self.bsets = vec![Bset { keys: merged }];
    }

    /// Seal the mutable run (it was just written out) and open a new
    /// one, compacting first when at the run limit.
    pub fn seal(&mut self) {
        if self.bsets.len() >= MAX_BSETS {
            self.compact();
        }
        if self.bsets.last().is_some_and(|set| !set.is_empty()) {
            self.bsets.push(Bset::default());
        }
    }

    /// Compact and expose the single remaining run for range surgery.
    pub fn single_mut(&mut self) -> &mut Vec<KeyVal> {
        self.compact();
        &mut self.bsets[0].keys
    }

    /// Insert into the mutable run, keeping it sorted. An existing key
    /// in that run with the same position and type is replaced.
    pub fn insert_sorted(&mut self, kv: KeyVal) {
        let set = self
            .bsets
            .last_mut()
            .unwrap_or_else(|| unreachable!("NodeData always has a mutable run"));
        let idx = set.keys.partition_point(|k| k.k.p < kv.k.p);
        if set
            .keys
            .get(idx)
            .is_some_and(|k| k.k.p == kv.k.p && k.k.ty == kv.k.ty)
        {
            set.keys[idx] = kv;
        } else {
            set.keys.insert(idx, kv);
        }
    }

    /// Whether any key (in any run) overlaps the extent range of `kv`.
    #[must_use]
    pub fn overlaps(&self, kv: &KeyVal) -> bool {
        self.bsets.iter().any(|set| {
            let from = set.search(kv.k.start(), true);
            set.keys[from..]
                .iter()
                .take_while(|k| k.k.start() < kv.k.p)
                .any(|k| k.k.overlaps(&kv.k))
        })
    }

    /// Cursor positioned at the first key at or after `pos`.
    #[must_use]
    pub fn iter_at(&self, pos: Bpos, is_extents: bool) -> NodeIter {
        NodeIter {
            positions: self
                .bsets
                .iter()
                .map(|set| set.search(pos, is_extents))
                .collect(),
        }
    }

    // ── Serialization ───────────────────────────────────────────────────

    /// Encode to a sector-padded blob: per-run frames with crc32c.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&BSET_MAGIC.to_le_bytes());
        #[expect(clippy::cast_possible_truncation)]
        let nsets = self.bsets.len() as u32;
        out.extend_from_slice(&nsets.to_le_bytes());

        for set in &self.bsets {
            let payload = serde_json::to_vec(set)
                .map_err(|err| StrataError::Io(std::io::Error::other(err)))?;
            #[expect(clippy::cast_possible_truncation)]
            let len = payload.len() as u32;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
            out.extend_from_slice(&payload);
        }

        let sector_bytes = 1_usize << SECTOR_SHIFT;
        let cap = (BTREE_NODE_SECTORS as usize) << SECTOR_SHIFT as usize;
        let padded = out.len().div_ceil(sector_bytes) * sector_bytes;
        if padded > cap {
            return Err(StrataError::Inconsistent(format!(
                "btree node overflows {BTREE_NODE_SECTORS} sectors"
            )));
        }
        out.resize(padded, 0);
        Ok(out)
    }

    /// Decode a blob produced by [`NodeData::encode`], validating every
    /// run's checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: &str| StrataError::Inconsistent(format!("btree node: {detail}"));

        if bytes.len() < 8 || bytes[0..4] != BSET_MAGIC.to_le_bytes() {
            return Err(corrupt("bad magic"));
        }
        let nsets = u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default()) as usize;
        if nsets == 0 || nsets > MAX_BSETS {
            return Err(corrupt("bad run count"));
        }

        let mut bsets = Vec::with_capacity(nsets);
        let mut at = 8_usize;
        for _ in 0..nsets {
            if at + 8 > bytes.len() {
                return Err(corrupt("truncated frame header"));
            }
            let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap_or_default()) as usize;
            let crc = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap_or_default());
            at += 8;
            if at + len > bytes.len() {
                return Err(corrupt("truncated frame"));
            }
            let payload = &bytes[at..at + len];
            if crc32c::crc32c(payload) != crc {
                return Err(corrupt("checksum mismatch"));
            }
            let set: Bset = serde_json::from_slice(payload)
                .map_err(|_| corrupt("undecodable run"))?;
            bsets.push(set);
            at += len;
        }
        Ok(Self { bsets })
    }

    /// Sectors the encoded form of this data occupies.
    pub fn encoded_sectors(&self) -> Result<u32> {
        #[expect(clippy::cast_possible_truncation)]
        let sectors = (self.encode()?.len() >> SECTOR_SHIFT as usize) as u32;
        Ok(sectors)
    }
}

/// K-way merge cursor over a node's runs.
///
/// `peek` yields the smallest key at or after the seek position; on
/// duplicate positions the newest run wins and stale occurrences are
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct NodeIter {
    /// Cursor into each run, parallel to `NodeData::bsets`.
    positions: Vec<usize>,
}

impl NodeIter {
    fn min_slot(&mut self, data: &NodeData) -> Option<usize> {
        loop {
            let mut best: Option<(Bpos, usize)> = None;
            let mut dup = false;
            for (slot, set) in data.bsets.iter().enumerate() {
                let Some(&at) = self.positions.get(slot) else {
                    continue;
                };
                let Some(kv) = set.keys.get(at) else {
                    continue;
                };
                match best {
                    None => best = Some((kv.k.p, slot)),
                    Some((bp, _)) if kv.k.p < bp => {
                        best = Some((kv.k.p, slot));
                        dup = false;
                    }
                    // Equal position in a newer run shadows the older.
                    Some((bp, _)) if kv.k.p == bp => {
                        best = Some((bp, slot));
                        dup = true;
                    }
                    Some(_) => {}
                }
            }
            let (pos, slot) = best?;
            if dup {
                // Advance every older run stuck on the shadowed position.
                for (other, set) in data.bsets.iter().enumerate() {
                    if other != slot
                        && set
                            .keys
                            .get(self.positions[other])
                            .is_some_and(|kv| kv.k.p == pos)
                    {
                        self.positions[other] += 1;
                    }
                }
                continue;
            }
            return Some(slot);
        }
    }

    /// The next key, without consuming it.
    pub fn peek(&mut self, data: &NodeData) -> Option<KeyVal> {
        let slot = self.min_slot(data)?;
        data.bsets[slot].keys.get(self.positions[slot]).cloned()
    }

    /// Consume the key `peek` would return.
    pub fn advance(&mut self, data: &NodeData) {
        if let Some(slot) = self.min_slot(data) {
            self.positions[slot] += 1;
        }
    }

    /// Reposition at the first key at or after `pos`; used after an
    /// insert rearranged the node under a held lock.
    pub fn fix(&mut self, data: &NodeData, pos: Bpos, is_extents: bool) {
        *self = data.iter_at(pos, is_extents);
    }
}
