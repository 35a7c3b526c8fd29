#![forbid(unsafe_code)]
//! Core value types for the strata caching engine.
//!
//! Everything here is plain data: btree positions and keys, extent
//! pointers, bucket records, reserve classes and the enums backing the
//! configuration surface. Behaviour lives in the crates that own the
//! corresponding state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sector size everything in the engine is denominated in.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

/// Maximum replicas a single extent can carry.
pub const MAX_REPLICAS: usize = 4;

/// Maximum btree depth. Depth 4 with 256-key interior nodes covers far
/// more extents than a cache device can hold.
pub const BTREE_MAX_DEPTH: usize = 4;

/// Number of storage tiers. Tier 0 is the fastest.
pub const TIER_MAX: u8 = 4;

// ── Id newtypes ─────────────────────────────────────────────────────────────

/// Index of a cache device within its cache set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u8);

/// Index of a bucket on one cache device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIdx(pub u64);

/// Journal sequence number. Monotone per cache set; defines the visible
/// order of metadata updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

/// Storage tier, 0 = fastest. Validated against [`TIER_MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tier(u8);

impl Tier {
    pub const ZERO: Self = Self(0);

    pub fn new(tier: u8) -> Result<Self, ParseError> {
        if tier >= TIER_MAX {
            return Err(ParseError::InvalidField {
                field: "tier",
                reason: "tier out of range",
            });
        }
        Ok(Self(tier))
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

/// Per-bucket generation. Eight bits, wraps; a pointer whose gen does
/// not match the bucket's current gen is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gen(pub u8);

impl Gen {
    /// The next generation, wrapping.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Wrap-aware "how far has `self` advanced past `other`".
    ///
    /// Valid as long as generations never advance more than 127 steps
    /// between observations of the same bucket.
    #[must_use]
    pub fn after(self, other: Self) -> i8 {
        #[expect(clippy::cast_possible_wrap)]
        let delta = self.0.wrapping_sub(other.0) as i8;
        delta
    }
}

// ── Btree positions and keys ────────────────────────────────────────────────

/// Position in a btree: `(inode, offset)`, totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
}

impl Bpos {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }

    /// The smallest position strictly greater than `self`.
    #[must_use]
    pub fn successor(self) -> Self {
        if self.offset == u64::MAX {
            Self {
                inode: self.inode.wrapping_add(1),
                offset: 0,
            }
        } else {
            Self {
                inode: self.inode,
                offset: self.offset + 1,
            }
        }
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// Key type tag.
///
/// `Extent` is dirty data (only in the cache), `CachedExtent` is a clean
/// copy of data that also exists on the backing device. `Cookie` keys
/// reserve a range for an in-flight promote and carry no pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Deleted,
    Discard,
    Cookie,
    Extent,
    CachedExtent,
    Inode,
}

impl KeyType {
    #[must_use]
    pub fn is_extent(self) -> bool {
        matches!(self, Self::Extent | Self::CachedExtent)
    }
}

/// Key header: position, size, type.
///
/// Extent keys are half-open and end-addressed: a key at `p` with size
/// `s` covers sectors `(p.offset - s, p.offset]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bkey {
    pub p: Bpos,
    pub size: u32,
    pub ty: KeyType,
}

impl Bkey {
    #[must_use]
    pub fn new(p: Bpos, size: u32, ty: KeyType) -> Self {
        Self { p, size, ty }
    }

    /// First sector covered by this key.
    #[must_use]
    pub fn start(&self) -> Bpos {
        Bpos {
            inode: self.p.inode,
            offset: self.p.offset - u64::from(self.size),
        }
    }

    /// Whether two keys cover intersecting sector ranges of one inode.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.p.inode == other.p.inode
            && self.start().offset < other.p.offset
            && other.start().offset < self.p.offset
    }

    /// Whether `pos` falls within this key's covered range.
    #[must_use]
    pub fn covers(&self, pos: Bpos) -> bool {
        pos.inode == self.p.inode
            && pos.offset >= self.start().offset
            && pos.offset < self.p.offset
    }
}

// ── Extents ─────────────────────────────────────────────────────────────────

/// One replica pointer: which device, which generation the pointed-to
/// bucket had when the pointer was created, and the device sector the
/// data starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    pub gen: Gen,
    pub offset: u64,
}

impl ExtentPtr {
    /// Bucket this pointer lands in, given the device's bucket size.
    #[must_use]
    pub fn bucket(&self, bucket_sectors: u64) -> BucketIdx {
        BucketIdx(self.offset / bucket_sectors)
    }

    /// Offset within the bucket, in sectors.
    #[must_use]
    pub fn bucket_offset(&self, bucket_sectors: u64) -> u64 {
        self.offset % bucket_sectors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Gzip,
}

/// Checksum / compression record attached to an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentCrc {
    pub csum: u32,
    pub uncompressed_sectors: u32,
    pub compression: CompressionType,
}

/// Extent value: one pointer per replica, plus an optional crc record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extent {
    pub ptrs: Vec<ExtentPtr>,
    pub crc: Option<ExtentCrc>,
}

impl Extent {
    #[must_use]
    pub fn single(ptr: ExtentPtr) -> Self {
        Self {
            ptrs: vec![ptr],
            crc: None,
        }
    }

    #[must_use]
    pub fn first_ptr(&self) -> Option<&ExtentPtr> {
        self.ptrs.first()
    }
}

/// Inode record stored in the inodes btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRec {
    pub i_size: u64,
    pub i_sectors: u64,
    pub i_label: [u8; 32],
}

impl Default for InodeRec {
    fn default() -> Self {
        Self {
            i_size: 0,
            i_sectors: 0,
            i_label: [0; 32],
        }
    }
}

/// Value attached to a key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bval {
    #[default]
    None,
    Extent(Extent),
    Inode(InodeRec),
}

impl Bval {
    #[must_use]
    pub fn as_extent(&self) -> Option<&Extent> {
        match self {
            Self::Extent(e) => Some(e),
            _ => None,
        }
    }
}

/// A full key: header plus value. The unit the btree stores and the
/// iterator yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    pub k: Bkey,
    pub v: Bval,
}

impl KeyVal {
    #[must_use]
    pub fn new(k: Bkey, v: Bval) -> Self {
        Self { k, v }
    }

    /// A deleted (whiteout) key at `pos`.
    #[must_use]
    pub fn deleted(p: Bpos, size: u32) -> Self {
        Self {
            k: Bkey::new(p, size, KeyType::Deleted),
            v: Bval::None,
        }
    }
}

/// Which btree a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BtreeId {
    Extents,
    Inodes,
}

impl BtreeId {
    pub const ALL: [Self; 2] = [Self::Extents, Self::Inodes];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extents => "extents",
            Self::Inodes => "inodes",
        }
    }

    /// Position the iterator advances to after consuming a key at `pos`.
    ///
    /// Extents are end-addressed, so the consumed key's own position is
    /// already the next boundary; the inodes tree steps a whole inode.
    #[must_use]
    pub fn successor(self, pos: Bpos) -> Bpos {
        match self {
            Self::Extents => pos,
            Self::Inodes => Bpos {
                inode: pos.inode.wrapping_add(1),
                offset: 0,
            },
        }
    }
}

// ── Buckets ─────────────────────────────────────────────────────────────────

/// What a bucket currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BucketMark {
    #[default]
    Free,
    Cached,
    Dirty,
    Meta,
    Btree,
}

impl BucketMark {
    /// Metadata buckets are never invalidated by the allocator.
    #[must_use]
    pub fn is_metadata(self) -> bool {
        matches!(self, Self::Meta | Self::Btree)
    }
}

/// Per-bucket record. One of these per bucket per device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Bucket {
    pub gen: Gen,
    pub mark: BucketMark,
    pub read_prio: u16,
    pub write_prio: u16,
    pub sectors_used: u32,
    /// Pins held by in-flight writes through an open bucket.
    pub pin: u32,
}

impl Bucket {
    /// Whether the allocator may invalidate this bucket.
    #[must_use]
    pub fn can_invalidate(&self) -> bool {
        self.mark == BucketMark::Cached && self.pin == 0
    }
}

/// Free-bucket reserve classes, in fill order. Metadata reserves must
/// never starve; `MovingGc` guarantees copy-GC can always make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReserveClass {
    Prio,
    Btree,
    MovingGc,
    None,
}

impl ReserveClass {
    pub const ALL: [Self; 4] = [Self::Prio, Self::Btree, Self::MovingGc, Self::None];

    #[must_use]
    pub fn is_metadata(self) -> bool {
        matches!(self, Self::Prio | Self::Btree)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prio => "prio",
            Self::Btree => "btree",
            Self::MovingGc => "movinggc",
            Self::None => "none",
        }
    }
}

/// Read or write direction, used to index the per-device prio clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDir {
    Read,
    Write,
}

// ── Configuration enums ─────────────────────────────────────────────────────

/// Cache mode of a cached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Writethrough,
    Writeback,
    Writearound,
    None,
}

impl CacheMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Writethrough => "writethrough",
            Self::Writeback => "writeback",
            Self::Writearound => "writearound",
            Self::None => "none",
        }
    }
}

impl FromStr for CacheMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "writethrough" => Ok(Self::Writethrough),
            "writeback" => Ok(Self::Writeback),
            "writearound" => Ok(Self::Writearound),
            "none" => Ok(Self::None),
            _ => Err(ParseError::InvalidField {
                field: "cache_mode",
                reason: "expected writethrough|writeback|writearound|none",
            }),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Victim selection policy for the per-device allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    #[default]
    Lru,
    Fifo,
    Random,
}

impl FromStr for ReplacementPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lru" => Ok(Self::Lru),
            "fifo" => Ok(Self::Fifo),
            "random" => Ok(Self::Random),
            _ => Err(ParseError::InvalidField {
                field: "cache_replacement_policy",
                reason: "expected lru|fifo|random",
            }),
        }
    }
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lru => "lru",
            Self::Fifo => "fifo",
            Self::Random => "random",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpos_orders_by_inode_then_offset() {
        assert!(Bpos::new(1, 100) < Bpos::new(2, 0));
        assert!(Bpos::new(2, 0) < Bpos::new(2, 1));
        assert_eq!(Bpos::new(3, 7), Bpos::new(3, 7));
    }

    #[test]
    fn bpos_successor_carries_into_inode() {
        assert_eq!(Bpos::new(1, 5).successor(), Bpos::new(1, 6));
        assert_eq!(Bpos::new(1, u64::MAX).successor(), Bpos::new(2, 0));
    }

    #[test]
    fn gen_wraps() {
        let g = Gen(0xff);
        assert_eq!(g.next(), Gen(0));
        assert_eq!(Gen(0).after(Gen(0xff)), 1);
        assert_eq!(Gen(5).after(Gen(5)), 0);
        assert_eq!(Gen(4).after(Gen(5)), -1);
    }

    #[test]
    fn extent_keys_are_end_addressed() {
        let k = Bkey::new(Bpos::new(7, 128), 64, KeyType::Extent);
        assert_eq!(k.start(), Bpos::new(7, 64));
        assert!(k.covers(Bpos::new(7, 64)));
        assert!(k.covers(Bpos::new(7, 127)));
        assert!(!k.covers(Bpos::new(7, 128)));
        assert!(!k.covers(Bpos::new(8, 100)));
    }

    #[test]
    fn overlap_requires_same_inode() {
        let a = Bkey::new(Bpos::new(1, 100), 50, KeyType::Extent);
        let b = Bkey::new(Bpos::new(1, 120), 50, KeyType::Extent);
        let c = Bkey::new(Bpos::new(2, 120), 50, KeyType::Extent);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn adjacent_extents_do_not_overlap() {
        let a = Bkey::new(Bpos::new(1, 100), 50, KeyType::Extent);
        let b = Bkey::new(Bpos::new(1, 150), 50, KeyType::Extent);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn extent_successor_stays_put() {
        let pos = Bpos::new(9, 64);
        assert_eq!(BtreeId::Extents.successor(pos), pos);
        assert_eq!(BtreeId::Inodes.successor(pos), Bpos::new(10, 0));
    }

    #[test]
    fn ptr_bucket_math() {
        let ptr = ExtentPtr {
            dev: DeviceIdx(0),
            gen: Gen(3),
            offset: 1024 + 17,
        };
        assert_eq!(ptr.bucket(1024), BucketIdx(1));
        assert_eq!(ptr.bucket_offset(1024), 17);
    }

    #[test]
    fn cache_mode_round_trips() {
        for mode in [
            CacheMode::Writethrough,
            CacheMode::Writeback,
            CacheMode::Writearound,
            CacheMode::None,
        ] {
            assert_eq!(mode.as_str().parse::<CacheMode>().unwrap(), mode);
        }
        assert!("sideways".parse::<CacheMode>().is_err());
    }

    #[test]
    fn metadata_reserves() {
        assert!(ReserveClass::Prio.is_metadata());
        assert!(ReserveClass::Btree.is_metadata());
        assert!(!ReserveClass::MovingGc.is_metadata());
        assert!(!ReserveClass::None.is_metadata());
    }
}
