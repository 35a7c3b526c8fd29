#![forbid(unsafe_code)]
//! strata: a block-device caching and tiered-storage engine.
//!
//! strata sits between backing devices (bulk, slow storage) and cache
//! devices (fast storage carved into fixed-size buckets), presents
//! virtual block devices, and decides per-I/O whether a request is
//! served from cache, promoted into cache, written through, written
//! back, or bypassed. Metadata lives in copy-on-write btrees whose
//! nodes are bucket-backed and journaled.
//!
//! This crate is the assembly surface: it re-exports the pieces in
//! dependency order. Start with [`CacheSet::open`], then
//! [`CachedDev::attach`] or [`Volume::create`], and feed bios to their
//! `make_request` entry points.

pub use strata_alloc::{
    AllocHow, CacheDevice, CacheGroup, DeviceConfig, DeviceSet, OpenBucket, WritePoint,
    OPEN_BUCKETS_COUNT, WRITE_POINT_COUNT,
};
pub use strata_block::{
    AlignedVec, Bio, BioOp, FileSectorDevice, IoErrorConfig, IoErrors, MemSectorDevice,
    SectorDevice,
};
pub use strata_btree::{Btree, BtreeIter, NodeCache, NodeCacheConfig, NodeCacheStats};
pub use strata_closure::{Closure, WaitList, WorkerPool};
pub use strata_core::{
    CacheSet, CacheSetOpts, Congestion, Observables, PdController, Registry, CUTOFF_CACHE_ADD,
};
pub use strata_error::{Result, StrataError};
pub use strata_journal::{Journal, JournalEntry, JournalRegion};
pub use strata_request::{
    current_task, data_write, BdevState, CachedDev, CachedDevConfig, Keybuf, Volume,
    WRITE_CACHED, WRITE_DISCARD, WRITE_FLUSH,
};
pub use strata_types as types;
pub use strata_types::{Bkey, Bpos, BtreeId, CacheMode, KeyType, KeyVal, ReplacementPolicy, Tier};
