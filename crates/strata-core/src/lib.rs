#![forbid(unsafe_code)]
//! Cache-set assembly.
//!
//! A [`CacheSet`] owns the pieces the rest of the engine hangs off:
//! the device set with its allocator threads, the journal, the btrees
//! and their node cache, the request worker pool, the congestion
//! tracker and the set-scope configuration surface. The process-wide
//! [`Registry`] of open cache sets is an explicit collaborator passed
//! by reference, not a global.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strata_alloc::{DeviceConfig, DeviceSet};
use strata_block::{IoErrorConfig, SectorDevice};
use strata_btree::{Btree, NodeCacheConfig, NodeCacheStats};
use strata_closure::WorkerPool;
use strata_error::{Result, StrataError};
use strata_journal::Journal;
use strata_types::{BucketIdx, DeviceIdx, IoDir, JournalSeq, ReplacementPolicy};
use tracing::{info, warn};

/// Stop adding to the cache once free space drops under this percent
/// of capacity.
pub const CUTOFF_CACHE_ADD: u64 = 10;

/// Congestion values saturate here.
const CONGESTED_MAX: i64 = 1024;

/// Number of quantiles in the observable summaries.
pub const QUANTILE_COUNT: usize = 31;

// ── Congestion ──────────────────────────────────────────────────────────────

/// `2^(x >> fract_bits)`, with the low bits interpolated linearly.
#[must_use]
pub fn fract_exp_two(x: i64, fract_bits: u32) -> i64 {
    let mask = (1_i64 << fract_bits) - 1;
    let mut r = 1_i64 << (x >> fract_bits).min(32);
    r += (r * (x & mask)) >> fract_bits;
    r
}

/// Fixed-point congestion tracker.
///
/// Slow completions (latency above the configured per-direction
/// threshold) push the value negative; it decays back toward zero with
/// wall-clock time. `get` reports 0 when uncongested, else a positive
/// magnitude the bypass logic compares sequential run lengths against.
#[derive(Debug)]
pub struct Congestion {
    /// Negative while congested.
    congested: AtomicU64,
    last_us: AtomicU64,
    epoch: Instant,
    pub read_threshold_us: AtomicU64,
    pub write_threshold_us: AtomicU64,
}

impl Default for Congestion {
    fn default() -> Self {
        Self::new()
    }
}

impl Congestion {
    #[must_use]
    pub fn new() -> Self {
        Self {
            congested: AtomicU64::new(0),
            last_us: AtomicU64::new(0),
            epoch: Instant::now(),
            read_threshold_us: AtomicU64::new(0),
            write_threshold_us: AtomicU64::new(0),
        }
    }

    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn load_congested(&self) -> i64 {
        #[expect(clippy::cast_possible_wrap)]
        let value = self.congested.load(Ordering::Relaxed) as i64;
        value
    }

    /// Record a completed I/O; latencies above the threshold for `dir`
    /// push the tracker toward congested.
    pub fn io_done(&self, dir: IoDir, latency_us: u64) {
        let threshold = match dir {
            IoDir::Read => self.read_threshold_us.load(Ordering::Relaxed),
            IoDir::Write => self.write_threshold_us.load(Ordering::Relaxed),
        };
        if threshold == 0 {
            return;
        }
        self.last_us.store(self.now_us(), Ordering::Relaxed);
        if latency_us > threshold {
            #[expect(clippy::cast_possible_wrap)]
            let over = (latency_us - threshold) as i64;
            let next = (self.load_congested() - over).max(-CONGESTED_MAX);
            #[expect(clippy::cast_sign_loss)]
            self.congested.store(next as u64, Ordering::Relaxed);
        } else {
            // Fast completions walk the value back up.
            let next = (self.load_congested() + 1).min(0);
            #[expect(clippy::cast_sign_loss)]
            self.congested.store(next as u64, Ordering::Relaxed);
        }
    }

    /// Current congestion magnitude; 0 = not congested.
    #[must_use]
    pub fn get(&self) -> u64 {
        if self.read_threshold_us.load(Ordering::Relaxed) == 0
            && self.write_threshold_us.load(Ordering::Relaxed) == 0
        {
            return 0;
        }

        let elapsed =
            i64::try_from(self.now_us().saturating_sub(self.last_us.load(Ordering::Relaxed)))
                .unwrap_or(i64::MAX);
        let mut i = (elapsed / 1024).saturating_add(self.load_congested());
        if i >= 0 {
            return 0;
        }
        i += CONGESTED_MAX;

        let mut value = if i > 0 { fract_exp_two(i, 6) } else { 1 };
        // A random fuzz term keeps every request from flipping at the
        // same instant.
        value -= i64::from(rand::random::<u64>().count_ones());
        #[expect(clippy::cast_sign_loss)]
        let out = value.max(1) as u64;
        out
    }

    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.get() > 0
    }
}

// ── Dirty-data rate controller ──────────────────────────────────────────────

/// Proportional-derivative controller producing a background-copy rate
/// from how far dirty (or tier-0 used) data is from its target.
///
/// The writeback user clamps its target percent to 0..=40; the tiering
/// user feeds the same controller unclamped.
#[derive(Debug, Clone, Copy)]
pub struct PdController {
    pub p_term_inverse: u64,
    pub d_term_inverse: u64,
    last_error: i64,
    /// Sectors per second floor so progress never fully stalls.
    pub rate_floor: u64,
}

impl Default for PdController {
    fn default() -> Self {
        Self {
            p_term_inverse: 6000,
            d_term_inverse: 30,
            last_error: 0,
            rate_floor: 8,
        }
    }
}

impl PdController {
    /// New rate in sectors/second given the current and target amounts
    /// (both in sectors).
    pub fn next_rate(&mut self, current: u64, target: u64) -> u64 {
        let error = i64::try_from(current).unwrap_or(i64::MAX)
            - i64::try_from(target).unwrap_or(i64::MAX);
        let derivative = error - self.last_error;
        self.last_error = error;

        let p = error / i64::try_from(self.p_term_inverse.max(1)).unwrap_or(1);
        let d = derivative / i64::try_from(self.d_term_inverse.max(1)).unwrap_or(1);
        let rate = p + d;
        #[expect(clippy::cast_sign_loss)]
        let rate = rate.max(0) as u64;
        rate.max(self.rate_floor)
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Set-wide counters, all monotone.
#[derive(Debug, Default)]
pub struct CacheSetStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_bypass_hits: AtomicU64,
    pub sectors_bypassed: AtomicU64,
    pub cache_read_races: AtomicU64,
    pub bypass_sequential: AtomicU64,
    pub bypass_congested: AtomicU64,
}

impl CacheSetStats {
    pub fn mark_cache_accounting(&self, hit: bool, bypass: bool) {
        match (hit, bypass) {
            (true, false) => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            (false, false) => self.cache_misses.fetch_add(1, Ordering::Relaxed),
            (_, true) => self.cache_bypass_hits.fetch_add(1, Ordering::Relaxed),
        };
    }
}

// ── Cache set ───────────────────────────────────────────────────────────────

/// Set-scope tunables, all adjustable through the attr surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheSetOpts {
    /// Sectors per block; bios not aligned to this bypass the cache.
    pub block_sectors: u32,
    pub node_cache_capacity: usize,
    pub tiering_enabled: bool,
    /// Target utilisation of tier 0, percent. Deliberately unclamped.
    pub tiering_percent: u8,
    pub copy_gc_enabled: bool,
}

impl Default for CacheSetOpts {
    fn default() -> Self {
        Self {
            block_sectors: 1,
            node_cache_capacity: NodeCacheConfig::default().capacity,
            tiering_enabled: false,
            tiering_percent: 40,
            copy_gc_enabled: true,
        }
    }
}

/// One mounted cache set.
pub struct CacheSet {
    pub name: String,
    pub devs: Arc<DeviceSet>,
    pub journal: Arc<Journal>,
    pub btree: Arc<Btree>,
    /// Worker pool request continuations run on.
    pub wq: WorkerPool,
    pub congestion: Congestion,
    pub stats: CacheSetStats,
    opts: Mutex<CacheSetOpts>,
    read_only: AtomicBool,
}

impl std::fmt::Debug for CacheSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSet").field("name", &self.name).finish()
    }
}

impl CacheSet {
    /// Assemble a cache set over `devices` with a fresh journal and
    /// btrees.
    pub fn open(
        name: impl Into<String>,
        devices: Vec<(Arc<dyn SectorDevice>, DeviceConfig)>,
        opts: CacheSetOpts,
    ) -> Result<Arc<Self>> {
        let journal = Arc::new(Journal::in_memory());
        let devs = Arc::new(DeviceSet::new(Arc::clone(&journal)));
        for (dev, config) in devices {
            devs.add_device(dev, config)?;
        }
        let btree = Btree::new(
            Arc::clone(&devs),
            Arc::clone(&journal),
            NodeCacheConfig {
                capacity: opts.node_cache_capacity,
            },
        )?;

        let set = Arc::new(Self {
            name: name.into(),
            devs,
            journal,
            btree,
            wq: WorkerPool::new("strata-wq", 4),
            congestion: Congestion::new(),
            stats: CacheSetStats::default(),
            opts: Mutex::new(opts),
            read_only: AtomicBool::new(false),
        });
        info!(target: "strata::core", event = "cache_set_open", name = %set.name);
        Ok(set)
    }

    #[must_use]
    pub fn opts(&self) -> CacheSetOpts {
        *self.opts.lock()
    }

    #[must_use]
    pub fn block_sectors(&self) -> u32 {
        self.opts.lock().block_sectors
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.devs.capacity_sectors()
    }

    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.devs.sectors_available()
    }

    /// Whether adding to the cache is still allowed.
    #[must_use]
    pub fn has_cache_headroom(&self) -> bool {
        self.sectors_available() * 100 >= self.capacity_sectors() * CUTOFF_CACHE_ADD
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire) || self.journal.is_poisoned()
    }

    /// Demote to read-only; in-flight and future writes error out.
    pub fn set_read_only(&self, reason: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            warn!(
                target: "strata::core",
                event = "read_only",
                name = %self.name,
                reason = reason
            );
        }
    }

    /// A device exceeded its error limit: fail it and demote the set.
    pub fn device_failed(&self, idx: DeviceIdx) {
        self.set_read_only("device error limit exceeded");
        warn!(target: "strata::core", event = "device_failed", dev = idx.0);
    }

    pub fn flush(&self) -> Result<()> {
        self.btree.flush_all()?;
        let seq = self.journal.last_seq();
        if seq > JournalSeq(0) {
            self.journal.flush_seq(seq)?;
        }
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        let result = self.flush();
        self.wq.shutdown();
        self.devs.stop_allocators();
        self.journal.quiesce();
        info!(target: "strata::core", event = "cache_set_shutdown", name = %self.name);
        result
    }

    // ── Attr surface (set scope) ────────────────────────────────────────

    /// Read a set-scope attribute as text.
    #[must_use]
    pub fn attr_get(&self, key: &str) -> Option<String> {
        let opts = self.opts.lock();
        match key {
            "congested_read_threshold_us" => {
                Some(self.congestion.read_threshold_us.load(Ordering::Relaxed).to_string())
            }
            "congested_write_threshold_us" => {
                Some(self.congestion.write_threshold_us.load(Ordering::Relaxed).to_string())
            }
            "tiering_enabled" => Some(u8::from(opts.tiering_enabled).to_string()),
            "tiering_percent" => Some(opts.tiering_percent.to_string()),
            "copy_gc_enabled" => Some(u8::from(opts.copy_gc_enabled).to_string()),
            "block_sectors" => Some(opts.block_sectors.to_string()),
            _ => None,
        }
    }

    /// Write a set-scope attribute from text.
    pub fn attr_set(&self, key: &str, value: &str) -> Result<()> {
        let invalid = |detail: &str| StrataError::InvalidConfig(format!("{key}: {detail}"));
        let mut opts = self.opts.lock();
        match key {
            "congested_read_threshold_us" => {
                let us = value.parse().map_err(|_| invalid("expected microseconds"))?;
                self.congestion.read_threshold_us.store(us, Ordering::Relaxed);
            }
            "congested_write_threshold_us" => {
                let us = value.parse().map_err(|_| invalid("expected microseconds"))?;
                self.congestion.write_threshold_us.store(us, Ordering::Relaxed);
            }
            "tiering_enabled" => {
                opts.tiering_enabled = parse_bool(value).ok_or_else(|| invalid("expected 0|1"))?;
            }
            "tiering_percent" => {
                opts.tiering_percent =
                    value.parse().map_err(|_| invalid("expected percent"))?;
            }
            "copy_gc_enabled" => {
                opts.copy_gc_enabled = parse_bool(value).ok_or_else(|| invalid("expected 0|1"))?;
            }
            _ => return Err(invalid("unknown attribute")),
        }
        Ok(())
    }

    /// Write a cache-device-scope attribute from text.
    pub fn device_attr_set(&self, idx: DeviceIdx, key: &str, value: &str) -> Result<()> {
        let invalid = |detail: &str| StrataError::InvalidConfig(format!("{key}: {detail}"));
        let device = self
            .devs
            .device(idx)
            .ok_or_else(|| invalid("no such device"))?;
        match key {
            "cache_replacement_policy" => {
                let policy: ReplacementPolicy =
                    value.parse().map_err(|_| invalid("expected lru|fifo|random"))?;
                device.set_policy(policy);
            }
            "discard" => {
                device.set_discard(parse_bool(value).ok_or_else(|| invalid("expected 0|1"))?);
            }
            "io_error_limit" => {
                let limit = value.parse().map_err(|_| invalid("expected count"))?;
                let config = IoErrorConfig {
                    limit,
                    ..device.io_errors.config()
                };
                device.io_errors.set_config(config);
            }
            "io_error_halflife" => {
                let halflife_us = value.parse().map_err(|_| invalid("expected microseconds"))?;
                let config = IoErrorConfig {
                    halflife_us,
                    ..device.io_errors.config()
                };
                device.io_errors.set_config(config);
            }
            _ => return Err(invalid("unknown attribute")),
        }
        Ok(())
    }

    // ── Observables ─────────────────────────────────────────────────────

    #[must_use]
    pub fn observables(&self) -> Observables {
        let devices = self
            .devs
            .devices()
            .iter()
            .map(|dev| DeviceObservables {
                dev: dev.idx,
                bucket_counts: dev.bucket_counts(),
                reserve_depths: dev.reserve_depths(),
                prio_quantiles: dev.prio_quantiles(QUANTILE_COUNT),
                fragmentation_quantiles: fragmentation_quantiles(dev, QUANTILE_COUNT),
                io_errors: dev.io_errors.current(),
            })
            .collect();

        Observables {
            node_cache: self.btree.cache.stats(),
            journal_seq: self.journal.last_seq(),
            journal_flushed_seq: self.journal.flushed_seq(),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            cache_read_races: self.stats.cache_read_races.load(Ordering::Relaxed),
            sectors_bypassed: self.stats.sectors_bypassed.load(Ordering::Relaxed),
            devices,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "0" | "false" | "off" => Some(false),
        "1" | "true" | "on" => Some(true),
        _ => None,
    }
}

/// Descending quantiles of per-bucket free space (fragmentation view).
fn fragmentation_quantiles(dev: &Arc<strata_alloc::CacheDevice>, nq: usize) -> Vec<u64> {
    let bucket_sectors = dev.bucket_sectors();
    let mut free: Vec<u64> = (0..dev.nbuckets())
        .filter_map(|i| dev.bucket(BucketIdx(i)))
        .filter(|b| !b.mark.is_metadata())
        .map(|b| bucket_sectors.saturating_sub(u64::from(b.sectors_used)))
        .collect();
    if free.is_empty() {
        return vec![0; nq];
    }
    free.sort_unstable_by(|a, b| b.cmp(a));
    let step = (nq - 1).max(1);
    (0..nq).map(|i| free[i * (free.len() - 1) / step]).collect()
}

/// Read-only snapshot of the observable surface.
#[derive(Debug, Clone)]
pub struct Observables {
    pub node_cache: NodeCacheStats,
    pub journal_seq: JournalSeq,
    pub journal_flushed_seq: JournalSeq,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_read_races: u64,
    pub sectors_bypassed: u64,
    pub devices: Vec<DeviceObservables>,
}

#[derive(Debug, Clone)]
pub struct DeviceObservables {
    pub dev: DeviceIdx,
    /// (free, cached, dirty, meta, btree).
    pub bucket_counts: [u64; 5],
    pub reserve_depths: [usize; 4],
    pub prio_quantiles: Vec<u16>,
    pub fragmentation_quantiles: Vec<u64>,
    pub io_errors: u64,
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Process-wide list of open cache sets, used by the attach admin
/// path. Constructed once at process start and passed by reference.
#[derive(Debug, Default)]
pub struct Registry {
    sets: Mutex<Vec<Arc<CacheSet>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, set: Arc<CacheSet>) {
        self.sets.lock().push(set);
    }

    pub fn deregister(&self, name: &str) {
        self.sets.lock().retain(|set| set.name != name);
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<CacheSet>> {
        self.sets.lock().iter().find(|set| set.name == name).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<CacheSet>> {
        self.sets.lock().clone()
    }
}
