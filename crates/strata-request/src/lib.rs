#![forbid(unsafe_code)]
//! The request pipeline.
//!
//! A client bio enters through [`CachedDev::make_request`] (or
//! [`Volume::make_request`] for flash-only volumes), passes the bypass
//! decision, and is served by the read or write state machine: reads
//! walk the extents btree with holes synthesized, pick a pointer per
//! extent, retry on stale pointers and fall back to the backing device
//! when recoverable; writes check the writeback keybuf for overlap with
//! background writeback, choose bypass / writeback / writethrough, and
//! hand data to the write path that allocates sectors from a write
//! point and inserts extents.

pub mod keybuf;
pub mod sequential;
mod writeback;

#[cfg(feature = "promote")]
mod promote;

pub use keybuf::Keybuf;
pub use sequential::{ewma_add, RecentIo, TaskSeq, RECENT_IO};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strata_alloc::{AllocHow, WritePoint};
use strata_block::{Bio, BioOp, IoErrorConfig, IoErrors, SectorDevice};
use strata_core::CacheSet;
use strata_error::{Result, StrataError};
use strata_types::{
    Bkey, Bpos, BtreeId, BucketMark, Bval, CacheMode, Extent, ExtentCrc, InodeRec, IoDir, KeyType,
    KeyVal, ReserveClass, SECTOR_SHIFT,
};
use tracing::{debug, info, trace, warn};

// Write-op flags.
pub const WRITE_CACHED: u32 = 1 << 0;
pub const WRITE_FLUSH: u32 = 1 << 1;
pub const WRITE_DISCARD: u32 = 1 << 2;
pub const WRITE_DISCARD_ON_ERROR: u32 = 1 << 3;
pub const WRITE_ALLOC_NOWAIT: u32 = 1 << 4;

/// Dirty percent above which writeback stops being offered to async
/// writes, and the harder cutoff where even sync writes go through.
const CUTOFF_WRITEBACK: u64 = 40;
const CUTOFF_WRITEBACK_SYNC: u64 = 70;

/// Stale-pointer retries per slice before treating the slice as a miss.
const STALE_RETRY_LIMIT: u32 = 16;

// ── Task identity ───────────────────────────────────────────────────────────

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TASK_ID: u64 = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
}

/// Stable id for the submitting task; keys the per-task sequential
/// average and the foreground write-point hash.
#[must_use]
pub fn current_task() -> u64 {
    TASK_ID.with(|id| *id)
}

// ── Search ──────────────────────────────────────────────────────────────────

/// Per-request state threaded through the pipeline.
#[derive(Debug)]
struct Search {
    inode: u64,
    write: bool,
    bypass: bool,
    recoverable: bool,
    read_dirty_data: bool,
    cache_miss: bool,
    start: Instant,
}

impl Search {
    fn new(inode: u64, bio: &Bio) -> Self {
        Self {
            inode,
            write: bio.op.is_write(),
            bypass: false,
            recoverable: true,
            read_dirty_data: false,
            cache_miss: false,
            start: Instant::now(),
        }
    }
}

// ── Cached device ───────────────────────────────────────────────────────────

/// Cached-device state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdevState {
    NoCache,
    Clean,
    Dirty,
    Inconsistent,
}

#[derive(Debug, Clone, Copy)]
pub struct CachedDevConfig {
    pub cache_mode: CacheMode,
    /// Run length in bytes above which requests bypass the cache.
    pub sequential_cutoff: u64,
    /// Max sectors to prefetch past a miss.
    pub readahead_sectors: u32,
    /// Dirty-data target for the writeback rate controller, clamped to
    /// 0..=40 for cached devices.
    pub writeback_percent: u8,
    pub writeback_running: bool,
    /// Torture knob: randomly force bypass.
    pub bypass_torture_test: bool,
}

impl Default for CachedDevConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Writethrough,
            sequential_cutoff: 4 << 20,
            readahead_sectors: 0,
            writeback_percent: 10,
            writeback_running: true,
            bypass_torture_test: false,
        }
    }
}

/// A backing device fronted by the cache.
pub struct CachedDev {
    pub set: Arc<CacheSet>,
    pub backing: Arc<dyn SectorDevice>,
    pub backing_errors: IoErrors,
    /// The inode all of this device's extents live under.
    pub inode: u64,
    config: Mutex<CachedDevConfig>,
    state: Mutex<BdevState>,
    /// Foreground writes take this shared; the writeback scan takes it
    /// exclusive.
    pub writeback_lock: RwLock<()>,
    pub keybuf: Keybuf,
    recent: Mutex<RecentIo>,
    tasks: Mutex<HashMap<u64, TaskSeq>>,
    pub dirty_sectors: AtomicU64,
    count: AtomicU64,
    detaching: AtomicBool,
    stopped: AtomicBool,
    pub(crate) writeback_shutdown: Arc<AtomicBool>,
    writeback_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for CachedDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDev")
            .field("inode", &self.inode)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl CachedDev {
    /// Attach a backing device to the cache set under `inode`.
    pub fn attach(
        set: Arc<CacheSet>,
        backing: Arc<dyn SectorDevice>,
        inode: u64,
        label: &str,
        config: CachedDevConfig,
    ) -> Result<Arc<Self>> {
        let mut i_label = [0_u8; 32];
        let bytes = label.as_bytes();
        i_label[..bytes.len().min(32)].copy_from_slice(&bytes[..bytes.len().min(32)]);
        set.btree.insert(
            BtreeId::Inodes,
            KeyVal::new(
                Bkey::new(Bpos::new(inode, 0), 0, KeyType::Inode),
                Bval::Inode(InodeRec {
                    i_size: backing.nr_sectors() << u64::from(SECTOR_SHIFT),
                    i_sectors: backing.nr_sectors(),
                    i_label,
                }),
            ),
        )?;

        let dc = Arc::new(Self {
            set,
            backing,
            backing_errors: IoErrors::new(IoErrorConfig::default()),
            inode,
            config: Mutex::new(CachedDevConfig {
                writeback_percent: config.writeback_percent.min(40),
                ..config
            }),
            state: Mutex::new(BdevState::Clean),
            writeback_lock: RwLock::new(()),
            keybuf: Keybuf::new(),
            recent: Mutex::new(RecentIo::new()),
            tasks: Mutex::new(HashMap::new()),
            dirty_sectors: AtomicU64::new(0),
            count: AtomicU64::new(1),
            detaching: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            writeback_shutdown: Arc::new(AtomicBool::new(false)),
            writeback_thread: Mutex::new(None),
        });

        *dc.writeback_thread.lock() = Some(writeback::spawn(Arc::clone(&dc))?);
        info!(
            target: "strata::request",
            event = "cached_dev_attach",
            inode = inode,
            label = label
        );
        Ok(dc)
    }

    #[must_use]
    pub fn state(&self) -> BdevState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: BdevState) {
        let mut state = self.state.lock();
        if *state != next && *state != BdevState::Inconsistent {
            debug!(
                target: "strata::request",
                event = "bdev_state",
                inode = self.inode,
                from = ?*state,
                to = ?next
            );
            *state = next;
        }
    }

    #[must_use]
    pub fn config(&self) -> CachedDevConfig {
        *self.config.lock()
    }

    /// Take a reference on the device; fails once detach ran down the
    /// count. Paired with [`CachedDev::put`].
    pub fn get(&self) -> bool {
        let mut count = self.count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => count = cur,
            }
        }
    }

    pub fn put(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last reference: finish the detach.
            self.set_state(BdevState::NoCache);
            info!(target: "strata::request", event = "cached_dev_detached", inode = self.inode);
        }
    }

    /// Begin detaching: new requests pass through, and the base
    /// reference is dropped so the last in-flight put finalizes.
    pub fn detach(&self) {
        if !self.detaching.swap(true, Ordering::AcqRel) {
            self.writeback_shutdown.store(true, Ordering::Release);
            if let Some(handle) = self.writeback_thread.lock().take() {
                let _ = handle.join();
            }
            self.put();
        }
    }

    #[must_use]
    pub fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::Acquire)
    }

    /// Stop the virtual device entirely: every further request errors
    /// with `ENODEV`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.detach();
    }

    // ── Attr surface (device scope) ─────────────────────────────────────

    #[must_use]
    pub fn attr_get(&self, key: &str) -> Option<String> {
        let config = self.config.lock();
        match key {
            "cache_mode" => Some(config.cache_mode.to_string()),
            "sequential_cutoff" => Some(config.sequential_cutoff.to_string()),
            "readahead" => Some(config.readahead_sectors.to_string()),
            "writeback_percent" => Some(config.writeback_percent.to_string()),
            "writeback_running" => Some(u8::from(config.writeback_running).to_string()),
            "state" => Some(format!("{:?}", self.state()).to_lowercase()),
            "dirty_data" => Some(self.dirty_sectors.load(Ordering::Relaxed).to_string()),
            _ => None,
        }
    }

    pub fn attr_set(&self, key: &str, value: &str) -> Result<()> {
        let invalid = |detail: &str| StrataError::InvalidConfig(format!("{key}: {detail}"));
        let mut config = self.config.lock();
        match key {
            "cache_mode" => {
                config.cache_mode = value.parse().map_err(|_| invalid("bad mode"))?;
            }
            "sequential_cutoff" => {
                config.sequential_cutoff =
                    value.parse().map_err(|_| invalid("expected bytes"))?;
            }
            "readahead" => {
                config.readahead_sectors =
                    value.parse().map_err(|_| invalid("expected sectors"))?;
            }
            "writeback_percent" => {
                let percent: u8 = value.parse().map_err(|_| invalid("expected percent"))?;
                config.writeback_percent = percent.min(40);
            }
            "writeback_running" => {
                config.writeback_running = matches!(value, "1" | "true" | "on");
            }
            "bypass_torture_test" => {
                config.bypass_torture_test = matches!(value, "1" | "true" | "on");
            }
            _ => return Err(invalid("unknown attribute")),
        }
        Ok(())
    }

    // ── Entry point ─────────────────────────────────────────────────────

    /// Serve one bio. Returns it completed, `error` set on failure.
    pub fn make_request(self: &Arc<Self>, mut bio: Bio) -> Bio {
        if self.stopped.load(Ordering::Acquire) {
            bio.error = StrataError::NoDev.to_errno();
            return bio;
        }
        if !self.get() {
            // Detached: pass straight through to the backing device.
            return passthrough(&*self.backing, bio);
        }

        let mut s = Search::new(self.inode, &bio);
        trace!(
            target: "strata::request",
            event = "request_start",
            inode = s.inode,
            sector = bio.sector,
            sectors = bio.nr_sectors,
            write = s.write
        );

        if bio.is_empty() {
            // Flush bios carry no data; flush the journal and the
            // backing device.
            if matches!(bio.op, BioOp::Write { flush: true, .. }) {
                if let Err(err) = self.flush_everything() {
                    bio.error = err.to_errno();
                }
            }
        } else {
            s.bypass = self.check_should_bypass(&bio);
            if s.write {
                self.cached_dev_write(&mut s, &mut bio);
            } else {
                self.cached_dev_read(&mut s, &mut bio);
            }
            self.set
                .stats
                .mark_cache_accounting(!s.cache_miss, s.bypass);
        }

        trace!(
            target: "strata::request",
            event = "request_end",
            inode = s.inode,
            error = bio.error,
            read_dirty = s.read_dirty_data,
            us = s.start.elapsed().as_micros() as u64
        );
        self.put();
        bio
    }

    fn flush_everything(&self) -> Result<()> {
        let seq = self.set.journal.last_seq();
        self.set.journal.flush_seq(seq)?;
        self.backing.flush()?;
        Ok(())
    }

    // ── Bypass decision ─────────────────────────────────────────────────

    fn check_should_bypass(&self, bio: &Bio) -> bool {
        let set = &self.set;
        let config = self.config();
        let mode = config.cache_mode;
        let congested = set.congestion.get();
        let is_write = bio.op.is_write();

        if self.is_detaching()
            || !set.has_cache_headroom()
            || matches!(bio.op, BioOp::Discard)
        {
            return self.mark_bypassed(bio);
        }

        if mode == CacheMode::None || (mode == CacheMode::Writearound && is_write) {
            return self.mark_bypassed(bio);
        }

        let block_mask = u64::from(set.block_sectors().max(1)) - 1;
        if bio.sector & block_mask != 0 || u64::from(bio.nr_sectors) & block_mask != 0 {
            debug!(target: "strata::request", event = "bypass_unaligned", inode = self.inode);
            return self.mark_bypassed(bio);
        }

        if config.bypass_torture_test {
            if rand::random::<u8>() & 3 == 3 {
                return self.mark_bypassed(bio);
            }
            return false;
        }

        if congested == 0 && config.sequential_cutoff == 0 {
            return false;
        }

        let sync = matches!(bio.op, BioOp::Write { sync: true, .. });
        if congested == 0 && mode == CacheMode::Writeback && is_write && sync {
            return false;
        }

        // Run detection.
        let task_id = current_task();
        let (run_bytes, continued) = self
            .recent
            .lock()
            .note(bio.sector, bio.bytes() as u64);
        let sectors = {
            let mut tasks = self.tasks.lock();
            let task = tasks.entry(task_id).or_default();
            if !continued {
                task.add_sequential();
            }
            task.sequential_io = run_bytes;
            task.effective_bytes() >> 9
        };

        if config.sequential_cutoff > 0 && sectors >= config.sequential_cutoff >> 9 {
            trace!(
                target: "strata::request",
                event = "bypass_sequential",
                inode = self.inode,
                sector = bio.sector,
                run_sectors = sectors
            );
            set.stats.bypass_sequential.fetch_add(1, Ordering::Relaxed);
            return self.mark_bypassed(bio);
        }

        if congested > 0 && sectors >= congested {
            trace!(
                target: "strata::request",
                event = "bypass_congested",
                inode = self.inode,
                sector = bio.sector
            );
            set.stats.bypass_congested.fetch_add(1, Ordering::Relaxed);
            return self.mark_bypassed(bio);
        }

        false
    }

    fn mark_bypassed(&self, bio: &Bio) -> bool {
        self.set
            .stats
            .sectors_bypassed
            .fetch_add(u64::from(bio.nr_sectors), Ordering::Relaxed);
        true
    }

    // ── Read path ───────────────────────────────────────────────────────

    fn cached_dev_read(&self, s: &mut Search, bio: &mut Bio) {
        let set = Arc::clone(&self.set);
        let btree = Arc::clone(&set.btree);
        let mut iter = btree.iter(BtreeId::Extents, Bpos::new(s.inode, bio.sector));

        let end = bio.end_sector();
        let mut cur = bio.sector;
        let mut stale_retries = 0_u32;

        while cur < end {
            iter.set_pos(Bpos::new(s.inode, cur));
            let kv = match iter.peek_with_holes() {
                Ok(Some(kv)) => kv,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        target: "strata::request",
                        event = "read_btree_error",
                        inode = s.inode,
                        error = %err
                    );
                    bio.error = err.to_errno();
                    break;
                }
            };

            let extent_end = if kv.k.p.inode == s.inode {
                kv.k.p.offset
            } else {
                end
            };
            let slice_end = extent_end.min(end);
            debug_assert!(slice_end > cur);
            #[expect(clippy::cast_possible_truncation)]
            let sectors = (slice_end - cur) as u32;
            let buf_at = ((cur - bio.sector) as usize) << SECTOR_SHIFT as usize;
            let buf = &mut bio.data[buf_at..buf_at + ((sectors as usize) << SECTOR_SHIFT as usize)];

            let pick = kv
                .v
                .as_extent()
                .filter(|_| kv.k.ty.is_extent() && kv.k.covers(Bpos::new(s.inode, cur)))
                .map(|extent| extent_pick_ptr(&set, extent));

            let cached = kv.k.ty == KeyType::CachedExtent;
            match pick {
                Some(Pick::Live { device, ptr }) => {
                    let delta = cur - kv.k.start().offset;
                    let started = Instant::now();
                    let result = device.dev.read_sectors(ptr.offset + delta, buf);
                    set.congestion.io_done(
                        IoDir::Read,
                        u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                    );

                    match result {
                        Ok(()) => {
                            // A bucket can be invalidated while the read
                            // is in flight; what we just read may be
                            // garbage. Re-pick and retry at the same
                            // position.
                            if device.ptr_stale(&ptr) {
                                set.stats.cache_read_races.fetch_add(1, Ordering::Relaxed);
                                stale_retries += 1;
                                trace!(
                                    target: "strata::request",
                                    event = "cache_read_race",
                                    inode = s.inode,
                                    sector = cur
                                );
                                if stale_retries < STALE_RETRY_LIMIT {
                                    continue;
                                }
                                if self.read_miss_slice(s, &btree, cur, sectors, buf) {
                                    bio.error = StrataError::Io(std::io::Error::other(
                                        "backing read failed",
                                    ))
                                    .to_errno();
                                    break;
                                }
                            } else {
                                device.touch_bucket(
                                    ptr.bucket(device.bucket_sectors()),
                                    IoDir::Read,
                                );
                                device.add_io_time(IoDir::Read, u64::from(sectors));
                                if !cached {
                                    s.read_dirty_data = true;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(
                                target: "strata::request",
                                event = "cache_read_error",
                                inode = s.inode,
                                sector = cur,
                                error = %err
                            );
                            if device.io_errors.add_error() {
                                set.device_failed(device.idx);
                            }
                            if !s.recoverable
                                || self.read_miss_slice(s, &btree, cur, sectors, buf)
                            {
                                bio.error = StrataError::Io(std::io::Error::other(
                                    "cache read failed",
                                ))
                                .to_errno();
                                break;
                            }
                        }
                    }
                }
                other => {
                    // Hole, cookie, discard tombstone, or an extent with
                    // no usable pointer: serve from the backing device.
                    if matches!(other, Some(Pick::NoDevice)) && !s.recoverable {
                        bio.error = StrataError::NoDisk.to_errno();
                        break;
                    }
                    if self.read_miss_slice(s, &btree, cur, sectors, buf) {
                        bio.error = StrataError::Io(std::io::Error::other(
                            "backing read failed",
                        ))
                        .to_errno();
                        break;
                    }
                }
            }

            stale_retries = 0;
            cur = slice_end;
        }
        drop(iter);
    }

    /// Serve a slice from the backing device, reserving the range for a
    /// promote unless the request is bypassing. Returns true on error.
    fn read_miss_slice(
        &self,
        s: &mut Search,
        btree: &Arc<strata_btree::Btree>,
        sector: u64,
        sectors: u32,
        buf: &mut [u8],
    ) -> bool {
        s.cache_miss = true;

        let started = Instant::now();
        let result = self.backing.read_sectors(sector, buf);
        self.set.congestion.io_done(
            IoDir::Read,
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        );
        if let Err(err) = result {
            warn!(
                target: "strata::request",
                event = "backing_read_error",
                inode = s.inode,
                sector = sector,
                error = %err
            );
            self.backing_errors.add_error();
            s.recoverable = false;
            return true;
        }

        if !s.bypass {
            // Reserve the miss range (plus readahead when the cache has
            // room) so an in-flight promote owns it.
            let mut reada = 0_u32;
            let config = self.config();
            if config.readahead_sectors > 0 && self.set.has_cache_headroom() {
                let backing_end = self.backing.nr_sectors();
                let avail = backing_end.saturating_sub(sector + u64::from(sectors));
                reada = config
                    .readahead_sectors
                    .min(u32::try_from(avail).unwrap_or(u32::MAX));
            }
            let total = sectors + reada;
            let cookie = KeyVal::new(
                Bkey::new(
                    Bpos::new(s.inode, sector + u64::from(total)),
                    total,
                    KeyType::Cookie,
                ),
                Bval::None,
            );
            let mut citer = btree.iter_intent(BtreeId::Extents, cookie.k.start());
            match citer.insert_check_key(cookie) {
                Ok(inserted) => {
                    if inserted {
                        #[cfg(feature = "promote")]
                        promote::promote_after_miss(self, sector, sectors, buf);
                    }
                }
                Err(err) => {
                    trace!(
                        target: "strata::request",
                        event = "check_key_failed",
                        error = %err
                    );
                }
            }
        }
        false
    }

    // ── Write path ──────────────────────────────────────────────────────

    fn cached_dev_write(&self, s: &mut Search, bio: &mut Bio) {
        if self.set.is_read_only() {
            self.set_state(BdevState::Inconsistent);
            bio.error = StrataError::Inconsistent("cache set is read-only".to_owned()).to_errno();
            return;
        }

        let _wb = self.writeback_lock.read();
        let start = Bpos::new(s.inode, bio.sector);
        let end = Bpos::new(s.inode, bio.end_sector());

        let mut bypass = s.bypass;
        let mut do_writeback = false;

        if self.keybuf.check_overlapping(start, end) {
            // Overlap with dirty data undergoing background writeback:
            // this write must be ordered with it, so force writeback.
            bypass = false;
            do_writeback = true;
        }

        // Discards aren't required to do anything, so bypassing even
        // after check_overlapping dropped keys is fine.
        let is_discard = matches!(bio.op, BioOp::Discard);
        if is_discard {
            bypass = true;
        }

        if self.should_writeback(bio, bypass) {
            bypass = false;
            do_writeback = true;
        }

        let sync = matches!(bio.op, BioOp::Write { sync: true, .. });
        let flush = matches!(bio.op, BioOp::Write { flush: true, .. });
        let wp = self.set.devs.wps.foreground(current_task());

        let result = if bypass {
            s.bypass = true;
            self.write_bypass(s, bio, is_discard)
        } else if do_writeback {
            self.write_writeback(s, bio, wp, sync, flush)
        } else {
            self.write_writethrough(s, bio, wp, sync, flush)
        };

        if let Err(err) = result {
            bio.error = err.to_errno();
        }
    }

    fn write_bypass(&self, s: &mut Search, bio: &Bio, is_discard: bool) -> Result<()> {
        // Stale cached copies of the range must stop being served.
        data_write(
            &self.set,
            self.set.devs.wps.foreground(current_task()),
            s.inode,
            bio.sector,
            bio.nr_sectors,
            &[],
            WRITE_DISCARD,
        )?;

        if is_discard && !self.backing.supports_discard() {
            return Ok(());
        }
        let started = Instant::now();
        let result = if is_discard {
            self.backing.discard(bio.sector, u64::from(bio.nr_sectors))
        } else {
            self.backing.write_sectors(bio.sector, &bio.data)
        };
        self.set.congestion.io_done(
            IoDir::Write,
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        );
        result.inspect_err(|_| {
            self.backing_errors.add_error();
        })
    }

    fn write_writeback(
        &self,
        s: &mut Search,
        bio: &Bio,
        wp: &WritePoint,
        sync: bool,
        flush: bool,
    ) -> Result<()> {
        self.writeback_add(u64::from(bio.nr_sectors));

        let mut flags = 0;
        if sync || flush {
            flags |= WRITE_FLUSH;
        }
        data_write(
            &self.set,
            wp,
            s.inode,
            bio.sector,
            bio.nr_sectors,
            &bio.data,
            flags,
        )?;

        if flush {
            // The client asked for a flush; the backing device has its
            // own volatile cache to empty even though the data went to
            // the cache tier.
            self.backing.flush()?;
        }
        Ok(())
    }

    fn write_writethrough(
        &self,
        s: &mut Search,
        bio: &Bio,
        wp: &WritePoint,
        sync: bool,
        flush: bool,
    ) -> Result<()> {
        let started = Instant::now();
        self.backing
            .write_sectors(bio.sector, &bio.data)
            .inspect_err(|_| {
                self.backing_errors.add_error();
            })?;
        self.set.congestion.io_done(
            IoDir::Write,
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        );
        if sync || flush {
            self.backing.flush()?;
        }

        // Cache copy is best-effort: the data is already durable on the
        // backing device, so allocation failures just skip the cache.
        let mut flags = WRITE_CACHED | WRITE_ALLOC_NOWAIT | WRITE_DISCARD_ON_ERROR;
        if sync || flush {
            flags |= WRITE_FLUSH;
        }
        match data_write(
            &self.set,
            wp,
            s.inode,
            bio.sector,
            bio.nr_sectors,
            &bio.data,
            flags,
        ) {
            Ok(()) | Err(StrataError::NoMem) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn should_writeback(&self, bio: &Bio, bypass: bool) -> bool {
        if bypass {
            return false;
        }
        let config = self.config();
        if config.cache_mode != CacheMode::Writeback {
            return false;
        }

        let capacity = self.set.capacity_sectors().max(1);
        let in_use = (capacity.saturating_sub(self.set.sectors_available())) * 100 / capacity;
        if in_use > CUTOFF_WRITEBACK_SYNC {
            return false;
        }
        let sync = matches!(bio.op, BioOp::Write { sync: true, .. });
        sync || in_use <= CUTOFF_WRITEBACK
    }

    pub(crate) fn writeback_add(&self, sectors: u64) {
        self.dirty_sectors.fetch_add(sectors, Ordering::Relaxed);
        self.set_state(BdevState::Dirty);
    }

    pub(crate) fn writeback_done(&self, sectors: u64) {
        let prev = self.dirty_sectors.fetch_sub(
            sectors.min(self.dirty_sectors.load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );
        if prev <= sectors && self.keybuf.is_empty() {
            self.set_state(BdevState::Clean);
        }
    }
}

impl Drop for CachedDev {
    fn drop(&mut self) {
        self.writeback_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.writeback_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn passthrough(backing: &dyn SectorDevice, mut bio: Bio) -> Bio {
    let result = match bio.op {
        BioOp::Read => backing.read_sectors(bio.sector, &mut bio.data),
        BioOp::Write { flush, sync } => {
            let r = backing.write_sectors(bio.sector, &bio.data);
            if r.is_ok() && (flush || sync) {
                backing.flush()
            } else {
                r
            }
        }
        BioOp::Discard => backing.discard(bio.sector, u64::from(bio.nr_sectors)),
    };
    if let Err(err) = result {
        bio.error = err.to_errno();
    }
    bio
}

// ── Extent pick ─────────────────────────────────────────────────────────────

enum Pick {
    Live {
        device: Arc<strata_alloc::CacheDevice>,
        ptr: strata_types::ExtentPtr,
    },
    /// Every pointer is stale; the data may still be on backing.
    Stale,
    /// No pointer references a present device.
    NoDevice,
}

/// Choose a pointer to read: non-stale, lowest tier, then fewest
/// accumulated errors.
fn extent_pick_ptr(set: &Arc<CacheSet>, extent: &Extent) -> Pick {
    let mut best: Option<(u8, u64, Arc<strata_alloc::CacheDevice>, strata_types::ExtentPtr)> =
        None;
    let mut saw_stale = false;
    let mut saw_device = false;

    for ptr in &extent.ptrs {
        let Some(device) = set.devs.device(ptr.dev) else {
            continue;
        };
        saw_device = true;
        if device.ptr_stale(ptr) {
            saw_stale = true;
            continue;
        }
        let score = (device.tier().get(), device.io_errors.current());
        if best
            .as_ref()
            .is_none_or(|(tier, errors, _, _)| score < (*tier, *errors))
        {
            best = Some((score.0, score.1, device, *ptr));
        }
    }

    match best {
        Some((_, _, device, ptr)) => Pick::Live { device, ptr },
        None if saw_stale => Pick::Stale,
        None if saw_device => Pick::NoDevice,
        None => Pick::NoDevice,
    }
}

// ── Write op ────────────────────────────────────────────────────────────────

/// The write state machine: allocate sectors from `wp`, write the
/// payload to every replica, insert the extent key, repeat until the
/// range is covered. `WRITE_DISCARD` skips the data and inserts a
/// discard tombstone instead (invalidating cached copies of the range).
pub fn data_write(
    set: &Arc<CacheSet>,
    wp: &WritePoint,
    inode: u64,
    sector: u64,
    nr_sectors: u32,
    data: &[u8],
    flags: u32,
) -> Result<()> {
    if flags & WRITE_DISCARD != 0 {
        set.btree.insert(
            BtreeId::Extents,
            KeyVal::new(
                Bkey::new(
                    Bpos::new(inode, sector + u64::from(nr_sectors)),
                    nr_sectors,
                    KeyType::Discard,
                ),
                Bval::None,
            ),
        )?;
        return Ok(());
    }

    debug_assert_eq!(data.len(), (nr_sectors as usize) << SECTOR_SHIFT as usize);
    let cached = flags & WRITE_CACHED != 0;
    let how = if flags & WRITE_ALLOC_NOWAIT != 0 {
        AllocHow::NoWait
    } else {
        AllocHow::Blocking
    };
    let mark = if cached {
        BucketMark::Cached
    } else {
        BucketMark::Dirty
    };

    let mut written = 0_u32;
    while written < nr_sectors {
        let mut extent = Extent::default();
        let got = set.devs.alloc_sectors(
            wp,
            &mut extent,
            1,
            nr_sectors - written,
            ReserveClass::None,
            mark,
            &how,
        )?;

        let slice = &data[(written as usize) << SECTOR_SHIFT as usize..]
            [..(got as usize) << SECTOR_SHIFT as usize];

        let mut write_failed = false;
        for ptr in &extent.ptrs {
            let Some(device) = set.devs.device(ptr.dev) else {
                write_failed = true;
                continue;
            };
            let started = Instant::now();
            let result = device.dev.write_sectors(ptr.offset, slice);
            set.congestion.io_done(
                IoDir::Write,
                u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            );
            match result {
                Ok(()) => {
                    device.touch_bucket(ptr.bucket(device.bucket_sectors()), IoDir::Write);
                    device.add_io_time(IoDir::Write, u64::from(got));
                }
                Err(err) => {
                    warn!(
                        target: "strata::request",
                        event = "cache_write_error",
                        dev = ptr.dev.0,
                        error = %err
                    );
                    if device.io_errors.add_error() {
                        set.device_failed(device.idx);
                    }
                    write_failed = true;
                }
            }
        }

        if write_failed {
            if flags & WRITE_DISCARD_ON_ERROR != 0 {
                set.btree.insert(
                    BtreeId::Extents,
                    KeyVal::new(
                        Bkey::new(
                            Bpos::new(inode, sector + u64::from(written) + u64::from(got)),
                            got,
                            KeyType::Discard,
                        ),
                        Bval::None,
                    ),
                )?;
                written += got;
                continue;
            }
            return Err(StrataError::Io(std::io::Error::other("cache write failed")));
        }

        let kv = KeyVal::new(
            Bkey::new(
                Bpos::new(inode, sector + u64::from(written) + u64::from(got)),
                got,
                if cached {
                    KeyType::CachedExtent
                } else {
                    KeyType::Extent
                },
            ),
            Bval::Extent(Extent {
                ptrs: extent.ptrs,
                crc: Some(ExtentCrc {
                    csum: crc32c::crc32c(slice),
                    uncompressed_sectors: got,
                    compression: strata_types::CompressionType::None,
                }),
            }),
        );
        set.btree.insert(BtreeId::Extents, kv)?;
        written += got;
    }

    if flags & WRITE_FLUSH != 0 {
        let seq = set.journal.last_seq();
        set.journal.flush_seq(seq)?;
    }
    Ok(())
}

// ── Blockdev volumes ────────────────────────────────────────────────────────

/// A flash-only volume: a virtual block device whose data lives
/// entirely in the cache set.
#[derive(Debug)]
pub struct Volume {
    pub set: Arc<CacheSet>,
    pub inode: u64,
    pub nr_sectors: u64,
}

impl Volume {
    pub fn create(set: Arc<CacheSet>, inode: u64, nr_sectors: u64) -> Result<Self> {
        let mut i_label = [0_u8; 32];
        i_label[..6].copy_from_slice(b"volume");
        set.btree.insert(
            BtreeId::Inodes,
            KeyVal::new(
                Bkey::new(Bpos::new(inode, 0), 0, KeyType::Inode),
                Bval::Inode(InodeRec {
                    i_size: nr_sectors << u64::from(SECTOR_SHIFT),
                    i_sectors: nr_sectors,
                    i_label,
                }),
            ),
        )?;
        Ok(Self {
            set,
            inode,
            nr_sectors,
        })
    }

    /// Serve one bio against the volume.
    pub fn make_request(&self, mut bio: Bio) -> Bio {
        if bio.is_empty() {
            if matches!(bio.op, BioOp::Write { flush: true, .. }) {
                let seq = self.set.journal.last_seq();
                if let Err(err) = self.set.journal.flush_seq(seq) {
                    bio.error = err.to_errno();
                }
            }
            return bio;
        }
        if bio.end_sector() > self.nr_sectors {
            bio.error = StrataError::Io(std::io::Error::other("past end of volume")).to_errno();
            return bio;
        }

        match bio.op {
            BioOp::Read => {
                if let Err(err) = self.read(&mut bio) {
                    bio.error = err.to_errno();
                }
            }
            BioOp::Write { flush, sync } => {
                // A volume write needs cache space; no backing device
                // exists to fall back on.
                if self.set.sectors_available() < u64::from(bio.nr_sectors) {
                    bio.error = StrataError::NoSpace.to_errno();
                    return bio;
                }
                let mut flags = 0;
                if flush || sync {
                    flags |= WRITE_FLUSH;
                }
                let wp = self.set.devs.wps.foreground(current_task());
                if let Err(err) = data_write(
                    &self.set,
                    wp,
                    self.inode,
                    bio.sector,
                    bio.nr_sectors,
                    &bio.data,
                    flags,
                ) {
                    bio.error = err.to_errno();
                }
            }
            BioOp::Discard => {
                if let Err(err) = data_write(
                    &self.set,
                    self.set.devs.wps.foreground(current_task()),
                    self.inode,
                    bio.sector,
                    bio.nr_sectors,
                    &[],
                    WRITE_DISCARD,
                ) {
                    bio.error = err.to_errno();
                }
            }
        }
        bio
    }

    fn read(&self, bio: &mut Bio) -> Result<()> {
        let btree = Arc::clone(&self.set.btree);
        let mut iter = btree.iter(BtreeId::Extents, Bpos::new(self.inode, bio.sector));
        let end = bio.end_sector();
        let mut cur = bio.sector;

        while cur < end {
            iter.set_pos(Bpos::new(self.inode, cur));
            let Some(kv) = iter.peek_with_holes()? else {
                break;
            };
            let extent_end = if kv.k.p.inode == self.inode {
                kv.k.p.offset
            } else {
                end
            };
            let slice_end = extent_end.min(end);
            #[expect(clippy::cast_possible_truncation)]
            let sectors = (slice_end - cur) as u32;
            let buf_at = ((cur - bio.sector) as usize) << SECTOR_SHIFT as usize;
            let buf =
                &mut bio.data[buf_at..buf_at + ((sectors as usize) << SECTOR_SHIFT as usize)];

            let served = if kv.k.ty.is_extent() && kv.k.covers(Bpos::new(self.inode, cur)) {
                match kv.v.as_extent().map(|e| extent_pick_ptr(&self.set, e)) {
                    Some(Pick::Live { device, ptr, .. }) => {
                        let delta = cur - kv.k.start().offset;
                        device.dev.read_sectors(ptr.offset + delta, buf)?;
                        device.touch_bucket(ptr.bucket(device.bucket_sectors()), IoDir::Read);
                        true
                    }
                    _ => false,
                }
            } else {
                false
            };
            if !served {
                // Unwritten ranges read as zeroes.
                buf.fill(0);
            }
            cur = slice_end;
        }
        drop(iter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_alloc::DeviceConfig;
    use strata_block::MemSectorDevice;
    use strata_core::CacheSetOpts;
    use strata_types::{ReplacementPolicy, Tier};

    fn test_rig(mode: CacheMode) -> (Arc<CacheSet>, Arc<CachedDev>, Arc<MemSectorDevice>) {
        let cache_dev = Arc::new(MemSectorDevice::new(64 * 512));
        let set = CacheSet::open(
            "request-test",
            vec![(
                cache_dev as Arc<dyn SectorDevice>,
                DeviceConfig {
                    nbuckets: 64,
                    bucket_sectors: 512,
                    first_bucket: 0,
                    tier: Tier::ZERO,
                    policy: ReplacementPolicy::Lru,
                    discard: false,
                },
            )],
            CacheSetOpts {
                block_sectors: 8,
                ..CacheSetOpts::default()
            },
        )
        .unwrap();

        let backing = Arc::new(MemSectorDevice::new(16_384));
        let dc = CachedDev::attach(
            Arc::clone(&set),
            Arc::clone(&backing) as Arc<dyn SectorDevice>,
            42,
            "test",
            CachedDevConfig {
                cache_mode: mode,
                writeback_running: false,
                ..CachedDevConfig::default()
            },
        )
        .unwrap();
        (set, dc, backing)
    }

    fn sector_bytes(sectors: u32) -> Vec<u8> {
        vec![0x55_u8; (sectors as usize) << SECTOR_SHIFT as usize]
    }

    #[test]
    fn unaligned_bios_bypass() {
        let (set, dc, _backing) = test_rig(CacheMode::Writethrough);
        // block_sectors = 8: a 3-sector bio is unaligned.
        let aligned = Bio::write(42, 0, sector_bytes(8));
        let unaligned = Bio::write(42, 5, sector_bytes(3));

        assert!(!dc.check_should_bypass(&aligned));
        assert!(dc.check_should_bypass(&unaligned));
        set.shutdown().unwrap();
    }

    #[test]
    fn mode_none_and_writearound_bypass() {
        let (set, dc, _backing) = test_rig(CacheMode::None);
        assert!(dc.check_should_bypass(&Bio::write(42, 0, sector_bytes(8))));
        assert!(dc.check_should_bypass(&Bio::read(42, 0, 8)));
        set.shutdown().unwrap();

        let (set, dc, _backing) = test_rig(CacheMode::Writearound);
        assert!(dc.check_should_bypass(&Bio::write(42, 0, sector_bytes(8))));
        assert!(!dc.check_should_bypass(&Bio::read(42, 0, 8)));
        set.shutdown().unwrap();
    }

    #[test]
    fn discards_always_bypass() {
        let (set, dc, _backing) = test_rig(CacheMode::Writeback);
        assert!(dc.check_should_bypass(&Bio::discard(42, 0, 8)));
        set.shutdown().unwrap();
    }

    #[test]
    fn sync_writeback_writes_skip_sequential_check() {
        let (set, dc, _backing) = test_rig(CacheMode::Writeback);
        {
            let mut config = dc.config.lock();
            config.sequential_cutoff = 4096;
        }
        // Build a long run; async writes eventually bypass.
        for i in 0..4_u64 {
            let bio = Bio::write(42, i * 8, sector_bytes(8));
            dc.check_should_bypass(&bio);
        }
        let async_bio = Bio::write(42, 32, sector_bytes(8));
        assert!(dc.check_should_bypass(&async_bio));

        // The same run, submitted sync under writeback, is exempt.
        let sync_bio = Bio::write(42, 40, sector_bytes(8)).with_sync(true);
        assert!(!dc.check_should_bypass(&sync_bio));
        set.shutdown().unwrap();
    }

    #[test]
    fn congestion_bypasses_short_runs() {
        let (set, dc, _backing) = test_rig(CacheMode::Writethrough);
        set.attr_set("congested_read_threshold_us", "1").unwrap();
        // Hammer the tracker with slow completions.
        for _ in 0..64 {
            set.congestion.io_done(strata_types::IoDir::Read, 1_000_000);
        }
        assert!(set.congestion.get() > 0);

        let before = set.stats.bypass_congested.load(Ordering::Relaxed);
        // A couple of consecutive bios build a run longer than the
        // congestion value.
        let mut bypassed = false;
        for i in 0..64_u64 {
            let bio = Bio::read(42, i * 8, 8);
            bypassed |= dc.check_should_bypass(&bio);
        }
        assert!(bypassed);
        assert!(set.stats.bypass_congested.load(Ordering::Relaxed) > before);
        set.shutdown().unwrap();
    }

    #[test]
    fn should_writeback_honors_mode_and_sync() {
        let (set, dc, _backing) = test_rig(CacheMode::Writethrough);
        let bio = Bio::write(42, 0, sector_bytes(8));
        assert!(!dc.should_writeback(&bio, false));
        set.shutdown().unwrap();

        let (set, dc, _backing) = test_rig(CacheMode::Writeback);
        let bio = Bio::write(42, 0, sector_bytes(8));
        assert!(dc.should_writeback(&bio, false));
        assert!(!dc.should_writeback(&bio, true));
        set.shutdown().unwrap();
    }

    #[test]
    fn extent_pick_prefers_live_pointers() {
        let (set, dc, _backing) = test_rig(CacheMode::Writethrough);
        let done = dc.make_request(Bio::write(42, 0, sector_bytes(8)));
        assert_eq!(done.error, 0);

        let kv = set
            .btree
            .lookup(BtreeId::Extents, Bpos::new(42, 0))
            .unwrap()
            .unwrap();
        let extent = kv.v.as_extent().unwrap();
        assert!(matches!(extent_pick_ptr(&set, extent), Pick::Live { .. }));

        // Invalidate the bucket; the pick must report stale.
        let ptr = extent.ptrs[0];
        let device = set.devs.device(ptr.dev).unwrap();
        device.with_bucket_mut(ptr.bucket(device.bucket_sectors()), |b| {
            b.gen = b.gen.next();
        });
        assert!(matches!(extent_pick_ptr(&set, extent), Pick::Stale));
        set.shutdown().unwrap();
    }

    #[test]
    fn data_write_round_trips_through_btree() {
        let (set, dc, _backing) = test_rig(CacheMode::Writethrough);
        let payload = sector_bytes(16);
        data_write(
            &set,
            set.devs.wps.foreground(current_task()),
            dc.inode,
            64,
            16,
            &payload,
            0,
        )
        .unwrap();

        let kv = set
            .btree
            .lookup(BtreeId::Extents, Bpos::new(dc.inode, 64))
            .unwrap()
            .unwrap();
        assert_eq!(kv.k.ty, KeyType::Extent);
        let extent = kv.v.as_extent().unwrap();
        assert_eq!(
            extent.crc.unwrap().csum,
            crc32c::crc32c(&payload[..(kv.k.size as usize) << SECTOR_SHIFT as usize])
        );
        set.shutdown().unwrap();
    }
}
