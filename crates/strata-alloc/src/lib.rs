#![forbid(unsafe_code)]
//! Bucket allocation.
//!
//! Each cache device is carved into fixed-size buckets. A per-device
//! allocator thread selects victim buckets by the configured replacement
//! policy, advances their generations (invalidating any pointer still
//! referencing them), journals the new generations, optionally discards
//! the sector range, and only then pushes the buckets onto the reserve
//! FIFOs consumers allocate from. Metadata reserves (`Prio`, `Btree`)
//! are sized so metadata writes never wait behind user I/O, and the
//! `MovingGc` reserve guarantees copy-GC can always make progress.
//!
//! The open-bucket / write-point layer lives in [`open_bucket`].

pub mod open_bucket;

pub use open_bucket::{
    AllocHow, OpenBucket, OpenBucketPool, WritePoint, WritePoints, OPEN_BUCKETS_COUNT,
    WRITE_POINT_COUNT,
};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use strata_block::{IoErrorConfig, IoErrors, SectorDevice};
use strata_closure::{Closure, WaitList};
use strata_error::{Result, StrataError};
use strata_journal::{Journal, JournalEntry};
use strata_types::{
    Bucket, BucketIdx, BucketMark, DeviceIdx, ExtentPtr, Gen, IoDir, ReplacementPolicy,
    ReserveClass, Tier, TIER_MAX,
};
use tracing::{debug, info, trace, warn};

/// Reserve FIFO target depths, indexed like [`ReserveClass::ALL`].
const RESERVE_PRIO_TARGET: usize = 8;
const RESERVE_BTREE_TARGET: usize = 8;
const RESERVE_MOVINGGC_TARGET: usize = 16;

/// Buckets invalidated per allocator pass before journaling.
const FREE_INC_BATCH: usize = 16;

/// How close `hand - min_prio` may get to the u16 range before the
/// prio clock rescales.
const PRIO_RESCALE_THRESHOLD: u16 = u16::MAX - 8192;

fn reserve_slot(reserve: ReserveClass) -> usize {
    match reserve {
        ReserveClass::Prio => 0,
        ReserveClass::Btree => 1,
        ReserveClass::MovingGc => 2,
        ReserveClass::None => 3,
    }
}

// ── Prio clocks ─────────────────────────────────────────────────────────────

/// One of the two per-device IO-time clocks (read and write).
///
/// The hand advances with the amount of data moved; touched buckets get
/// `prio = hand`, so `hand - prio` is the time since last touch in IO
/// units. When the spread approaches the u16 range everything is halved,
/// preserving relative order.
#[derive(Debug, Clone, Copy)]
pub struct PrioClock {
    pub hand: u16,
    pub min_prio: u16,
    /// Sectors accumulated toward the next hand step.
    pending_sectors: u64,
    /// Sectors of IO per hand step.
    sectors_per_step: u64,
}

impl PrioClock {
    fn new(sectors_per_step: u64) -> Self {
        Self {
            hand: 0,
            min_prio: 0,
            pending_sectors: 0,
            sectors_per_step: sectors_per_step.max(1),
        }
    }

    /// Advance the hand for `sectors` of IO; returns true if a rescale
    /// is due.
    fn add_io(&mut self, sectors: u64) -> bool {
        self.pending_sectors += sectors;
        let steps = self.pending_sectors / self.sectors_per_step;
        self.pending_sectors %= self.sectors_per_step;
        #[expect(clippy::cast_possible_truncation)]
        let steps = steps.min(u64::from(u16::MAX)) as u16;
        self.hand = self.hand.wrapping_add(steps);
        self.hand.wrapping_sub(self.min_prio) >= PRIO_RESCALE_THRESHOLD
    }

    /// Halve every distance from the hand. `prios` yields mutable refs
    /// to every bucket prio this clock owns.
    fn rescale<'a>(&mut self, prios: impl Iterator<Item = &'a mut u16>) {
        let hand = self.hand;
        let mut min = u16::MAX;
        for prio in prios {
            let dist = hand.wrapping_sub(*prio) / 2;
            *prio = hand.wrapping_sub(dist);
            min = min.min(*prio);
        }
        self.min_prio = if min == u16::MAX { hand } else { min };
    }
}

// ── Cache device ────────────────────────────────────────────────────────────

/// Static geometry plus mutable policy knobs for one cache device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub nbuckets: u64,
    pub bucket_sectors: u64,
    /// Buckets below this hold the superblock and journal; never
    /// allocated.
    pub first_bucket: u64,
    pub tier: Tier,
    pub policy: ReplacementPolicy,
    pub discard: bool,
}

impl DeviceConfig {
    #[must_use]
    pub fn data_buckets(&self) -> u64 {
        self.nbuckets - self.first_bucket
    }
}

#[derive(Debug, Default)]
struct FreeLists {
    /// Reserve FIFOs, indexed by [`reserve_slot`].
    free: [VecDeque<BucketIdx>; 4],
    /// Invalidated buckets whose new generations are not yet journaled.
    free_inc: VecDeque<BucketIdx>,
    /// Buckets that have never been handed out since device add.
    untouched: VecDeque<BucketIdx>,
}

impl FreeLists {
    fn queued_free(&self) -> usize {
        self.free.iter().map(VecDeque::len).sum()
    }
}

/// One cache device: bucket table, prio clocks, reserve FIFOs and the
/// allocator thread feeding them.
#[derive(Debug)]
pub struct CacheDevice {
    pub idx: DeviceIdx,
    pub dev: Arc<dyn SectorDevice>,
    tier: Tier,
    bucket_sectors: u64,
    first_bucket: u64,
    policy: Mutex<ReplacementPolicy>,
    discard: AtomicBool,
    buckets: RwLock<Vec<Bucket>>,
    free_lists: Mutex<FreeLists>,
    /// Signalled when buckets land on a reserve FIFO.
    free_cv: Condvar,
    /// Closures parked until the next reserve refill.
    alloc_wait: WaitList,
    /// Kicks the allocator thread.
    thread_cv: Condvar,
    thread_kick: Mutex<bool>,
    shutdown: AtomicBool,
    prio: Mutex<[PrioClock; 2]>,
    pub io_errors: IoErrors,
    /// Total buckets invalidated; observable.
    invalidated: AtomicU64,
}

impl CacheDevice {
    fn new(idx: DeviceIdx, dev: Arc<dyn SectorDevice>, config: DeviceConfig) -> Self {
        let nbuckets = config.nbuckets as usize;
        let untouched: VecDeque<BucketIdx> =
            (config.first_bucket..config.nbuckets).map(BucketIdx).collect();
        // One hand step per 1/1024th of the device, in sectors.
        let sectors_per_step = (config.nbuckets * config.bucket_sectors / 1024).max(1);

        Self {
            idx,
            dev,
            tier: config.tier,
            bucket_sectors: config.bucket_sectors,
            first_bucket: config.first_bucket,
            policy: Mutex::new(config.policy),
            discard: AtomicBool::new(config.discard),
            buckets: RwLock::new(vec![Bucket::default(); nbuckets]),
            free_lists: Mutex::new(FreeLists {
                untouched,
                ..FreeLists::default()
            }),
            free_cv: Condvar::new(),
            alloc_wait: WaitList::new(),
            thread_cv: Condvar::new(),
            thread_kick: Mutex::new(false),
            shutdown: AtomicBool::new(false),
            prio: Mutex::new([PrioClock::new(sectors_per_step); 2]),
            io_errors: IoErrors::new(IoErrorConfig::default()),
            invalidated: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[must_use]
    pub fn bucket_sectors(&self) -> u64 {
        self.bucket_sectors
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.buckets.read().len() as u64
    }

    pub fn set_policy(&self, policy: ReplacementPolicy) {
        *self.policy.lock() = policy;
    }

    #[must_use]
    pub fn policy(&self) -> ReplacementPolicy {
        *self.policy.lock()
    }

    pub fn set_discard(&self, discard: bool) {
        self.discard.store(discard, Ordering::Relaxed);
    }

    /// Current generation of a bucket.
    #[must_use]
    pub fn bucket_gen(&self, bucket: BucketIdx) -> Option<Gen> {
        self.buckets.read().get(bucket.0 as usize).map(|b| b.gen)
    }

    /// Whether a pointer's generation no longer matches its bucket.
    #[must_use]
    pub fn ptr_stale(&self, ptr: &ExtentPtr) -> bool {
        self.bucket_gen(ptr.bucket(self.bucket_sectors))
            .is_none_or(|gen| gen != ptr.gen)
    }

    /// Snapshot of one bucket record.
    #[must_use]
    pub fn bucket(&self, bucket: BucketIdx) -> Option<Bucket> {
        self.buckets.read().get(bucket.0 as usize).copied()
    }

    /// Run `f` over the bucket record, under the table write lock.
    pub fn with_bucket_mut<R>(&self, bucket: BucketIdx, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut buckets = self.buckets.write();
        f(&mut buckets[bucket.0 as usize])
    }

    /// Reset a touched bucket's prio to the current hand.
    ///
    /// Lock order: prio before the bucket table, everywhere.
    pub fn touch_bucket(&self, bucket: BucketIdx, dir: IoDir) {
        let hand = self.prio.lock()[dir as usize].hand;
        let mut buckets = self.buckets.write();
        if let Some(b) = buckets.get_mut(bucket.0 as usize) {
            match dir {
                IoDir::Read => b.read_prio = hand,
                IoDir::Write => b.write_prio = hand,
            }
        }
    }

    /// Account `sectors` of IO against the prio clock for `dir`,
    /// rescaling if the hand has pulled far enough ahead.
    pub fn add_io_time(&self, dir: IoDir, sectors: u64) {
        let mut clocks = self.prio.lock();
        if clocks[dir as usize].add_io(sectors) {
            let mut buckets = self.buckets.write();
            let clock = &mut clocks[dir as usize];
            match dir {
                IoDir::Read => clock.rescale(buckets.iter_mut().map(|b| &mut b.read_prio)),
                IoDir::Write => clock.rescale(buckets.iter_mut().map(|b| &mut b.write_prio)),
            }
            debug!(
                target: "strata::alloc",
                event = "prio_rescale",
                dev = self.idx.0,
                dir = ?dir,
                hand = clock.hand
            );
        }
    }

    #[must_use]
    pub fn prio_hand(&self, dir: IoDir) -> u16 {
        self.prio.lock()[dir as usize].hand
    }

    /// Pop a free bucket from the requested reserve.
    pub fn bucket_alloc(&self, reserve: ReserveClass) -> Result<BucketIdx> {
        let mut lists = self.free_lists.lock();
        if let Some(bucket) = lists.free[reserve_slot(reserve)].pop_front() {
            drop(lists);
            self.kick_allocator();
            trace!(
                target: "strata::alloc",
                event = "bucket_alloc",
                dev = self.idx.0,
                reserve = reserve.as_str(),
                bucket = bucket.0
            );
            return Ok(bucket);
        }
        drop(lists);
        self.kick_allocator();
        Err(StrataError::NoMem)
    }

    /// Pop a free bucket, blocking until the allocator produces one.
    pub fn bucket_alloc_blocking(&self, reserve: ReserveClass) -> Result<BucketIdx> {
        let mut lists = self.free_lists.lock();
        loop {
            if let Some(bucket) = lists.free[reserve_slot(reserve)].pop_front() {
                drop(lists);
                self.kick_allocator();
                return Ok(bucket);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(StrataError::NoMem);
            }
            self.kick_allocator();
            self.free_cv.wait_for(&mut lists, Duration::from_millis(100));
        }
    }

    /// Park a closure until the next reserve refill, then fail the
    /// current attempt so the caller unwinds and retries.
    pub fn bucket_alloc_wait(&self, reserve: ReserveClass, cl: &Closure) -> StrataError {
        self.alloc_wait.wait(cl);
        self.kick_allocator();
        trace!(
            target: "strata::alloc",
            event = "bucket_alloc_wait",
            dev = self.idx.0,
            reserve = reserve.as_str()
        );
        StrataError::NoMem
    }

    /// Return an allocated-but-unused bucket to the front of its
    /// reserve FIFO (unwinding a partial multi-device allocation).
    pub(crate) fn bucket_unalloc(&self, reserve: ReserveClass, bucket: BucketIdx) {
        self.free_lists.lock().free[reserve_slot(reserve)].push_front(bucket);
        self.free_cv.notify_all();
    }

    /// Sectors currently allocatable without invalidating anything.
    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        let lists = self.free_lists.lock();
        (lists.queued_free() + lists.untouched.len()) as u64 * self.bucket_sectors
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        (self.nbuckets() - self.first_bucket) * self.bucket_sectors
    }

    /// Depth of each reserve FIFO, indexed like [`ReserveClass::ALL`].
    #[must_use]
    pub fn reserve_depths(&self) -> [usize; 4] {
        let lists = self.free_lists.lock();
        std::array::from_fn(|slot| lists.free[slot].len())
    }

    /// Per-mark bucket counts: (free, cached, dirty, meta, btree).
    #[must_use]
    pub fn bucket_counts(&self) -> [u64; 5] {
        let mut counts = [0_u64; 5];
        for bucket in self.buckets.read().iter().skip(self.first_bucket as usize) {
            let slot = match bucket.mark {
                BucketMark::Free => 0,
                BucketMark::Cached => 1,
                BucketMark::Dirty => 2,
                BucketMark::Meta => 3,
                BucketMark::Btree => 4,
            };
            counts[slot] += 1;
        }
        counts
    }

    /// Descending quantiles of `hand - prio` ages for the read clock.
    #[must_use]
    pub fn prio_quantiles(&self, nq: usize) -> Vec<u16> {
        let hand = self.prio.lock()[IoDir::Read as usize].hand;
        let mut ages: Vec<u16> = self
            .buckets
            .read()
            .iter()
            .skip(self.first_bucket as usize)
            .filter(|b| b.mark == BucketMark::Cached)
            .map(|b| hand.wrapping_sub(b.read_prio))
            .collect();
        if ages.is_empty() {
            return vec![0; nq];
        }
        ages.sort_unstable_by(|a, b| b.cmp(a));
        let step = (nq - 1).max(1);
        (0..nq).map(|i| ages[i * (ages.len() - 1) / step]).collect()
    }

    fn kick_allocator(&self) {
        let mut kick = self.thread_kick.lock();
        *kick = true;
        drop(kick);
        self.thread_cv.notify_one();
    }

    // ── Allocator thread ────────────────────────────────────────────────

    /// How many buckets the reserves currently want.
    fn reserve_deficit(lists: &FreeLists) -> usize {
        let targets = [
            RESERVE_PRIO_TARGET,
            RESERVE_BTREE_TARGET,
            RESERVE_MOVINGGC_TARGET,
            FREE_INC_BATCH,
        ];
        targets
            .iter()
            .zip(lists.free.iter())
            .map(|(target, fifo)| target.saturating_sub(fifo.len()))
            .sum()
    }

    /// Choose up to `nr` victim buckets by the replacement policy.
    fn choose_victims(&self, nr: usize) -> Vec<BucketIdx> {
        let mut victims = Vec::with_capacity(nr);

        // Never-used buckets first; no data to age out.
        {
            let mut lists = self.free_lists.lock();
            while victims.len() < nr {
                match lists.untouched.pop_front() {
                    Some(b) => victims.push(b),
                    None => break,
                }
            }
        }
        if victims.len() == nr {
            return victims;
        }

        let policy = *self.policy.lock();
        let hand = self.prio.lock()[IoDir::Read as usize].hand;
        let buckets = self.buckets.read();
        let first = self.first_bucket as usize;

        let mut candidates: Vec<(u32, BucketIdx)> = buckets
            .iter()
            .enumerate()
            .skip(first)
            .filter(|(_, b)| b.can_invalidate())
            .map(|(i, b)| {
                let weight = match policy {
                    // Oldest (largest hand distance) first.
                    ReplacementPolicy::Lru => {
                        let age = u32::from(hand.wrapping_sub(b.read_prio))
                            + u32::from(hand.wrapping_sub(b.write_prio));
                        u32::MAX - age
                    }
                    #[expect(clippy::cast_possible_truncation)]
                    ReplacementPolicy::Fifo => i as u32,
                    ReplacementPolicy::Random => rand::random::<u32>(),
                };
                (weight, BucketIdx(i as u64))
            })
            .collect();
        drop(buckets);

        candidates.sort_unstable_by_key(|(weight, _)| *weight);
        victims.extend(
            candidates
                .into_iter()
                .take(nr - victims.len())
                .map(|(_, b)| b),
        );
        victims
    }

    /// Invalidate `victims`: bump gens, journal, discard, then make the
    /// buckets allocatable.
    fn invalidate_buckets(&self, journal: &Arc<Journal>, victims: Vec<BucketIdx>) -> Result<()> {
        if victims.is_empty() {
            return Ok(());
        }

        let mut gen_set = Vec::with_capacity(victims.len());
        {
            let mut buckets = self.buckets.write();
            for &idx in &victims {
                let bucket = &mut buckets[idx.0 as usize];
                bucket.gen = bucket.gen.next();
                bucket.mark = BucketMark::Free;
                bucket.sectors_used = 0;
                bucket.read_prio = 0;
                bucket.write_prio = 0;
                gen_set.push((self.idx, idx, bucket.gen));
            }
        }
        self.free_lists.lock().free_inc.extend(victims.iter().copied());
        self.invalidated
            .fetch_add(victims.len() as u64, Ordering::Relaxed);

        // New generations must be durable before the buckets can be
        // handed out; a crash in between must not resurrect old data.
        let cl = Closure::new();
        journal.meta_async(JournalEntry::GenSet(gen_set), &cl)?;
        cl.wait_sync();
        if journal.is_poisoned() {
            return Err(StrataError::Inconsistent("journal poisoned".to_owned()));
        }

        if self.discard.load(Ordering::Relaxed) && self.dev.supports_discard() {
            for &idx in &victims {
                let start = idx.0 * self.bucket_sectors;
                if let Err(err) = self.dev.discard(start, self.bucket_sectors) {
                    warn!(
                        target: "strata::alloc",
                        event = "discard_failed",
                        dev = self.idx.0,
                        bucket = idx.0,
                        error = %err
                    );
                }
            }
        }

        // Distribute to reserves in fill order, then wake waiters.
        {
            let mut lists = self.free_lists.lock();
            let targets = [
                RESERVE_PRIO_TARGET,
                RESERVE_BTREE_TARGET,
                RESERVE_MOVINGGC_TARGET,
                usize::MAX,
            ];
            let mut pending: VecDeque<BucketIdx> = std::mem::take(&mut lists.free_inc);
            while let Some(bucket) = pending.pop_front() {
                let slot = (0..4)
                    .find(|&slot| lists.free[slot].len() < targets[slot])
                    .unwrap_or(3);
                lists.free[slot].push_back(bucket);
            }
        }
        self.free_cv.notify_all();
        self.alloc_wait.wake_all();

        trace!(
            target: "strata::alloc",
            event = "buckets_invalidated",
            dev = self.idx.0,
            count = victims.len()
        );
        Ok(())
    }

    fn allocator_pass(&self, journal: &Arc<Journal>) -> Result<bool> {
        let deficit = Self::reserve_deficit(&self.free_lists.lock());
        if deficit == 0 {
            return Ok(false);
        }
        let victims = self.choose_victims(deficit.min(FREE_INC_BATCH));
        if victims.is_empty() {
            return Ok(false);
        }
        self.invalidate_buckets(journal, victims)?;
        Ok(true)
    }

    fn allocator_loop(self: &Arc<Self>, journal: Arc<Journal>) {
        info!(target: "strata::alloc", event = "allocator_start", dev = self.idx.0);
        while !self.shutdown.load(Ordering::Acquire) {
            match self.allocator_pass(&journal) {
                Ok(true) => continue,
                Ok(false) => {
                    let mut kick = self.thread_kick.lock();
                    if !*kick {
                        self.thread_cv
                            .wait_for(&mut kick, Duration::from_millis(50));
                    }
                    *kick = false;
                }
                Err(err) => {
                    warn!(
                        target: "strata::alloc",
                        event = "allocator_stopped",
                        dev = self.idx.0,
                        error = %err
                    );
                    break;
                }
            }
        }
        info!(target: "strata::alloc", event = "allocator_exit", dev = self.idx.0);
    }

    /// Consistency check used by tests: reserves + unjournaled + never
    /// used + pinned + marked buckets account for every data bucket.
    #[must_use]
    pub fn verify_partition(&self) -> bool {
        let lists = self.free_lists.lock();
        let queued = lists.queued_free() + lists.free_inc.len() + lists.untouched.len();
        drop(lists);

        let buckets = self.buckets.read();
        let mut unqueued = 0_usize;
        for bucket in buckets.iter().skip(self.first_bucket as usize) {
            let accounted = bucket.pin > 0 || bucket.mark != BucketMark::Free;
            if accounted {
                unqueued += 1;
            }
        }
        let total = buckets.len() - self.first_bucket as usize;
        drop(buckets);

        queued + unqueued == total
    }
}

// ── Allocator handle ────────────────────────────────────────────────────────

/// Join handle + shutdown flag for one device's allocator thread.
#[derive(Debug)]
pub struct AllocatorHandle {
    device: Arc<CacheDevice>,
    handle: Option<JoinHandle<()>>,
}

impl AllocatorHandle {
    pub fn stop(&mut self) {
        self.device.shutdown.store(true, Ordering::Release);
        self.device.kick_allocator();
        self.device.free_cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AllocatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Cache groups ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct GroupMember {
    pub idx: DeviceIdx,
    pub weight: u64,
}

/// Weighted device group for round-robin replica placement within a
/// tier. Reads snapshot the member list without blocking writers.
#[derive(Debug)]
pub struct CacheGroup {
    members: ArcSwap<Vec<GroupMember>>,
    cur: AtomicU64,
}

impl Default for CacheGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheGroup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: ArcSwap::from_pointee(Vec::new()),
            cur: AtomicU64::new(0),
        }
    }

    pub fn add(&self, member: GroupMember) {
        let mut members = (**self.members.load()).clone();
        members.retain(|m| m.idx != member.idx);
        members.push(member);
        self.members.store(Arc::new(members));
    }

    pub fn remove(&self, idx: DeviceIdx) {
        let mut members = (**self.members.load()).clone();
        members.retain(|m| m.idx != idx);
        self.members.store(Arc::new(members));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    /// Next `nr` distinct devices in weighted round-robin order.
    #[must_use]
    pub fn next_devices(&self, nr: usize) -> Vec<DeviceIdx> {
        let members = self.members.load();
        if members.is_empty() {
            return Vec::new();
        }
        let start = self.cur.fetch_add(1, Ordering::Relaxed) as usize;
        (0..members.len().min(nr))
            .map(|i| members[(start + i) % members.len()].idx)
            .collect()
    }
}

// ── Device set ──────────────────────────────────────────────────────────────

/// Every cache device in the set, plus the open-bucket pool and write
/// points shared across them.
#[derive(Debug)]
pub struct DeviceSet {
    devices: ArcSwap<Vec<Arc<CacheDevice>>>,
    add_lock: Mutex<Vec<AllocatorHandle>>,
    tiers: [CacheGroup; TIER_MAX as usize],
    pub open: OpenBucketPool,
    pub wps: open_bucket::WritePoints,
    journal: Arc<Journal>,
}

impl DeviceSet {
    #[must_use]
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            devices: ArcSwap::from_pointee(Vec::new()),
            add_lock: Mutex::new(Vec::new()),
            tiers: std::array::from_fn(|_| CacheGroup::new()),
            open: OpenBucketPool::new(),
            wps: open_bucket::WritePoints::new(),
            journal,
        }
    }

    /// Register a device and start its allocator thread.
    pub fn add_device(&self, dev: Arc<dyn SectorDevice>, config: DeviceConfig) -> Result<DeviceIdx> {
        let mut handles = self.add_lock.lock();
        let devices = self.devices.load();
        #[expect(clippy::cast_possible_truncation)]
        let idx = DeviceIdx(devices.len() as u8);

        let device = Arc::new(CacheDevice::new(idx, dev, config));
        let journal = Arc::clone(&self.journal);
        let thread_dev = Arc::clone(&device);
        let handle = std::thread::Builder::new()
            .name(format!("strata-alloc-{}", idx.0))
            .spawn(move || thread_dev.allocator_loop(journal))
            .map_err(StrataError::Io)?;

        handles.push(AllocatorHandle {
            device: Arc::clone(&device),
            handle: Some(handle),
        });

        let mut new_devices = (**devices).clone();
        new_devices.push(Arc::clone(&device));
        self.devices.store(Arc::new(new_devices));

        self.tiers[config.tier.get() as usize].add(GroupMember { idx, weight: 1 });
        drop(handles);

        info!(
            target: "strata::alloc",
            event = "device_added",
            dev = idx.0,
            nbuckets = config.nbuckets,
            tier = config.tier.get()
        );
        Ok(idx)
    }

    #[must_use]
    pub fn device(&self, idx: DeviceIdx) -> Option<Arc<CacheDevice>> {
        self.devices.load().get(idx.0 as usize).map(Arc::clone)
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<CacheDevice>> {
        (**self.devices.load()).clone()
    }

    #[must_use]
    pub fn tier_group(&self, tier: Tier) -> &CacheGroup {
        &self.tiers[tier.get() as usize]
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Whether `ptr` is stale (device missing counts as stale).
    #[must_use]
    pub fn ptr_stale(&self, ptr: &ExtentPtr) -> bool {
        self.device(ptr.dev).is_none_or(|dev| dev.ptr_stale(ptr))
    }

    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.devices
            .load()
            .iter()
            .map(|dev| dev.sectors_available())
            .sum()
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.devices
            .load()
            .iter()
            .map(|dev| dev.capacity_sectors())
            .sum()
    }

    /// Stop every allocator thread; used at teardown.
    pub fn stop_allocators(&self) {
        let mut handles = self.add_lock.lock();
        for handle in handles.iter_mut() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_block::MemSectorDevice;

    pub(crate) fn test_config(nbuckets: u64) -> DeviceConfig {
        DeviceConfig {
            nbuckets,
            bucket_sectors: 8,
            first_bucket: 0,
            tier: Tier::ZERO,
            policy: ReplacementPolicy::Lru,
            discard: false,
        }
    }

    pub(crate) fn test_set(nbuckets: u64) -> (Arc<DeviceSet>, DeviceIdx) {
        let journal = Arc::new(Journal::in_memory());
        let set = Arc::new(DeviceSet::new(journal));
        let dev = Arc::new(MemSectorDevice::new(nbuckets * 8));
        let idx = set.add_device(dev, test_config(nbuckets)).unwrap();
        (set, idx)
    }

    fn wait_for_free(device: &CacheDevice) {
        for _ in 0..200 {
            if device.free_lists.lock().queued_free() > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("allocator never refilled reserves");
    }

    #[test]
    fn allocator_fills_reserves_in_order() {
        let (set, idx) = test_set(64);
        let device = set.device(idx).unwrap();
        wait_for_free(&device);

        let bucket = device.bucket_alloc_blocking(ReserveClass::None).unwrap();
        assert!(bucket.0 < 64);
        // Metadata reserves are populated too.
        assert!(device.bucket_alloc(ReserveClass::Btree).is_ok());
        assert!(device.bucket_alloc(ReserveClass::Prio).is_ok());
        set.stop_allocators();
    }

    #[test]
    fn generations_are_journaled_before_reuse() {
        let (set, idx) = test_set(16);
        let device = set.device(idx).unwrap();
        let bucket = device.bucket_alloc_blocking(ReserveClass::None).unwrap();

        // The gen bump for this bucket must already be durable.
        let gen = device.bucket_gen(bucket).unwrap();
        assert_eq!(gen, Gen(1));
        assert!(set.journal().flushed_seq().0 >= 1);
        set.stop_allocators();
    }

    #[test]
    fn stale_pointer_detection() {
        let (set, idx) = test_set(16);
        let device = set.device(idx).unwrap();
        let bucket = device.bucket_alloc_blocking(ReserveClass::None).unwrap();
        let gen = device.bucket_gen(bucket).unwrap();

        let ptr = ExtentPtr {
            dev: idx,
            gen,
            offset: bucket.0 * device.bucket_sectors(),
        };
        assert!(!set.ptr_stale(&ptr));

        device.with_bucket_mut(bucket, |b| b.gen = b.gen.next());
        assert!(set.ptr_stale(&ptr));
        set.stop_allocators();
    }

    #[test]
    fn gen_never_decreases_through_invalidation() {
        let (set, idx) = test_set(8);
        let device = set.device(idx).unwrap();

        let mut last = vec![Gen(0); 8];
        for _ in 0..4 {
            let bucket = device.bucket_alloc_blocking(ReserveClass::None).unwrap();
            let gen = device.bucket_gen(bucket).unwrap();
            assert!(gen.after(last[bucket.0 as usize]) >= 0);
            last[bucket.0 as usize] = gen;
            // Release it as cached data so it can be invalidated again.
            device.with_bucket_mut(bucket, |b| b.mark = BucketMark::Cached);
            device.kick_allocator();
        }
        set.stop_allocators();
    }

    #[test]
    fn prio_clock_rescales_preserving_order() {
        let mut clock = PrioClock::new(1);
        let mut prios = [0_u16, 100, 200];
        clock.hand = u16::MAX - 10;
        prios[0] = clock.hand.wrapping_sub(500);
        prios[1] = clock.hand.wrapping_sub(300);
        prios[2] = clock.hand.wrapping_sub(100);

        clock.rescale(prios.iter_mut());
        let d0 = clock.hand.wrapping_sub(prios[0]);
        let d1 = clock.hand.wrapping_sub(prios[1]);
        let d2 = clock.hand.wrapping_sub(prios[2]);
        assert!(d0 > d1 && d1 > d2);
        assert_eq!(d0, 250);
    }

    #[test]
    fn partition_invariant_holds_at_rest() {
        let (set, idx) = test_set(32);
        let device = set.device(idx).unwrap();
        wait_for_free(&device);
        assert!(device.verify_partition());

        let bucket = device.bucket_alloc_blocking(ReserveClass::None).unwrap();
        // An allocated-but-unpinned bucket is the caller's to account
        // for; pin it the way the open-bucket layer would.
        device.with_bucket_mut(bucket, |b| {
            b.pin = 1;
            b.mark = BucketMark::Dirty;
        });
        assert!(device.verify_partition());
        set.stop_allocators();
    }

    #[test]
    fn group_round_robin_distinct_devices() {
        let journal = Arc::new(Journal::in_memory());
        let set = Arc::new(DeviceSet::new(journal));
        for _ in 0..3 {
            let dev = Arc::new(MemSectorDevice::new(64 * 8));
            set.add_device(dev, test_config(64)).unwrap();
        }

        let picked = set.tier_group(Tier::ZERO).next_devices(2);
        assert_eq!(picked.len(), 2);
        assert_ne!(picked[0], picked[1]);
        set.stop_allocators();
    }
}
