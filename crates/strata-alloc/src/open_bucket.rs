//! Open buckets and write points.
//!
//! An open bucket is a bucket (one per replica, on distinct devices)
//! currently being written to; it stays pinned until its sectors are
//! exhausted and every in-flight writer has finished. A write point is a
//! long-lived slot batching related writes into the same open bucket so
//! data written together lands together.
//!
//! Allocation protocol: `alloc_sectors_start` ensures the write point
//! has an open bucket with space on enough distinct devices,
//! `alloc_sectors_append_ptrs` emits extent pointers covering the next
//! `n` sectors, and `alloc_sectors_done` releases the open bucket back
//! to the pool once drained.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use strata_closure::{Closure, WaitList};
use strata_error::{Result, StrataError};
use strata_types::{
    BucketIdx, BucketMark, DeviceIdx, Extent, ExtentPtr, Gen, ReserveClass, Tier,
};
use tracing::{debug, trace};

use crate::{CacheDevice, DeviceSet};

/// Enough for 16 cache devices, 2 tiers and some left over for
/// pipelining.
pub const OPEN_BUCKETS_COUNT: usize = 256;

pub const WRITE_POINT_COUNT: usize = 16;

/// How an allocation behaves when the reserve FIFO is empty.
#[derive(Debug, Clone, Copy)]
pub enum AllocHow<'a> {
    /// Fail with `NoMem` immediately.
    NoWait,
    /// Block on the allocator.
    Blocking,
    /// Park `cl` on the allocator wait list and fail; the closure
    /// re-fires when buckets become available.
    Wait(&'a Closure),
}

#[derive(Debug)]
struct ObPtr {
    dev: DeviceIdx,
    bucket: BucketIdx,
    gen: Gen,
    /// Device sector the next append lands at.
    cursor: u64,
}

#[derive(Debug, Default)]
struct ObState {
    ptrs: Vec<ObPtr>,
    sectors_free: u32,
    mark: BucketMark,
    /// No longer reachable from a write point; release once unpinned.
    detached: bool,
}

/// A pinned set of replica buckets being filled by writes.
#[derive(Debug, Default)]
pub struct OpenBucket {
    state: Mutex<ObState>,
    /// In-flight users (writers between start and done).
    pin: AtomicU32,
}

impl OpenBucket {
    #[must_use]
    pub fn sectors_free(&self) -> u32 {
        self.state.lock().sectors_free
    }

    #[must_use]
    pub fn nr_ptrs(&self) -> usize {
        self.state.lock().ptrs.len()
    }
}

/// Fixed pool of open-bucket shells.
#[derive(Debug)]
pub struct OpenBucketPool {
    free: Mutex<Vec<Arc<OpenBucket>>>,
    /// Closures parked until a shell is released.
    pub wait: WaitList,
}

impl Default for OpenBucketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenBucketPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: Mutex::new(
                (0..OPEN_BUCKETS_COUNT)
                    .map(|_| Arc::new(OpenBucket::default()))
                    .collect(),
            ),
            wait: WaitList::new(),
        }
    }

    fn take(&self) -> Option<Arc<OpenBucket>> {
        self.free.lock().pop()
    }

    fn put(&self, ob: Arc<OpenBucket>) {
        self.free.lock().push(ob);
        self.wait.wake_all();
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// A slot batching related writes into one open bucket.
#[derive(Debug)]
pub struct WritePoint {
    ob: Mutex<Option<Arc<OpenBucket>>>,
    /// Tier replicas are placed in.
    tier: Tier,
    /// For tracing only.
    name: &'static str,
}

impl WritePoint {
    #[must_use]
    pub fn new(name: &'static str, tier: Tier) -> Self {
        Self {
            ob: Mutex::new(None),
            tier,
            name,
        }
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// The write points a cache set runs with: a hashed set for foreground
/// writes plus dedicated points for btree nodes, promotes and tiering so
/// metadata and background traffic never fragment foreground buckets.
#[derive(Debug)]
pub struct WritePoints {
    foreground: Vec<WritePoint>,
    pub btree: WritePoint,
    pub promote: WritePoint,
    pub tiering: WritePoint,
}

impl Default for WritePoints {
    fn default() -> Self {
        Self::new()
    }
}

impl WritePoints {
    #[must_use]
    pub fn new() -> Self {
        Self {
            foreground: (0..WRITE_POINT_COUNT)
                .map(|_| WritePoint::new("foreground", Tier::ZERO))
                .collect(),
            btree: WritePoint::new("btree", Tier::ZERO),
            promote: WritePoint::new("promote", Tier::ZERO),
            tiering: WritePoint::new("tiering", Tier::ZERO),
        }
    }

    /// Foreground write point for a task, hashed so unrelated tasks use
    /// different buckets.
    #[must_use]
    pub fn foreground(&self, task: u64) -> &WritePoint {
        let slot = (task.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize;
        &self.foreground[slot % self.foreground.len()]
    }
}

impl DeviceSet {
    fn bucket_alloc_how(
        &self,
        device: &CacheDevice,
        reserve: ReserveClass,
        how: &AllocHow<'_>,
    ) -> Result<BucketIdx> {
        match how {
            AllocHow::NoWait => device.bucket_alloc(reserve),
            AllocHow::Blocking => device.bucket_alloc_blocking(reserve),
            AllocHow::Wait(cl) => match device.bucket_alloc(reserve) {
                Ok(bucket) => Ok(bucket),
                Err(StrataError::NoMem) => Err(device.bucket_alloc_wait(reserve, cl)),
                Err(err) => Err(err),
            },
        }
    }

    /// Ensure `wp` has an open bucket with free space and at least
    /// `nr_replicas` pointers on distinct devices; pin and return it.
    pub fn alloc_sectors_start(
        &self,
        wp: &WritePoint,
        nr_replicas: usize,
        reserve: ReserveClass,
        mark: BucketMark,
        how: &AllocHow<'_>,
    ) -> Result<Arc<OpenBucket>> {
        debug_assert!(nr_replicas >= 1);
        let mut slot = wp.ob.lock();

        if let Some(ob) = slot.take() {
            let reuse = {
                let state = ob.state.lock();
                state.sectors_free > 0 && state.ptrs.len() >= nr_replicas && state.mark == mark
            };
            if reuse {
                ob.pin.fetch_add(1, Ordering::AcqRel);
                *slot = Some(Arc::clone(&ob));
                return Ok(ob);
            }
            // Retire the drained (or mismatched) open bucket. A writer
            // still between start and done keeps it alive via its pin;
            // the last done releases it.
            ob.state.lock().detached = true;
            if ob.pin.load(Ordering::Acquire) == 0 {
                self.open_bucket_release(&ob);
            }
        }

        let group = self.tier_group(wp.tier);
        let candidates = group.next_devices(nr_replicas.max(1));
        if candidates.len() < nr_replicas {
            return Err(StrataError::NoDisk);
        }

        let ob = match self.open.take() {
            Some(ob) => ob,
            None => match how {
                AllocHow::Wait(cl) => {
                    self.open.wait.wait(cl);
                    return Err(StrataError::NoMem);
                }
                _ => return Err(StrataError::NoMem),
            },
        };

        let mut acquired: Vec<(Arc<CacheDevice>, BucketIdx)> = Vec::with_capacity(nr_replicas);
        for idx in candidates.into_iter().take(nr_replicas) {
            let Some(device) = self.device(idx) else {
                continue;
            };
            match self.bucket_alloc_how(&device, reserve, how) {
                Ok(bucket) => acquired.push((device, bucket)),
                Err(err) => {
                    // Unwind: return what we took, shell back to pool.
                    for (device, bucket) in acquired {
                        device.bucket_unalloc(reserve, bucket);
                    }
                    self.open.put(ob);
                    return Err(err);
                }
            }
        }
        if acquired.len() < nr_replicas {
            for (device, bucket) in acquired {
                device.bucket_unalloc(reserve, bucket);
            }
            self.open.put(ob);
            return Err(StrataError::NoDisk);
        }

        let mut sectors_free = u32::MAX;
        let mut ptrs = Vec::with_capacity(acquired.len());
        for (device, bucket) in &acquired {
            let gen = device.with_bucket_mut(*bucket, |b| {
                b.pin += 1;
                b.mark = mark;
                b.gen
            });
            #[expect(clippy::cast_possible_truncation)]
            let bucket_sectors = device.bucket_sectors() as u32;
            sectors_free = sectors_free.min(bucket_sectors);
            ptrs.push(ObPtr {
                dev: device.idx,
                bucket: *bucket,
                gen,
                cursor: bucket.0 * device.bucket_sectors(),
            });
        }

        {
            let mut state = ob.state.lock();
            state.ptrs = ptrs;
            state.sectors_free = sectors_free;
            state.mark = mark;
        }
        ob.pin.store(1, Ordering::Release);
        *slot = Some(Arc::clone(&ob));
        drop(slot);

        debug!(
            target: "strata::alloc",
            event = "open_bucket",
            write_point = wp.name,
            replicas = nr_replicas,
            sectors_free = ob.sectors_free()
        );
        Ok(ob)
    }

    /// Emit pointers into `extent` covering the next `sectors` sectors
    /// of every replica of `ob`.
    pub fn alloc_sectors_append_ptrs(&self, ob: &OpenBucket, extent: &mut Extent, sectors: u32) {
        let mut state = ob.state.lock();
        debug_assert!(sectors <= state.sectors_free);
        for ptr in &mut state.ptrs {
            extent.ptrs.push(ExtentPtr {
                dev: ptr.dev,
                gen: ptr.gen,
                offset: ptr.cursor,
            });
            ptr.cursor += u64::from(sectors);
            if let Some(device) = self.device(ptr.dev) {
                device.with_bucket_mut(ptr.bucket, |b| b.sectors_used += sectors);
            }
        }
        state.sectors_free -= sectors;
        trace!(
            target: "strata::alloc",
            event = "sectors_appended",
            sectors = sectors,
            sectors_free = state.sectors_free
        );
    }

    /// Drop one writer's pin; release the open bucket if it is drained
    /// (or detached) and unpinned.
    pub fn alloc_sectors_done(&self, wp: &WritePoint, ob: Arc<OpenBucket>) {
        let (drained, detached) = {
            let state = ob.state.lock();
            (state.sectors_free == 0, state.detached)
        };
        if drained {
            let mut slot = wp.ob.lock();
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &ob))
            {
                *slot = None;
            }
        }

        if ob.pin.fetch_sub(1, Ordering::AcqRel) == 1 && (drained || detached) {
            self.open_bucket_release(&ob);
        }
    }

    /// Unpin every bucket and return the shell to the pool.
    fn open_bucket_release(&self, ob: &Arc<OpenBucket>) {
        let ptrs = {
            let mut state = ob.state.lock();
            state.sectors_free = 0;
            state.detached = false;
            std::mem::take(&mut state.ptrs)
        };
        for ptr in ptrs {
            if let Some(device) = self.device(ptr.dev) {
                device.with_bucket_mut(ptr.bucket, |b| b.pin = b.pin.saturating_sub(1));
            }
        }
        self.open.put(Arc::clone(ob));
    }

    /// Allocate up to `want_sectors` for an extent: start, append,
    /// done. Returns the sectors actually covered (at least one).
    pub fn alloc_sectors(
        &self,
        wp: &WritePoint,
        extent: &mut Extent,
        nr_replicas: usize,
        want_sectors: u32,
        reserve: ReserveClass,
        mark: BucketMark,
        how: &AllocHow<'_>,
    ) -> Result<u32> {
        let ob = self.alloc_sectors_start(wp, nr_replicas, reserve, mark, how)?;
        let sectors = want_sectors.min(ob.sectors_free()).max(1);
        self.alloc_sectors_append_ptrs(&ob, extent, sectors);
        self.alloc_sectors_done(wp, ob);
        Ok(sectors)
    }

    /// Retire a write point's current open bucket, if any.
    pub fn wp_retire(&self, wp: &WritePoint) {
        if let Some(ob) = wp.ob.lock().take() {
            ob.state.lock().detached = true;
            if ob.pin.load(Ordering::Acquire) == 0 {
                self.open_bucket_release(&ob);
            }
        }
    }

    /// Allocate space for one btree node and return its pointer key
    /// value. Btree nodes are single-replica, contiguous, and come from
    /// the btree reserve so they never wait behind user I/O.
    pub fn alloc_btree_node(&self, sectors: u32) -> Result<Extent> {
        for _ in 0..2 {
            let mut extent = Extent::default();
            let got = self.alloc_sectors(
                &self.wps.btree,
                &mut extent,
                1,
                sectors,
                ReserveClass::Btree,
                BucketMark::Btree,
                &AllocHow::Blocking,
            )?;
            if got >= sectors {
                return Ok(extent);
            }
            // The tail of the current bucket is too small for a
            // contiguous node; take a fresh bucket.
            self.wp_retire(&self.wps.btree);
        }
        Err(StrataError::NoSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_set;
    use strata_types::IoDir;

    #[test]
    fn alloc_sectors_emits_pointers() {
        let (set, idx) = test_set(64);
        let device = set.device(idx).unwrap();

        let wp = WritePoint::new("test", Tier::ZERO);
        let mut extent = Extent::default();
        let sectors = set
            .alloc_sectors(
                &wp,
                &mut extent,
                1,
                4,
                ReserveClass::None,
                BucketMark::Dirty,
                &AllocHow::Blocking,
            )
            .unwrap();

        assert_eq!(sectors, 4);
        assert_eq!(extent.ptrs.len(), 1);
        let ptr = extent.ptrs[0];
        assert_eq!(ptr.dev, idx);
        assert!(!device.ptr_stale(&ptr));

        let bucket = device.bucket(ptr.bucket(device.bucket_sectors())).unwrap();
        assert_eq!(bucket.mark, BucketMark::Dirty);
        assert_eq!(bucket.sectors_used, 4);
        assert_eq!(bucket.pin, 1);
        set.stop_allocators();
    }

    #[test]
    fn write_point_batches_consecutive_writes() {
        let (set, _idx) = test_set(64);
        let wp = WritePoint::new("test", Tier::ZERO);

        let mut a = Extent::default();
        let mut b = Extent::default();
        set.alloc_sectors(&wp, &mut a, 1, 2, ReserveClass::None, BucketMark::Dirty, &AllocHow::Blocking)
            .unwrap();
        set.alloc_sectors(&wp, &mut b, 1, 2, ReserveClass::None, BucketMark::Dirty, &AllocHow::Blocking)
            .unwrap();

        // Same bucket, consecutive sectors.
        assert_eq!(a.ptrs[0].dev, b.ptrs[0].dev);
        assert_eq!(a.ptrs[0].offset + 2, b.ptrs[0].offset);
        set.stop_allocators();
    }

    #[test]
    fn drained_open_bucket_is_released() {
        let (set, idx) = test_set(64);
        let device = set.device(idx).unwrap();
        let bucket_sectors = u32::try_from(device.bucket_sectors()).unwrap();

        let wp = WritePoint::new("test", Tier::ZERO);
        let mut extent = Extent::default();
        let before = set.open.available();
        set.alloc_sectors(
            &wp,
            &mut extent,
            1,
            bucket_sectors,
            ReserveClass::None,
            BucketMark::Cached,
            &AllocHow::Blocking,
        )
        .unwrap();

        // Fully consumed: shell back in the pool, bucket unpinned.
        assert_eq!(set.open.available(), before);
        let bucket = device
            .bucket(extent.ptrs[0].bucket(device.bucket_sectors()))
            .unwrap();
        assert_eq!(bucket.pin, 0);
        assert_eq!(bucket.sectors_used, bucket_sectors);
        set.stop_allocators();
    }

    #[test]
    fn nowait_fails_when_reserves_empty() {
        let (set, idx) = test_set(4);
        let device = set.device(idx).unwrap();

        // Drain everything the allocator can produce; two quiet rounds
        // in a row means it has nothing left.
        let mut taken = Vec::new();
        let mut quiet_rounds = 0;
        while quiet_rounds < 2 {
            let mut drained = true;
            for reserve in ReserveClass::ALL {
                if let Ok(bucket) = device.bucket_alloc(reserve) {
                    taken.push(bucket);
                    drained = false;
                }
            }
            if drained && device.sectors_available() == 0 {
                quiet_rounds += 1;
                std::thread::sleep(std::time::Duration::from_millis(20));
            } else {
                quiet_rounds = 0;
            }
        }

        let wp = WritePoint::new("test", Tier::ZERO);
        let mut extent = Extent::default();
        let err = set.alloc_sectors(
            &wp,
            &mut extent,
            1,
            1,
            ReserveClass::None,
            BucketMark::Dirty,
            &AllocHow::NoWait,
        );
        assert!(matches!(err, Err(StrataError::NoMem)));
        set.stop_allocators();
    }

    #[test]
    fn btree_node_alloc_marks_bucket() {
        let (set, idx) = test_set(64);
        let device = set.device(idx).unwrap();

        let extent = set.alloc_btree_node(4).unwrap();
        let ptr = extent.ptrs[0];
        let bucket = device.bucket(ptr.bucket(device.bucket_sectors())).unwrap();
        assert_eq!(bucket.mark, BucketMark::Btree);
        set.stop_allocators();
    }

    #[test]
    fn touch_bucket_tracks_hand() {
        let (set, idx) = test_set(64);
        let device = set.device(idx).unwrap();

        device.add_io_time(IoDir::Read, 10_000);
        let hand = device.prio_hand(IoDir::Read);
        assert!(hand > 0);

        device.touch_bucket(BucketIdx(5), IoDir::Read);
        assert_eq!(device.bucket(BucketIdx(5)).unwrap().read_prio, hand);
        set.stop_allocators();
    }
}
