//! End-to-end engine scenarios: a cache set over in-memory devices,
//! cached devices in each mode, bypass and writeback behaviour, stale
//! pointer races, and the pressure invariants.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata::{
    Bio, BioOp, Bpos, BtreeId, CacheMode, CacheSet, CacheSetOpts, CachedDev, CachedDevConfig,
    DeviceConfig, KeyType, KeyVal, MemSectorDevice, ReplacementPolicy, SectorDevice, Tier, Volume,
};
use strata_error::Result;
use strata_types::{Bkey, Bval};

const BACKING_SECTORS: u64 = 32_768;
const CACHE_NBUCKETS: u64 = 64;
const BUCKET_SECTORS: u64 = 512;
const INODE: u64 = 100;

/// Cache device wrapper that can run a hook during the next read; used
/// to force a bucket-reuse race mid-I/O.
struct HookedDevice {
    inner: MemSectorDevice,
    on_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for HookedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedDevice").field("inner", &self.inner).finish()
    }
}

impl HookedDevice {
    fn new(nr_sectors: u64) -> Self {
        Self {
            inner: MemSectorDevice::new(nr_sectors),
            on_read: Mutex::new(None),
        }
    }

    fn hook_next_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_read.lock() = Some(Box::new(hook));
    }
}

impl SectorDevice for HookedDevice {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_sectors(sector, buf)?;
        if let Some(hook) = self.on_read.lock().take() {
            hook();
        }
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.inner.write_sectors(sector, buf)
    }

    fn discard(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        self.inner.discard(sector, nr_sectors)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn nr_sectors(&self) -> u64 {
        self.inner.nr_sectors()
    }

    fn supports_discard(&self) -> bool {
        self.inner.supports_discard()
    }
}

struct Rig {
    set: Arc<CacheSet>,
    dc: Arc<CachedDev>,
    backing: Arc<MemSectorDevice>,
    cache_dev: Arc<HookedDevice>,
}

fn rig(mode: CacheMode, tweak: impl FnOnce(&mut CachedDevConfig)) -> Rig {
    rig_with_opts(mode, CacheSetOpts::default(), tweak)
}

fn rig_with_opts(
    mode: CacheMode,
    opts: CacheSetOpts,
    tweak: impl FnOnce(&mut CachedDevConfig),
) -> Rig {
    let cache_dev = Arc::new(HookedDevice::new(CACHE_NBUCKETS * BUCKET_SECTORS));
    let set = CacheSet::open(
        "e2e",
        vec![(
            Arc::clone(&cache_dev) as Arc<dyn SectorDevice>,
            DeviceConfig {
                nbuckets: CACHE_NBUCKETS,
                bucket_sectors: BUCKET_SECTORS,
                first_bucket: 0,
                tier: Tier::ZERO,
                policy: ReplacementPolicy::Lru,
                discard: false,
            },
        )],
        opts,
    )
    .unwrap();

    let backing = Arc::new(MemSectorDevice::new(BACKING_SECTORS));
    let mut config = CachedDevConfig {
        cache_mode: mode,
        // Keep the worker out of the way unless a test opts in.
        writeback_running: false,
        ..CachedDevConfig::default()
    };
    tweak(&mut config);
    let dc = CachedDev::attach(
        Arc::clone(&set),
        Arc::clone(&backing) as Arc<dyn SectorDevice>,
        INODE,
        "e2e-backing",
        config,
    )
    .unwrap();

    Rig {
        set,
        dc,
        backing,
        cache_dev,
    }
}

fn pattern(len_sectors: u32, seed: u8) -> Vec<u8> {
    (0..(len_sectors as usize) << 9)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn write_at(dc: &Arc<CachedDev>, sector: u64, data: Vec<u8>) -> Bio {
    dc.make_request(Bio::write(INODE, sector, data))
}

fn read_at(dc: &Arc<CachedDev>, sector: u64, sectors: u32) -> Bio {
    dc.make_request(Bio::read(INODE, sector, sectors))
}

// ── Scenario: writeback then read ───────────────────────────────────────────

#[test]
fn writeback_write_then_read_hits_cache() {
    let r = rig(CacheMode::Writeback, |_| {});

    // 64 KiB at sector 0.
    let data = pattern(128, 7);
    let done = write_at(&r.dc, 0, data.clone());
    assert_eq!(done.error, 0);

    assert_eq!(r.dc.state(), strata::BdevState::Dirty);
    let obs = r.set.observables();
    // (free, cached, dirty, meta, btree)
    assert!(obs.devices[0].bucket_counts[2] >= 1, "no dirty buckets");
    // Data must not have reached the backing device.
    let mut backing_now = vec![0_u8; data.len()];
    r.backing.read_sectors(0, &mut backing_now).unwrap();
    assert!(backing_now.iter().all(|&b| b == 0));

    let misses_before = r.set.stats.cache_misses.load(Ordering::Relaxed);
    let bio = read_at(&r.dc, 0, 128);
    assert_eq!(bio.error, 0);
    assert_eq!(bio.data, data);
    assert_eq!(
        r.set.stats.cache_misses.load(Ordering::Relaxed),
        misses_before,
        "read of freshly written data must not miss"
    );
    r.set.shutdown().unwrap();
}

// ── Scenario: sequential bypass ─────────────────────────────────────────────

#[test]
fn sequential_run_bypasses_after_cutoff() {
    let r = rig(CacheMode::Writethrough, |config| {
        config.sequential_cutoff = 256 * 1024;
    });

    for i in 0..10_u64 {
        let done = write_at(&r.dc, i * 128, pattern(128, i as u8));
        assert_eq!(done.error, 0);
    }

    let sequential = r.set.stats.bypass_sequential.load(Ordering::Relaxed);
    assert!(
        sequential >= 7,
        "expected >= 7 sequential bypasses, got {sequential}"
    );

    // The early, cached bios have extents; the bypassed tail does not.
    let early = r
        .set
        .btree
        .lookup(BtreeId::Extents, Bpos::new(INODE, 0))
        .unwrap()
        .unwrap();
    assert_eq!(early.k.ty, KeyType::CachedExtent);
    let tail = r
        .set
        .btree
        .lookup(BtreeId::Extents, Bpos::new(INODE, 9 * 128))
        .unwrap();
    assert!(
        tail.is_none_or(|kv| kv.k.ty != KeyType::CachedExtent || kv.k.p.offset <= 9 * 128),
        "bypassed range must not be cached"
    );

    // Every byte is still correct via the backing device.
    for i in 0..10_u64 {
        let bio = read_at(&r.dc, i * 128, 128);
        assert_eq!(bio.error, 0);
        assert_eq!(bio.data, pattern(128, i as u8), "bio {i} data mismatch");
    }
    r.set.shutdown().unwrap();
}

// ── Scenario: stale-pointer retry ───────────────────────────────────────────

#[test]
fn stale_pointer_read_falls_back_to_backing() {
    let r = rig(CacheMode::Writethrough, |_| {});

    let data = pattern(8, 42);
    r.backing.write_sectors(0, &data).unwrap();
    // Populate the cache with the only pointer for this range.
    let done = write_at(&r.dc, 0, data.clone());
    assert_eq!(done.error, 0);

    let kv = r
        .set
        .btree
        .lookup(BtreeId::Extents, Bpos::new(INODE, 0))
        .unwrap()
        .unwrap();
    let ptr = kv.v.as_extent().unwrap().ptrs[0];
    let device = r.set.devs.device(ptr.dev).unwrap();
    let bucket = ptr.bucket(device.bucket_sectors());

    // Reuse the bucket mid-read: the generation bumps while the cache
    // read is in flight.
    let race_dev = Arc::clone(&device);
    r.cache_dev.hook_next_read(move || {
        race_dev.with_bucket_mut(bucket, |b| b.gen = b.gen.next());
    });

    let races_before = r.set.stats.cache_read_races.load(Ordering::Relaxed);
    let bio = read_at(&r.dc, 0, 8);
    assert_eq!(bio.error, 0);
    assert_eq!(bio.data, data);
    assert!(
        r.set.stats.cache_read_races.load(Ordering::Relaxed) > races_before,
        "stale completion must count a cache_read_race"
    );
    r.set.shutdown().unwrap();
}

// ── Scenario: writeback-overlap forces writeback ────────────────────────────

#[test]
fn keybuf_overlap_upgrades_writearound_write() {
    let r = rig(CacheMode::Writearound, |_| {});

    // Dirty key [0, 128) pending background writeback, not yet started.
    r.dc.keybuf.add(KeyVal::new(
        Bkey::new(Bpos::new(INODE, 128), 128, KeyType::Extent),
        Bval::None,
    ));

    // Foreground write [64, 192): would bypass under writearound, but
    // the overlap forces writeback.
    let data = pattern(128, 9);
    let done = write_at(&r.dc, 64, data.clone());
    assert_eq!(done.error, 0);

    // The unstarted keybuf key was dropped.
    assert!(r.dc.keybuf.is_empty());
    // The write went to the cache as dirty data, not to the backing.
    assert_eq!(r.dc.state(), strata::BdevState::Dirty);
    let kv = r
        .set
        .btree
        .lookup(BtreeId::Extents, Bpos::new(INODE, 64))
        .unwrap()
        .unwrap();
    assert_eq!(kv.k.ty, KeyType::Extent);
    let mut backing_now = vec![0_u8; data.len()];
    r.backing.read_sectors(64, &mut backing_now).unwrap();
    assert!(backing_now.iter().all(|&b| b == 0));

    // And reads see the new bytes.
    let bio = read_at(&r.dc, 64, 128);
    assert_eq!(bio.data, data);
    r.set.shutdown().unwrap();
}

// ── Scenario: shrinker reserve and recovery under pressure ──────────────────

#[test]
fn node_cache_pressure_does_not_break_lookups() {
    let r = rig_with_opts(
        CacheMode::Writethrough,
        CacheSetOpts {
            node_cache_capacity: 24,
            ..CacheSetOpts::default()
        },
        |_| {},
    );

    for i in 0..512_u64 {
        let done = write_at(&r.dc, i * 8, pattern(8, i as u8));
        assert_eq!(done.error, 0, "write {i} failed");
    }
    r.set.btree.flush_all().unwrap();

    let reserve = r.set.btree.cache.reserve();
    r.set.btree.cache.scan(usize::MAX);
    assert!(r.set.btree.cache.used() >= reserve.min(24));

    for i in [0_u64, 100, 255, 511] {
        let bio = read_at(&r.dc, i * 8, 8);
        assert_eq!(bio.error, 0);
        assert_eq!(bio.data, pattern(8, i as u8), "read {i} after pressure");
    }
    r.set.shutdown().unwrap();
}

// ── Laws: round trips per mode ──────────────────────────────────────────────

#[test]
fn round_trip_in_every_cache_mode() {
    for mode in [
        CacheMode::Writethrough,
        CacheMode::Writeback,
        CacheMode::Writearound,
        CacheMode::None,
    ] {
        let r = rig(mode, |_| {});
        let data = pattern(64, 0xA5);
        let done = write_at(&r.dc, 256, data.clone());
        assert_eq!(done.error, 0, "{mode}: write failed");

        let bio = read_at(&r.dc, 256, 64);
        assert_eq!(bio.error, 0, "{mode}: read failed");
        assert_eq!(bio.data, data, "{mode}: data mismatch");
        r.set.shutdown().unwrap();
    }
}

#[test]
fn background_writeback_drains_to_backing() {
    let r = rig(CacheMode::Writeback, |config| {
        config.writeback_running = true;
        config.writeback_percent = 0;
    });

    let data = pattern(128, 3);
    let done = write_at(&r.dc, 0, data.clone());
    assert_eq!(done.error, 0);

    // The worker copies the dirty range to the backing device.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let mut now = vec![0_u8; data.len()];
        r.backing.read_sectors(0, &mut now).unwrap();
        if now == data {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "writeback never drained"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    // Still readable, now as clean data.
    let bio = read_at(&r.dc, 0, 128);
    assert_eq!(bio.data, data);
    r.set.shutdown().unwrap();
}

// ── Flush, discard and detach edges ─────────────────────────────────────────

#[test]
fn empty_flush_bio_flushes_journal() {
    let r = rig(CacheMode::Writeback, |_| {});
    write_at(&r.dc, 0, pattern(8, 1));

    let flush = Bio {
        inode: INODE,
        sector: 0,
        nr_sectors: 0,
        op: BioOp::Write {
            flush: true,
            sync: false,
        },
        data: Vec::new(),
        error: 0,
    };
    let done = r.dc.make_request(flush);
    assert_eq!(done.error, 0);
    assert_eq!(r.set.journal.flushed_seq(), r.set.journal.last_seq());
    r.set.shutdown().unwrap();
}

#[test]
fn bypass_write_invalidates_cached_copy() {
    let r = rig(CacheMode::Writethrough, |_| {});

    let old = pattern(128, 1);
    assert_eq!(write_at(&r.dc, 0, old).error, 0);

    // A discard bypasses and knocks the cached copy out.
    let done = r.dc.make_request(Bio::discard(INODE, 0, 128));
    assert_eq!(done.error, 0);

    let kv = r
        .set
        .btree
        .lookup(BtreeId::Extents, Bpos::new(INODE, 0))
        .unwrap()
        .unwrap();
    assert_eq!(kv.k.ty, KeyType::Discard, "cached copy must be invalidated");

    // Reads now come from the (discarded, zeroed) backing device.
    let bio = read_at(&r.dc, 0, 128);
    assert_eq!(bio.error, 0);
    assert!(bio.data.iter().all(|&b| b == 0));
    r.set.shutdown().unwrap();
}

#[test]
fn stopped_device_errors_with_enodev() {
    let r = rig(CacheMode::Writethrough, |_| {});
    r.dc.stop();
    let bio = read_at(&r.dc, 0, 8);
    assert_eq!(bio.error, libc::ENODEV);
    r.set.shutdown().unwrap();
}

#[test]
fn detached_device_passes_through() {
    let r = rig(CacheMode::Writethrough, |_| {});
    r.dc.detach();

    let data = pattern(16, 8);
    let done = write_at(&r.dc, 512, data.clone());
    assert_eq!(done.error, 0);

    // Straight to backing, nothing cached.
    let mut now = vec![0_u8; data.len()];
    r.backing.read_sectors(512, &mut now).unwrap();
    assert_eq!(now, data);
    assert_eq!(r.dc.state(), strata::BdevState::NoCache);
    r.set.shutdown().unwrap();
}

// ── Blockdev volumes ────────────────────────────────────────────────────────

#[test]
fn volume_round_trip_and_enospc() {
    let r = rig(CacheMode::Writethrough, |_| {});
    let volume = Volume::create(Arc::clone(&r.set), 7, BACKING_SECTORS).unwrap();

    let data = pattern(64, 0x3C);
    let done = volume.make_request(Bio::write(7, 128, data.clone()));
    assert_eq!(done.error, 0);

    let bio = volume.make_request(Bio::read(7, 128, 64));
    assert_eq!(bio.error, 0);
    assert_eq!(bio.data, data);

    // Unwritten ranges read zeroes.
    let hole = volume.make_request(Bio::read(7, 1024, 16));
    assert!(hole.data.iter().all(|&b| b == 0));

    // A write beyond the cache's free space fails with ENOSPC.
    let available = r.set.sectors_available();
    let too_big = u32::try_from(available + 128).unwrap();
    let huge = volume.make_request(Bio {
        inode: 7,
        sector: 0,
        nr_sectors: too_big,
        op: BioOp::Write {
            flush: false,
            sync: false,
        },
        data: vec![0_u8; (too_big as usize) << 9],
        error: 0,
    });
    assert_eq!(huge.error, libc::ENOSPC);
    r.set.shutdown().unwrap();
}

// ── Torture knob ────────────────────────────────────────────────────────────

#[test]
fn bypass_torture_still_round_trips() {
    let r = rig(CacheMode::Writethrough, |config| {
        config.bypass_torture_test = true;
    });

    for i in 0..32_u64 {
        assert_eq!(write_at(&r.dc, i * 16, pattern(16, i as u8)).error, 0);
    }
    for i in 0..32_u64 {
        let bio = read_at(&r.dc, i * 16, 16);
        assert_eq!(bio.error, 0);
        assert_eq!(bio.data, pattern(16, i as u8), "torture read {i}");
    }
    r.set.shutdown().unwrap();
}
