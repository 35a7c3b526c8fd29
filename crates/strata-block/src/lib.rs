#![forbid(unsafe_code)]
//! Sector-granular device layer.
//!
//! Provides the `SectorDevice` trait the rest of the engine is written
//! against, a file-backed implementation, an in-memory implementation
//! used by tests and flash-only setups, page-aligned buffers, the `Bio`
//! unit of client I/O, and per-device error accounting.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use strata_error::{Result, StrataError};
use strata_types::{SECTOR_SHIFT, SECTOR_SIZE};
use tracing::{debug, trace, warn};

const DEFAULT_BUF_ALIGNMENT: usize = 4096;

#[inline]
fn normalized_alignment(requested: usize) -> usize {
    if requested <= 1 {
        1
    } else if requested.is_power_of_two() {
        requested
    } else {
        requested.next_power_of_two()
    }
}

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Stays fully safe by keeping the original backing allocation and
/// exposing an aligned subslice.
#[derive(Debug, Clone)]
pub struct AlignedVec {
    storage: Vec<u8>,
    start: usize,
    len: usize,
    alignment: usize,
}

impl AlignedVec {
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Self {
        let alignment = normalized_alignment(alignment);
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
                alignment,
            };
        }

        let padding = alignment.saturating_sub(1);
        let storage = vec![0_u8; size.saturating_add(padding)];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        trace!(
            target: "strata::block::io",
            event = "buffer_alloc",
            size = size,
            alignment = alignment
        );
        Self {
            storage,
            start,
            len: size,
            alignment,
        }
    }

    /// A buffer sized for `sectors` sectors at the default alignment.
    #[must_use]
    pub fn for_sectors(sectors: u32) -> Self {
        Self::new((sectors as usize) << SECTOR_SHIFT, DEFAULT_BUF_ALIGNMENT)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

// ── Devices ─────────────────────────────────────────────────────────────────

/// A device addressed in 512-byte sectors.
pub trait SectorDevice: Send + Sync + std::fmt::Debug {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Discard a sector range. Devices without discard support return
    /// `Ok(())` without doing anything; callers that care check
    /// [`SectorDevice::supports_discard`].
    fn discard(&self, sector: u64, nr_sectors: u64) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn nr_sectors(&self) -> u64;

    fn supports_discard(&self) -> bool {
        false
    }
}

fn check_range(dev: &dyn SectorDevice, sector: u64, bytes: usize) -> Result<()> {
    let nr = (bytes as u64) >> u64::from(SECTOR_SHIFT);
    if bytes & (SECTOR_SIZE as usize - 1) != 0 {
        return Err(StrataError::Io(std::io::Error::other(
            "buffer not sector sized",
        )));
    }
    if sector.saturating_add(nr) > dev.nr_sectors() {
        return Err(StrataError::Io(std::io::Error::other("I/O past device end")));
    }
    Ok(())
}

/// File- or block-device-backed sector device using positional I/O.
#[derive(Debug)]
pub struct FileSectorDevice {
    file: Arc<File>,
    nr_sectors: u64,
}

impl FileSectorDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(
            target: "strata::block::io",
            event = "device_open",
            path = %path.display(),
            bytes = len
        );
        Ok(Self {
            file: Arc::new(file),
            nr_sectors: len >> u64::from(SECTOR_SHIFT),
        })
    }
}

impl SectorDevice for FileSectorDevice {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self, sector, buf.len())?;
        self.file
            .read_exact_at(buf, sector << u64::from(SECTOR_SHIFT))?;
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        check_range(self, sector, buf.len())?;
        self.file
            .write_all_at(buf, sector << u64::from(SECTOR_SHIFT))?;
        Ok(())
    }

    fn discard(&self, _sector: u64, _nr_sectors: u64) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }
}

/// In-memory sector device. Backs tests and flash-only volumes; tracks
/// discards so tests can assert on them.
#[derive(Debug)]
pub struct MemSectorDevice {
    bytes: Mutex<Vec<u8>>,
    discards: Mutex<Vec<(u64, u64)>>,
    supports_discard: bool,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new(nr_sectors: u64) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; (nr_sectors as usize) << SECTOR_SHIFT as usize]),
            discards: Mutex::new(Vec::new()),
            supports_discard: true,
        }
    }

    #[must_use]
    pub fn without_discard(nr_sectors: u64) -> Self {
        Self {
            supports_discard: false,
            ..Self::new(nr_sectors)
        }
    }

    /// Discard ranges issued so far, in order.
    #[must_use]
    pub fn discard_log(&self) -> Vec<(u64, u64)> {
        self.discards.lock().clone()
    }

    /// Fill a sector range with a byte pattern, bypassing the engine.
    pub fn fill(&self, sector: u64, nr_sectors: u64, byte: u8) {
        let start = (sector as usize) << SECTOR_SHIFT as usize;
        let end = start + ((nr_sectors as usize) << SECTOR_SHIFT as usize);
        let mut bytes = self.bytes.lock();
        bytes[start..end].fill(byte);
    }
}

impl SectorDevice for MemSectorDevice {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self, sector, buf.len())?;
        let start = (sector as usize) << SECTOR_SHIFT as usize;
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        check_range(self, sector, buf.len())?;
        let start = (sector as usize) << SECTOR_SHIFT as usize;
        let mut bytes = self.bytes.lock();
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn discard(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        if self.supports_discard {
            self.discards.lock().push((sector, nr_sectors));
            self.fill(sector, nr_sectors, 0);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nr_sectors(&self) -> u64 {
        (self.bytes.lock().len() >> SECTOR_SHIFT as usize) as u64
    }

    fn supports_discard(&self) -> bool {
        self.supports_discard
    }
}

// ── Bios ────────────────────────────────────────────────────────────────────

/// Operation carried by a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write {
        /// REQ_PREFLUSH: flush prior writes before this one.
        flush: bool,
        /// REQ_FUA / sync write: durable before completion.
        sync: bool,
    },
    Discard,
}

impl BioOp {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write { .. } | Self::Discard)
    }
}

/// Unit of client I/O against a virtual device.
///
/// `data` is the write payload or the read destination; discards carry
/// no data and use `nr_sectors` alone.
#[derive(Debug)]
pub struct Bio {
    pub inode: u64,
    pub sector: u64,
    pub nr_sectors: u32,
    pub op: BioOp,
    pub data: Vec<u8>,
    /// Errno, set at completion. Zero means success.
    pub error: i32,
}

impl Bio {
    #[must_use]
    pub fn read(inode: u64, sector: u64, nr_sectors: u32) -> Self {
        Self {
            inode,
            sector,
            nr_sectors,
            op: BioOp::Read,
            data: vec![0_u8; (nr_sectors as usize) << SECTOR_SHIFT as usize],
            error: 0,
        }
    }

    #[must_use]
    pub fn write(inode: u64, sector: u64, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len() & (SECTOR_SIZE as usize - 1), 0);
        #[expect(clippy::cast_possible_truncation)]
        let nr_sectors = (data.len() >> SECTOR_SHIFT as usize) as u32;
        Self {
            inode,
            sector,
            nr_sectors,
            op: BioOp::Write {
                flush: false,
                sync: false,
            },
            data,
            error: 0,
        }
    }

    #[must_use]
    pub fn discard(inode: u64, sector: u64, nr_sectors: u32) -> Self {
        Self {
            inode,
            sector,
            nr_sectors,
            op: BioOp::Discard,
            data: Vec::new(),
            error: 0,
        }
    }

    #[must_use]
    pub fn with_flush(mut self, flush: bool) -> Self {
        if let BioOp::Write { sync, .. } = self.op {
            self.op = BioOp::Write { flush, sync };
        }
        self
    }

    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        if let BioOp::Write { flush, .. } = self.op {
            self.op = BioOp::Write { flush, sync };
        }
        self
    }

    /// First sector past the end of this bio.
    #[must_use]
    pub fn end_sector(&self) -> u64 {
        self.sector + u64::from(self.nr_sectors)
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        (self.nr_sectors as usize) << SECTOR_SHIFT as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nr_sectors == 0
    }

    /// Split off the first `sectors` sectors as a new bio, advancing
    /// this one past them.
    pub fn split_front(&mut self, sectors: u32) -> Self {
        debug_assert!(sectors <= self.nr_sectors);
        let split_bytes = (sectors as usize) << SECTOR_SHIFT as usize;
        let rest = self.data.split_off(split_bytes.min(self.data.len()));
        let front_data = std::mem::replace(&mut self.data, rest);

        let front = Self {
            inode: self.inode,
            sector: self.sector,
            nr_sectors: sectors,
            op: self.op,
            data: front_data,
            error: 0,
        };

        self.sector += u64::from(sectors);
        self.nr_sectors -= sectors;
        front
    }
}

// ── I/O error accounting ────────────────────────────────────────────────────

/// Knobs for the moving-window error accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoErrorConfig {
    /// Decayed error count above which the device is considered failed.
    pub limit: u64,
    /// Time for the decayed count to halve, in microseconds. Zero
    /// disables decay.
    pub halflife_us: u64,
}

impl Default for IoErrorConfig {
    fn default() -> Self {
        Self {
            limit: 8,
            halflife_us: 20_000_000,
        }
    }
}

#[derive(Debug)]
struct IoErrorState {
    /// Fixed point, 16 fractional bits.
    count_fp: u64,
    last_decay: Instant,
}

/// Decayed per-device I/O error counter.
///
/// Each error adds one; the count halves every `halflife_us`. Crossing
/// `limit` is reported once per crossing via the return of `add_error`.
#[derive(Debug)]
pub struct IoErrors {
    config: Mutex<IoErrorConfig>,
    state: Mutex<IoErrorState>,
}

const ERROR_FP_SHIFT: u32 = 16;

impl IoErrors {
    #[must_use]
    pub fn new(config: IoErrorConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(IoErrorState {
                count_fp: 0,
                last_decay: Instant::now(),
            }),
        }
    }

    pub fn set_config(&self, config: IoErrorConfig) {
        *self.config.lock() = config;
    }

    #[must_use]
    pub fn config(&self) -> IoErrorConfig {
        *self.config.lock()
    }

    fn decay_locked(state: &mut IoErrorState, halflife_us: u64, now: Instant) {
        if halflife_us == 0 {
            return;
        }
        let elapsed_us = now.duration_since(state.last_decay).as_micros();
        let halvings = (elapsed_us / u128::from(halflife_us)).min(63) as u32;
        if halvings > 0 {
            state.count_fp >>= halvings;
            state.last_decay = now;
        }
    }

    /// Record one error. Returns true if the decayed count now exceeds
    /// the configured limit.
    pub fn add_error(&self) -> bool {
        let config = *self.config.lock();
        let mut state = self.state.lock();
        Self::decay_locked(&mut state, config.halflife_us, Instant::now());
        state.count_fp = state.count_fp.saturating_add(1 << ERROR_FP_SHIFT);
        let exceeded = (state.count_fp >> ERROR_FP_SHIFT) > config.limit;
        if exceeded {
            warn!(
                target: "strata::block::io",
                event = "io_error_limit",
                count = state.count_fp >> ERROR_FP_SHIFT,
                limit = config.limit
            );
        }
        exceeded
    }

    /// Current decayed count.
    #[must_use]
    pub fn current(&self) -> u64 {
        let config = *self.config.lock();
        let mut state = self.state.lock();
        Self::decay_locked(&mut state, config.halflife_us, Instant::now());
        state.count_fp >> ERROR_FP_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn aligned_vec_respects_alignment() {
        for alignment in [1_usize, 512, 4096] {
            let buf = AlignedVec::new(8192, alignment);
            assert_eq!(buf.len(), 8192);
            assert_eq!(buf.as_slice().as_ptr() as usize % alignment, 0);
        }
    }

    #[test]
    fn aligned_vec_rounds_alignment_up() {
        let buf = AlignedVec::new(16, 100);
        assert_eq!(buf.alignment(), 128);
    }

    #[test]
    fn mem_device_round_trips() {
        let dev = MemSectorDevice::new(64);
        let data = vec![0xAB_u8; 2 << SECTOR_SHIFT as usize];
        dev.write_sectors(10, &data).unwrap();

        let mut out = vec![0_u8; data.len()];
        dev.read_sectors(10, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemSectorDevice::new(8);
        let mut buf = vec![0_u8; 1 << SECTOR_SHIFT as usize];
        assert!(dev.read_sectors(8, &mut buf).is_err());
        assert!(dev.write_sectors(7, &vec![0_u8; 1024]).is_err());
    }

    #[test]
    fn mem_device_logs_discards() {
        let dev = MemSectorDevice::new(64);
        dev.fill(4, 2, 0xFF);
        dev.discard(4, 2).unwrap();
        assert_eq!(dev.discard_log(), vec![(4, 2)]);

        let mut buf = vec![0xEE_u8; 2 << SECTOR_SHIFT as usize];
        dev.read_sectors(4, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn file_device_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; 64 << SECTOR_SHIFT as usize])
            .unwrap();
        tmp.flush().unwrap();

        let dev = FileSectorDevice::open(tmp.path()).unwrap();
        assert_eq!(dev.nr_sectors(), 64);

        let data = vec![0x5A_u8; 4 << SECTOR_SHIFT as usize];
        dev.write_sectors(8, &data).unwrap();
        let mut out = vec![0_u8; data.len()];
        dev.read_sectors(8, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn bio_split_front() {
        let mut bio = Bio::write(1, 100, vec![7_u8; 8 << SECTOR_SHIFT as usize]);
        let front = bio.split_front(3);

        assert_eq!(front.sector, 100);
        assert_eq!(front.nr_sectors, 3);
        assert_eq!(front.data.len(), 3 << SECTOR_SHIFT as usize);
        assert_eq!(bio.sector, 103);
        assert_eq!(bio.nr_sectors, 5);
        assert_eq!(bio.data.len(), 5 << SECTOR_SHIFT as usize);
    }

    #[test]
    fn io_errors_decay_and_trip_limit() {
        let errors = IoErrors::new(IoErrorConfig {
            limit: 2,
            halflife_us: 0,
        });
        assert!(!errors.add_error());
        assert!(!errors.add_error());
        assert!(errors.add_error());
        assert_eq!(errors.current(), 3);
    }
}
