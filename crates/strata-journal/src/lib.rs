#![forbid(unsafe_code)]
//! Journal sequencing for strata metadata updates.
//!
//! The rest of the engine consumes a narrow contract: every metadata
//! update gets a monotone [`JournalSeq`]; `flush_seq` makes everything
//! up to a sequence durable; `meta_async` flushes on the journal worker
//! and releases a closure when done. Generation bumps must be journaled
//! before their buckets reappear on a reserve FIFO, and btree root swaps
//! must be journaled before the old root is reused; both reduce to
//! "update, then flush_seq" here.
//!
//! Records are crc32c-framed onto a reserved device region when one is
//! configured; replay is handled at open time by the superblock layer
//! and is out of scope here. A journal write failure poisons the
//! journal, which the cache set maps to read-only.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_block::SectorDevice;
use strata_closure::{Closure, WorkerPool};
use strata_error::{Result, StrataError};
use strata_types::{BtreeId, BucketIdx, DeviceIdx, Gen, JournalSeq, KeyVal, SECTOR_SHIFT};
use tracing::{debug, error, trace};

const JOURNAL_MAGIC: u32 = 0x5354_4A4C;

/// One journaled metadata update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// Bucket generations advanced by the allocator.
    GenSet(Vec<(DeviceIdx, BucketIdx, Gen)>),
    /// Keys inserted into a btree.
    Keys { btree: BtreeId, keys: Vec<KeyVal> },
    /// A btree root was replaced.
    RootSwap { btree: BtreeId, level: u8, key: KeyVal },
}

/// Reserved journal region on a cache device, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRegion {
    pub start: u64,
    pub nr_sectors: u64,
}

#[derive(Debug)]
struct JournalState {
    /// Sequence of the most recent update. Zero = none yet.
    seq: u64,
    /// Everything at or below this sequence is durable.
    flushed_seq: u64,
    /// Updates not yet written out, oldest first.
    buffered: Vec<(u64, JournalEntry)>,
    /// Next write offset within the region, relative to its start.
    write_pos: u64,
}

struct Backing {
    dev: Arc<dyn SectorDevice>,
    region: JournalRegion,
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backing").field("region", &self.region).finish()
    }
}

/// The journal. One per cache set.
#[derive(Debug)]
pub struct Journal {
    state: Mutex<JournalState>,
    /// Serializes writers of the on-device ring.
    flush_lock: Mutex<()>,
    backing: Option<Backing>,
    pool: WorkerPool,
    poisoned: AtomicBool,
}

impl Journal {
    /// Journal backed by a device region.
    #[must_use]
    pub fn on_device(dev: Arc<dyn SectorDevice>, region: JournalRegion) -> Self {
        Self {
            state: Mutex::new(JournalState {
                seq: 0,
                flushed_seq: 0,
                buffered: Vec::new(),
                write_pos: 0,
            }),
            flush_lock: Mutex::new(()),
            backing: Some(Backing { dev, region }),
            pool: WorkerPool::new("strata-journal", 1),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Journal with no backing region; sequencing and flush ordering
    /// only. Used by tests and volatile cache sets.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(JournalState {
                seq: 0,
                flushed_seq: 0,
                buffered: Vec::new(),
                write_pos: 0,
            }),
            flush_lock: Mutex::new(()),
            backing: None,
            pool: WorkerPool::new("strata-journal", 1),
            poisoned: AtomicBool::new(false),
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(StrataError::Inconsistent(
                "journal write failed".to_owned(),
            ));
        }
        Ok(())
    }

    /// Record an update and return its sequence number.
    pub fn update(&self, entry: JournalEntry) -> Result<JournalSeq> {
        self.check_poisoned()?;
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state.buffered.push((seq, entry));
        trace!(target: "strata::journal", event = "update", seq = seq);
        Ok(JournalSeq(seq))
    }

    /// Sequence of the most recent update.
    #[must_use]
    pub fn last_seq(&self) -> JournalSeq {
        JournalSeq(self.state.lock().seq)
    }

    /// Highest durable sequence.
    #[must_use]
    pub fn flushed_seq(&self) -> JournalSeq {
        JournalSeq(self.state.lock().flushed_seq)
    }

    /// Make every update at or below `seq` durable.
    pub fn flush_seq(&self, seq: JournalSeq) -> Result<()> {
        self.check_poisoned()?;
        let _flush_guard = self.flush_lock.lock();

        let (to_write, mut pos) = {
            let state = self.state.lock();
            if state.flushed_seq >= seq.0 {
                return Ok(());
            }
            let to_write: Vec<(u64, JournalEntry)> = state
                .buffered
                .iter()
                .filter(|(s, _)| *s <= seq.0)
                .cloned()
                .collect();
            (to_write, state.write_pos)
        };

        if let Some(backing) = &self.backing {
            let result = (|| -> Result<u64> {
                for (entry_seq, entry) in &to_write {
                    pos = Self::append_record(backing, pos, *entry_seq, entry)?;
                }
                backing.dev.flush()?;
                Ok(pos)
            })();

            match result {
                Ok(new_pos) => self.state.lock().write_pos = new_pos,
                Err(err) => {
                    self.poisoned.store(true, Ordering::Release);
                    error!(
                        target: "strata::journal",
                        event = "write_failed",
                        error = %err
                    );
                    return Err(StrataError::Inconsistent(
                        "journal write failed".to_owned(),
                    ));
                }
            }
        }

        let mut state = self.state.lock();
        if state.flushed_seq < seq.0 {
            state.flushed_seq = seq.0;
        }
        let flushed = state.flushed_seq;
        state.buffered.retain(|(s, _)| *s > flushed);
        drop(state);

        debug!(target: "strata::journal", event = "flush", seq = seq.0);
        Ok(())
    }

    /// Record an update and flush it on the journal worker; `cl` is
    /// released once the entry is durable (or the journal is poisoned).
    pub fn meta_async(self: &Arc<Self>, entry: JournalEntry, cl: &Closure) -> Result<JournalSeq> {
        let seq = self.update(entry)?;
        cl.get();
        let journal = Arc::clone(self);
        let cl = cl.clone();
        self.pool.submit(move || {
            if let Err(err) = journal.flush_seq(seq) {
                error!(
                    target: "strata::journal",
                    event = "meta_async_failed",
                    seq = seq.0,
                    error = %err
                );
            }
            cl.put();
        });
        Ok(seq)
    }

    /// True once a journal write has failed; the cache set must go
    /// read-only.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Drain the journal worker; used at teardown.
    pub fn quiesce(&self) {
        self.pool.drain();
    }

    // Record framing: magic, seq, payload len, crc32c(payload), payload,
    // zero-padded to a sector boundary.
    fn append_record(
        backing: &Backing,
        pos: u64,
        seq: u64,
        entry: &JournalEntry,
    ) -> Result<u64> {
        let payload = serde_json::to_vec(entry)
            .map_err(|err| StrataError::Io(std::io::Error::other(err)))?;

        let mut record = Vec::with_capacity(20 + payload.len());
        record.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        record.extend_from_slice(&seq.to_le_bytes());
        #[expect(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        let sector_bytes = 1_usize << SECTOR_SHIFT;
        let padded = record.len().div_ceil(sector_bytes) * sector_bytes;
        record.resize(padded, 0);

        let nr_sectors = (padded >> SECTOR_SHIFT as usize) as u64;
        let region = backing.region;
        // Wrap the ring rather than split a record across the seam.
        let pos = if pos + nr_sectors > region.nr_sectors {
            0
        } else {
            pos
        };
        if nr_sectors > region.nr_sectors {
            return Err(StrataError::Io(std::io::Error::other(
                "journal record exceeds region",
            )));
        }

        backing.dev.write_sectors(region.start + pos, &record)?;
        Ok(pos + nr_sectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_block::MemSectorDevice;
    use strata_types::{Bkey, Bpos, Bval, KeyType};

    fn gen_entry() -> JournalEntry {
        JournalEntry::GenSet(vec![(DeviceIdx(0), BucketIdx(3), Gen(7))])
    }

    #[test]
    fn sequences_are_monotone() {
        let journal = Journal::in_memory();
        let a = journal.update(gen_entry()).unwrap();
        let b = journal.update(gen_entry()).unwrap();
        assert!(b > a);
        assert_eq!(journal.last_seq(), b);
    }

    #[test]
    fn flush_advances_flushed_seq() {
        let journal = Journal::in_memory();
        let seq = journal.update(gen_entry()).unwrap();
        assert_eq!(journal.flushed_seq(), JournalSeq(0));
        journal.flush_seq(seq).unwrap();
        assert_eq!(journal.flushed_seq(), seq);
    }

    #[test]
    fn device_backed_flush_writes_frames() {
        let dev = Arc::new(MemSectorDevice::new(256));
        let journal = Journal::on_device(
            Arc::clone(&dev) as Arc<dyn SectorDevice>,
            JournalRegion {
                start: 0,
                nr_sectors: 256,
            },
        );

        let seq = journal
            .update(JournalEntry::Keys {
                btree: BtreeId::Extents,
                keys: vec![KeyVal::new(
                    Bkey::new(Bpos::new(1, 64), 64, KeyType::Extent),
                    Bval::None,
                )],
            })
            .unwrap();
        journal.flush_seq(seq).unwrap();

        let mut header = vec![0_u8; 512];
        dev.read_sectors(0, &mut header).unwrap();
        assert_eq!(&header[0..4], &JOURNAL_MAGIC.to_le_bytes());
        let len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[16..20].try_into().unwrap());
        assert_eq!(crc, crc32c::crc32c(&header[20..20 + len]));
    }

    #[test]
    fn meta_async_releases_closure_after_flush() {
        let journal = Arc::new(Journal::in_memory());
        let cl = Closure::new();
        let seq = journal.meta_async(gen_entry(), &cl).unwrap();
        cl.wait_sync();
        assert!(journal.flushed_seq() >= seq);
    }

    #[test]
    fn poisoned_journal_rejects_updates() {
        // A one-sector region cannot hold any record, so the first flush
        // poisons the journal.
        let dev = Arc::new(MemSectorDevice::new(1));
        let journal = Journal::on_device(
            dev as Arc<dyn SectorDevice>,
            JournalRegion {
                start: 0,
                nr_sectors: 0,
            },
        );
        let seq = journal.update(gen_entry()).unwrap();
        assert!(matches!(
            journal.flush_seq(seq),
            Err(StrataError::Inconsistent(_))
        ));
        assert!(journal.is_poisoned());
        assert!(journal.update(gen_entry()).is_err());
    }
}
