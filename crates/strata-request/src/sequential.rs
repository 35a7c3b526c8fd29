//! Sequential-I/O detection.
//!
//! A small per-cached-device table of recent I/Os, keyed by the sector
//! each run last ended at. A bio continuing a run extends it; otherwise
//! the least recently used slot is recycled. Run lengths feed a
//! per-task exponentially weighted average, and the larger of the two
//! is what the bypass check compares against `sequential_cutoff`.

use std::time::{Duration, Instant};

pub const RECENT_IO: usize = 16;

/// A run goes stale if not extended within this window.
const RECENT_IO_WINDOW: Duration = Duration::from_secs(5);

const EWMA_WEIGHT: u32 = 3;

/// `avg <- (avg * (2^w - 1) + val) / 2^w`.
#[must_use]
pub fn ewma_add(avg: u64, val: u64, weight: u32) -> u64 {
    ((avg * ((1 << weight) - 1)) + val) >> weight
}

#[derive(Debug, Clone)]
struct RecentEntry {
    /// Sector right past the end of the run.
    last_sector: u64,
    run_bytes: u64,
    expires: Instant,
    stamp: u64,
}

/// Fixed table of recent runs, LRU-recycled.
#[derive(Debug)]
pub struct RecentIo {
    entries: Vec<RecentEntry>,
    clock: u64,
}

impl Default for RecentIo {
    fn default() -> Self {
        Self::new()
    }
}

impl RecentIo {
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            entries: (0..RECENT_IO)
                .map(|_| RecentEntry {
                    last_sector: u64::MAX,
                    run_bytes: 0,
                    expires: now,
                    stamp: 0,
                })
                .collect(),
            clock: 0,
        }
    }

    /// Record a bio against the table.
    ///
    /// Returns `(run_bytes, continued)`: the run length including this
    /// bio, and whether it extended an existing run (a fresh run means
    /// the caller should fold its previous run into the task average).
    pub fn note(&mut self, sector: u64, bytes: u64) -> (u64, bool) {
        let now = Instant::now();
        self.clock += 1;

        let slot = self
            .entries
            .iter()
            .position(|e| e.last_sector == sector && now < e.expires);

        let (slot, continued) = match slot {
            Some(slot) => (slot, true),
            None => {
                let lru = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.stamp)
                    .map_or(0, |(i, _)| i);
                self.entries[lru].run_bytes = 0;
                (lru, false)
            }
        };

        let entry = &mut self.entries[slot];
        entry.run_bytes = entry.run_bytes.saturating_add(bytes);
        entry.last_sector = sector + (bytes >> 9);
        entry.expires = now + RECENT_IO_WINDOW;
        entry.stamp = self.clock;
        (entry.run_bytes, continued)
    }
}

/// Per-task sequential accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskSeq {
    pub sequential_io: u64,
    pub sequential_io_avg: u64,
}

impl TaskSeq {
    /// Fold the finished run into the average and start fresh.
    pub fn add_sequential(&mut self) {
        self.sequential_io_avg = ewma_add(self.sequential_io_avg, self.sequential_io, EWMA_WEIGHT);
        self.sequential_io = 0;
    }

    /// Bytes the bypass check should weigh for this task.
    #[must_use]
    pub fn effective_bytes(&self) -> u64 {
        self.sequential_io.max(self.sequential_io_avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_bios_extend_a_run() {
        let mut table = RecentIo::new();
        let (run, continued) = table.note(0, 64 * 1024);
        assert_eq!(run, 64 * 1024);
        assert!(!continued);

        // Next bio starts where the previous ended (128 sectors).
        let (run, continued) = table.note(128, 64 * 1024);
        assert_eq!(run, 128 * 1024);
        assert!(continued);
    }

    #[test]
    fn non_consecutive_bios_recycle_lru() {
        let mut table = RecentIo::new();
        table.note(0, 4096);
        let (run, continued) = table.note(10_000, 4096);
        assert_eq!(run, 4096);
        assert!(!continued);
    }

    #[test]
    fn table_tracks_parallel_streams() {
        let mut table = RecentIo::new();
        table.note(0, 4096);
        table.note(50_000, 4096);

        // Both streams continue independently.
        let (run_a, cont_a) = table.note(8, 4096);
        let (run_b, cont_b) = table.note(50_008, 4096);
        assert!(cont_a && cont_b);
        assert_eq!(run_a, 8192);
        assert_eq!(run_b, 8192);
    }

    #[test]
    fn ewma_converges() {
        let mut avg = 0_u64;
        for _ in 0..64 {
            avg = ewma_add(avg, 1 << 20, 3);
        }
        assert!(avg > (1 << 20) - (1 << 14));
        assert!(avg <= 1 << 20);
    }

    #[test]
    fn task_effective_bytes_takes_max() {
        let mut task = TaskSeq {
            sequential_io: 100,
            sequential_io_avg: 0,
        };
        assert_eq!(task.effective_bytes(), 100);
        task.add_sequential();
        assert_eq!(task.sequential_io, 0);
        assert!(task.sequential_io_avg > 0);
    }
}
