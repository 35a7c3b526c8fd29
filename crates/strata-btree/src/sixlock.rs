//! The six-mode node lock.
//!
//! Three access modes with this compatibility (R = shared read, I =
//! exclusive intent, W = exclusive write):
//!
//! | held\req | R | I | W |
//! |----------|---|---|---|
//! | R        | y | y | n |
//! | I        | y | n | n |
//! | W        | n | n | n |
//!
//! Intent marks "will modify": it excludes other intents (so two
//! would-be writers cannot both climb the tree) while still admitting
//! readers, and is upgradeable to write by draining readers. A write
//! lock may only be taken while holding intent.
//!
//! Every write acquisition and release increments `seq`, so an even
//! value means not write-locked and `seq >> 1` identifies the node
//! version. Readers snapshot `seq`; `relock` succeeds only if nothing
//! was written in between. Linked iterators that already hold a lock on
//! a node share it via [`SixLock::increment`], which bumps the hold
//! count without blocking.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Intent,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    /// Intent hold count. Above one only via lock sharing between
    /// linked iterators.
    intent: u32,
    write: bool,
}

#[derive(Debug, Default)]
pub struct SixLock {
    state: Mutex<LockState>,
    cv: Condvar,
    seq: AtomicU64,
}

impl SixLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence number. Even = not write-locked.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn lock(&self, ty: LockType) {
        let mut state = self.state.lock();
        match ty {
            LockType::Read => {
                while state.write {
                    self.cv.wait(&mut state);
                }
                state.readers += 1;
            }
            LockType::Intent => {
                while state.intent > 0 || state.write {
                    self.cv.wait(&mut state);
                }
                state.intent = 1;
            }
            LockType::Write => {
                debug_assert!(state.intent > 0, "write requires intent held");
                while state.readers > 0 {
                    self.cv.wait(&mut state);
                }
                state.write = true;
                self.seq.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    #[must_use]
    pub fn try_lock(&self, ty: LockType) -> bool {
        let mut state = self.state.lock();
        match ty {
            LockType::Read => {
                if state.write {
                    return false;
                }
                state.readers += 1;
            }
            LockType::Intent => {
                if state.intent > 0 || state.write {
                    return false;
                }
                state.intent = 1;
            }
            LockType::Write => {
                debug_assert!(state.intent > 0, "write requires intent held");
                if state.readers > 0 {
                    return false;
                }
                state.write = true;
                self.seq.fetch_add(1, Ordering::AcqRel);
            }
        }
        true
    }

    pub fn unlock(&self, ty: LockType) {
        let mut state = self.state.lock();
        match ty {
            LockType::Read => {
                debug_assert!(state.readers > 0);
                state.readers -= 1;
            }
            LockType::Intent => {
                debug_assert!(state.intent > 0);
                debug_assert!(!state.write, "release write before intent");
                state.intent -= 1;
            }
            LockType::Write => {
                debug_assert!(state.write);
                state.write = false;
                self.seq.fetch_add(1, Ordering::AcqRel);
            }
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Share a lock already held by a linked iterator: bump the hold
    /// count without blocking. Write locks are never shared.
    pub fn increment(&self, ty: LockType) {
        let mut state = self.state.lock();
        match ty {
            LockType::Read => {
                debug_assert!(!state.write);
                state.readers += 1;
            }
            LockType::Intent => {
                debug_assert!(state.intent > 0, "can only share a held intent");
                state.intent += 1;
            }
            LockType::Write => unreachable!("write locks are not shared"),
        }
    }

    /// Downgrade one intent hold to a read hold without a window where
    /// neither is held.
    pub fn downgrade(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.intent > 0 && !state.write);
        state.intent -= 1;
        state.readers += 1;
        drop(state);
        self.cv.notify_all();
    }

    /// Re-take a dropped read or intent lock iff the node was not
    /// write-locked since `seq` was snapshotted.
    #[must_use]
    pub fn relock(&self, ty: LockType, seq: u64) -> bool {
        if !self.try_lock(ty) {
            return false;
        }
        if self.seq() == seq {
            return true;
        }
        self.unlock(ty);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share() {
        let lock = SixLock::new();
        lock.lock(LockType::Read);
        assert!(lock.try_lock(LockType::Read));
        lock.unlock(LockType::Read);
        lock.unlock(LockType::Read);
    }

    #[test]
    fn intent_coexists_with_readers_but_not_intent() {
        let lock = SixLock::new();
        lock.lock(LockType::Intent);
        assert!(lock.try_lock(LockType::Read));
        assert!(!lock.try_lock(LockType::Intent));
        lock.unlock(LockType::Read);
        lock.unlock(LockType::Intent);
        assert!(lock.try_lock(LockType::Intent));
        lock.unlock(LockType::Intent);
    }

    #[test]
    fn write_excludes_everything() {
        let lock = SixLock::new();
        lock.lock(LockType::Intent);
        lock.lock(LockType::Write);
        assert!(!lock.try_lock(LockType::Read));
        assert!(!lock.try_lock(LockType::Intent));
        lock.unlock(LockType::Write);
        assert!(lock.try_lock(LockType::Read));
        lock.unlock(LockType::Read);
        lock.unlock(LockType::Intent);
    }

    #[test]
    fn write_waits_for_readers_to_drain() {
        let lock = Arc::new(SixLock::new());
        lock.lock(LockType::Intent);
        lock.lock(LockType::Read);

        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            lock2.lock(LockType::Write);
            lock2.unlock(LockType::Write);
            lock2.unlock(LockType::Intent);
        });

        thread::sleep(Duration::from_millis(20));
        lock.unlock(LockType::Read);
        handle.join().unwrap();
    }

    #[test]
    fn seq_parity_tracks_write_state() {
        let lock = SixLock::new();
        assert_eq!(lock.seq() % 2, 0);
        lock.lock(LockType::Intent);
        lock.lock(LockType::Write);
        assert_eq!(lock.seq() % 2, 1);
        lock.unlock(LockType::Write);
        assert_eq!(lock.seq() % 2, 0);
        lock.unlock(LockType::Intent);
    }

    #[test]
    fn relock_fails_after_write_cycle() {
        let lock = SixLock::new();
        lock.lock(LockType::Read);
        let seq = lock.seq();
        lock.unlock(LockType::Read);

        lock.lock(LockType::Intent);
        lock.lock(LockType::Write);
        lock.unlock(LockType::Write);
        lock.unlock(LockType::Intent);

        assert!(!lock.relock(LockType::Read, seq));
        // And the failed relock left nothing held.
        lock.lock(LockType::Intent);
        lock.lock(LockType::Write);
        lock.unlock(LockType::Write);
        lock.unlock(LockType::Intent);
    }

    #[test]
    fn relock_succeeds_when_unchanged() {
        let lock = SixLock::new();
        lock.lock(LockType::Read);
        let seq = lock.seq();
        lock.unlock(LockType::Read);
        assert!(lock.relock(LockType::Read, seq));
        lock.unlock(LockType::Read);
    }

    #[test]
    fn downgrade_keeps_continuity() {
        let lock = SixLock::new();
        lock.lock(LockType::Intent);
        lock.downgrade();
        // Now a reader; intent is free again.
        assert!(lock.try_lock(LockType::Intent));
        lock.unlock(LockType::Intent);
        lock.unlock(LockType::Read);
    }

    #[test]
    fn shared_intent_counts() {
        let lock = SixLock::new();
        lock.lock(LockType::Intent);
        lock.increment(LockType::Intent);
        lock.unlock(LockType::Intent);
        // Still held once.
        assert!(!lock.try_lock(LockType::Intent));
        lock.unlock(LockType::Intent);
        assert!(lock.try_lock(LockType::Intent));
        lock.unlock(LockType::Intent);
    }
}
