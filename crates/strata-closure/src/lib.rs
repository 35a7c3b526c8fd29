#![forbid(unsafe_code)]
//! Completion-continuation primitive for chaining asynchronous I/O stages.
//!
//! A [`Closure`] carries an atomic refcount and at most one registered
//! continuation. `get` pins a stage's outstanding work (a submitted bio,
//! a journal write); `put` releases it. When the count drops to zero the
//! registered continuation runs exactly once, on the designated
//! [`WorkerPool`]. Continuations of one closure never run concurrently
//! with each other: the count is reset to one before the next stage is
//! dispatched, so the chain is single-threaded with respect to itself.
//!
//! Closures are not cancellable once submitted; teardown drains the pool
//! and waits for outstanding work via [`Closure::wait_sync`].

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

type Continuation = Box<dyn FnOnce(Closure) + Send + 'static>;

#[derive(Default)]
struct ClosureState {
    continuation: Option<(Continuation, Option<WorkerPool>)>,
    done: bool,
}

struct ClosureInner {
    remaining: AtomicU32,
    state: Mutex<ClosureState>,
    done_cv: Condvar,
}

/// Refcounted continuation handle. Cheap to clone; all clones share the
/// same count and continuation slot.
#[derive(Clone)]
pub struct Closure {
    inner: Arc<ClosureInner>,
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closure")
            .field("remaining", &self.inner.remaining.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Closure {
    fn default() -> Self {
        Self::new()
    }
}

impl Closure {
    /// A fresh closure owned by the calling stage (count = 1).
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClosureInner {
                remaining: AtomicU32::new(1),
                state: Mutex::new(ClosureState::default()),
                done_cv: Condvar::new(),
            }),
        }
    }

    /// Pin one more outstanding piece of work.
    pub fn get(&self) {
        let prev = self.inner.remaining.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "closure resurrected after completion");
    }

    /// Release one piece of work; fires the continuation at zero.
    pub fn put(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "closure refcount underflow");
        if prev != 1 {
            return;
        }

        let next = {
            let mut state = self.inner.state.lock();
            match state.continuation.take() {
                Some(next) => Some(next),
                None => {
                    state.done = true;
                    self.inner.done_cv.notify_all();
                    None
                }
            }
        };

        if let Some((continuation, pool)) = next {
            // The next stage owns the closure again.
            self.inner.remaining.store(1, Ordering::Release);
            let cl = self.clone();
            match pool {
                Some(pool) => pool.submit(move || continuation(cl)),
                None => continuation(cl),
            }
        }
    }

    /// Register the next stage and release the current one.
    ///
    /// The continuation runs on `pool` (or inline on the thread that
    /// drops the count to zero, when `pool` is `None`) once every
    /// outstanding `get` has been `put`.
    pub fn continue_with<F>(&self, pool: Option<&WorkerPool>, f: F)
    where
        F: FnOnce(Closure) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            debug_assert!(
                state.continuation.is_none(),
                "closure already has a continuation"
            );
            state.continuation = Some((Box::new(f), pool.cloned()));
        }
        self.put();
    }

    /// Release the current stage and block until the closure completes.
    pub fn wait_sync(&self) {
        self.put();
        let mut state = self.inner.state.lock();
        while !state.done {
            self.inner.done_cv.wait(&mut state);
        }
    }

    /// Current count; for assertions and tests.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.inner.remaining.load(Ordering::Acquire)
    }
}

// ── Wait lists ──────────────────────────────────────────────────────────────

/// FIFO list of parked closures.
///
/// `wait` pins the closure (the parked stage holds a ref on behalf of
/// whoever will wake it); `wake_all` releases every parked closure,
/// re-firing their continuations so they can retry.
#[derive(Default)]
pub struct WaitList {
    parked: Mutex<VecDeque<Closure>>,
}

impl std::fmt::Debug for WaitList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitList")
            .field("parked", &self.parked.lock().len())
            .finish()
    }
}

impl WaitList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, cl: &Closure) {
        cl.get();
        self.parked.lock().push_back(cl.clone());
    }

    pub fn wake_all(&self) {
        let parked: Vec<Closure> = self.parked.lock().drain(..).collect();
        for cl in parked {
            cl.put();
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.lock().is_empty()
    }
}

// ── Worker pool ─────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    idle: Condvar,
    shutdown: Mutex<bool>,
    busy: AtomicU32,
}

/// Fixed pool of worker threads consuming queued continuations.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued", &self.shared.queue.lock().len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `threads` workers named `name-N`.
    #[must_use]
    pub fn new(name: &str, threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            idle: Condvar::new(),
            shutdown: Mutex::new(false),
            busy: AtomicU32::new(0),
        });

        let handles = (0..threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn worker thread")
            })
            .collect();

        Self {
            shared,
            handles: Arc::new(Mutex::new(handles)),
        }
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        queue.push_back(Box::new(job));
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Block until the queue is empty and no worker is mid-job.
    pub fn drain(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.is_empty() || self.shared.busy.load(Ordering::Acquire) != 0 {
            self.shared.idle.wait(&mut queue);
        }
    }

    /// Drain, then stop and join every worker.
    pub fn shutdown(&self) {
        self.drain();
        *self.shared.shutdown.lock() = true;
        self.shared.available.notify_all();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        trace!(target: "strata::closure", event = "pool_shutdown");
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    shared.busy.fetch_add(1, Ordering::AcqRel);
                    break job;
                }
                if *shared.shutdown.lock() {
                    return;
                }
                shared.idle.notify_all();
                shared.available.wait(&mut queue);
            }
        };

        job();

        if shared.busy.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn continuation_fires_once_at_zero() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cl = Closure::new();
        cl.get();
        cl.get();

        let fired2 = Arc::clone(&fired);
        cl.continue_with(None, move |_cl| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        cl.put();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        cl.put();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chained_stages_run_in_order() {
        let pool = WorkerPool::new("test-closure", 2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let cl = Closure::new();
        let log1 = Arc::clone(&log);
        let log2 = Arc::clone(&log);
        let pool2 = pool.clone();
        cl.continue_with(Some(&pool), move |cl| {
            log1.lock().push(1);
            cl.continue_with(Some(&pool2), move |cl| {
                log2.lock().push(2);
                cl.put();
            });
        });

        pool.drain();
        assert_eq!(*log.lock(), vec![1, 2]);
        pool.shutdown();
    }

    #[test]
    fn wait_sync_blocks_for_outstanding_work() {
        let cl = Closure::new();
        cl.get();

        let cl2 = cl.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cl2.put();
        });

        cl.wait_sync();
        handle.join().unwrap();
        assert_eq!(cl.remaining(), 0);
    }

    #[test]
    fn wait_list_wakes_parked_closures() {
        let list = WaitList::new();
        let woke = Arc::new(AtomicUsize::new(0));

        let cl = Closure::new();
        let woke2 = Arc::clone(&woke);
        list.wait(&cl);
        cl.continue_with(None, move |cl| {
            woke2.fetch_add(1, Ordering::SeqCst);
            cl.put();
        });

        assert_eq!(woke.load(Ordering::SeqCst), 0);
        list.wake_all();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn pool_drain_waits_for_running_jobs() {
        let pool = WorkerPool::new("drain-test", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(30));
            done2.fetch_add(1, Ordering::SeqCst);
        });
        pool.drain();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }
}
