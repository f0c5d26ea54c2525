//! `AsyncPool`: bounded worker pool for blocking work.
//!
//! Workers are OS threads that run closures the event loop cannot run
//! without blocking (disk I/O, `sendfile`, name resolution, blocking
//! connect). The pool grows lazily: a submission that finds no idle
//! worker spawns one, up to `max_workers`. Workers above `min_workers`
//! exit after sitting idle for `linger`.
//!
//! ```text
//!   submit ──► Mutex<PoolState { jobs: VecDeque, idle, total }> ──► worker
//!                      │ Condvar                                      │
//!                      └──────────────── notify_one ◄─────────────────┘
//! ```
//!
//! The pool knows nothing about event loops; completion routing is done
//! by the closure itself (see `job.rs`).

use crate::config::PoolConfig;

use evio_core::{kdebug, kwarn, Error, Result};

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

/// A unit of blocking work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    jobs: VecDeque<Work>,
    /// Workers parked on the condvar
    idle: usize,
    /// Live workers, idle or running a job
    total: usize,
    /// Monotonic counter for thread names
    spawned: usize,
    shutdown: bool,
    config: PoolConfig,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled on submit, reconfigure and shutdown
    work: Condvar,
    /// Signalled whenever a worker exits
    exited: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub queued: usize,
}

/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct AsyncPool {
    shared: Arc<Shared>,
}

impl AsyncPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    jobs: VecDeque::new(),
                    idle: 0,
                    total: 0,
                    spawned: 0,
                    shutdown: false,
                    config,
                }),
                work: Condvar::new(),
                exited: Condvar::new(),
            }),
        })
    }

    /// Queue `work` for a worker. Never blocks on the work itself.
    ///
    /// Fails with `Closed` after [`shutdown`](Self::shutdown), or with
    /// the spawn error if no worker exists and none could be started.
    pub fn submit(&self, work: Work) -> Result<()> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(Error::Closed);
        }
        state.jobs.push_back(work);

        if state.idle > 0 {
            self.shared.work.notify_one();
            return Ok(());
        }
        if state.total >= state.config.max_workers {
            return Ok(());
        }

        let name = format!("{}-{}", state.config.thread_name, state.spawned);
        let shared = Arc::clone(&self.shared);
        // The new worker blocks on the lock until this guard drops.
        match thread::Builder::new().name(name).spawn(move || worker_loop(shared)) {
            Ok(_) => {
                state.total += 1;
                state.spawned += 1;
                kdebug!("spawned async worker ({} live)", state.total);
                Ok(())
            }
            Err(e) => {
                kwarn!("failed to spawn async worker: {}", e);
                if state.total == 0 {
                    state.jobs.pop_back();
                    return Err(Error::from(e));
                }
                Ok(())
            }
        }
    }

    /// Replace linger and worker bounds. Idle workers re-evaluate
    /// immediately; busy ones when they next go idle.
    pub fn reconfigure(&self, linger: Duration, min_workers: usize, max_workers: usize) -> Result<()> {
        let mut state = self.shared.lock();
        let config = state
            .config
            .clone()
            .linger(linger)
            .min_workers(min_workers)
            .max_workers(max_workers);
        config.validate().map_err(Error::InvalidArgument)?;
        state.config = config;
        self.shared.work.notify_all();
        Ok(())
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.lock().config.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total: state.total,
            idle: state.idle,
            queued: state.jobs.len(),
        }
    }

    /// Stop accepting work without waiting. Queued jobs still run.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        self.shared.work.notify_all();
    }

    /// Stop accepting work, let workers drain the queue, and wait for
    /// every worker to exit. Must not be called from a worker.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        self.shared.work.notify_all();
        while state.total > 0 {
            state = self
                .shared
                .exited
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        kdebug!("async pool drained");
    }
}

/// Worker thread main loop.
fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.lock();
    loop {
        if let Some(job) = state.jobs.pop_front() {
            drop(state);
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                kwarn!("detached async job panicked");
            }
            state = shared.lock();
            continue;
        }
        if state.shutdown {
            break;
        }

        let linger = state.config.linger;
        state.idle += 1;
        let (guard, timeout) = shared
            .work
            .wait_timeout(state, linger)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
        state.idle -= 1;

        let surplus = state.total > state.config.min_workers;
        let overfull = state.total > state.config.max_workers;
        if state.jobs.is_empty() && ((timeout.timed_out() && surplus) || overfull) {
            break;
        }
    }
    state.total -= 1;
    kdebug!("async worker retired ({} live)", state.total);
    shared.exited.notify_all();
}

// ── process-wide pool ────────────────────────────────────────────────

static GLOBAL: OnceLock<AsyncPool> = OnceLock::new();

/// The shared pool, created from [`PoolConfig::from_env`] on first use.
pub fn global() -> Result<AsyncPool> {
    if let Some(pool) = GLOBAL.get() {
        return Ok(pool.clone());
    }
    let pool = AsyncPool::new(PoolConfig::from_env()).or_else(|e| {
        kwarn!("invalid pool environment ({}); using defaults", e);
        AsyncPool::new(PoolConfig::default())
    })?;
    Ok(GLOBAL.get_or_init(|| pool).clone())
}

/// Reconfigure the shared pool: idle linger and worker bounds.
pub fn async_config(linger: Duration, min_workers: usize, max_workers: usize) -> Result<()> {
    global()?.reconfigure(linger, min_workers, max_workers)
}

/// Run `work` on the shared pool with no completion and no owning loop.
pub fn execute_detached<F>(work: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    global()?.submit(Box::new(work))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn pool(max: usize) -> AsyncPool {
        AsyncPool::new(
            PoolConfig::new()
                .max_workers(max)
                .linger(Duration::from_millis(20))
                .thread_name("evio-test"),
        )
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_runs_every_job_with_bounded_workers() {
        let p = pool(2);
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let done = done.clone();
            let tx = tx.clone();
            p.submit(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
                tx.send(i).unwrap();
            }))
            .unwrap();
            assert!(p.stats().total <= 2);
        }
        let mut seen: Vec<i32> = (0..20).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(done.load(Ordering::SeqCst), 20);
        p.shutdown();
    }

    #[test]
    fn test_idle_workers_linger_then_exit() {
        let p = pool(4);
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            p.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(10));
                tx.send(()).unwrap();
            }))
            .unwrap();
        }
        for _ in 0..4 {
            rx.recv().unwrap();
        }
        wait_until(|| p.stats().total == 0);
    }

    #[test]
    fn test_min_workers_stay() {
        let p = pool(2);
        p.reconfigure(Duration::from_millis(10), 1, 2).unwrap();
        let (tx, rx) = mpsc::channel();
        p.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(p.stats().total, 1);
        p.shutdown();
        assert_eq!(p.stats().total, 0);
    }

    #[test]
    fn test_panicking_job_does_not_kill_pool() {
        let p = pool(1);
        p.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        p.submit(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
        p.shutdown();
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let p = pool(1);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            p.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        p.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(p.submit(Box::new(|| {})), Err(Error::Closed));
    }

    #[test]
    fn test_reconfigure_validates() {
        let p = pool(2);
        assert!(matches!(
            p.reconfigure(Duration::ZERO, 3, 1),
            Err(Error::InvalidArgument(_))
        ));
        p.reconfigure(Duration::from_secs(1), 0, 6).unwrap();
        assert_eq!(p.config().max_workers, 6);
        assert_eq!(p.config().thread_name, "evio-test");
    }

    #[test]
    fn test_execute_detached_runs_on_global_pool() {
        let (tx, rx) = mpsc::channel();
        execute_detached(move || tx.send(thread::current().name().map(str::to_owned)).unwrap())
            .unwrap();
        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("evio-async"));
    }
}
