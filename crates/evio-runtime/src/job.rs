//! Async job bridge: loop-side bookkeeping for work run on the pool.
//!
//! ```text
//!  loop thread                          worker thread
//!  ───────────                          ─────────────
//!  JobTable::insert ─► id
//!  pool.submit(work) ─────────────────► run work (catch_unwind)
//!  JobFuture::poll ─► park waker          │
//!                                         ▼
//!                        CompletionQueue::complete(id, outcome)
//!                          push + eventfd notify
//!  epoll wakes ◄──────────────────────────┘
//!  JobTable::reap(id, outcome) ─► store, wake task
//!  JobFuture::poll ─► take outcome, downcast
//! ```
//!
//! Reaping always happens on the loop thread. Each id is reaped exactly
//! once; a second reap, or a reap for an id the table never issued, is a
//! bug in the bridge and panics.
//!
//! An owner that stops waiting can leave an orphan hook behind. The hook
//! runs on the loop with the outcome at reap, so whatever it captures
//! (busy claims, descriptors, buffers) stays held until the worker is done.

use crate::notifier::{EventFdNotifier, Notifier};
use crate::event_loop::Handle;

use crossbeam_queue::SegQueue;
use evio_core::{kerror, ktrace, Error, Result};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Identifies one submitted job within its event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// What a worker hands back: the type-erased return value, or why there
/// is none.
pub type Outcome = Result<Box<dyn Any + Send>>;

/// Loop-side cleanup for a job whose owner went away.
pub type OrphanHook = Box<dyn FnOnce(Outcome)>;

/// An abandoned job's outcome and its cleanup. Run it once the job table
/// is no longer borrowed.
pub struct Orphaned {
    hook: Option<OrphanHook>,
    outcome: Outcome,
}

impl Orphaned {
    pub fn run(self) {
        match self.hook {
            Some(hook) => hook(self.outcome),
            None => drop(self.outcome),
        }
    }
}

/// What [`JobTable::reap`] found at the other end of a job.
pub enum Reaped {
    /// The owner is still interested; wake it if it is parked
    Owner(Option<Waker>),
    Orphaned(Orphaned),
}

/// Worker → loop channel. One per event loop.
pub struct CompletionQueue {
    done: SegQueue<(JobId, Outcome)>,
    notifier: Arc<EventFdNotifier>,
}

impl CompletionQueue {
    pub fn new(notifier: Arc<EventFdNotifier>) -> Self {
        Self {
            done: SegQueue::new(),
            notifier,
        }
    }

    /// Called on the worker thread once `work` has returned.
    pub fn complete(&self, id: JobId, outcome: Outcome) {
        self.done.push((id, outcome));
        if let Err(e) = self.notifier.notify() {
            kerror!("failed to wake event loop for {}: {}", id, e);
        }
    }

    pub fn pop(&self) -> Option<(JobId, Outcome)> {
        self.done.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }
}

#[derive(Default)]
struct JobEntry {
    waker: Option<Waker>,
    outcome: Option<Outcome>,
    reaped: bool,
    /// The future went away; hand the outcome to `hook` at reap
    orphaned: bool,
    hook: Option<OrphanHook>,
}

/// Loop-side record of every job in flight.
#[derive(Default)]
pub struct JobTable {
    next: u64,
    entries: HashMap<JobId, JobEntry>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self) -> JobId {
        self.next += 1;
        let id = JobId(self.next);
        self.entries.insert(id, JobEntry::default());
        id
    }

    /// Settle a job that never reached a worker.
    pub fn fail(&mut self, id: JobId, err: Error) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.outcome = Some(Err(err));
            entry.reaped = true;
        }
    }

    /// Record a finished job.
    ///
    /// # Panics
    /// Panics if `id` is unknown or was already reaped.
    pub fn reap(&mut self, id: JobId, outcome: Outcome) -> Reaped {
        let Some(entry) = self.entries.get_mut(&id) else {
            panic!("reaped {} which is not in flight", id);
        };
        if entry.reaped {
            panic!("{} reaped twice", id);
        }
        if entry.orphaned {
            ktrace!("{} reaped after its owner went away", id);
            let hook = entry.hook.take();
            self.entries.remove(&id);
            return Reaped::Orphaned(Orphaned { hook, outcome });
        }
        entry.reaped = true;
        entry.outcome = Some(outcome);
        Reaped::Owner(entry.waker.take())
    }

    /// Take the outcome if reaped, otherwise park `waker`.
    pub fn poll_outcome(&mut self, id: JobId, waker: &Waker) -> Option<Outcome> {
        let entry = self.entries.get_mut(&id)?;
        if entry.reaped {
            let outcome = entry.outcome.take();
            self.entries.remove(&id);
            return outcome;
        }
        match &entry.waker {
            Some(w) if w.will_wake(waker) => {}
            _ => entry.waker = Some(waker.clone()),
        }
        None
    }

    /// The owner stopped waiting. A job still running keeps its entry, and
    /// `hook`, until reaped. A job already reaped is settled right away:
    /// the caller runs the returned cleanup.
    pub fn orphan(&mut self, id: JobId, hook: Option<OrphanHook>) -> Option<Orphaned> {
        let entry = self.entries.get_mut(&id)?;
        if entry.reaped {
            let outcome = entry.outcome.take();
            self.entries.remove(&id);
            return outcome.map(|outcome| Orphaned { hook, outcome });
        }
        entry.orphaned = true;
        entry.waker = None;
        entry.hook = hook;
        None
    }

    /// Jobs submitted to a worker and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.entries.values().filter(|e| !e.reaped).count()
    }
}

/// Resolves to the return value of a job's work function.
///
/// The work starts when the job is submitted, not when this future is
/// first polled. Dropping the future does not cancel the work; its
/// result goes to the [`on_orphan`](JobFuture::on_orphan) hook, if any,
/// when the job is reaped.
#[must_use = "dropping a JobFuture discards the job's result"]
pub struct JobFuture<T> {
    handle: Handle,
    id: JobId,
    done: bool,
    on_orphan: Option<OrphanHook>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JobFuture<T> {
    pub(crate) fn new(handle: Handle, id: JobId) -> Self {
        Self {
            handle,
            id,
            done: false,
            on_orphan: None,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }
}

impl<T: 'static> JobFuture<T> {
    /// Hand the result to `cleanup` if this future is dropped before it
    /// resolves. `cleanup` runs on the loop once the job is reaped, so
    /// anything it captures is held until the worker has finished.
    pub fn on_orphan<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(Result<T>) + 'static,
    {
        self.on_orphan = Some(Box::new(move |outcome: Outcome| {
            cleanup(outcome.map(downcast::<T>))
        }));
        self
    }
}

fn downcast<T: 'static>(boxed: Box<dyn Any + Send>) -> T {
    match boxed.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => unreachable!("async job returned a value of the wrong type"),
    }
}

impl<T: 'static> Future for JobFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let outcome = self.handle.jobs().poll_outcome(self.id, cx.waker());
        let Some(outcome) = outcome else {
            return Poll::Pending;
        };
        self.done = true;
        Poll::Ready(outcome.map(downcast::<T>))
    }
}

impl<T> Drop for JobFuture<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let settled = self.handle.jobs().orphan(self.id, self.on_orphan.take());
        if let Some(orphaned) = settled {
            orphaned.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct Flag(AtomicUsize);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn outcome(v: u32) -> Outcome {
        Ok(Box::new(v))
    }

    #[test]
    fn test_reap_wakes_parked_owner() {
        let mut table = JobTable::new();
        let id = table.insert();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        let waker = Waker::from(flag.clone());

        assert!(table.poll_outcome(id, &waker).is_none());
        assert_eq!(table.in_flight(), 1);
        let Reaped::Owner(Some(w)) = table.reap(id, outcome(9)) else {
            panic!("parked owner not returned");
        };
        w.wake();
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        assert_eq!(table.in_flight(), 0);

        let got = table.poll_outcome(id, &waker).unwrap().unwrap();
        assert_eq!(*got.downcast::<u32>().unwrap(), 9);
        assert!(table.entries.is_empty());
    }

    #[test]
    #[should_panic(expected = "reaped twice")]
    fn test_double_reap_panics() {
        let mut table = JobTable::new();
        let id = table.insert();
        table.reap(id, outcome(1));
        table.reap(id, outcome(1));
    }

    #[test]
    #[should_panic(expected = "not in flight")]
    fn test_unknown_reap_panics() {
        let mut table = JobTable::new();
        table.reap(JobId(42), outcome(1));
    }

    #[test]
    fn test_orphaned_outcome_is_discarded() {
        let mut table = JobTable::new();
        let id = table.insert();
        assert!(table.orphan(id, None).is_none());
        assert_eq!(table.in_flight(), 1);
        let Reaped::Orphaned(orphaned) = table.reap(id, outcome(3)) else {
            panic!("orphaned job woke an owner");
        };
        orphaned.run();
        assert_eq!(table.in_flight(), 0);
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_orphan_hook_runs_at_reap_with_outcome() {
        let mut table = JobTable::new();
        let id = table.insert();
        let seen = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let s = seen.clone();
        let hook: OrphanHook = Box::new(move |out| {
            s.set(*out.unwrap().downcast::<u32>().unwrap());
        });
        assert!(table.orphan(id, Some(hook)).is_none());
        assert_eq!(seen.get(), 0);
        let Reaped::Orphaned(orphaned) = table.reap(id, outcome(7)) else {
            panic!("orphaned job woke an owner");
        };
        assert_eq!(seen.get(), 0);
        orphaned.run();
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_orphan_after_reap_settles_immediately() {
        let mut table = JobTable::new();
        let id = table.insert();
        assert!(matches!(table.reap(id, outcome(4)), Reaped::Owner(None)));
        let seen = std::rc::Rc::new(std::cell::Cell::new(false));
        let s = seen.clone();
        let orphaned = table.orphan(id, Some(Box::new(move |_| s.set(true)))).unwrap();
        orphaned.run();
        assert!(seen.get());
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_failed_submission_settles_immediately() {
        let mut table = JobTable::new();
        let id = table.insert();
        table.fail(id, Error::Closed);
        assert_eq!(table.in_flight(), 0);
        let waker = Waker::from(Arc::new(Flag(AtomicUsize::new(0))));
        assert!(matches!(table.poll_outcome(id, &waker), Some(Err(Error::Closed))));
    }

    #[test]
    fn test_completion_queue_notifies() {
        let n = Arc::new(EventFdNotifier::create().unwrap());
        let q = CompletionQueue::new(n.clone());
        let mut table = JobTable::new();
        let id = table.insert();
        let q = Arc::new(q);
        let remote = q.clone();
        std::thread::spawn(move || remote.complete(id, outcome(5)))
            .join()
            .unwrap();
        assert_eq!(n.drain(), 1);
        let (got, out) = q.pop().unwrap();
        assert_eq!(got, id);
        assert!(out.is_ok());
        assert!(q.is_empty());
    }
}
