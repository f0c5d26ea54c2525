//! # Event loop
//!
//! A single-threaded executor driving `!Send` futures over the epoll
//! [`Reactor`]. Tasks suspend only at would-block points and job
//! submissions; everything else runs to completion between polls.
//!
//! ```text
//!   ┌──────────────────────── turn ────────────────────────┐
//!   │ 1. poll every task id in the ready queue              │
//!   │ 2. epoll_wait (0 if work is queued, else forever)     │
//!   │      fd readiness ──► wake parked task                │
//!   │      eventfd      ──► cross-thread wake / job done    │
//!   │ 3. reap finished jobs ──► wake owning task            │
//!   └───────────────────────────────────────────────────────┘
//! ```
//!
//! Wakers are `Send + Sync`: waking from another thread pushes the task
//! id onto a lock-free queue and writes the loop's eventfd.

use crate::config::LoopConfig;
use crate::job::{CompletionQueue, JobFuture, JobTable, Reaped};
use crate::notifier::{EventFdNotifier, Notifier};
use crate::pool::{self, AsyncPool};
use crate::reactor::{Interest, Readiness, Reactor};

use crossbeam_queue::SegQueue;
use evio_core::{kdebug, ktrace, Error, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::{pin, Pin};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};
use std::time::Duration;

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Ready-queue id of the future passed to `block_on`
const MAIN_TASK: u64 = 0;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Weak<Inner>> = const { RefCell::new(Weak::new()) };
}

struct ReadyQueue {
    ids: SegQueue<u64>,
    notifier: Arc<EventFdNotifier>,
    owner: ThreadId,
}

struct TaskWaker {
    id: u64,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.ids.push(self.id);
        if thread::current().id() != self.ready.owner {
            let _ = self.ready.notifier.notify();
        }
    }
}

struct Task {
    /// `None` while the task is being polled
    future: Option<LocalFuture>,
    waker: Waker,
}

struct Inner {
    id: u64,
    config: LoopConfig,
    notifier: Arc<EventFdNotifier>,
    reactor: Reactor,
    ready: Arc<ReadyQueue>,
    tasks: RefCell<HashMap<u64, Task>>,
    next_task: Cell<u64>,
    jobs: RefCell<JobTable>,
    completions: Arc<CompletionQueue>,
    pool: AsyncPool,
    /// `pool` was created for this loop and is closed with it
    own_pool: bool,
}

/// Owns the loop. Create one per thread that does I/O.
pub struct EventLoop {
    inner: Rc<Inner>,
}

/// Cloneable reference to a running loop, used by I/O wrappers to reach
/// the reactor and the job bridge.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::from_env())
    }

    /// Build a loop and make it current on this thread.
    pub fn with_config(config: LoopConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;

        if config.ignore_sigpipe {
            unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
        }

        let (pool, own_pool) = match &config.pool {
            Some(pc) => (AsyncPool::new(pc.clone())?, true),
            None => (pool::global()?, false),
        };

        let notifier = Arc::new(EventFdNotifier::create()?);
        let reactor = Reactor::new(notifier.fd(), config.max_events)?;
        let ready = Arc::new(ReadyQueue {
            ids: SegQueue::new(),
            notifier: Arc::clone(&notifier),
            owner: thread::current().id(),
        });
        let completions = Arc::new(CompletionQueue::new(Arc::clone(&notifier)));

        let inner = Rc::new(Inner {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            notifier,
            reactor,
            ready,
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(MAIN_TASK + 1),
            jobs: RefCell::new(JobTable::new()),
            completions,
            pool,
            own_pool,
        });
        CURRENT.with(|c| *c.borrow_mut() = Rc::downgrade(&inner));
        kdebug!("event loop {} started", inner.id);
        Ok(Self { inner })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: Rc::clone(&self.inner),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// Spawn a task on this loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.handle().spawn(future)
    }

    /// Drive the loop until `future` resolves. Other tasks run while it
    /// is pending and stay spawned afterwards.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        self.make_current();
        let mut future = pin!(future);
        let waker = Waker::from(Arc::new(TaskWaker {
            id: MAIN_TASK,
            ready: Arc::clone(&self.inner.ready),
        }));
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
            return Ok(v);
        }
        loop {
            while let Some(id) = self.inner.ready.ids.pop() {
                if id == MAIN_TASK {
                    if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                        return Ok(v);
                    }
                } else {
                    self.poll_task(id);
                }
            }
            self.turn()?;
        }
    }

    /// Run until every task has finished and no job is in flight.
    pub fn run(&self) -> Result<()> {
        self.make_current();
        loop {
            while let Some(id) = self.inner.ready.ids.pop() {
                if id != MAIN_TASK {
                    self.poll_task(id);
                }
            }
            if self.inner.tasks.borrow().is_empty() && self.inner.jobs.borrow().in_flight() == 0 {
                kdebug!("event loop {} idle", self.inner.id);
                return Ok(());
            }
            self.turn()?;
        }
    }

    fn make_current(&self) {
        CURRENT.with(|c| *c.borrow_mut() = Rc::downgrade(&self.inner));
    }

    fn poll_task(&self, id: u64) {
        let taken = {
            let mut tasks = self.inner.tasks.borrow_mut();
            match tasks.get_mut(&id) {
                Some(task) => task.future.take().map(|f| (f, task.waker.clone())),
                None => None,
            }
        };
        // Stale wake for a finished task.
        let Some((mut future, waker)) = taken else {
            return;
        };
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.inner.tasks.borrow_mut().remove(&id);
                ktrace!("task {} finished", id);
            }
            Poll::Pending => {
                if let Some(task) = self.inner.tasks.borrow_mut().get_mut(&id) {
                    task.future = Some(future);
                }
            }
        }
    }

    /// One reactor pass followed by reaping finished jobs.
    fn turn(&self) -> Result<()> {
        let inner = &self.inner;
        let busy = !inner.ready.ids.is_empty() || !inner.completions.is_empty();
        let timeout = if busy { Some(Duration::ZERO) } else { None };
        let (_, woken) = inner.reactor.poll(timeout)?;
        if woken {
            inner.notifier.drain();
        }
        let mut wake = Vec::new();
        let mut orphans = Vec::new();
        {
            let mut jobs = inner.jobs.borrow_mut();
            while let Some((id, outcome)) = inner.completions.pop() {
                match jobs.reap(id, outcome) {
                    Reaped::Owner(waker) => wake.extend(waker),
                    Reaped::Orphaned(orphaned) => orphans.push(orphaned),
                }
            }
        }
        for orphaned in orphans {
            orphaned.run();
        }
        for w in wake {
            w.wake();
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Futures hold Handles; dropping them here breaks the Rc cycle.
        let tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        drop(tasks);
        if self.inner.own_pool {
            self.inner.pool.close();
        }
        CURRENT.with(|c| {
            let mut c = c.borrow_mut();
            if c.as_ptr() == Rc::as_ptr(&self.inner) {
                *c = Weak::new();
            }
        });
        kdebug!("event loop {} stopped", self.inner.id);
    }
}

impl Handle {
    /// The loop most recently created (or driven) on this thread.
    pub fn current() -> Result<Handle> {
        CURRENT
            .with(|c| c.borrow().upgrade())
            .map(|inner| Handle { inner })
            .ok_or(Error::NotInitialized)
    }

    /// Process-unique loop id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn readiness(&self, fd: RawFd, interest: Interest) -> Readiness<'_> {
        self.inner.reactor.readiness(fd, interest)
    }

    pub fn pool(&self) -> &AsyncPool {
        &self.inner.pool
    }

    pub(crate) fn jobs(&self) -> RefMut<'_, JobTable> {
        self.inner.jobs.borrow_mut()
    }

    /// Jobs submitted from this loop and not yet reaped.
    pub fn jobs_in_flight(&self) -> usize {
        self.inner.jobs.borrow().in_flight()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            result: None,
            waker: None,
        }));
        let remote = Rc::clone(&state);
        let task: LocalFuture = Box::pin(async move {
            let out = future.await;
            let waker = {
                let mut s = remote.borrow_mut();
                s.result = Some(out);
                s.waker.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
        });

        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: Arc::clone(&self.inner.ready),
        }));
        self.inner.tasks.borrow_mut().insert(
            id,
            Task {
                future: Some(task),
                waker,
            },
        );
        self.inner.ready.ids.push(id);
        ktrace!("task {} spawned", id);
        JoinHandle { state }
    }

    /// Run `work` on a pool worker; the returned future resolves on this
    /// loop once the job has been reaped. A panic in `work` resolves to
    /// [`Error::Panicked`].
    pub fn execute<F, T>(&self, work: F) -> JobFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = self.inner.jobs.borrow_mut().insert();
        let completions = Arc::clone(&self.inner.completions);
        let job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => Ok(Box::new(value) as Box<dyn Any + Send>),
                Err(_) => Err(Error::Panicked),
            };
            completions.complete(id, outcome);
        });
        if let Err(e) = self.inner.pool.submit(job) {
            self.inner.jobs.borrow_mut().fail(id, e);
        }
        JobFuture::new(self.clone(), id)
    }
}

struct JoinState<T> {
    result: Option<T>,
    waker: Option<Waker>,
}

/// Resolves to the output of a spawned task. Dropping it detaches the
/// task.
pub struct JoinHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.state.borrow().result.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut s = self.state.borrow_mut();
        match s.result.take() {
            Some(v) => Poll::Ready(v),
            None => {
                s.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Spawn on the current thread's loop.
pub fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Ok(Handle::current()?.spawn(future))
}

/// Run blocking `work` on the current loop's pool.
pub fn execute<F, T>(work: F) -> Result<JobFuture<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(Handle::current()?.execute(work))
}

/// Let every other ready task run once before continuing.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
