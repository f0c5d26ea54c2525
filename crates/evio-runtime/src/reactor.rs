//! # Reactor: epoll readiness dispatch
//!
//! One record per attached descriptor, with an independent waiter slot
//! for each direction:
//!
//! ```text
//!   fd ──► Source { reader: Option<Waker>, writer: Option<Waker>, armed }
//! ```
//!
//! A descriptor is only in the epoll set while at least one slot holds a
//! waker; `armed` mirrors the mask the kernel currently has. Registration
//! is level-triggered and one-shot per slot: when an event fires the
//! waker is taken out and the interest drops, so an idle descriptor never
//! reports again (not even `EPOLLHUP`).
//!
//! The loop's eventfd is registered permanently and is never dispatched
//! to a slot; it only breaks `epoll_wait`.

use crate::sys::cvt;

use evio_core::{ktrace, Errno, Error, Result};

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Direction a task waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    #[inline]
    fn epoll_bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

#[derive(Default)]
struct Source {
    reader: Option<Waker>,
    writer: Option<Waker>,
    /// Mask last handed to `epoll_ctl`; 0 when not in the epoll set
    armed: u32,
    /// `epoll_ctl` refused the fd (regular files): always ready
    unpollable: bool,
}

impl Source {
    fn slot(&mut self, interest: Interest) -> &mut Option<Waker> {
        match interest {
            Interest::Read => &mut self.reader,
            Interest::Write => &mut self.writer,
        }
    }

    fn wanted(&self) -> u32 {
        let mut bits = 0;
        if self.reader.is_some() {
            bits |= Interest::Read.epoll_bits();
        }
        if self.writer.is_some() {
            bits |= Interest::Write.epoll_bits();
        }
        bits
    }
}

pub struct Reactor {
    epfd: RawFd,
    wake_fd: RawFd,
    sources: RefCell<HashMap<RawFd, Source>>,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl Reactor {
    /// Create the epoll instance and register `wake_fd` for reading.
    pub fn new(wake_fd: RawFd, max_events: usize) -> Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let reactor = Self {
            epfd,
            wake_fd,
            sources: RefCell::new(HashMap::new()),
            events: RefCell::new(vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)]),
        };
        reactor.ctl(libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32)?;
        Ok(reactor)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) })?;
        Ok(())
    }

    /// Start tracking `fd`. A descriptor can be attached once.
    pub fn attach(&self, fd: RawFd) -> Result<()> {
        let mut sources = self.sources.borrow_mut();
        if sources.contains_key(&fd) || fd == self.wake_fd {
            return Err(Error::Os(Errno::EEXIST));
        }
        sources.insert(fd, Source::default());
        ktrace!("attach fd {}", fd);
        Ok(())
    }

    /// Stop tracking `fd`, waking whoever was waiting on it. Must run
    /// before the descriptor is closed.
    pub fn detach(&self, fd: RawFd) {
        let source = self.sources.borrow_mut().remove(&fd);
        let Some(mut source) = source else {
            return;
        };
        if source.armed != 0 {
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        ktrace!("detach fd {}", fd);
        if let Some(w) = source.reader.take() {
            w.wake();
        }
        if let Some(w) = source.writer.take() {
            w.wake();
        }
    }

    pub fn is_attached(&self, fd: RawFd) -> bool {
        self.sources.borrow().contains_key(&fd)
    }

    /// Park `waker` until `fd` is ready for `interest`. Replaces a waker
    /// already parked in the same slot.
    pub fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> Result<()> {
        let mut sources = self.sources.borrow_mut();
        let source = sources.get_mut(&fd).ok_or(Error::Closed)?;
        if source.unpollable {
            drop(sources);
            waker.wake();
            return Ok(());
        }
        *source.slot(interest) = Some(waker);
        let wanted = source.wanted();
        if wanted == source.armed {
            return Ok(());
        }
        let op = if source.armed == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        match self.ctl(op, fd, wanted) {
            Ok(()) => {
                source.armed = wanted;
                Ok(())
            }
            Err(Error::Os(Errno::EPERM)) => {
                // Regular files never block and cannot be polled.
                source.unpollable = true;
                let waker = source.slot(interest).take();
                drop(sources);
                if let Some(w) = waker {
                    w.wake();
                }
                Ok(())
            }
            Err(e) => {
                source.slot(interest).take();
                Err(e)
            }
        }
    }

    /// Drop the waker parked for `interest`, if any.
    pub fn unregister(&self, fd: RawFd, interest: Interest) {
        let mut sources = self.sources.borrow_mut();
        if let Some(source) = sources.get_mut(&fd) {
            source.slot(interest).take();
            self.rearm(fd, source);
        }
    }

    /// Whether a waker is parked for `interest`.
    pub fn is_registered(&self, fd: RawFd, interest: Interest) -> bool {
        self.sources
            .borrow_mut()
            .get_mut(&fd)
            .map_or(false, |s| s.slot(interest).is_some())
    }

    /// Wake the waiter on `interest` as if the descriptor became ready.
    /// Returns whether a waiter was parked.
    pub fn fire(&self, fd: RawFd, interest: Interest) -> bool {
        let waker = {
            let mut sources = self.sources.borrow_mut();
            match sources.get_mut(&fd) {
                Some(source) => {
                    let w = source.slot(interest).take();
                    self.rearm(fd, source);
                    w
                }
                None => None,
            }
        };
        match waker {
            Some(w) => {
                w.wake();
                true
            }
            None => false,
        }
    }

    fn rearm(&self, fd: RawFd, source: &mut Source) {
        let wanted = source.wanted();
        if wanted == source.armed {
            return;
        }
        let res = if wanted == 0 {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, wanted)
        };
        if res.is_ok() {
            source.armed = wanted;
        }
    }

    /// Wait for readiness (`None` blocks indefinitely) and wake the
    /// parked tasks. Returns `(dispatched, woken)`: how many descriptor
    /// events were delivered and whether the wake fd fired.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<(usize, bool)> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };
        let mut events = self.events.borrow_mut();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok((0, false)),
                e => Err(Error::Os(e)),
            };
        }

        let mut woken = false;
        let mut ready: Vec<Waker> = Vec::new();
        {
            let mut sources = self.sources.borrow_mut();
            for ev in events.iter().take(n as usize) {
                let fd = ev.u64 as RawFd;
                if fd == self.wake_fd {
                    woken = true;
                    continue;
                }
                let Some(source) = sources.get_mut(&fd) else {
                    continue;
                };
                let bits = ev.events;
                let failed = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
                if failed || bits & libc::EPOLLIN as u32 != 0 {
                    ready.extend(source.reader.take());
                }
                if failed || bits & libc::EPOLLOUT as u32 != 0 {
                    ready.extend(source.writer.take());
                }
                self.rearm(fd, source);
            }
        }
        let dispatched = ready.len();
        for w in ready {
            w.wake();
        }
        Ok((dispatched, woken))
    }

    /// A future resolving once `fd` is ready for `interest`.
    pub fn readiness(&self, fd: RawFd, interest: Interest) -> Readiness<'_> {
        Readiness {
            reactor: self,
            fd,
            interest,
            registered: false,
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Resolves when the reactor takes the parked waker back out, i.e. the
/// descriptor became ready, was [fired](Reactor::fire), or was detached.
/// Fails with [`Error::Closed`] if the descriptor is not attached.
pub struct Readiness<'a> {
    reactor: &'a Reactor,
    fd: RawFd,
    interest: Interest,
    registered: bool,
}

impl Future for Readiness<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if !self.registered {
            self.reactor.register(self.fd, self.interest, cx.waker().clone())?;
            self.registered = true;
            return Poll::Pending;
        }
        if self.reactor.is_registered(self.fd, self.interest) {
            // Spurious poll: refresh the waker in case the task moved.
            self.reactor.register(self.fd, self.interest, cx.waker().clone())?;
            return Poll::Pending;
        }
        self.registered = false;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Readiness<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.reactor.unregister(self.fd, self.interest);
        }
    }
}
