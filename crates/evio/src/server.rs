//! # Server: listening sockets
//!
//! A server has a single accept slot. Either one `accept` or one
//! `autospawn` may be pending at a time; both can be woken early by
//! [`Server::interrupt`] (the socket stays open) or by [`Server::close`].

use crate::net::sockaddr_to_addr;
use crate::stream::Stream;
use crate::waiter::Waiter;

use evio_core::{kdebug, ktrace, kwarn, Errno, Error, Result};
use evio_runtime::sys::{cvt, set_nonblocking};
use evio_runtime::{Handle, Interest};

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

pub struct Server {
    fd: Cell<RawFd>,
    accepting: Cell<bool>,
    /// Set by `interrupt`, consumed by the pending accept
    interrupted: Cell<bool>,
    handle: Handle,
}

impl Server {
    /// Wrap a bound, listening socket on the current thread's loop.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        let handle = Handle::current()?;
        set_nonblocking(fd.as_raw_fd(), true)?;
        Self::attach(handle, fd.into_raw_fd())
    }

    /// Takes ownership of `fd`, closing it on failure.
    pub(crate) fn attach(handle: Handle, fd: RawFd) -> Result<Self> {
        if let Err(e) = handle.reactor().attach(fd) {
            evio_runtime::sys::close_fd(fd);
            return Err(e);
        }
        kdebug!("server listening on fd {}", fd);
        Ok(Self {
            fd: Cell::new(fd),
            accepting: Cell::new(false),
            interrupted: Cell::new(false),
            handle,
        })
    }

    #[inline]
    fn live_fd(&self) -> Result<RawFd> {
        match self.fd.get() {
            fd if fd >= 0 => Ok(fd),
            _ => Err(Error::Closed),
        }
    }

    pub fn closed(&self) -> bool {
        self.fd.get() < 0
    }

    /// Whether an accept or autospawn is pending.
    pub fn busy(&self) -> bool {
        self.accepting.get()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let fd = self.live_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        sockaddr_to_addr(&storage, len)
    }

    /// Wait for one connection.
    pub async fn accept(&self) -> Result<Stream> {
        self.live_fd()?;
        let _waiter = Waiter::claim(&self.accepting)?;
        self.interrupted.set(false);

        loop {
            let fd = self.live_fd()?;
            match accept_raw(fd) {
                Ok(conn) => return Stream::attach(self.handle.clone(), conn, true),
                Err(Errno::EAGAIN) => {}
                Err(Errno::EINTR) | Err(Errno::ECONNABORTED) | Err(Errno::EPROTO) => continue,
                Err(e) => return Err(Error::Os(e)),
            }
            self.wait_readable(fd).await?;
        }
    }

    /// Accept connections forever, spawning `factory(stream)` as its own
    /// task for each one.
    ///
    /// Returns `Closed` once the server is interrupted or closed. A
    /// connection that cannot be set up is logged and dropped. Running
    /// out of descriptors or memory is logged and retried on the next
    /// readiness event.
    pub async fn autospawn<F, Fut>(&self, mut factory: F) -> Result<()>
    where
        F: FnMut(Stream) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.live_fd()?;
        let _waiter = Waiter::claim(&self.accepting)?;
        self.interrupted.set(false);

        loop {
            let fd = self.live_fd()?;
            loop {
                match accept_raw(fd) {
                    Ok(conn) => self.admit(conn, &mut factory),
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) | Err(Errno::ECONNABORTED) | Err(Errno::EPROTO) => {}
                    Err(e @ (Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)) => {
                        kwarn!("accept on fd {} failed: {}; waiting", fd, e.desc());
                        break;
                    }
                    Err(e) => return Err(Error::Os(e)),
                }
            }
            self.wait_readable(fd).await?;
        }
    }

    /// Start a task for one accepted connection. One that cannot be
    /// attached is closed and logged.
    fn admit<F, Fut>(&self, conn: RawFd, factory: &mut F)
    where
        F: FnMut(Stream) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        match Stream::attach(self.handle.clone(), conn, true) {
            Ok(stream) => {
                ktrace!("autospawn: connection on fd {}", conn);
                drop(self.handle.spawn(factory(stream)));
            }
            Err(e) => kwarn!("autospawn: dropping connection on fd {}: {}", conn, e),
        }
    }

    /// Suspend until `fd` is readable; `Closed` if interrupted or closed
    /// meanwhile.
    async fn wait_readable(&self, fd: RawFd) -> Result<()> {
        self.handle.readiness(fd, Interest::Read).await?;
        if self.interrupted.replace(false) {
            ktrace!("accept on fd {} interrupted", fd);
            return Err(Error::Closed);
        }
        self.live_fd().map(drop)
    }

    /// Resume a pending accept or autospawn with `Closed`, leaving the
    /// socket open. Returns whether anything was pending.
    pub fn interrupt(&self) -> bool {
        let Ok(fd) = self.live_fd() else {
            return false;
        };
        if !self.accepting.get() {
            return false;
        }
        self.interrupted.set(true);
        self.handle.reactor().fire(fd, Interest::Read);
        true
    }

    /// Close the socket. A pending accept wakes and fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        let fd = self.live_fd()?;
        self.fd.set(-1);
        self.handle.reactor().detach(fd);
        cvt(unsafe { libc::close(fd) })?;
        kdebug!("server on fd {} closed", fd);
        Ok(())
    }
}

impl AsRawFd for Server {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("fd", &self.fd.get())
            .field("accepting", &self.accepting.get())
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
        fn accept_raw(fd: RawFd) -> std::result::Result<RawFd, Errno> {
            let conn = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if conn < 0 {
                return Err(Errno::last());
            }
            Ok(conn)
        }
    } else {
        fn accept_raw(fd: RawFd) -> std::result::Result<RawFd, Errno> {
            use nix::fcntl::{fcntl, FcntlArg, FdFlag};

            let conn = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if conn < 0 {
                return Err(Errno::last());
            }
            let setup = fcntl(conn, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(Error::from)
                .and_then(|_| set_nonblocking(conn, true));
            if let Err(e) = setup {
                evio_runtime::sys::close_fd(conn);
                return Err(e.errno().unwrap_or(Errno::EIO));
            }
            Ok(conn)
        }
    }
}
