//! # File: blocking descriptors behind the job bridge
//!
//! Regular files never report would-block, so every syscall on them runs
//! on a pool worker. A file allows one outstanding job at a time; a
//! second concurrent operation fails with [`Error::Busy`].
//!
//! Reads use the same parser protocol as streams. The input buffer is
//! moved into each read job and handed back at reap, so the loop thread
//! and the worker never share it.
//!
//! A job owns the file until it is reaped. Dropping an operation's future
//! does not end that: the file stays busy, any input the job read is
//! returned to the buffer, and if the `File` itself is dropped the
//! descriptor is closed only after the worker lets go of it. Bytes a
//! parser had already set aside for a result longer than the buffer are
//! given back when a read ends, but not when its future is dropped.

use crate::stream::Stream;
use crate::waiter::JobClaim;

use evio_core::{ktrace, EndReason, Errno, Error, InputBuffer, Parse, Parser, Result};
use evio_runtime::sys::{cvt, cvt_size, set_nonblocking, Descriptor};
use evio_runtime::Handle;

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::rc::Rc;

/// Reference point for [`File::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    fn as_raw(self) -> libc::c_int {
        match self {
            Whence::Set => libc::SEEK_SET,
            Whence::Cur => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        }
    }
}

pub struct File {
    /// None once closed; jobs in flight hold clones
    desc: RefCell<Option<Rc<Descriptor>>>,
    /// Held from submission until the job is reaped
    pub(crate) busy: Rc<Cell<bool>>,
    /// Taken while a read job owns it
    buf: Rc<RefCell<Option<InputBuffer>>>,
    handle: Handle,
}

impl File {
    /// Wrap `fd` on the current thread's loop.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        Ok(Self::new(Handle::current()?, fd))
    }

    pub(crate) fn new(handle: Handle, fd: OwnedFd) -> Self {
        Self {
            desc: RefCell::new(Some(Rc::new(Descriptor::new(fd.into_raw_fd(), true)))),
            busy: Rc::new(Cell::new(false)),
            buf: Rc::new(RefCell::new(Some(InputBuffer::new()))),
            handle,
        }
    }

    /// The open descriptor, shared so a job can keep it alive.
    pub(crate) fn lease(&self) -> Result<Rc<Descriptor>> {
        self.desc.borrow().clone().ok_or(Error::Closed)
    }

    fn claim(&self) -> Result<JobClaim> {
        JobClaim::claim(&[&self.busy])
    }

    pub fn closed(&self) -> bool {
        self.desc.borrow().is_none()
    }

    /// Whether a job is in flight, including one whose operation was
    /// dropped before it was reaped.
    pub fn busy(&self) -> bool {
        self.busy.get()
    }

    /// Read until `parser` completes. End of file is reported to the
    /// parser as a peer close.
    pub async fn read<P: Parser>(&self, mut parser: P) -> Result<P::Output> {
        let desc = self.lease()?;
        let claim = self.claim()?;
        let fd = desc.raw();

        let mut buf = self.buf.borrow_mut().take().unwrap_or_default();
        parser.init(&mut buf);
        loop {
            if let Parse::Done(out) = parser.process(&mut buf) {
                *self.buf.borrow_mut() = Some(buf);
                return Ok(out);
            }
            if !buf.reserve_tail() {
                parser.restore(&mut buf);
                *self.buf.borrow_mut() = Some(buf);
                return Err(Error::Os(Errno::ENOBUFS));
            }

            let home = Rc::clone(&self.buf);
            let held = (claim.clone(), Rc::clone(&desc));
            let (back, res) = self
                .handle
                .execute(move || {
                    let res = read_into(fd, &mut buf);
                    (buf, res)
                })
                .on_orphan(move |done| {
                    if let Ok((buf, _)) = done {
                        *home.borrow_mut() = Some(buf);
                    }
                    drop(held);
                })
                .await?;
            buf = back;

            let reason = match res {
                Ok(0) => EndReason::PeerClosed,
                Ok(n) => {
                    ktrace!("read {} bytes from file fd {}", n, fd);
                    continue;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => EndReason::Error(e),
            };
            let out = parser.destroy(&mut buf, reason);
            parser.restore(&mut buf);
            *self.buf.borrow_mut() = Some(buf);
            return out.ok_or_else(|| reason.into_error());
        }
    }

    /// Write every buffer, in order, from the current offset.
    pub async fn write(&self, bufs: &[&[u8]]) -> Result<usize> {
        let desc = self.lease()?;
        let claim = self.claim()?;
        let fd = desc.raw();
        let data = bufs.concat();
        self.handle
            .execute(move || write_all(fd, &data))
            .on_orphan(move |_| drop((claim, desc)))
            .await?
    }

    /// Reposition the file offset; returns the new offset. Buffered input
    /// that no parser consumed is discarded.
    pub async fn seek(&self, whence: Whence, offset: i64) -> Result<u64> {
        let desc = self.lease()?;
        let claim = self.claim()?;
        let fd = desc.raw();
        let home = Rc::clone(&self.buf);
        let pos = self
            .handle
            .execute(move || {
                let ret = unsafe { libc::lseek(fd, offset as libc::off_t, whence.as_raw()) };
                if ret < 0 {
                    Err(Error::last_os_error())
                } else {
                    Ok(ret as u64)
                }
            })
            .on_orphan(move |_| {
                discard_input(&home);
                drop((claim, desc));
            })
            .await??;
        discard_input(&self.buf);
        Ok(pos)
    }

    /// Close the file. Fails with `Busy` while a job is outstanding.
    pub fn close(&self) -> Result<()> {
        self.lease()?;
        if self.busy.get() {
            return Err(Error::Busy);
        }
        let Some(desc) = self.desc.borrow_mut().take() else {
            return Err(Error::Closed);
        };
        match Rc::try_unwrap(desc) {
            Ok(desc) => desc.close(),
            // Still leased; the last holder closes it.
            Err(_) => Ok(()),
        }
    }
}

fn discard_input(buf: &RefCell<Option<InputBuffer>>) {
    if let Some(buf) = buf.borrow_mut().as_mut() {
        buf.clear();
    }
}

impl AsRawFd for File {
    /// -1 once closed
    fn as_raw_fd(&self) -> RawFd {
        self.desc.borrow().as_ref().map_or(-1, |d| d.raw())
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("fd", &self.as_raw_fd())
            .field("busy", &self.busy.get())
            .finish()
    }
}

/// One `read(2)` into the free tail. Runs on a worker.
fn read_into(fd: RawFd, buf: &mut InputBuffer) -> std::result::Result<usize, Errno> {
    let spare = buf.spare_mut();
    let n = unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) };
    if n < 0 {
        return Err(Errno::last());
    }
    buf.commit(n as usize);
    Ok(n as usize)
}

/// Runs on a worker.
fn write_all(fd: RawFd, mut data: &[u8]) -> Result<usize> {
    let total = data.len();
    while !data.is_empty() {
        let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        match cvt_size(ret) {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => data = &data[n..],
            Err(Error::Os(Errno::EINTR)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

// ── open ─────────────────────────────────────────────────────────────

/// What [`open`] produced: regular files are driven through the job
/// bridge, everything else (FIFOs, character devices, sockets) is a
/// non-blocking stream.
#[derive(Debug)]
pub enum Opened {
    File(File),
    Stream(Stream),
}

impl Opened {
    pub fn into_file(self) -> Option<File> {
        match self {
            Opened::File(f) => Some(f),
            Opened::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<Stream> {
        match self {
            Opened::Stream(s) => Some(s),
            Opened::File(_) => None,
        }
    }
}

/// `fopen`-style mode: `r`, `w`, `a`, `r+`, `w+`, `a+`, each optionally
/// with a `b` that is accepted and ignored.
pub(crate) fn parse_mode(mode: &str) -> Result<libc::c_int> {
    let mut chars = mode.chars().filter(|&c| c != 'b');
    let base = chars.next();
    let plus = match chars.next() {
        None => false,
        Some('+') => true,
        Some(_) => return Err(Error::InvalidArgument("invalid mode string")),
    };
    if chars.next().is_some() || mode.matches('b').count() > 1 || mode.starts_with('b') {
        return Err(Error::InvalidArgument("invalid mode string"));
    }
    let flags = match (base, plus) {
        (Some('r'), false) => libc::O_RDONLY,
        (Some('r'), true) => libc::O_RDWR,
        (Some('w'), false) => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        (Some('w'), true) => libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
        (Some('a'), false) => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
        (Some('a'), true) => libc::O_RDWR | libc::O_CREAT | libc::O_APPEND,
        _ => return Err(Error::InvalidArgument("invalid mode string")),
    };
    Ok(flags)
}

/// Open `path` without blocking the loop: `open(2)` and `fstat(2)` run on
/// a worker.
pub async fn open(path: impl AsRef<Path>, mode: &str) -> Result<Opened> {
    let flags = parse_mode(mode)?;
    let path = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("path contains a NUL byte"))?;
    let handle = Handle::current()?;

    let (fd, regular) = handle
        .execute(move || -> Result<(OwnedFd, bool)> {
            let raw = cvt(unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, 0o666 as libc::c_uint) })?;
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            cvt(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) })?;
            let regular = st.st_mode & libc::S_IFMT == libc::S_IFREG;
            if !regular {
                set_nonblocking(fd.as_raw_fd(), true)?;
            }
            Ok((fd, regular))
        })
        .await??;

    if regular {
        Ok(Opened::File(File::new(handle, fd)))
    } else {
        Ok(Opened::Stream(Stream::attach(handle, fd.into_raw_fd(), true)?))
    }
}
