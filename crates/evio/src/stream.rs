//! # Stream: non-blocking byte channel
//!
//! Wraps a socket, pipe or character device. Each direction has its own
//! waiter slot, so one task may read while another writes, but a second
//! concurrent read (or write) fails with [`Error::Busy`].
//!
//! ```text
//!  read(parser)                           write(bufs)
//!  ────────────                           ───────────
//!  init + process ─► Done? return         writev from cursor
//!  loop:                                  short write ─► advance cursor
//!    read(2) into buffer tail             EAGAIN ─► await writable
//!    process ─► Done? return              EPIPE/ECONNRESET/0 ─► Closed
//!    EAGAIN ─► await readable             other errno ─► Os(errno)
//!    EOF/reset ─► destroy(PeerClosed)     (fatal: both directions shut)
//! ```
//!
//! Input that a parser leaves unconsumed stays buffered for the next
//! read, and so does input it set aside for a result it never produced.

use crate::waiter::Waiter;

use evio_core::{kdebug, ktrace, kwarn, EndReason, Errno, Error, InputBuffer, Parse, Parser, Result};
use evio_runtime::sys::{cvt, set_nonblocking, Descriptor};
use evio_runtime::{Handle, Interest};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// Upper bound on iovecs handed to a single `writev`
const MAX_IOV: usize = 1024;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const CORK_OPTION: libc::c_int = libc::TCP_CORK;
    } else {
        const CORK_OPTION: libc::c_int = libc::TCP_NOPUSH;
    }
}

pub struct Stream {
    /// None once closed; a transfer job in flight holds a clone
    desc: RefCell<Option<Rc<Descriptor>>>,
    pub(crate) reading: Cell<bool>,
    pub(crate) writing: Rc<Cell<bool>>,
    /// A zero-copy transfer holds the descriptor in blocking mode
    pub(crate) transferring: Rc<Cell<bool>>,
    buf: RefCell<InputBuffer>,
    pub(crate) handle: Handle,
    on_close: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Stream {
    /// Wrap `fd` on the current thread's loop, switching it to
    /// non-blocking mode.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        let handle = Handle::current()?;
        set_nonblocking(fd.as_raw_fd(), true)?;
        Self::attach(handle, fd.into_raw_fd(), true)
    }

    /// `fd` must already be non-blocking. `owned` descriptors are closed
    /// with the stream (stdio is not); on failure an owned `fd` is closed.
    pub(crate) fn attach(handle: Handle, fd: RawFd, owned: bool) -> Result<Self> {
        if let Err(e) = handle.reactor().attach(fd) {
            if owned {
                evio_runtime::sys::close_fd(fd);
            }
            return Err(e);
        }
        ktrace!("stream on fd {}", fd);
        Ok(Self {
            desc: RefCell::new(Some(Rc::new(Descriptor::new(fd, owned)))),
            reading: Cell::new(false),
            writing: Rc::new(Cell::new(false)),
            transferring: Rc::new(Cell::new(false)),
            buf: RefCell::new(InputBuffer::new()),
            handle,
            on_close: RefCell::new(None),
        })
    }

    /// Run `hook` once when the descriptor is released.
    pub(crate) fn set_on_close(&self, hook: Box<dyn FnOnce()>) {
        *self.on_close.borrow_mut() = Some(hook);
    }

    #[inline]
    pub(crate) fn live_fd(&self) -> Result<RawFd> {
        self.desc.borrow().as_ref().map(|d| d.raw()).ok_or(Error::Closed)
    }

    /// The open descriptor, shared so a job can keep it alive.
    pub(crate) fn lease(&self) -> Result<Rc<Descriptor>> {
        self.desc.borrow().clone().ok_or(Error::Closed)
    }

    pub fn closed(&self) -> bool {
        self.desc.borrow().is_none()
    }

    /// Bytes received but not yet consumed by a parser.
    pub fn buffered(&self) -> usize {
        self.buf.borrow().len()
    }

    /// Read until `parser` completes.
    ///
    /// Fails with `Closed` on a closed stream or when the peer closes and
    /// the parser salvages nothing, `Busy` if another read or a zero-copy
    /// transfer is pending, and `Os(ENOBUFS)` if the parser stalls on a
    /// full buffer.
    pub async fn read<P: Parser>(&self, parser: P) -> Result<P::Output> {
        self.live_fd()?;
        if self.transferring.get() {
            return Err(Error::Busy);
        }
        let _waiter = Waiter::claim(&self.reading)?;
        let mut active = Active {
            parser,
            buf: &self.buf,
        };

        {
            let mut buf = self.buf.borrow_mut();
            active.parser.init(&mut buf);
            if let Parse::Done(out) = active.parser.process(&mut buf) {
                return Ok(out);
            }
        }

        loop {
            let fd = self.live_fd()?;
            if let Some(out) = self.drain(fd, &mut active.parser)? {
                return Ok(out);
            }
            self.handle.readiness(fd, Interest::Read).await?;
        }
    }

    /// Read everything the kernel has, feeding the parser after each
    /// chunk. `Ok(None)` means the descriptor would block.
    fn drain<P: Parser>(&self, fd: RawFd, parser: &mut P) -> Result<Option<P::Output>> {
        let mut buf = self.buf.borrow_mut();
        loop {
            if !buf.reserve_tail() {
                return Err(Error::Os(Errno::ENOBUFS));
            }
            let spare = buf.spare_mut();
            let n = unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) };
            if n > 0 {
                ktrace!("read {} bytes from fd {}", n, fd);
                buf.commit(n as usize);
                if let Parse::Done(out) = parser.process(&mut buf) {
                    return Ok(Some(out));
                }
                continue;
            }

            let reason = if n == 0 {
                EndReason::PeerClosed
            } else {
                match Errno::last() {
                    Errno::EAGAIN => return Ok(None),
                    Errno::EINTR => continue,
                    Errno::ECONNRESET | Errno::EPIPE => EndReason::PeerClosed,
                    e => EndReason::Error(e),
                }
            };
            kdebug!("input on fd {} ended: {}", fd, reason);
            return match parser.destroy(&mut buf, reason) {
                Some(out) => Ok(Some(out)),
                None => Err(reason.into_error()),
            };
        }
    }

    /// Write every buffer, in order. Returns the total byte count.
    ///
    /// A zero-progress write or a broken connection fails with `Closed`;
    /// any other error fails with `Os`. Both shut the stream down in
    /// both directions.
    pub async fn write(&self, bufs: &[&[u8]]) -> Result<usize> {
        self.live_fd()?;
        let _waiter = Waiter::claim(&self.writing)?;

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut cursor = Cursor::default();
        loop {
            let fd = self.live_fd()?;
            if self.flush(fd, bufs, &mut cursor)? {
                return Ok(total);
            }
            self.handle.readiness(fd, Interest::Write).await?;
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<usize> {
        self.write(&[data]).await
    }

    /// Write from `cursor` until done (`true`) or the descriptor would
    /// block (`false`).
    fn flush(&self, fd: RawFd, bufs: &[&[u8]], cursor: &mut Cursor) -> Result<bool> {
        let mut iov: Vec<libc::iovec> = Vec::new();
        loop {
            cursor.skip_finished(bufs);
            if cursor.idx == bufs.len() {
                return Ok(true);
            }

            iov.clear();
            iov.extend(bufs[cursor.idx..].iter().take(MAX_IOV).enumerate().map(|(i, b)| {
                let b = if i == 0 { &b[cursor.off..] } else { *b };
                libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                }
            }));
            let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
            if n > 0 {
                ktrace!("wrote {} bytes to fd {}", n, fd);
                cursor.advance(bufs, n as usize);
                continue;
            }

            let err = if n == 0 {
                Error::Closed
            } else {
                match Errno::last() {
                    Errno::EAGAIN => return Ok(false),
                    Errno::EINTR => continue,
                    Errno::EPIPE | Errno::ECONNRESET => Error::Closed,
                    e => Error::Os(e),
                }
            };
            kwarn!("write to fd {} failed ({}); shutting stream down", fd, err);
            self.shutdown();
            return Err(err);
        }
    }

    /// Enable `TCP_CORK` (`TCP_NOPUSH` on BSD/macOS).
    pub fn cork(&self) -> Result<()> {
        self.set_cork(true)
    }

    pub fn uncork(&self) -> Result<()> {
        self.set_cork(false)
    }

    fn set_cork(&self, on: bool) -> Result<()> {
        let fd = self.live_fd()?;
        if self.writing.get() {
            return Err(Error::Busy);
        }
        let val = on as libc::c_int;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                CORK_OPTION,
                &val as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// Close the stream. Fails with `Busy` while an operation is pending.
    pub fn close(&self) -> Result<()> {
        self.live_fd()?;
        if self.reading.get() || self.writing.get() {
            return Err(Error::Busy);
        }
        self.release()
    }

    /// Close both directions regardless of pending operations; waiters
    /// observe `Closed` when they resume.
    pub(crate) fn shutdown(&self) {
        if !self.closed() {
            let _ = self.release();
        }
    }

    fn release(&self) -> Result<()> {
        let Some(desc) = self.desc.borrow_mut().take() else {
            return Err(Error::Closed);
        };
        let fd = desc.raw();
        self.handle.reactor().detach(fd);
        let ret = match Rc::try_unwrap(desc) {
            Ok(desc) => desc.close(),
            Err(_) => {
                kdebug!("fd {} still used by a transfer; closing once it is reaped", fd);
                Ok(())
            }
        };
        if let Some(hook) = self.on_close.borrow_mut().take() {
            hook();
        }
        ktrace!("closed fd {}", fd);
        ret
    }
}

impl AsRawFd for Stream {
    /// -1 once closed
    fn as_raw_fd(&self) -> RawFd {
        self.desc.borrow().as_ref().map_or(-1, |d| d.raw())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("fd", &self.as_raw_fd())
            .field("reading", &self.reading.get())
            .field("writing", &self.writing.get())
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// The parser of a read in progress. However the read ends, including by
/// its future being dropped, bytes the parser set aside go back to the
/// buffer.
struct Active<'a, P: Parser> {
    parser: P,
    buf: &'a RefCell<InputBuffer>,
}

impl<P: Parser> Drop for Active<'_, P> {
    fn drop(&mut self) {
        if let Ok(mut buf) = self.buf.try_borrow_mut() {
            self.parser.restore(&mut buf);
        }
    }
}

/// Position within a list of output buffers
#[derive(Debug, Default)]
struct Cursor {
    idx: usize,
    off: usize,
}

impl Cursor {
    fn skip_finished(&mut self, bufs: &[&[u8]]) {
        while self.idx < bufs.len() && self.off == bufs[self.idx].len() {
            self.idx += 1;
            self.off = 0;
        }
    }

    fn advance(&mut self, bufs: &[&[u8]], mut n: usize) {
        while n > 0 {
            let left = bufs[self.idx].len() - self.off;
            if n < left {
                self.off += n;
                return;
            }
            n -= left;
            self.idx += 1;
            self.off = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{poll_once, test_loop};
    use evio_core::{All, Available, Line, Target};
    use evio_runtime::yield_now;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (Stream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Stream::from_owned_fd(a.into()).unwrap(), b)
    }

    #[test]
    fn test_cursor_advances_across_buffers() {
        let bufs: [&[u8]; 4] = [b"abc", b"", b"de", b"f"];
        let mut c = Cursor::default();
        c.advance(&bufs, 2);
        assert_eq!((c.idx, c.off), (0, 2));
        c.advance(&bufs, 1);
        c.skip_finished(&bufs);
        assert_eq!((c.idx, c.off), (2, 0));
        c.advance(&bufs, 3);
        c.skip_finished(&bufs);
        assert_eq!(c.idx, 4);
    }

    #[test]
    fn test_line_split_across_chunks_keeps_remainder() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let writer = thread::spawn(move || {
            peer.write_all(b"a").unwrap();
            thread::sleep(Duration::from_millis(20));
            peer.write_all(b"b\ncd").unwrap();
            thread::sleep(Duration::from_millis(20));
        });
        ev.block_on(async {
            assert_eq!(s.read(Line::new()).await.unwrap(), b"ab");
            writer.join().unwrap();
            // Peer gone before a second delimiter arrived.
            assert_eq!(s.read(Line::new()).await, Err(Error::Closed));
            assert_eq!(s.buffered(), 2);
            assert_eq!(s.read(Available).await.unwrap(), b"cd");
        })
        .unwrap();
    }

    #[test]
    fn test_target_over_single_byte_writes() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let writer = thread::spawn(move || {
            for b in b"hello world" {
                peer.write_all(std::slice::from_ref(b)).unwrap();
                thread::sleep(Duration::from_millis(2));
            }
            peer
        });
        ev.block_on(async {
            assert_eq!(s.read(Target::new(5)).await.unwrap(), b"hello");
            assert_eq!(s.read(Target::new(6)).await.unwrap(), b" world");
        })
        .unwrap();
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_second_reader_is_busy_but_writer_is_not() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let s = Rc::new(s);
        let reader = {
            let s = s.clone();
            ev.spawn(async move { s.read(Line::new()).await })
        };
        ev.block_on(async {
            yield_now().await;
            assert_eq!(s.read(Available).await, Err(Error::Busy));
            assert_eq!(s.close(), Err(Error::Busy));
            assert_eq!(s.write_all(b"pong").await, Ok(4));
            peer.write_all(b"ping\n").unwrap();
            assert_eq!(reader.await.unwrap(), b"ping");
        })
        .unwrap();
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");
    }

    #[test]
    fn test_closed_stream_fails_fast() {
        let ev = test_loop();
        let (s, _peer) = pair();
        assert!(!s.closed());
        s.close().unwrap();
        assert!(s.closed());
        assert_eq!(s.as_raw_fd(), -1);
        ev.block_on(async {
            assert_eq!(s.read(Available).await, Err(Error::Closed));
            assert_eq!(s.write_all(b"x").await, Err(Error::Closed));
        })
        .unwrap();
        assert_eq!(s.cork(), Err(Error::Closed));
        assert_eq!(s.close(), Err(Error::Closed));
    }

    #[test]
    fn test_large_scatter_write_delivers_exactly() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let a: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        let b: Vec<u8> = (0..300_001u32).map(|i| (i % 13) as u8).collect();
        let mut expect = a.clone();
        expect.extend_from_slice(&b);

        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            peer.read_to_end(&mut got).unwrap();
            got
        });
        let n = ev
            .block_on(async { s.write(&[&a[..], &[][..], &b[..]]).await })
            .unwrap()
            .unwrap();
        assert_eq!(n, expect.len());
        s.close().unwrap();
        let got = reader.join().unwrap();
        assert_eq!(got.len(), expect.len());
        assert!(got == expect);
    }

    #[test]
    fn test_write_to_vanished_peer_closes_stream() {
        let ev = test_loop();
        let (s, peer) = pair();
        drop(peer);
        let res = ev.block_on(async { s.write_all(b"anyone?").await }).unwrap();
        assert_eq!(res, Err(Error::Closed));
        assert!(s.closed());
    }

    #[test]
    fn test_all_collects_until_eof() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let sent = body.clone();
        let writer = thread::spawn(move || {
            for chunk in sent.chunks(777) {
                peer.write_all(chunk).unwrap();
            }
        });
        let got = ev.block_on(async { s.read(All::new()).await }).unwrap().unwrap();
        writer.join().unwrap();
        assert!(got == body);
    }

    #[test]
    fn test_stalled_parser_fails_with_enobufs() {
        struct Never;
        impl Parser for Never {
            type Output = ();
            fn process(&mut self, _buf: &mut InputBuffer) -> Parse<()> {
                Parse::Pending
            }
        }

        let ev = test_loop();
        let (s, mut peer) = pair();
        peer.write_all(&[b'x'; 5000]).unwrap();
        let res = ev.block_on(async { s.read(Never).await }).unwrap();
        assert_eq!(res, Err(Error::Os(Errno::ENOBUFS)));
        assert!(!s.closed());
    }

    #[test]
    fn test_cork_on_tcp() {
        let ev = test_loop();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let s = Stream::from_owned_fd(server_side.into()).unwrap();
        s.cork().unwrap();
        ev.block_on(async { s.write_all(b"corked").await }).unwrap().unwrap();
        s.uncork().unwrap();
        let mut got = [0u8; 6];
        let mut client = client;
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"corked");
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let _ev = test_loop();
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let s = Stream::from_owned_fd(a.into()).unwrap();
        let dup = Stream::attach(Handle::current().unwrap(), raw, false);
        assert_eq!(dup.unwrap_err(), Error::Os(Errno::EEXIST));
        assert!(!s.closed());
    }

    #[test]
    fn test_parked_write_blocks_second_writer_and_cork() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let s = Rc::new(s);
        let writer = {
            let s = s.clone();
            let big = vec![7u8; 4_000_000];
            ev.spawn(async move { s.write_all(&big).await })
        };
        let drain = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut got = vec![0u8; 4_000_000];
            peer.read_exact(&mut got).unwrap();
            (peer, got)
        });
        ev.block_on(async {
            yield_now().await;
            // The first write has filled the socket buffer and is parked.
            assert!(s.writing.get());
            assert_eq!(s.write_all(b"second").await, Err(Error::Busy));
            assert_eq!(s.cork(), Err(Error::Busy));
            assert_eq!(s.uncork(), Err(Error::Busy));
            assert_eq!(s.close(), Err(Error::Busy));
            assert_eq!(writer.await, Ok(4_000_000));
            assert_eq!(s.write_all(b"after").await, Ok(5));
        })
        .unwrap();
        let (mut peer, got) = drain.join().unwrap();
        assert!(got.iter().all(|&b| b == 7));
        let mut tail = [0u8; 5];
        peer.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"after");
    }

    #[test]
    fn test_read_error_surfaces_errno() {
        let ev = test_loop();
        let dir = std::fs::File::open(std::env::temp_dir()).unwrap();
        let s = Stream::from_owned_fd(dir.into()).unwrap();
        let res = ev.block_on(async { s.read(Available).await }).unwrap();
        assert_eq!(res, Err(Error::Os(Errno::EISDIR)));
        // Read errors leave the stream open.
        assert!(!s.closed());
    }

    #[test]
    fn test_long_line_survives_eof_and_cancel() {
        let ev = test_loop();
        let (s, mut peer) = pair();
        let long = vec![b'q'; 6000];
        peer.write_all(&long).unwrap();

        // Dropped while waiting for more: nothing set aside is lost.
        {
            let mut read = Box::pin(s.read(Line::new()));
            assert!(poll_once(read.as_mut()).is_pending());
        }
        assert_eq!(s.buffered(), 6000);

        drop(peer);
        ev.block_on(async {
            assert_eq!(s.read(Line::new()).await, Err(Error::Closed));
            assert_eq!(s.buffered(), 6000);
            assert!(s.read(Available).await.unwrap() == long);
        })
        .unwrap();
    }
}
