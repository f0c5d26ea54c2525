//! Zero-copy File → Stream transfer
//!
//! `sendfile` on a non-blocking socket returns `EAGAIN` as soon as the send
//! buffer fills, so the job flips the stream's descriptor to blocking mode
//! for the duration of the call and back afterwards. While that happens
//! the stream is unusable from the loop: reads and writes fail with
//! `Busy` until the job is reaped.

use crate::file::File;
use crate::stream::Stream;
use crate::waiter::JobClaim;

use evio_core::{kdebug, kerror, Errno, Error, Result};
use evio_runtime::sys::set_nonblocking;

use std::os::unix::io::{AsRawFd, RawFd};

struct Sent {
    result: Result<u64>,
    /// The descriptor may still be in blocking mode
    restore_failed: bool,
}

impl Stream {
    /// Send `size` bytes of `file` starting at `offset`, without copying
    /// through user space. Returns the number of bytes sent, which is
    /// short only if the file ends first.
    ///
    /// The stream and the file stay busy until the job is reaped, even if
    /// this future is dropped first.
    pub async fn sendfile(&self, file: &File, size: u64, offset: u64) -> Result<u64> {
        let sock = self.lease()?;
        let src = file.lease()?;
        if self.reading.get() || self.writing.get() || self.transferring.get() || file.busy() {
            return Err(Error::Busy);
        }
        if size == 0 {
            return Ok(0);
        }

        let claim = JobClaim::claim(&[&self.writing, &self.transferring, &file.busy])?;
        let (sock_fd, src_fd) = (sock.raw(), src.raw());
        let sent = self
            .handle
            .execute(move || {
                if let Err(e) = set_nonblocking(sock_fd, false) {
                    return Sent {
                        result: Err(e),
                        restore_failed: false,
                    };
                }
                let result = send_all(src_fd, sock_fd, offset, size);
                let restore_failed = set_nonblocking(sock_fd, true).is_err();
                Sent {
                    result,
                    restore_failed,
                }
            })
            .on_orphan(move |done| {
                if let Ok(Sent { restore_failed: true, .. }) = done {
                    kerror!("fd {} left in blocking mode by a dropped sendfile; shutting down", sock_fd);
                    unsafe {
                        libc::shutdown(sock.raw(), libc::SHUT_RDWR);
                    }
                }
                drop((claim, sock, src));
            })
            .await?;

        if let Ok(n) = sent.result {
            kdebug!("sendfile moved {} bytes from fd {} to fd {}", n, src_fd, sock_fd);
        }
        self.settle(sent)
    }

    fn settle(&self, sent: Sent) -> Result<u64> {
        if sent.restore_failed {
            kerror!("fd {} left in blocking mode after sendfile; closing", self.as_raw_fd());
            self.shutdown();
        }
        sent.result
    }
}

/// Loop the platform call until `size` bytes are out or the file ends.
fn send_all(src: RawFd, sock: RawFd, offset: u64, size: u64) -> Result<u64> {
    let mut done = 0u64;
    while done < size {
        match send_chunk(src, sock, offset + done, size - done) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(Errno::EINTR) => {}
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(Error::Closed),
            Err(e) => return Err(Error::Os(e)),
        }
    }
    Ok(done)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn send_chunk(src: RawFd, sock: RawFd, offset: u64, len: u64) -> std::result::Result<u64, Errno> {
            let mut off = offset as libc::off_t;
            let len = len.min(isize::MAX as u64) as usize;
            let n = unsafe { libc::sendfile(sock, src, &mut off, len) };
            if n < 0 {
                return Err(Errno::last());
            }
            Ok(n as u64)
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        fn send_chunk(src: RawFd, sock: RawFd, offset: u64, len: u64) -> std::result::Result<u64, Errno> {
            let mut sent = len as libc::off_t;
            let ret = unsafe {
                libc::sendfile(src, sock, offset as libc::off_t, &mut sent, std::ptr::null_mut(), 0)
            };
            // Partial progress is reported alongside EINTR/EAGAIN.
            if ret < 0 && sent == 0 {
                return Err(Errno::last());
            }
            Ok(sent as u64)
        }
    } else if #[cfg(target_os = "freebsd")] {
        fn send_chunk(src: RawFd, sock: RawFd, offset: u64, len: u64) -> std::result::Result<u64, Errno> {
            let mut sent: libc::off_t = 0;
            let ret = unsafe {
                libc::sendfile(
                    src,
                    sock,
                    offset as libc::off_t,
                    len as libc::size_t,
                    std::ptr::null_mut(),
                    &mut sent,
                    0,
                )
            };
            if ret < 0 && sent == 0 {
                return Err(Errno::last());
            }
            Ok(sent as u64)
        }
    } else {
        fn send_chunk(_src: RawFd, _sock: RawFd, _offset: u64, _len: u64) -> std::result::Result<u64, Errno> {
            Err(Errno::ENOSYS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{open, Whence};
    use crate::testing::{poll_once, temp_path, test_loop};
    use evio_core::Available;
    use evio_runtime::sys::is_nonblocking;
    use evio_runtime::yield_now;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (Stream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Stream::from_owned_fd(a.into()).unwrap(), b)
    }

    #[test]
    fn test_empty_transfer_touches_nothing() {
        let ev = test_loop();
        let path = temp_path("sendfile-empty");
        std::fs::write(&path, b"payload").unwrap();
        let (s, _peer) = pair();
        ev.block_on(async {
            let f = open(&path, "r").await.unwrap().into_file().unwrap();
            assert_eq!(s.sendfile(&f, 0, 0).await, Ok(0));
            assert_eq!(ev.handle().jobs_in_flight(), 0);
        })
        .unwrap();
        assert!(is_nonblocking(s.as_raw_fd()).unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_transfer_from_offset() {
        let ev = test_loop();
        let path = temp_path("sendfile-offset");
        std::fs::write(&path, b"0123456789abcdef").unwrap();
        let (s, mut peer) = pair();
        ev.block_on(async {
            let f = open(&path, "r").await.unwrap().into_file().unwrap();
            assert_eq!(s.sendfile(&f, 6, 4).await, Ok(6));
            // Past the end of the file: short count.
            assert_eq!(s.sendfile(&f, 100, 14).await, Ok(2));
        })
        .unwrap();
        assert!(is_nonblocking(s.as_raw_fd()).unwrap());
        let mut got = [0u8; 8];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"456789ef");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_stream_is_busy_during_transfer() {
        let ev = test_loop();
        let path = temp_path("sendfile-busy");
        let body: Vec<u8> = (0..4_000_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(&path, &body).unwrap();
        let (s, mut peer) = pair();
        let s = Rc::new(s);
        let f = Rc::new(
            ev.block_on(open(path.clone(), "r"))
                .unwrap()
                .unwrap()
                .into_file()
                .unwrap(),
        );

        let drain = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut got = vec![0u8; 4_000_000];
            peer.read_exact(&mut got).unwrap();
            got
        });
        let transfer = {
            let (s, f) = (s.clone(), f.clone());
            ev.spawn(async move { s.sendfile(&f, 4_000_000, 0).await })
        };
        ev.block_on(async {
            yield_now().await;
            assert_eq!(s.read(Available).await, Err(Error::Busy));
            assert_eq!(s.write_all(b"x").await, Err(Error::Busy));
            assert_eq!(s.sendfile(&f, 1, 0).await, Err(Error::Busy));
            assert_eq!(s.close(), Err(Error::Busy));
            assert!(f.busy());
            assert_eq!(transfer.await, Ok(4_000_000));
        })
        .unwrap();
        assert!(!f.busy());
        assert!(is_nonblocking(s.as_raw_fd()).unwrap());
        assert!(drain.join().unwrap() == body);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_closed_ends_fail() {
        let ev = test_loop();
        let path = temp_path("sendfile-closed");
        std::fs::write(&path, b"x").unwrap();
        let (s, _peer) = pair();
        ev.block_on(async {
            let f = open(&path, "r").await.unwrap().into_file().unwrap();
            f.close().unwrap();
            assert_eq!(s.sendfile(&f, 1, 0).await, Err(Error::Closed));
            let g = open(&path, "r").await.unwrap().into_file().unwrap();
            s.close().unwrap();
            assert_eq!(s.sendfile(&g, 1, 0).await, Err(Error::Closed));
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    fn big_file(name: &str, len: u32) -> (std::path::PathBuf, Vec<u8>) {
        let path = temp_path(name);
        let body: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
        std::fs::write(&path, &body).unwrap();
        (path, body)
    }

    #[test]
    fn test_dropped_transfer_holds_both_ends_until_reaped() {
        let ev = test_loop();
        let (path, body) = big_file("sendfile-dropped", 8_000_000);
        let (s, mut peer) = pair();
        let f = ev
            .block_on(open(path.clone(), "r"))
            .unwrap()
            .unwrap()
            .into_file()
            .unwrap();

        {
            let mut transfer = Box::pin(s.sendfile(&f, 8_000_000, 0));
            assert!(poll_once(transfer.as_mut()).is_pending());
        }
        // The worker is still inside sendfile with the socket blocking.
        assert!(f.busy());
        assert_eq!(ev.handle().jobs_in_flight(), 1);
        ev.block_on(async {
            assert_eq!(s.read(Available).await, Err(Error::Busy));
            assert_eq!(s.write_all(b"x").await, Err(Error::Busy));
            assert_eq!(f.seek(Whence::Set, 0).await, Err(Error::Busy));
            assert_eq!(s.sendfile(&f, 1, 0).await, Err(Error::Busy));
        })
        .unwrap();
        assert_eq!(s.cork(), Err(Error::Busy));
        assert_eq!(s.close(), Err(Error::Busy));
        assert_eq!(f.close(), Err(Error::Busy));
        assert_eq!(ev.handle().jobs_in_flight(), 1);

        let drain = thread::spawn(move || {
            let mut got = vec![0u8; 8_000_000];
            peer.read_exact(&mut got).unwrap();
            (peer, got)
        });
        let (_peer, got) = drain.join().unwrap();
        ev.run().unwrap();
        assert!(got == body);
        assert!(!f.busy());
        assert!(is_nonblocking(s.as_raw_fd()).unwrap());
        assert_eq!(ev.block_on(async { s.write_all(b"ok").await }).unwrap(), Ok(2));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_stream_dropped_mid_transfer_closes_after_reap() {
        let ev = test_loop();
        let (path, _) = big_file("sendfile-drop-stream", 4_000_000);
        let (s, mut peer) = pair();
        let f = ev
            .block_on(open(path.clone(), "r"))
            .unwrap()
            .unwrap()
            .into_file()
            .unwrap();

        let mut transfer = Box::pin(s.sendfile(&f, 4_000_000, 0));
        assert!(poll_once(transfer.as_mut()).is_pending());
        drop(transfer);
        drop(s);
        drop(f);

        // The descriptor stays open for the worker: every byte arrives,
        // then end of stream once the job is reaped.
        let drain = thread::spawn(move || {
            let mut got = Vec::new();
            peer.read_to_end(&mut got).unwrap();
            got.len()
        });
        ev.run().unwrap();
        assert_eq!(drain.join().unwrap(), 4_000_000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_failed_restore_shuts_stream() {
        let _ev = test_loop();
        let (s, _peer) = pair();
        let res = s.settle(Sent {
            result: Ok(3),
            restore_failed: true,
        });
        assert_eq!(res, Ok(3));
        assert!(s.closed());
    }
}
