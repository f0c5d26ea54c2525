//! Cross-thread wake source for the event loop.
//!
//! Worker threads finishing a job, and wakers fired off the loop thread,
//! write to the loop's eventfd. The fd is permanently registered with
//! the reactor, so `epoll_wait` returns and the loop drains its ready and
//! completion queues.
//!
//! Coalescing: multiple calls to `notify()` before the loop reads the
//! eventfd result in a single wakeup (eventfd counter semantics).

use evio_core::{Error, Errno, Result};

use std::os::unix::io::RawFd;

/// Wakes the event loop from another thread.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the loop wakes are coalesced.
pub trait Notifier: Send + Sync {
    fn notify(&self) -> Result<()>;
}

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking eventfd. The notifier closes it on drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Reset the counter after a wakeup. Returns the number of coalesced
    /// notifications, 0 if none were pending.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            // Counter saturated: a wakeup is already pending.
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(Error::Os(errno));
        }
        Ok(())
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_notifications_coalesce() {
        let n = EventFdNotifier::create().unwrap();
        assert_eq!(n.drain(), 0);
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert_eq!(n.drain(), 3);
        assert_eq!(n.drain(), 0);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let n = Arc::new(EventFdNotifier::create().unwrap());
        let remote = Arc::clone(&n);
        std::thread::spawn(move || remote.notify().unwrap())
            .join()
            .unwrap();
        assert_eq!(n.drain(), 1);
    }
}
