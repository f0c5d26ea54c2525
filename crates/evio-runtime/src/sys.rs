//! Thin helpers over raw libc calls

use evio_core::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::os::unix::io::RawFd;

/// Turn a `-1`-on-error libc return into a `Result`.
#[inline]
pub fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[inline]
pub fn cvt_size(ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Set or clear `O_NONBLOCK`.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(bits);
    if flags.contains(OFlag::O_NONBLOCK) == nonblocking {
        return Ok(());
    }
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> Result<bool> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    Ok(OFlag::from_bits_truncate(bits).contains(OFlag::O_NONBLOCK))
}

/// `close(2)`, ignoring the result. The descriptor is gone either way.
#[inline]
pub fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// A descriptor closed when its holder drops it. Wrapped in an `Rc`, a
/// clone parked with an in-flight job keeps the number from being reused
/// while a worker still uses it.
#[derive(Debug)]
pub struct Descriptor {
    fd: RawFd,
    /// Close on drop (false for borrowed descriptors such as stdio)
    owned: bool,
}

impl Descriptor {
    pub fn new(fd: RawFd, owned: bool) -> Self {
        Self { fd, owned }
    }

    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Close now and report the result.
    pub fn close(mut self) -> Result<()> {
        let fd = std::mem::replace(&mut self.fd, -1);
        if !self.owned {
            return Ok(());
        }
        cvt(unsafe { libc::close(fd) }).map(drop)
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if self.owned {
            close_fd(self.fd);
        }
    }
}
