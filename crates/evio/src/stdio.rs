//! Standard descriptors as streams
//!
//! Each loop gets at most one live stream per descriptor; repeated calls
//! return the same `Rc`. The descriptors are switched to non-blocking
//! mode on first access and are never closed by the stream.

use crate::stream::Stream;

use evio_core::Result;
use evio_runtime::sys::set_nonblocking;
use evio_runtime::Handle;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

thread_local! {
    /// (loop id, fd) → stream
    static STDIO: RefCell<HashMap<(u64, RawFd), Weak<Stream>>> = RefCell::new(HashMap::new());
}

pub fn stdin() -> Result<Rc<Stream>> {
    shared(libc::STDIN_FILENO)
}

pub fn stdout() -> Result<Rc<Stream>> {
    shared(libc::STDOUT_FILENO)
}

pub fn stderr() -> Result<Rc<Stream>> {
    shared(libc::STDERR_FILENO)
}

fn shared(fd: RawFd) -> Result<Rc<Stream>> {
    let handle = Handle::current()?;
    let key = (handle.id(), fd);
    if let Some(s) = STDIO.with(|m| m.borrow().get(&key).and_then(Weak::upgrade)) {
        return Ok(s);
    }

    set_nonblocking(fd, true)?;
    let stream = Rc::new(Stream::attach(handle, fd, false)?);
    STDIO.with(|m| {
        let mut m = m.borrow_mut();
        m.retain(|_, w| w.strong_count() > 0);
        m.insert(key, Rc::downgrade(&stream));
    });
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_loop;
    use evio_runtime::sys::is_nonblocking;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_stdin_is_shared_per_loop() {
        let was_nonblocking = is_nonblocking(libc::STDIN_FILENO).unwrap_or(false);
        {
            let _ev = test_loop();
            let a = stdin().unwrap();
            let b = stdin().unwrap();
            assert!(Rc::ptr_eq(&a, &b));
            assert_eq!(a.as_raw_fd(), libc::STDIN_FILENO);
            assert!(is_nonblocking(libc::STDIN_FILENO).unwrap());

            // Closing a borrowed descriptor only detaches it.
            a.close().unwrap();
            assert!(a.closed());
            assert!(is_nonblocking(libc::STDIN_FILENO).unwrap());
            drop((a, b));

            let c = stdin().unwrap();
            assert!(!c.closed());
        }
        {
            let _other = test_loop();
            let d = stdin().unwrap();
            assert!(!d.closed());
        }
        let _ = set_nonblocking(libc::STDIN_FILENO, was_nonblocking);
    }

    #[test]
    fn test_requires_a_loop() {
        std::thread::spawn(|| {
            assert_eq!(stdout().unwrap_err(), evio_core::Error::NotInitialized);
        })
        .join()
        .unwrap();
    }
}
