//! Child processes as streams
//!
//! `popen(cmd, "r")` reads the command's stdout; `popen(cmd, "w")` feeds
//! its stdin. The other descriptors are inherited. The child is waited
//! for on the shared pool once the stream is closed or dropped, so exit
//! status is not reported.

use crate::stream::Stream;

use evio_core::{kdebug, kwarn, Error, Result};
use evio_runtime::sys::set_nonblocking;
use evio_runtime::{execute_detached, Handle};

use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};
use std::process::{Child, Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Parent reads the child's stdout
    Read,
    /// Parent writes the child's stdin
    Write,
}

fn parse_mode(mode: &str) -> Result<Direction> {
    match mode {
        "r" => Ok(Direction::Read),
        "w" => Ok(Direction::Write),
        _ => Err(Error::InvalidArgument("invalid mode string")),
    }
}

/// Run `cmd` under `/bin/sh -c` with one end piped to a stream.
pub async fn popen(cmd: &str, mode: &str) -> Result<Stream> {
    let dir = parse_mode(mode)?;
    let handle = Handle::current()?;
    let cmd = cmd.to_owned();

    let (mut child, pipe) = handle
        .execute(move || -> Result<(Child, OwnedFd)> {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&cmd);
            match dir {
                Direction::Read => command.stdout(Stdio::piped()),
                Direction::Write => command.stdin(Stdio::piped()),
            };
            let mut child = command.spawn()?;
            let pipe = match dir {
                Direction::Read => child.stdout.take().map(OwnedFd::from),
                Direction::Write => child.stdin.take().map(OwnedFd::from),
            };
            match pipe {
                Some(pipe) => Ok((child, pipe)),
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    Err(Error::Closed)
                }
            }
        })
        .await??;

    kdebug!("popen: pid {} on fd {}", child.id(), pipe.as_raw_fd());
    if let Err(e) = set_nonblocking(pipe.as_raw_fd(), true) {
        drop(pipe);
        reap(child);
        return Err(e);
    }
    let stream = match Stream::attach(handle, pipe.into_raw_fd(), true) {
        Ok(s) => s,
        Err(e) => {
            let _ = child.kill();
            reap(child);
            return Err(e);
        }
    };
    stream.set_on_close(Box::new(move || reap(child)));
    Ok(stream)
}

fn reap(mut child: Child) {
    let pid = child.id();
    let res = execute_detached(move || {
        if let Err(e) = child.wait() {
            kwarn!("waiting for pid {} failed: {}", pid, e);
        }
    });
    if let Err(e) = res {
        kwarn!("cannot reap pid {}: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{temp_path, test_loop};
    use evio_core::{All, Line};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_read_command_output() {
        let ev = test_loop();
        ev.block_on(async {
            let s = popen("echo hello; echo world", "r").await.unwrap();
            assert_eq!(s.read(Line::new()).await.unwrap(), b"hello");
            assert_eq!(s.read(All::new()).await.unwrap(), b"world\n");
            s.close().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_write_command_input() {
        let ev = test_loop();
        let path = temp_path("popen-w");
        let cmd = format!("cat > '{}'", path.display());
        ev.block_on(async {
            let s = popen(&cmd, "w").await.unwrap();
            s.write(&[&b"piped "[..], &b"input\n"[..]]).await.unwrap();
            s.close().unwrap();
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if std::fs::read(&path).map_or(false, |b| b == b"piped input\n") {
                break;
            }
            assert!(Instant::now() < deadline, "child never flushed its input");
            thread::sleep(Duration::from_millis(10));
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bad_mode() {
        let ev = test_loop();
        ev.block_on(async {
            for mode in ["", "rw", "r+", "a"] {
                assert!(matches!(
                    popen("true", mode).await,
                    Err(Error::InvalidArgument(_))
                ));
            }
        })
        .unwrap();
    }
}
