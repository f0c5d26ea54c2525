//! Error types for evio operations

use core::fmt;

use nix::errno::Errno;

/// Result type for evio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the task that issued an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The descriptor (or the requested direction of it) is shut down
    Closed,

    /// Another operation is already pending on the same direction/resource
    Busy,

    /// A syscall failed
    Os(Errno),

    /// A caller-supplied argument was rejected before any syscall
    InvalidArgument(&'static str),

    /// The work function of an async job panicked on its worker thread
    Panicked,

    /// No event loop is running on this thread
    NotInitialized,
}

impl Error {
    /// Capture `errno` after a failed libc call.
    #[inline]
    pub fn last_os_error() -> Self {
        Error::Os(Errno::last())
    }

    /// The errno behind this error, if it came from the OS.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os(e) => Some(*e),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "closed"),
            Error::Busy => write!(f, "busy"),
            Error::Os(e) => write!(f, "{}", e.desc()),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::Panicked => write!(f, "async job panicked"),
            Error::NotInitialized => write!(f, "no event loop running on this thread"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Os(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Error::Os(Errno::from_raw(code)),
            None => Error::Os(Errno::EIO),
        }
    }
}

/// Why a stream stopped producing input.
///
/// Handed to `Parser::destroy` so a parser can salvage a final result.
/// A peer close is reported to callers as [`Error::Closed`]; the
/// distinction only matters to parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Orderly EOF, or a reset/broken pipe from the remote end
    PeerClosed,
    /// Any other read failure
    Error(Errno),
}

impl EndReason {
    /// The error a caller sees when no parser salvages a result.
    pub fn into_error(self) -> Error {
        match self {
            EndReason::PeerClosed => Error::Closed,
            EndReason::Error(e) => Error::Os(e),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::PeerClosed => write!(f, "peer closed"),
            EndReason::Error(e) => write!(f, "read error: {}", e.desc()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::Closed), "closed");
        assert_eq!(format!("{}", Error::Busy), "busy");
        assert_eq!(
            format!("{}", Error::Os(Errno::ECONNREFUSED)),
            Errno::ECONNREFUSED.desc()
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = Errno::EBADF.into();
        assert_eq!(err.errno(), Some(Errno::EBADF));

        let io = std::io::Error::from_raw_os_error(libc_enoent());
        let err: Error = io.into();
        assert_eq!(err, Error::Os(Errno::ENOENT));

        let custom = std::io::Error::new(std::io::ErrorKind::Other, "x");
        assert_eq!(Error::from(custom), Error::Os(Errno::EIO));
    }

    #[test]
    fn test_end_reason_maps_to_caller_error() {
        assert_eq!(EndReason::PeerClosed.into_error(), Error::Closed);
        assert_eq!(
            EndReason::Error(Errno::ETIMEDOUT).into_error(),
            Error::Os(Errno::ETIMEDOUT)
        );
    }

    fn libc_enoent() -> i32 {
        Errno::ENOENT as i32
    }
}
