//! Parser protocol: decides when enough input has arrived.
//!
//! A read operation owns an [`InputBuffer`] and a parser. After every
//! chunk the kernel delivers, the owner calls [`Parser::process`]; the
//! parser either consumes a complete unit from the front of the buffer
//! and returns it, or reports [`Parse::Pending`] and leaves the buffer as
//! it wants to see it next time.
//!
//! # Contract
//!
//! - `init` runs once at the start of each read operation.
//! - `process` must not assume that bytes it left unconsumed are still
//!   at the same offsets next call (the owner may compact the buffer).
//! - When `process` returns `Pending` on a [full](InputBuffer::is_full)
//!   buffer it must have made room, typically by moving bytes into its
//!   own storage; otherwise the read fails with `ENOBUFS`.
//! - `destroy` runs only when the input ends (EOF, reset, or error) and
//!   may salvage a final result instead of propagating the end.
//! - `restore` runs when the read is over, however it ended. A parser
//!   that moved bytes into its own storage without producing a result
//!   puts them back with [`InputBuffer::unread`], so the next read sees
//!   the input intact.
//!
//! # Built-ins
//!
//! | Parser        | Completes when                                     |
//! |---------------|----------------------------------------------------|
//! | [`Available`] | anything is buffered                               |
//! | [`Target`]    | exactly `n` bytes have arrived                     |
//! | [`Line`]      | the delimiter arrives (delimiter is consumed)      |
//! | [`All`]       | the peer closes; the whole input is the result     |

use crate::buffer::InputBuffer;
use crate::error::{EndReason, Error, Result};

/// Outcome of one [`Parser::process`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse<T> {
    /// More input is needed
    Pending,
    /// A complete unit was consumed from the buffer
    Done(T),
}

impl<T> Parse<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Parse::Pending)
    }
}

/// A pluggable consumer of buffered input.
pub trait Parser {
    type Output;

    fn init(&mut self, _buf: &mut InputBuffer) {}

    fn process(&mut self, buf: &mut InputBuffer) -> Parse<Self::Output>;

    fn destroy(&mut self, _buf: &mut InputBuffer, _reason: EndReason) -> Option<Self::Output> {
        None
    }

    fn restore(&mut self, _buf: &mut InputBuffer) {}
}

impl<P: Parser + ?Sized> Parser for &mut P {
    type Output = P::Output;

    fn init(&mut self, buf: &mut InputBuffer) {
        (**self).init(buf)
    }

    fn process(&mut self, buf: &mut InputBuffer) -> Parse<Self::Output> {
        (**self).process(buf)
    }

    fn destroy(&mut self, buf: &mut InputBuffer, reason: EndReason) -> Option<Self::Output> {
        (**self).destroy(buf, reason)
    }

    fn restore(&mut self, buf: &mut InputBuffer) {
        (**self).restore(buf)
    }
}

// ── available ────────────────────────────────────────────────────────

/// Whatever is buffered, as soon as there is anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Available;

impl Parser for Available {
    type Output = Vec<u8>;

    fn process(&mut self, buf: &mut InputBuffer) -> Parse<Vec<u8>> {
        if buf.is_empty() {
            Parse::Pending
        } else {
            Parse::Done(buf.take_all())
        }
    }
}

// ── target ───────────────────────────────────────────────────────────

/// Exactly `n` bytes; never fewer. `n` may exceed the buffer capacity.
#[derive(Debug, Clone, Default)]
pub struct Target {
    want: usize,
    acc: Vec<u8>,
}

impl Target {
    pub fn new(n: usize) -> Self {
        Self { want: n, acc: Vec::new() }
    }

    pub fn want(&self) -> usize {
        self.want
    }
}

impl Parser for Target {
    type Output = Vec<u8>;

    fn process(&mut self, buf: &mut InputBuffer) -> Parse<Vec<u8>> {
        let need = self.want - self.acc.len();
        if buf.len() >= need {
            if self.acc.is_empty() {
                return Parse::Done(buf.take(need));
            }
            self.acc.extend_from_slice(&buf.data()[..need]);
            buf.consume(need);
            return Parse::Done(std::mem::take(&mut self.acc));
        }
        if buf.is_full() {
            buf.drain_into(&mut self.acc);
        }
        Parse::Pending
    }

    fn restore(&mut self, buf: &mut InputBuffer) {
        buf.unread(&std::mem::take(&mut self.acc));
    }
}

// ── line ─────────────────────────────────────────────────────────────

/// Bytes up to (not including) a delimiter, which is consumed.
///
/// Partial lines stay in the input buffer so a later read sees them. Only
/// when a line outgrows the buffer are its leading bytes moved into the
/// parser; the last `delimiter.len() - 1` bytes are always left in place
/// so a delimiter split across reads is still found.
#[derive(Debug, Clone)]
pub struct Line {
    delim: Vec<u8>,
    acc: Vec<u8>,
}

impl Line {
    /// Newline-terminated lines.
    pub fn new() -> Self {
        Self { delim: vec![b'\n'], acc: Vec::new() }
    }

    /// Lines terminated by an arbitrary non-empty byte string.
    pub fn with_delimiter(delim: impl Into<Vec<u8>>) -> Result<Self> {
        let delim = delim.into();
        if delim.is_empty() {
            return Err(Error::InvalidArgument("line delimiter must not be empty"));
        }
        Ok(Self { delim, acc: Vec::new() })
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delim
    }

    fn find(&self, hay: &[u8]) -> Option<usize> {
        match self.delim.as_slice() {
            [b] => hay.iter().position(|c| c == b),
            d => hay.windows(d.len()).position(|w| w == d),
        }
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for Line {
    type Output = Vec<u8>;

    fn process(&mut self, buf: &mut InputBuffer) -> Parse<Vec<u8>> {
        if let Some(pos) = self.find(buf.data()) {
            let mut line = std::mem::take(&mut self.acc);
            line.extend_from_slice(&buf.data()[..pos]);
            buf.consume(pos + self.delim.len());
            return Parse::Done(line);
        }
        if buf.is_full() {
            let keep = self.delim.len() - 1;
            let spill = buf.len().saturating_sub(keep);
            self.acc.extend_from_slice(&buf.data()[..spill]);
            buf.consume(spill);
        }
        Parse::Pending
    }

    fn restore(&mut self, buf: &mut InputBuffer) {
        buf.unread(&std::mem::take(&mut self.acc));
    }
}

// ── all ──────────────────────────────────────────────────────────────

/// Everything until the peer closes.
#[derive(Debug, Clone, Default)]
pub struct All {
    acc: Vec<u8>,
}

impl All {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Parser for All {
    type Output = Vec<u8>;

    fn process(&mut self, buf: &mut InputBuffer) -> Parse<Vec<u8>> {
        if buf.is_full() {
            buf.drain_into(&mut self.acc);
        }
        Parse::Pending
    }

    fn destroy(&mut self, buf: &mut InputBuffer, reason: EndReason) -> Option<Vec<u8>> {
        match reason {
            EndReason::PeerClosed => {
                let mut out = std::mem::take(&mut self.acc);
                buf.drain_into(&mut out);
                Some(out)
            }
            EndReason::Error(_) => None,
        }
    }

    fn restore(&mut self, buf: &mut InputBuffer) {
        buf.unread(&std::mem::take(&mut self.acc));
    }
}
