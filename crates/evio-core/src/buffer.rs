//! Fixed-capacity input buffer shared by a descriptor and its parser.
//!
//! ```text
//!  0        start            end              capacity
//!  ├─────────┼────────────────┼──────────────────┤
//!  consumed   unconsumed data   free tail (spare)
//! ```
//!
//! The owning Stream/File reads from the kernel into the free tail and
//! then hands the buffer to the active parser, which consumes from the
//! front. When the tail is exhausted the owner compacts the unconsumed
//! bytes back to offset 0. Storage grows only when a parser hands back
//! more bytes than fit (see [`InputBuffer::unread`]).

/// Default capacity of an [`InputBuffer`].
pub const INPUT_BUFFER_SIZE: usize = 4096;

/// Bytes read from the kernel but not yet consumed by a parser.
///
/// Invariant: `0 <= start <= end <= capacity`.
#[derive(Debug)]
pub struct InputBuffer {
    storage: Box<[u8]>,
    start: usize,
    end: usize,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INPUT_BUFFER_SIZE)
    }

    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "input buffer capacity must be non-zero");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of unconsumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Every byte of storage holds unconsumed data; no read can make
    /// progress until a parser takes something out.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Unconsumed bytes, `[start, end)`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    /// Free tail, `[end, capacity)`, for the next kernel read.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.end..]
    }

    #[inline]
    pub fn spare_len(&self) -> usize {
        self.capacity() - self.end
    }

    /// Mark `n` bytes of the free tail as filled.
    ///
    /// # Panics
    /// Panics if `n` exceeds the free tail.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.spare_len(), "commit past end of input buffer");
        self.end += n;
    }

    /// Drop `n` bytes from the front.
    ///
    /// # Panics
    /// Panics if `n` exceeds the unconsumed length.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past end of input buffer");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Copy out and consume the first `n` bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.data()[..n].to_vec();
        self.consume(n);
        out
    }

    /// Copy out and consume everything buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.data().to_vec();
        self.clear();
        out
    }

    /// Append everything buffered to `dst` and empty the buffer.
    pub fn drain_into(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(self.data());
        self.clear();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Move unconsumed bytes to offset 0 so the free tail is maximal.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        let len = self.len();
        self.storage.copy_within(self.start..self.end, 0);
        self.start = 0;
        self.end = len;
    }

    /// Put `front` back ahead of the unconsumed bytes, growing the
    /// storage if they do not fit.
    pub fn unread(&mut self, front: &[u8]) {
        if front.is_empty() {
            return;
        }
        if front.len() <= self.start {
            self.start -= front.len();
            self.storage[self.start..self.start + front.len()].copy_from_slice(front);
            return;
        }
        let len = front.len() + self.len();
        let mut joined = Vec::with_capacity(len.max(self.capacity()));
        joined.extend_from_slice(front);
        joined.extend_from_slice(self.data());
        joined.resize(len.max(self.capacity()), 0);
        self.storage = joined.into_boxed_slice();
        self.start = 0;
        self.end = len;
    }

    /// Make sure the free tail is non-empty, compacting if that helps.
    /// Returns `false` when the buffer [is full](Self::is_full).
    pub fn reserve_tail(&mut self) -> bool {
        if self.spare_len() == 0 {
            self.compact();
        }
        self.spare_len() > 0
    }

    /// Append bytes as if they had been read from the kernel; returns how
    /// many fit.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        if !self.reserve_tail() {
            return 0;
        }
        let n = src.len().min(self.spare_len());
        self.spare_mut()[..n].copy_from_slice(&src[..n]);
        self.commit(n);
        n
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
