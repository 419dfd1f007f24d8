//! Growable byte buffer
//!
//! A [`Buffer`] either owns its storage or writes into a caller-provided
//! slice. Both variants behave identically: when an append does not fit in
//! a borrowed slice, the content moves to an owned allocation and the
//! buffer keeps growing from there.

use crate::{Error, Result};

#[derive(Debug)]
enum Storage<'a> {
    Owned(Vec<u8>),
    Borrowed { buf: &'a mut [u8], len: usize },
}

/// Byte buffer with explicit length and consume operations
#[derive(Debug)]
pub struct Buffer<'a> {
    storage: Storage<'a>,
}

impl Default for Buffer<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer<'static> {
    /// Create an empty owned buffer
    pub fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
        }
    }

    /// Create an owned buffer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Storage::Owned(Vec::with_capacity(capacity)),
        }
    }
}

impl<'a> Buffer<'a> {
    /// Create a buffer that writes into `backend` until it runs out of room
    pub fn borrowed(backend: &'a mut [u8]) -> Self {
        Self {
            storage: Storage::Borrowed {
                buf: backend,
                len: 0,
            },
        }
    }

    /// Number of bytes written
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Owned(v) => v.len(),
            Storage::Borrowed { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total room before the next reallocation
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(v) => v.capacity(),
            Storage::Borrowed { buf, .. } => buf.len(),
        }
    }

    /// Room left before the next reallocation
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Whether the content lives in an owned allocation
    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// Written bytes
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => v.as_slice(),
            Storage::Borrowed { buf, len } => &buf[..*len],
        }
    }

    /// Grow the capacity to at least `capacity` bytes
    pub fn expand(&mut self, capacity: usize) {
        if capacity <= self.capacity() {
            return;
        }
        match &mut self.storage {
            Storage::Owned(v) => {
                let extra = capacity - v.len();
                v.reserve_exact(extra);
            }
            Storage::Borrowed { buf, len } => {
                let mut owned = Vec::with_capacity(capacity);
                owned.extend_from_slice(&buf[..*len]);
                self.storage = Storage::Owned(owned);
            }
        }
    }

    /// Append bytes at the end
    pub fn append(&mut self, data: &[u8]) {
        let needed = self.len() + data.len();
        if needed > self.capacity() && !self.is_owned() {
            // Leave some headroom so that the next small appends do not
            // reallocate again.
            self.expand(needed + needed / 2);
        }
        match &mut self.storage {
            Storage::Owned(v) => v.extend_from_slice(data),
            Storage::Borrowed { buf, len } => {
                buf[*len..*len + data.len()].copy_from_slice(data);
                *len += data.len();
            }
        }
    }

    /// Append a single byte
    pub fn append_byte(&mut self, byte: u8) {
        self.append(&[byte]);
    }

    /// Drop the first `n` bytes, shifting the rest to the front
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        match &mut self.storage {
            Storage::Owned(v) => {
                v.drain(..n);
            }
            Storage::Borrowed { buf, len } => {
                buf.copy_within(n..*len, 0);
                *len -= n;
            }
        }
    }

    /// Move the write cursor to `pos`
    ///
    /// Moving backwards discards bytes; moving forwards exposes
    /// zero-filled bytes and must stay within the current capacity.
    pub fn move_to(&mut self, pos: usize) -> Result<()> {
        if pos > self.capacity() {
            return Err(Error::BufferTooSmall {
                needed: pos,
                have: self.capacity(),
            });
        }
        match &mut self.storage {
            Storage::Owned(v) => v.resize(pos, 0),
            Storage::Borrowed { buf, len } => {
                if pos > *len {
                    buf[*len..pos].fill(0);
                }
                *len = pos;
            }
        }
        Ok(())
    }

    /// Forget the content, keeping the allocation
    pub fn reset(&mut self) {
        match &mut self.storage {
            Storage::Owned(v) => v.clear(),
            Storage::Borrowed { len, .. } => *len = 0,
        }
    }

    /// Take the written bytes out, leaving the buffer empty
    pub fn take(&mut self) -> Vec<u8> {
        match &mut self.storage {
            Storage::Owned(v) => std::mem::take(v),
            Storage::Borrowed { buf, len } => {
                let out = buf[..*len].to_vec();
                *len = 0;
                out
            }
        }
    }
}

impl std::io::Write for Buffer<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
