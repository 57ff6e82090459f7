// Copyright 2024 Hearth Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable read/write byte buffer with scatter-read support.
//!
//! Each connection owns two of these: one filled from the socket and drained
//! by the request parser, one filled by the response builder and drained by
//! vectored writes.

use std::io::{IoSliceMut, Read, Result};

const INITIAL_CAPACITY: usize = 64 * 1024;

/// Size of the stack scratch segment used by [`ByteBuffer::read_from`].
const SCRATCH_LEN: usize = 64 * 1024;

/// A contiguous byte buffer with separate read and write offsets.
///
/// Invariant: `read_off <= write_off <= buf.len()`. Bytes in
/// `read_off..write_off` are readable; bytes in `write_off..` are writable.
/// Bytes before `read_off` are dead and reclaimed by compaction.
#[derive(Debug)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    read_off: usize,
    write_off: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_off: 0,
            write_off: 0,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_len(&self) -> usize {
        self.write_off - self.read_off
    }

    /// Number of bytes that can be written without reallocation.
    #[inline]
    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.write_off
    }

    /// Bytes already drained; reusable as write space after compaction.
    #[inline]
    fn reclaimable_len(&self) -> usize {
        self.read_off
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_off..self.write_off]
    }

    /// Appends `data`, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() > self.writable_len() {
            self.extend(data.len());
        }
        self.buf[self.write_off..self.write_off + data.len()].copy_from_slice(data);
        self.write_off += data.len();
    }

    /// Marks `n` readable bytes as consumed.
    pub fn drain(&mut self, n: usize) {
        debug_assert!(n <= self.readable_len());
        self.read_off += n.min(self.readable_len());
    }

    /// Consumes readable bytes up to (not including) offset `pos` of the
    /// current [`peek`](Self::peek) view.
    pub fn drain_until(&mut self, pos: usize) {
        self.drain(pos);
    }

    /// Discards everything and resets both offsets.
    pub fn drain_all(&mut self) {
        self.read_off = 0;
        self.write_off = 0;
    }

    /// Reads from `src` with a two-segment scatter read: first into the
    /// writable window, then into a 64 KiB stack scratch. Overflow past the
    /// window is appended afterwards, growing the buffer. The happy path
    /// stays copy-free while a burst larger than the window is still
    /// captured in one syscall.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<usize> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let writable = self.writable_len();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_off);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut scratch)];
            src.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.write_off += n;
        } else {
            self.write_off = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Makes room for at least `len` more bytes: grows when even reclaiming
    /// drained space would not fit, otherwise compacts in place.
    fn extend(&mut self, len: usize) {
        if self.writable_len() + self.reclaimable_len() < len {
            self.buf.resize(self.write_off + len + 1, 0);
        } else {
            let readable = self.readable_len();
            self.buf.copy_within(self.read_off..self.write_off, 0);
            self.read_off = 0;
            self.write_off = readable;
        }
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
