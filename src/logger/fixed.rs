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

//! Fixed-capacity byte slab used by the log pipeline.

use std::fmt;

/// Capacity of the per-line formatting buffer.
pub const SMALL_BUFFER: usize = 4096;

/// Capacity of the async back-end slabs.
pub const LARGE_BUFFER: usize = 4096 * 1024;

/// A slab of `N` bytes with a write cursor.
///
/// `append` silently truncates once the slab is full. That is acceptable for
/// the two users here — single log lines are bounded well below `SMALL_BUFFER`
/// and the async writer rotates large slabs before they fill — but it makes
/// this type unsuitable as a general-purpose buffer.
#[derive(Debug)]
pub struct FixedBuffer<const N: usize> {
    data: Box<[u8]>,
    len: usize,
}

impl<const N: usize> FixedBuffer<N> {
    pub fn new() -> Self {
        Self {
            data: vec![0; N].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn writable_len(&self) -> usize {
        N - self.len
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Appends as much of `bytes` as fits; the rest is dropped.
    pub fn append(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.writable_len());
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for FixedBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lines are assembled with `write!`, so truncation on overflow applies to
/// formatted output as well.
impl<const N: usize> fmt::Write for FixedBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes());
        Ok(())
    }
}
