// Copyright 2023 Google LLC
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

use std::collections::VecDeque;

/// A bounded ring of pty output bytes with a monotonic byte offset.
///
/// Offsets never reset: the first byte ever appended is offset 0 and
/// the ring only ever slides its window forward. When the ring is
/// full the oldest bytes are discarded and `earliest_offset`
/// advances, so late subscribers can learn how much history is gone.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: VecDeque<u8>,
    cap: usize,
    earliest_offset: u64,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> OutputBuffer {
        OutputBuffer { buf: VecDeque::with_capacity(cap.min(64 * 1024)), cap, earliest_offset: 0 }
    }

    /// Append a chunk, discarding the oldest bytes on overflow.
    /// Returns the offset just past the appended chunk.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        if bytes.len() >= self.cap {
            // the chunk alone overruns the ring, keep only its tail
            self.earliest_offset += (self.buf.len() + bytes.len() - self.cap) as u64;
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.cap..]);
            return self.end_offset();
        }

        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.earliest_offset += overflow as u64;
        }
        self.buf.extend(bytes);
        self.end_offset()
    }

    /// The offset of the oldest byte still retained.
    pub fn earliest_offset(&self) -> u64 {
        self.earliest_offset
    }

    /// The offset one past the newest byte.
    pub fn end_offset(&self) -> u64 {
        self.earliest_offset + self.buf.len() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Copy out up to `max` bytes starting at `from`, clamped to the
    /// retained window. Returns the bytes, the offset they actually
    /// start at, and the offset to resume from.
    pub fn snapshot(&self, from: u64, max: usize) -> (Vec<u8>, u64, u64) {
        let start = from.clamp(self.earliest_offset, self.end_offset());
        let skip = (start - self.earliest_offset) as usize;
        let take = (self.buf.len() - skip).min(max);

        let mut out = Vec::with_capacity(take);
        let (head, tail) = self.buf.as_slices();
        if skip < head.len() {
            let end = (skip + take).min(head.len());
            out.extend_from_slice(&head[skip..end]);
        }
        if out.len() < take {
            let tail_skip = skip.saturating_sub(head.len());
            out.extend_from_slice(&tail[tail_skip..tail_skip + (take - out.len())]);
        }

        let next = start + out.len() as u64;
        (out, start, next)
    }
}
