// Copyright 2025 jonefeewang@gmail.com
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

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on the spare room handed to a single socket read.
pub const READ_CHUNK: usize = 64 * 1024;

/// Growable byte buffer used for both directions of a connection.
///
/// Bytes are appended at the back and consumed from the front. There is no read/write mode to
/// flip: `readable()` is always the unconsumed data and `writable()` is always the spare room
/// behind it. Growth doubles the capacity until the requested space fits and never moves or
/// drops unconsumed bytes. Once the unconsumed bytes fit the initial capacity again, grown
/// capacity is released.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    initial_capacity: usize,
    // start of the spare region handed out by `writable`, until `commit`
    write_mark: Option<usize>,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> FrameBuffer {
        let capacity = capacity.max(1);
        FrameBuffer {
            buf: BytesMut::with_capacity(capacity),
            initial_capacity: capacity,
            write_mark: None,
        }
    }

    /// Unconsumed bytes, oldest first.
    pub fn readable(&self) -> &[u8] {
        match self.write_mark {
            Some(start) => &self.buf[..start],
            None => &self.buf,
        }
    }

    /// Spare room behind the readable bytes, at least `min` bytes long.
    ///
    /// The slice is zero-initialised and, beyond `min`, never longer than [`READ_CHUNK`]. Call
    /// [`FrameBuffer::commit`] with the number of bytes actually filled; anything not committed
    /// is discarded by the next mutation.
    pub fn writable(&mut self, min: usize) -> &mut [u8] {
        self.commit(0);
        let min = min.max(1);
        self.reserve(min);
        let start = self.buf.len();
        let spare = self.buf.capacity() - start;
        let len = spare.min(READ_CHUNK).max(min);
        self.buf.resize(start + len, 0);
        self.write_mark = Some(start);
        &mut self.buf[start..]
    }

    /// Turns the first `filled` bytes of the last `writable` view into readable bytes.
    pub fn commit(&mut self, filled: usize) {
        if let Some(start) = self.write_mark.take() {
            let end = start.saturating_add(filled).min(self.buf.len());
            self.buf.truncate(end);
        }
    }

    pub fn len(&self) -> usize {
        self.readable().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Makes room for `additional` more bytes, doubling the capacity as often as needed.
    pub fn reserve(&mut self, additional: usize) {
        self.commit(0);
        let required = self.buf.len().saturating_add(additional);
        if required <= self.buf.capacity() {
            return;
        }
        let mut capacity = self.buf.capacity().max(self.initial_capacity);
        while capacity < required {
            capacity = capacity.saturating_mul(2);
        }
        self.buf.reserve(capacity - self.buf.len());
    }

    pub fn put_u32(&mut self, n: u32) {
        self.reserve(4);
        self.buf.put_u32(n);
    }

    pub fn put_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        self.buf.put_slice(src);
    }

    /// Drops readable bytes past `len`. Used to take back bytes that were appended last.
    pub fn truncate(&mut self, len: usize) {
        self.commit(0);
        self.buf.truncate(len);
    }

    /// Drops `cnt` bytes from the front; the rest stays at the front.
    pub fn consume(&mut self, cnt: usize) {
        self.commit(0);
        self.buf.advance(cnt);
        self.release_grown();
    }

    /// Removes the first `len` readable bytes and returns them as an owned payload.
    ///
    /// Payloads up to the initial capacity are copied out, so they never keep a grown buffer
    /// alive. Larger ones take their part of the allocation and the remaining bytes move to a
    /// fresh buffer.
    pub fn split_to(&mut self, len: usize) -> Bytes {
        self.commit(0);
        if len <= self.initial_capacity {
            let payload = Bytes::copy_from_slice(&self.buf[..len]);
            self.buf.advance(len);
            self.release_grown();
            return payload;
        }
        let payload = self.buf.split_to(len).freeze();
        let mut rest = BytesMut::with_capacity(self.initial_capacity.max(self.buf.len()));
        rest.extend_from_slice(&self.buf);
        self.buf = rest;
        payload
    }

    /// Reads once from `reader` into at most [`READ_CHUNK`] bytes of spare room, growing the
    /// buffer first when it is full. `Ok(0)` means end of stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let result = reader.read(self.writable(1));
        self.commit(*result.as_ref().unwrap_or(&0));
        result
    }

    /// Writes once from the readable bytes to `writer` and consumes what was written.
    pub fn drain_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        self.commit(0);
        let written = writer.write(&self.buf)?;
        self.buf.advance(written);
        self.release_grown();
        Ok(written)
    }

    // swap a grown allocation for a small one once the leftover fits the initial capacity
    fn release_grown(&mut self) {
        if self.buf.capacity() > 2 * self.initial_capacity
            && self.buf.len() <= self.initial_capacity
        {
            let mut fresh = BytesMut::with_capacity(self.initial_capacity);
            fresh.extend_from_slice(&self.buf);
            self.buf = fresh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that remembers the largest slice it was asked to fill.
    struct ChunkRecorder {
        inner: Cursor<Vec<u8>>,
        largest_read: usize,
    }

    impl Read for ChunkRecorder {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.largest_read = self.largest_read.max(buf.len());
            self.inner.read(buf)
        }
    }

    #[test]
    fn test_growth_doubles_and_preserves_data() {
        let mut buffer = FrameBuffer::with_capacity(4);
        buffer.put_slice(b"abc");
        buffer.put_slice(b"defghij");
        assert!(buffer.capacity() >= 16);
        assert_eq!(buffer.readable(), b"abcdefghij");
    }

    #[test]
    fn test_consume_keeps_unread_bytes_at_front() {
        let mut buffer = FrameBuffer::with_capacity(8);
        buffer.put_slice(b"0123456789");
        buffer.consume(4);
        assert_eq!(buffer.readable(), b"456789");
        let head = buffer.split_to(2);
        assert_eq!(&head[..], b"45");
        buffer.put_slice(b"ab");
        assert_eq!(buffer.readable(), b"6789ab");
    }

    #[test]
    fn test_writable_commit() {
        let mut buffer = FrameBuffer::with_capacity(4);
        buffer.put_slice(b"xy");
        let spare = buffer.writable(6);
        assert!(spare.len() >= 6);
        spare[..3].copy_from_slice(b"zzz");
        // uncommitted padding is not readable
        assert_eq!(buffer.readable(), b"xy");
        buffer.commit(3);
        assert_eq!(buffer.readable(), b"xyzzz");
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_writable_is_bounded() {
        let mut buffer = FrameBuffer::with_capacity(4 * READ_CHUNK);
        assert_eq!(buffer.writable(1).len(), READ_CHUNK);
        buffer.commit(0);
        assert_eq!(buffer.writable(READ_CHUNK + 1).len(), READ_CHUNK + 1);
    }

    #[test]
    fn test_fill_from_grows_when_full() -> io::Result<()> {
        let mut buffer = FrameBuffer::with_capacity(2);
        let mut source = Cursor::new(b"hello world".to_vec());
        let mut total = 0;
        loop {
            let n = buffer.fill_from(&mut source)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 11);
        assert_eq!(buffer.readable(), b"hello world");
        assert!(buffer.capacity() >= 11);
        Ok(())
    }

    #[test]
    fn test_large_fill_reads_in_chunks() -> io::Result<()> {
        let mut buffer = FrameBuffer::with_capacity(1024);
        let mut source = ChunkRecorder {
            inner: Cursor::new(vec![3u8; 4 * 1024 * 1024]),
            largest_read: 0,
        };
        while buffer.fill_from(&mut source)? > 0 {}
        assert_eq!(buffer.len(), 4 * 1024 * 1024);
        assert!(source.largest_read <= READ_CHUNK);
        Ok(())
    }

    #[test]
    fn test_small_split_is_copied_and_capacity_released() {
        let mut buffer = FrameBuffer::with_capacity(64);
        buffer.put_slice(&[1u8; 100_000]);
        buffer.put_slice(b"tail");
        let big = buffer.split_to(100_000);
        assert_eq!(big.len(), 100_000);
        // the leftover moved to a buffer of the initial size
        assert!(buffer.capacity() <= 2 * 64);
        assert_eq!(buffer.readable(), b"tail");

        buffer.put_slice(&[2u8; 10_000]);
        buffer.consume(10_000 - 8);
        assert!(buffer.capacity() <= 2 * 64);
        let small = buffer.split_to(4);
        assert_eq!(&small[..], b"tail");
        assert_eq!(buffer.readable(), &[2u8; 8]);
    }

    #[test]
    fn test_drain_to_consumes_written_bytes() -> io::Result<()> {
        let mut buffer = FrameBuffer::with_capacity(16);
        buffer.put_slice(b"payload");
        let mut sink = Vec::new();
        let written = buffer.drain_to(&mut sink)?;
        assert_eq!(written, 7);
        assert_eq!(sink, b"payload");
        assert!(buffer.is_empty());
        Ok(())
    }
}
