// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::libc::ENOMEM;

//==============================================================================
// Structures
//==============================================================================

/// Growable byte arena with a write cursor and the previous write cursor.
///
/// Both cursors are stored as offsets from the start of the backing storage,
/// so growing the arena never invalidates them. Anything that must survive a
/// grow (or a cross-process copy) references the arena through a [Span],
/// never through a raw pointer.
///
/// Invariant: `prev <= cur <= capacity`.
#[derive(Debug)]
pub struct MemBuf {
    storage: Vec<u8>,
    /// Write cursor (offset).
    cur: usize,
    /// Previous write cursor (offset).
    prev: usize,
}

/// An `(offset, length)` pair into one [MemBuf].
///
/// Spans stay valid across arena growth and are what the handoff path
/// serializes; a span is meaningless without the arena it was issued for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub off: u32,
    pub len: u32,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MemBuf {
    /// Creates an arena with `initial_size` bytes of capacity.
    pub fn new(initial_size: usize) -> Self {
        Self {
            storage: vec![0u8; initial_size],
            cur: 0,
            prev: 0,
        }
    }

    /// Grows the arena so that `grow_size` more bytes fit past the write
    /// cursor. Cursors and issued spans survive the reallocation.
    pub fn grow(&mut self, grow_size: usize) {
        let new_size: usize = self.cur + grow_size;
        if new_size > self.storage.len() {
            self.storage.resize(new_size, 0);
        }
    }

    /// Rewinds both cursors. Capacity is retained.
    pub fn reset(&mut self) {
        self.cur = 0;
        self.prev = 0;
    }

    /// Bytes available past the write cursor.
    pub fn avail(&self) -> usize {
        self.storage.len() - self.cur
    }

    /// Bytes written so far.
    pub fn used(&self) -> usize {
        self.cur
    }

    /// Offset of the previous write cursor.
    pub fn prev(&self) -> usize {
        self.prev
    }

    /// Marks `size` bytes past the write cursor as written, advancing
    /// `prev` to the old cursor. Fails when the arena has no room.
    pub fn consume(&mut self, size: usize) -> Result<(), Fail> {
        if self.avail() < size {
            return Err(Fail::new(ENOMEM, "arena capacity exceeded"));
        }
        self.prev = self.cur;
        self.cur += size;
        Ok(())
    }

    /// The written region `[0, cur)`.
    pub fn filled(&self) -> &[u8] {
        &self.storage[..self.cur]
    }

    /// The unwritten region `[cur, capacity)`, for readv-style fills
    /// followed by [MemBuf::consume].
    pub fn spare(&mut self) -> &mut [u8] {
        let cur: usize = self.cur;
        &mut self.storage[cur..]
    }

    /// Appends a slice, growing if needed.
    pub fn push(&mut self, data: &[u8]) {
        if self.avail() < data.len() {
            self.grow(data.len());
        }
        let cur: usize = self.cur;
        self.storage[cur..cur + data.len()].copy_from_slice(data);
        self.prev = cur;
        self.cur = cur + data.len();
    }

    /// Moves the trailing `[from, cur)` region to the front of the arena and
    /// rewinds the cursors past it. Used to retain a partial record between
    /// reads.
    pub fn compact(&mut self, from: usize) {
        debug_assert!(from <= self.cur);
        let rem: usize = self.cur - from;
        self.storage.copy_within(from..self.cur, 0);
        self.cur = rem;
        self.prev = 0;
    }

    /// Computes the span of `sub` within this arena. `sub` must be a
    /// subslice of the written region.
    pub fn span_of(&self, sub: &[u8]) -> Span {
        let base: usize = self.storage.as_ptr() as usize;
        let off: usize = sub.as_ptr() as usize - base;
        debug_assert!(off + sub.len() <= self.cur);
        Span {
            off: off as u32,
            len: sub.len() as u32,
        }
    }

    /// Resolves a span issued for this arena.
    pub fn resolve(&self, span: Span) -> &[u8] {
        &self.storage[span.off as usize..(span.off + span.len) as usize]
    }
}

impl Span {
    pub fn new(off: u32, len: u32) -> Self {
        Self { off, len }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{MemBuf, Span};

    #[test]
    fn test_membuf_consume_and_cursors() {
        let mut mem = MemBuf::new(16);
        assert_eq!(mem.avail(), 16);
        assert_eq!(mem.used(), 0);

        mem.spare()[..4].copy_from_slice(b"abcd");
        mem.consume(4).unwrap();
        assert_eq!(mem.used(), 4);
        assert_eq!(mem.prev(), 0);

        mem.spare()[..2].copy_from_slice(b"ef");
        mem.consume(2).unwrap();
        assert_eq!(mem.used(), 6);
        assert_eq!(mem.prev(), 4);
        assert_eq!(mem.filled(), b"abcdef");
    }

    #[test]
    fn test_membuf_consume_past_capacity_fails() {
        let mut mem = MemBuf::new(4);
        assert!(mem.consume(5).is_err());
        // A failed consume moves no cursor.
        assert_eq!(mem.used(), 0);
        assert_eq!(mem.prev(), 0);
    }

    #[test]
    fn test_membuf_grow_preserves_contents_and_spans() {
        let mut mem = MemBuf::new(8);
        mem.push(b"GET /42 ");
        let span = Span::new(4, 3);
        assert_eq!(mem.resolve(span), b"/42");

        mem.grow(4096);
        assert_eq!(mem.resolve(span), b"/42");
        assert_eq!(mem.used(), 8);
        assert!(mem.avail() >= 4096);
    }

    #[test]
    fn test_membuf_reset_is_fresh() {
        let mut mem = MemBuf::new(8);
        mem.push(b"xyz");
        mem.reset();
        assert_eq!(mem.used(), 0);
        assert_eq!(mem.prev(), 0);
        assert_eq!(mem.filled(), b"");
    }

    #[test]
    fn test_membuf_compact_retains_leftover() {
        let mut mem = MemBuf::new(16);
        mem.push(b"full-rec");
        mem.push(b"part");
        mem.compact(8);
        assert_eq!(mem.filled(), b"part");
        assert_eq!(mem.used(), 4);
    }

    #[test]
    fn test_membuf_span_of() {
        let mut mem = MemBuf::new(16);
        mem.push(b"GET /index");
        let sub = &mem.filled()[4..10];
        let span = mem.span_of(sub);
        assert_eq!(span, Span::new(4, 6));
        assert_eq!(mem.resolve(span), b"/index");
    }
}
