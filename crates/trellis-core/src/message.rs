//! Message buffer passed between pipeline stages
//!
//! A `Message` is a window `[start, start + len)` over a fixed backing
//! region. Stages strip their header by moving the start forward and add one
//! by moving it back into the reserved padding, so headers are added and
//! removed without copying the payload.

use crate::error::{Error, Result};
use std::fmt;

/// Front padding reserved by buffers created from inbound traffic.
///
/// Enough for every header the pipeline adds on the way out.
pub const DEFAULT_PADDING: usize = 256;

/// A mutable byte region with a movable read window
pub struct Message {
    bytes: Vec<u8>,
    start: usize,
    len: usize,
}

impl Message {
    /// Allocate `length` zeroed payload bytes behind `padding` spare bytes.
    pub fn new(length: usize, padding: usize) -> Self {
        Self {
            bytes: vec![0u8; padding + length],
            start: padding,
            len: length,
        }
    }

    /// Copy `payload` into a new buffer with `padding` spare bytes in front.
    pub fn from_payload(payload: &[u8], padding: usize) -> Self {
        let mut bytes = vec![0u8; padding + payload.len()];
        bytes[padding..].copy_from_slice(payload);
        Self {
            bytes,
            start: padding,
            len: payload.len(),
        }
    }

    /// Valid payload length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available in front of the window
    pub fn padding(&self) -> usize {
        self.start
    }

    /// Total backing size
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[self.start..self.start + self.len]
    }

    /// Move the start of the window.
    ///
    /// A positive `delta` consumes leading bytes; a negative one re-exposes
    /// bytes hidden in front of the window (for example a header a lower
    /// layer already consumed).
    pub fn shift_start(&mut self, delta: isize) -> Result<()> {
        let amount = delta.unsigned_abs();
        if delta >= 0 {
            if amount > self.len {
                return Err(self.out_of_bounds("shift_start", amount));
            }
            self.start += amount;
            self.len -= amount;
        } else {
            if amount > self.start {
                return Err(self.out_of_bounds("shift_start", amount));
            }
            self.start -= amount;
            self.len += amount;
        }
        Ok(())
    }

    /// Shrink the window to `new_len` bytes.
    pub fn truncate(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.len {
            return Err(self.out_of_bounds("truncate", new_len));
        }
        self.len = new_len;
        Ok(())
    }

    /// Bounds-checked read view of `count` bytes at `offset`.
    pub fn peek(&self, offset: usize, count: usize) -> Result<&[u8]> {
        let end = self.checked_end(offset, count, "peek")?;
        Ok(&self.bytes[self.start + offset..self.start + end])
    }

    /// Bounds-checked write view of `count` bytes at `offset`.
    pub fn peek_mut(&mut self, offset: usize, count: usize) -> Result<&mut [u8]> {
        let end = self.checked_end(offset, count, "peek_mut")?;
        Ok(&mut self.bytes[self.start + offset..self.start + end])
    }

    /// Fail with `MalformedFrame` unless at least `needed` bytes are present.
    ///
    /// Parsers call this before popping a header so a short packet is
    /// reported as bad input rather than as a buffer contract violation.
    pub fn require(&self, needed: usize) -> Result<()> {
        if self.len < needed {
            return Err(Error::MalformedFrame {
                needed,
                got: self.len,
            });
        }
        Ok(())
    }

    /// Prepend `header` into the front padding.
    pub fn push(&mut self, header: &[u8]) -> Result<()> {
        let n = header.len();
        if n > self.start {
            return Err(self.out_of_bounds("push", n));
        }
        self.start -= n;
        self.len += n;
        self.bytes[self.start..self.start + n].copy_from_slice(header);
        Ok(())
    }

    /// Remove and return the first `n` bytes.
    pub fn pop(&mut self, n: usize) -> Result<Vec<u8>> {
        let head = self.peek(0, n)?.to_vec();
        self.shift_start(n as isize)?;
        Ok(head)
    }

    /// Remove the first `N` bytes into a fixed array.
    pub fn pop_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.peek(0, N)?);
        self.shift_start(N as isize)?;
        Ok(out)
    }

    pub fn push_u16_be(&mut self, value: u16) -> Result<()> {
        self.push(&value.to_be_bytes())
    }

    pub fn pop_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.pop_array()?))
    }

    pub fn push_u32_be(&mut self, value: u32) -> Result<()> {
        self.push(&value.to_be_bytes())
    }

    pub fn pop_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.pop_array()?))
    }

    pub fn push_u64_be(&mut self, value: u64) -> Result<()> {
        self.push(&value.to_be_bytes())
    }

    pub fn pop_u64_be(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.pop_array()?))
    }

    /// Copy of this buffer with the same padding, for callers that must keep
    /// the original (retransmit queues, tests).
    pub fn duplicate(&self) -> Self {
        Self::from_payload(self.as_slice(), self.start)
    }

    /// Consume the buffer, returning the window contents.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.start == 0 {
            self.bytes.truncate(self.len);
            return self.bytes;
        }
        self.as_slice().to_vec()
    }

    fn checked_end(&self, offset: usize, count: usize, op: &'static str) -> Result<usize> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(end),
            _ => Err(self.out_of_bounds(op, offset.saturating_add(count))),
        }
    }

    fn out_of_bounds(&self, op: &'static str, amount: usize) -> Error {
        Error::OutOfBounds {
            op,
            amount,
            start: self.start,
            len: self.len,
            capacity: self.bytes.len(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.as_slice()[..self.len.min(16)];
        f.debug_struct("Message")
            .field("len", &self.len)
            .field("padding", &self.start)
            .field("capacity", &self.bytes.len())
            .field("head", &hex::encode(preview))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_window() {
        let msg = Message::new(64, 512);
        assert_eq!(msg.len(), 64);
        assert_eq!(msg.padding(), 512);
        assert_eq!(msg.capacity(), 576);
        assert!(msg.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_shift_consumes_and_reexposes() {
        let mut msg = Message::from_payload(b"headerbody", 8);
        msg.shift_start(6).unwrap();
        assert_eq!(msg.as_slice(), b"body");

        // The consumed header is still in the backing region
        msg.shift_start(-6).unwrap();
        assert_eq!(msg.as_slice(), b"headerbody");
    }

    #[test]
    fn test_shift_out_of_bounds() {
        let mut msg = Message::from_payload(b"abc", 2);
        assert!(matches!(msg.shift_start(4), Err(Error::OutOfBounds { .. })));
        assert!(matches!(msg.shift_start(-3), Err(Error::OutOfBounds { .. })));
        // A failed shift leaves the window untouched
        assert_eq!(msg.as_slice(), b"abc");
        assert_eq!(msg.padding(), 2);

        msg.shift_start(-2).unwrap();
        assert_eq!(msg.padding(), 0);
        assert_eq!(msg.len(), 5);
    }

    #[test]
    fn test_truncate() {
        let mut msg = Message::new(64, 0);
        msg.peek_mut(0, 5).unwrap().copy_from_slice(b"hello");
        msg.truncate(5).unwrap();
        assert_eq!(msg.as_slice(), b"hello");
        assert!(msg.truncate(6).is_err());
    }

    #[test]
    fn test_peek_bounds() {
        let mut msg = Message::from_payload(&[1, 2, 3, 4], 0);
        assert_eq!(msg.peek(1, 2).unwrap(), &[2, 3]);
        assert_eq!(msg.peek(4, 0).unwrap(), &[] as &[u8]);
        assert!(msg.peek(3, 2).is_err());
        assert!(msg.peek(usize::MAX, 2).is_err());
        assert!(msg.peek_mut(0, 5).is_err());
    }

    #[test]
    fn test_push_pop_integers() {
        let mut msg = Message::from_payload(b"x", 16);
        msg.push_u64_be(0x0102_0304_0506_0708).unwrap();
        msg.push_u32_be(0xdead_beef).unwrap();
        msg.push_u16_be(0x86dd).unwrap();
        assert_eq!(msg.len(), 15);
        assert_eq!(msg.padding(), 2);

        assert_eq!(msg.pop_u16_be().unwrap(), 0x86dd);
        assert_eq!(msg.pop_u32_be().unwrap(), 0xdead_beef);
        assert_eq!(msg.pop_u64_be().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(msg.as_slice(), b"x");
    }

    #[test]
    fn test_push_without_padding_fails() {
        let mut msg = Message::from_payload(b"payload", 1);
        assert!(matches!(msg.push(&[0, 0]), Err(Error::OutOfBounds { .. })));
        assert_eq!(msg.as_slice(), b"payload");
    }

    #[test]
    fn test_require_reports_malformed() {
        let msg = Message::from_payload(&[0x86], 4);
        assert!(matches!(
            msg.require(2),
            Err(Error::MalformedFrame { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn test_into_vec_and_duplicate() {
        let mut msg = Message::from_payload(b"abcdef", 4);
        msg.shift_start(2).unwrap();
        let copy = msg.duplicate();
        assert_eq!(copy.padding(), msg.padding());
        assert_eq!(msg.into_vec(), b"cdef".to_vec());
        assert_eq!(copy.into_vec(), b"cdef".to_vec());
    }
}
