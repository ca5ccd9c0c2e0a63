// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// A stack allocated, capacity bounded text buffer.
///
/// `core::fmt` formatting of integers, floats and `&str` into this buffer does
/// not touch the heap, which makes it usable from inside a signal handler.
/// Writes that would exceed the capacity fail instead of truncating.
#[derive(Clone)]
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole `&str` values are ever appended.
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), fmt::Error> {
        let end = self.len.checked_add(bytes.len()).ok_or(fmt::Error)?;
        if end > N {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes())
    }
}

impl<const N: usize> fmt::Debug for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FixedBuf").field(&self.as_str()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::FixedBuf;
    use std::fmt::Write;

    #[test]
    fn test_write_within_capacity() {
        let mut buf = FixedBuf::<16>::new();
        write!(buf, "{}-{:x}", 42, 255).unwrap();
        assert_eq!(buf.as_str(), "42-ff");
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut buf = FixedBuf::<4>::new();
        assert!(write!(buf, "12345").is_err());
        assert!(buf.len() <= 4);
    }
}
