// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ffi::CStr;
use std::fmt;

/// A NUL-terminated string living in a fixed inline buffer.
///
/// Formatting into it never allocates: text that does not fit is dropped at the last complete
/// UTF-8 character, and [`FixedString::is_truncated`] reports it. This is what the crash path
/// uses for file paths, log lines and generated keys such as `stack@0x7ffc...`.
#[derive(Clone, Copy)]
pub struct FixedString<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> FixedString<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    /// Builds a string from `text`, truncating if needed.
    pub fn from_str_truncated(text: &str) -> Self {
        let mut s = Self::new();
        s.push_str(text);
        s
    }

    /// Builds a string from raw bytes; invalid UTF-8 is cut at the first bad sequence.
    pub fn from_bytes_lossy(bytes: &[u8]) -> Self {
        let valid = match std::str::from_utf8(bytes) {
            Ok(s) => s,
            // SAFETY: `valid_up_to` marks the end of the valid prefix.
            Err(e) => unsafe { std::str::from_utf8_unchecked(&bytes[..e.valid_up_to()]) },
        };
        Self::from_str_truncated(valid)
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
        if N > 0 {
            self.buf[0] = 0;
        }
    }

    pub fn push_str(&mut self, text: &str) {
        let capacity = N.saturating_sub(1);
        let room = capacity - self.len;
        let mut take = text.len().min(room);
        if take < text.len() {
            self.truncated = true;
            while take > 0 && !text.is_char_boundary(take) {
                take -= 1;
            }
        }
        self.buf[self.len..self.len + take].copy_from_slice(&text.as_bytes()[..take]);
        self.len += take;
        if N > 0 {
            self.buf[self.len] = 0;
        }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: only whole `&str` prefixes cut at char boundaries are ever copied in.
        unsafe { std::str::from_utf8_unchecked(&self.buf[..self.len]) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The string up to its first NUL, suitable for libc calls.
    pub fn as_c_str(&self) -> &CStr {
        CStr::from_bytes_until_nul(&self.buf).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedString<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Never report an error: a truncated log line or key is still useful.
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::FixedString;
    use std::fmt::Write;

    #[test]
    fn test_format_into_fixed_string() {
        let mut s = FixedString::<32>::new();
        write!(s, "stack@{:#x}", 0x7ffc_1234usize).unwrap();
        assert_eq!(s.as_str(), "stack@0x7ffc1234");
        assert_eq!(s.as_c_str().to_bytes(), b"stack@0x7ffc1234");
        assert!(!s.is_truncated());
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let mut s = FixedString::<6>::new();
        s.push_str("abcé€");
        // 5 bytes of room: "abc" + "é" (2 bytes) fits, "€" does not.
        assert_eq!(s.as_str(), "abcé");
        assert!(s.is_truncated());
    }

    #[test]
    fn test_lossy_bytes() {
        let s = FixedString::<16>::from_bytes_lossy(b"ok\xffnope");
        assert_eq!(s.as_str(), "ok");
    }
}
