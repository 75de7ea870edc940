// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File access built only from async-signal-safe system calls.
//!
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html> lists `open`, `read`, `write`,
//! `close`, `rename` and `unlink`; nothing here goes through `std::fs`, which may allocate.

use std::ffi::CStr;

/// Writes all of `bytes` to `fd`, retrying on `EINTR` and short writes.
pub fn write_all(fd: libc::c_int, mut bytes: &[u8]) -> Result<(), errno::Errno> {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length come from a valid slice.
        let written = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if written < 0 {
            let err = errno::errno();
            if err.0 == libc::EINTR {
                continue;
            }
            return Err(err);
        }
        if written == 0 {
            return Err(errno::Errno(libc::EIO));
        }
        bytes = &bytes[written as usize..];
    }
    Ok(())
}

/// An owned raw file descriptor, closed on drop.
#[derive(Debug)]
pub struct RawFile {
    fd: libc::c_int,
}

impl RawFile {
    pub fn open_read(path: &CStr) -> Result<Self, errno::Errno> {
        Self::open(path, libc::O_RDONLY | libc::O_CLOEXEC, 0)
    }

    pub fn open_directory(path: &CStr) -> Result<Self, errno::Errno> {
        Self::open(path, libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC, 0)
    }

    /// Creates or truncates `path` for writing.
    pub fn create(path: &CStr) -> Result<Self, errno::Errno> {
        Self::open(
            path,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644,
        )
    }

    fn open(path: &CStr, flags: libc::c_int, mode: libc::mode_t) -> Result<Self, errno::Errno> {
        loop {
            // SAFETY: `path` is NUL-terminated.
            let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
            if fd >= 0 {
                return Ok(Self { fd });
            }
            let err = errno::errno();
            if err.0 != libc::EINTR {
                return Err(err);
            }
        }
    }

    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    /// Reads into `buf`, returning 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, errno::Errno> {
        loop {
            // SAFETY: the pointer and length come from a valid mutable slice.
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = errno::errno();
            if err.0 != libc::EINTR {
                return Err(err);
            }
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), errno::Errno> {
        write_all(self.fd, bytes)
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        // Best-effort close.
        // SAFETY: we own the descriptor.
        let _ = unsafe { libc::close(self.fd) };
    }
}

/// Line and byte reader over a [`RawFile`] and a caller-provided buffer.
pub struct BufferedReader<'a> {
    file: RawFile,
    buf: &'a mut [u8],
    pos: usize,
    len: usize,
}

impl<'a> BufferedReader<'a> {
    pub fn new(file: RawFile, buf: &'a mut [u8]) -> Self {
        Self {
            file,
            buf,
            pos: 0,
            len: 0,
        }
    }

    fn fill(&mut self) -> bool {
        if self.pos < self.len {
            return true;
        }
        self.pos = 0;
        self.len = self.file.read(self.buf).unwrap_or(0);
        self.len > 0
    }

    /// Returns the next byte, or `None` at end of file or on a read error.
    pub fn next_byte(&mut self) -> Option<u8> {
        if !self.fill() {
            return None;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Some(b)
    }

    /// Copies bytes into `out` until `delimiter` (consumed, not copied) or end of file.
    ///
    /// Returns `None` once nothing is left. A line longer than `out` is cut and the rest of it
    /// is skipped.
    pub fn read_until<'o>(&mut self, delimiter: u8, out: &'o mut [u8]) -> Option<&'o [u8]> {
        let mut n = 0;
        let mut saw_any = false;
        while let Some(b) = self.next_byte() {
            saw_any = true;
            if b == delimiter {
                return Some(&out[..n]);
            }
            if n < out.len() {
                out[n] = b;
                n += 1;
            }
        }
        if saw_any {
            Some(&out[..n])
        } else {
            None
        }
    }
}

/// Writes the decimal form of `val` to the start of `buf`, returning the number of bytes used.
pub fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Write;

    #[test]
    fn test_write_decimal() {
        let mut buf = [0u8; 8];
        assert_eq!(write_decimal(&mut buf, 4021), Some(4));
        assert_eq!(&buf[..4], b"4021");
        assert_eq!(write_decimal(&mut buf, 0), Some(1));
        assert_eq!(&buf[..1], b"0");
        assert_eq!(write_decimal(&mut buf[..2], 123), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_read_lines() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"first\nsecond line that is long\nlast")?;
        let path = CString::new(file.path().to_str().unwrap())?;

        let mut storage = [0u8; 4];
        let mut reader = BufferedReader::new(RawFile::open_read(&path)?, &mut storage);
        let mut line = [0u8; 8];
        assert_eq!(reader.read_until(b'\n', &mut line), Some(&b"first"[..]));
        assert_eq!(reader.read_until(b'\n', &mut line), Some(&b"second l"[..]));
        assert_eq!(reader.read_until(b'\n', &mut line), Some(&b"last"[..]));
        assert_eq!(reader.read_until(b'\n', &mut line), None);
        Ok(())
    }

    #[test]
    fn test_open_missing_file() {
        let err = RawFile::open_read(c"/definitely/not/here").unwrap_err();
        assert_eq!(err.0, libc::ENOENT);
    }
}
