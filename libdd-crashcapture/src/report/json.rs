// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON encoder that never allocates.
//!
//! Elements are appended one at a time and go straight to a [`JsonSink`]; the encoder only keeps
//! a fixed stack of open containers. Keys are ignored where JSON has none: inside arrays and for
//! the top-level value.

use crate::shared::fixed_string::FixedString;
use crate::shared::log::crash_error;
use crate::shared::raw_io::{BufferedReader, RawFile};
use serde::de::IgnoredAny;
use std::ffi::CStr;
use std::fmt::Write;

pub const MAX_CONTAINER_DEPTH: usize = 64;
const WRITE_BUFFER_SIZE: usize = 1024;
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("cannot write report data: {0}")]
    Io(#[from] errno::Errno),
    #[error("containers nested deeper than 64 levels")]
    TooDeep,
    #[error("no open container left to end")]
    NoOpenContainer,
    #[error("invalid JSON data at line {line}, column {column}")]
    InvalidJson { line: usize, column: usize },
}

/// Destination of encoded bytes.
pub trait JsonSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodeError>;

    fn flush(&mut self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl JsonSink for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// A file written through a small inline buffer. Data reaches the file on [`JsonSink::flush`],
/// when the buffer fills up, and on drop.
pub struct BufferedFdWriter {
    file: RawFile,
    buf: [u8; WRITE_BUFFER_SIZE],
    len: usize,
}

impl BufferedFdWriter {
    /// Creates or truncates `path`.
    pub fn create(path: &CStr) -> Result<Self, EncodeError> {
        Ok(Self {
            file: RawFile::create(path)?,
            buf: [0; WRITE_BUFFER_SIZE],
            len: 0,
        })
    }
}

impl JsonSink for BufferedFdWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        if bytes.len() > self.buf.len() - self.len {
            self.flush()?;
        }
        if bytes.len() > self.buf.len() {
            return Ok(self.file.write_all(bytes)?);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EncodeError> {
        if self.len > 0 {
            let len = std::mem::take(&mut self.len);
            self.file.write_all(&self.buf[..len])?;
        }
        Ok(())
    }
}

impl Drop for BufferedFdWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            crash_error!("Failed to flush report data: {e}");
        }
    }
}

/// Carries an incomplete UTF-8 sequence from one chunk of bytes to the next.
#[derive(Debug, Default)]
pub(crate) struct Utf8Stream {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Stream {
    /// Calls `emit` with the valid text of `bytes`. Invalid sequences are skipped and a
    /// sequence cut at the end of `bytes` is completed by the next call.
    pub(crate) fn feed<E>(
        &mut self,
        mut bytes: &[u8],
        mut emit: impl FnMut(&str) -> Result<(), E>,
    ) -> Result<(), E> {
        while self.pending_len > 0 && !bytes.is_empty() {
            self.pending[self.pending_len] = bytes[0];
            self.pending_len += 1;
            bytes = &bytes[1..];
            match std::str::from_utf8(&self.pending[..self.pending_len]) {
                Ok(s) => {
                    emit(s)?;
                    self.pending_len = 0;
                }
                Err(e) if e.error_len().is_some() || self.pending_len == 4 => self.pending_len = 0,
                Err(_) => {}
            }
        }
        while !bytes.is_empty() {
            match std::str::from_utf8(bytes) {
                Ok(s) => return emit(s),
                Err(e) => {
                    let (valid, rest) = bytes.split_at(e.valid_up_to());
                    // SAFETY: `valid_up_to` marks the end of the valid prefix.
                    emit(unsafe { std::str::from_utf8_unchecked(valid) })?;
                    match e.error_len() {
                        Some(skip) => bytes = &rest[skip..],
                        None => {
                            self.pending[..rest.len()].copy_from_slice(rest);
                            self.pending_len = rest.len();
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Container {
    is_object: bool,
    is_first: bool,
}

pub struct JsonEncoder<W: JsonSink> {
    sink: W,
    stack: [Container; MAX_CONTAINER_DEPTH],
    depth: usize,
}

impl<W: JsonSink> JsonEncoder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            stack: [Container {
                is_object: false,
                is_first: true,
            }; MAX_CONTAINER_DEPTH],
            depth: 0,
        }
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn flush(&mut self) -> Result<(), EncodeError> {
        self.sink.flush()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.sink.write_bytes(bytes)
    }

    fn write_escaped(&mut self, text: &str) -> Result<(), EncodeError> {
        let bytes = text.as_bytes();
        let mut start = 0;
        for (i, b) in bytes.iter().enumerate() {
            let escaped: &[u8] = match b {
                b'"' => b"\\\"",
                b'\\' => b"\\\\",
                b'\n' => b"\\n",
                b'\r' => b"\\r",
                b'\t' => b"\\t",
                0x08 => b"\\b",
                0x0c => b"\\f",
                0..=0x1f => b"",
                _ => continue,
            };
            self.write(&bytes[start..i])?;
            if escaped.is_empty() {
                let unicode = [
                    b'\\',
                    b'u',
                    b'0',
                    b'0',
                    HEX_DIGITS[(b >> 4) as usize],
                    HEX_DIGITS[(b & 15) as usize],
                ];
                self.write(&unicode)?;
            } else {
                self.write(escaped)?;
            }
            start = i + 1;
        }
        self.write(&bytes[start..])
    }

    fn write_quoted(&mut self, text: &str) -> Result<(), EncodeError> {
        self.write(b"\"")?;
        self.write_escaped(text)?;
        self.write(b"\"")
    }

    /// Writes the separator and key that precede any element.
    fn begin_element(&mut self, key: Option<&str>) -> Result<(), EncodeError> {
        if self.depth == 0 {
            return Ok(());
        }
        let container = &mut self.stack[self.depth - 1];
        let needs_comma = !container.is_first;
        let is_object = container.is_object;
        container.is_first = false;
        if needs_comma {
            self.write(b",")?;
        }
        if is_object {
            if key.is_none() {
                crash_error!("Object element without a key");
            }
            self.write_quoted(key.unwrap_or_default())?;
            self.write(b":")?;
        }
        Ok(())
    }

    fn push(&mut self, is_object: bool, is_first: bool) -> Result<(), EncodeError> {
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        self.stack[self.depth] = Container {
            is_object,
            is_first,
        };
        self.depth += 1;
        Ok(())
    }

    pub fn begin_object(&mut self, key: Option<&str>) -> Result<(), EncodeError> {
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        self.begin_element(key)?;
        self.write(b"{")?;
        self.push(true, true)
    }

    pub fn begin_array(&mut self, key: Option<&str>) -> Result<(), EncodeError> {
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        self.begin_element(key)?;
        self.write(b"[")?;
        self.push(false, true)
    }

    pub fn end_container(&mut self) -> Result<(), EncodeError> {
        if self.depth == 0 {
            return Err(EncodeError::NoOpenContainer);
        }
        self.depth -= 1;
        let closing: &[u8] = if self.stack[self.depth].is_object {
            b"}"
        } else {
            b"]"
        };
        self.write(closing)
    }

    /// Closes every open container and flushes.
    pub fn end_encode(&mut self) -> Result<(), EncodeError> {
        while self.depth > 0 {
            self.end_container()?;
        }
        self.flush()
    }

    pub fn add_bool(&mut self, key: Option<&str>, value: bool) -> Result<(), EncodeError> {
        self.begin_element(key)?;
        self.write(if value { b"true" } else { b"false" })
    }

    pub fn add_null(&mut self, key: Option<&str>) -> Result<(), EncodeError> {
        self.begin_element(key)?;
        self.write(b"null")
    }

    pub fn add_int(&mut self, key: Option<&str>, value: i64) -> Result<(), EncodeError> {
        let mut text = FixedString::<24>::new();
        let _ = write!(text, "{value}");
        self.begin_element(key)?;
        self.write(text.as_bytes())
    }

    pub fn add_uint(&mut self, key: Option<&str>, value: u64) -> Result<(), EncodeError> {
        let mut text = FixedString::<24>::new();
        let _ = write!(text, "{value}");
        self.begin_element(key)?;
        self.write(text.as_bytes())
    }

    /// Non-finite values have no JSON form and are written as `null`.
    pub fn add_float(&mut self, key: Option<&str>, value: f64) -> Result<(), EncodeError> {
        if !value.is_finite() {
            return self.add_null(key);
        }
        let mut text = FixedString::<40>::new();
        // Debug switches to exponent notation for very large and very small values.
        let _ = write!(text, "{value:?}");
        self.begin_element(key)?;
        self.write(text.as_bytes())
    }

    pub fn add_string(&mut self, key: Option<&str>, value: &str) -> Result<(), EncodeError> {
        self.begin_element(key)?;
        self.write_quoted(value)
    }

    /// Writes `null` for `None`.
    pub fn add_optional_string(
        &mut self,
        key: Option<&str>,
        value: Option<&str>,
    ) -> Result<(), EncodeError> {
        match value {
            Some(value) => self.add_string(key, value),
            None => self.add_null(key),
        }
    }

    pub fn begin_string_element(&mut self, key: Option<&str>) -> Result<(), EncodeError> {
        self.begin_element(key)?;
        self.write(b"\"")
    }

    pub fn append_string_element(&mut self, text: &str) -> Result<(), EncodeError> {
        self.write_escaped(text)
    }

    pub fn end_string_element(&mut self) -> Result<(), EncodeError> {
        self.write(b"\"")
    }

    /// Writes `data` as a string of uppercase hex digits.
    pub fn add_data(&mut self, key: Option<&str>, data: &[u8]) -> Result<(), EncodeError> {
        self.begin_data_element(key)?;
        self.append_data_element(data)?;
        self.end_data_element()
    }

    pub fn begin_data_element(&mut self, key: Option<&str>) -> Result<(), EncodeError> {
        self.begin_string_element(key)
    }

    pub fn append_data_element(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let mut hex = [0u8; 128];
        for chunk in data.chunks(hex.len() / 2) {
            for (i, b) in chunk.iter().enumerate() {
                hex[i * 2] = HEX_DIGITS[(b >> 4) as usize];
                hex[i * 2 + 1] = HEX_DIGITS[(b & 15) as usize];
            }
            self.write(&hex[..chunk.len() * 2])?;
        }
        Ok(())
    }

    pub fn end_data_element(&mut self) -> Result<(), EncodeError> {
        self.end_string_element()
    }

    /// Writes 16 bytes in the canonical `8-4-4-4-12` form, or `null`.
    pub fn add_uuid(&mut self, key: Option<&str>, value: Option<&[u8; 16]>) -> Result<(), EncodeError> {
        let Some(bytes) = value else {
            return self.add_null(key);
        };
        let mut text = [0u8; 36];
        let mut pos = 0;
        for (i, b) in bytes.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                text[pos] = b'-';
                pos += 1;
            }
            text[pos] = HEX_DIGITS[(b >> 4) as usize];
            text[pos + 1] = HEX_DIGITS[(b & 15) as usize];
            pos += 2;
        }
        self.begin_string_element(key)?;
        self.write(&text)?;
        self.end_string_element()
    }

    /// Embeds pre-encoded JSON. Nothing is written if `json` is not well-formed.
    ///
    /// Without `close_last_container`, an object or array is left open so more elements can be
    /// appended to it before [`JsonEncoder::end_container`].
    pub fn add_json_element(
        &mut self,
        key: Option<&str>,
        json: &str,
        close_last_container: bool,
    ) -> Result<(), EncodeError> {
        let json = json.trim();
        if let Err(e) = serde_json::from_str::<IgnoredAny>(json) {
            return Err(EncodeError::InvalidJson {
                line: e.line(),
                column: e.column(),
            });
        }
        let is_object = json.starts_with('{');
        let is_container = is_object || json.starts_with('[');
        if close_last_container || !is_container {
            self.begin_element(key)?;
            return self.write(json.as_bytes());
        }
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        // Well-formed and starting with a bracket: the last byte is the matching one.
        let body = &json[..json.len() - 1];
        self.begin_element(key)?;
        self.write(body.as_bytes())?;
        self.push(is_object, body[1..].trim().is_empty())
    }

    /// Embeds the content of a text file as one string.
    pub fn add_text_file(&mut self, key: Option<&str>, path: &CStr) -> Result<(), EncodeError> {
        let mut file = RawFile::open_read(path)?;
        self.begin_string_element(key)?;
        let mut buffer = [0u8; 512];
        let mut stream = Utf8Stream::default();
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            stream.feed(&buffer[..n], |text| self.write_escaped(text))?;
        }
        self.end_string_element()
    }

    /// Embeds a text file as an array with one string per line. Lines longer than 1 KiB are
    /// cut.
    pub fn add_text_lines_from_file(
        &mut self,
        key: Option<&str>,
        path: &CStr,
    ) -> Result<(), EncodeError> {
        let file = RawFile::open_read(path)?;
        let mut storage = [0u8; 1024];
        let mut reader = BufferedReader::new(file, &mut storage);
        let mut line = [0u8; 1024];
        self.begin_array(key)?;
        while let Some(bytes) = reader.read_until(b'\n', &mut line) {
            let text = FixedString::<1025>::from_bytes_lossy(bytes);
            self.add_string(None, text.as_str())?;
        }
        self.end_container()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::ffi::CString;
    use std::io::Write as _;

    fn encode(f: impl FnOnce(&mut JsonEncoder<Vec<u8>>) -> Result<(), EncodeError>) -> Value {
        let mut encoder = JsonEncoder::new(Vec::new());
        f(&mut encoder).unwrap();
        encoder.end_encode().unwrap();
        let bytes = encoder.into_sink();
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|e| panic!("{e}: {}", String::from_utf8_lossy(&bytes)))
    }

    #[test]
    fn test_nested_containers_and_scalars() {
        let value = encode(|e| {
            e.begin_object(Some("ignored at top level"))?;
            e.add_string(Some("name"), "quote \" backslash \\ tab \t bell \u{7}")?;
            e.add_int(Some("neg"), -42)?;
            e.add_uint(Some("big"), u64::MAX)?;
            e.add_float(Some("ratio"), 0.25)?;
            e.add_float(Some("nan"), f64::NAN)?;
            e.add_bool(Some("yes"), true)?;
            e.add_optional_string(Some("missing"), None)?;
            e.begin_array(Some("list"))?;
            e.add_int(Some("keys are ignored in arrays"), 1)?;
            e.begin_object(None)?;
            e.end_container()?;
            e.end_container()
        });
        assert_eq!(
            value,
            json!({
                "name": "quote \" backslash \\ tab \t bell \u{7}",
                "neg": -42,
                "big": u64::MAX,
                "ratio": 0.25,
                "nan": null,
                "yes": true,
                "missing": null,
                "list": [1, {}],
            })
        );
    }

    #[test]
    fn test_data_and_uuid() {
        let uuid = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ];
        let value = encode(|e| {
            e.begin_object(None)?;
            e.add_data(Some("data"), &[0x00, 0xff, 0x10])?;
            e.add_uuid(Some("uuid"), Some(&uuid))?;
            e.add_uuid(Some("none"), None)
        });
        assert_eq!(value["data"], "00FF10");
        assert_eq!(value["uuid"], "12345678-9ABC-DEF0-0123-456789ABCDEF");
        assert_eq!(value["none"], Value::Null);
    }

    #[test]
    fn test_json_element_left_open() {
        let value = encode(|e| {
            e.begin_object(None)?;
            e.add_json_element(Some("user"), r#" {"a": 1} "#, false)?;
            e.add_string(Some("b"), "appended")?;
            e.end_container()?;
            e.add_json_element(Some("empty"), "[]", false)?;
            e.add_int(None, 7)?;
            e.end_container()?;
            e.add_json_element(Some("closed"), "[1,2]", true)?;
            e.add_json_element(Some("scalar"), "\"text\"", false)
        });
        assert_eq!(
            value,
            json!({
                "user": {"a": 1, "b": "appended"},
                "empty": [7],
                "closed": [1, 2],
                "scalar": "text",
            })
        );
    }

    #[test]
    fn test_invalid_json_element_writes_nothing() {
        let mut encoder = JsonEncoder::new(Vec::new());
        encoder.begin_object(None).unwrap();
        let err = encoder
            .add_json_element(Some("bad"), "{\"a\": ", true)
            .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidJson { .. }));
        encoder.end_encode().unwrap();
        assert_eq!(encoder.into_sink(), b"{}");
    }

    #[test]
    fn test_depth_limits() {
        let mut encoder = JsonEncoder::new(Vec::new());
        assert!(matches!(
            encoder.end_container(),
            Err(EncodeError::NoOpenContainer)
        ));
        for _ in 0..MAX_CONTAINER_DEPTH {
            encoder.begin_array(None).unwrap();
        }
        assert!(matches!(encoder.begin_array(None), Err(EncodeError::TooDeep)));
        encoder.end_encode().unwrap();
        let value: Value = serde_json::from_slice(&encoder.into_sink()).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_utf8_stream_across_chunks() {
        let text = "héllo €uro";
        let bytes = text.as_bytes();
        let mut out = String::new();
        let mut stream = Utf8Stream::default();
        for chunk in bytes.chunks(1) {
            stream
                .feed::<()>(chunk, |s| {
                    out.push_str(s);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(out, text);

        out.clear();
        stream
            .feed::<()>(b"ok\xffgo", |s| {
                out.push_str(s);
                Ok(())
            })
            .unwrap();
        assert_eq!(out, "okgo");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_text_file_elements_and_buffered_writer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("ConsoleLog.txt");
        std::fs::File::create(&log)?.write_all(b"first line\nsecond \"quoted\"\n")?;
        let log = CString::new(log.to_str().unwrap())?;

        let report = dir.path().join("report.json");
        let report_c = CString::new(report.to_str().unwrap())?;
        {
            let mut encoder = JsonEncoder::new(BufferedFdWriter::create(&report_c)?);
            encoder.begin_object(None)?;
            encoder.add_text_lines_from_file(Some("lines"), &log)?;
            encoder.add_text_file(Some("whole"), &log)?;
            // Larger than the write buffer.
            encoder.add_data(Some("blob"), &[0xab; 3000])?;
            encoder.end_encode()?;
        }
        let value: Value = serde_json::from_slice(&std::fs::read(&report)?)?;
        assert_eq!(value["lines"], json!(["first line", "second \"quoted\""]));
        assert_eq!(value["whole"], "first line\nsecond \"quoted\"\n");
        assert_eq!(value["blob"].as_str().map(str::len), Some(6000));
        Ok(())
    }
}
