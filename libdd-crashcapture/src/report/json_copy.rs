// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Re-encodes a JSON file into an open [`JsonEncoder`], token by token.
//!
//! The file is usually a report that was cut short by a crash in the middle of writing it, so
//! the input is allowed to stop anywhere: copying ends at the last complete value and every
//! container left open is closed. A syntax error is handled the same way. Only a fixed read
//! buffer is used, whatever the size of the file.

use super::json::{EncodeError, JsonEncoder, JsonSink, Utf8Stream, MAX_CONTAINER_DEPTH};
use crate::shared::fixed_string::FixedString;
use crate::shared::log::crash_warn;
use crate::shared::raw_io::{BufferedReader, RawFile};
use std::ffi::CStr;

const MAX_KEY_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// A value: top level, after `:` or after `,` in an array.
    Value,
    /// A value or `]`, right after `[`.
    ArrayFirst,
    /// A key or `}`, right after `{`.
    ObjectFirst,
    /// A key, after `,` in an object.
    Key,
    Colon,
    /// `,` or the end of the current container.
    AfterValue,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum Escape {
    None,
    Backslash,
    Unicode { digits: u8, value: u32 },
}

struct Copier<'e, W: JsonSink> {
    encoder: &'e mut JsonEncoder<W>,
    /// Object-ness of the containers opened by the copy.
    stack: [bool; MAX_CONTAINER_DEPTH],
    depth: usize,
    expect: Expect,
    /// Key of the top-level value, then of each object member.
    key: FixedString<MAX_KEY_LENGTH>,
    has_key: bool,
    emitted_any: bool,
}

impl<'e, W: JsonSink> Copier<'e, W> {
    fn value_done(&mut self) {
        self.has_key = false;
        self.emitted_any = true;
        self.expect = if self.depth == 0 {
            Expect::Done
        } else {
            Expect::AfterValue
        };
    }

    fn open(&mut self, is_object: bool) -> Result<(), EncodeError> {
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        let key = self.has_key.then_some(self.key);
        if is_object {
            self.encoder.begin_object(key.as_ref().map(|k| k.as_str()))?;
        } else {
            self.encoder.begin_array(key.as_ref().map(|k| k.as_str()))?;
        }
        self.stack[self.depth] = is_object;
        self.depth += 1;
        self.has_key = false;
        self.emitted_any = true;
        self.expect = if is_object {
            Expect::ObjectFirst
        } else {
            Expect::ArrayFirst
        };
        Ok(())
    }

    fn close(&mut self, is_object: bool) -> Result<bool, EncodeError> {
        if self.depth == 0 || self.stack[self.depth - 1] != is_object {
            return Ok(false);
        }
        self.depth -= 1;
        self.encoder.end_container()?;
        self.value_done();
        Ok(true)
    }

    fn close_all(&mut self) -> Result<(), EncodeError> {
        while self.depth > 0 {
            self.depth -= 1;
            self.encoder.end_container()?;
        }
        Ok(())
    }

    /// Emits a complete number or literal.
    fn scalar(&mut self, token: &str) -> Result<bool, EncodeError> {
        let key = self.has_key.then_some(self.key);
        let key = key.as_ref().map(|k| k.as_str());
        match token {
            "true" => self.encoder.add_bool(key, true)?,
            "false" => self.encoder.add_bool(key, false)?,
            "null" => self.encoder.add_null(key)?,
            _ => {
                if let Ok(v) = token.parse::<u64>() {
                    self.encoder.add_uint(key, v)?;
                } else if let Ok(v) = token.parse::<i64>() {
                    self.encoder.add_int(key, v)?;
                } else if let Ok(v) = token.parse::<f64>() {
                    self.encoder.add_float(key, v)?;
                } else {
                    return Ok(false);
                }
            }
        }
        self.value_done();
        Ok(true)
    }

    fn run(&mut self, reader: &mut BufferedReader<'_>) -> Result<(), EncodeError> {
        // Only set after a number or literal, which end on the byte that follows them.
        let mut lookahead: Option<u8> = None;
        while let Some(b) = lookahead.take().or_else(|| reader.next_byte()) {
            if b.is_ascii_whitespace() {
                continue;
            }
            let expects_value = matches!(self.expect, Expect::Value | Expect::ArrayFirst);
            let ok = match (self.expect, b) {
                (Expect::Done, _) => return Ok(()),
                (_, b'{') if expects_value => {
                    self.open(true)?;
                    true
                }
                (_, b'[') if expects_value => {
                    self.open(false)?;
                    true
                }
                (Expect::ArrayFirst | Expect::AfterValue, b']') => self.close(false)?,
                (Expect::ObjectFirst | Expect::AfterValue, b'}') => self.close(true)?,
                (Expect::AfterValue, b',') => {
                    self.expect = match self.stack[self.depth - 1] {
                        true => Expect::Key,
                        false => Expect::Value,
                    };
                    true
                }
                (Expect::Colon, b':') => {
                    self.expect = Expect::Value;
                    true
                }
                (Expect::ObjectFirst | Expect::Key, b'"') => {
                    if !self.read_key(reader) {
                        return Ok(());
                    }
                    self.expect = Expect::Colon;
                    true
                }
                (_, b'"') if expects_value => {
                    if !self.copy_string(reader)? {
                        return Ok(());
                    }
                    self.value_done();
                    true
                }
                (_, b'-' | b'0'..=b'9' | b't' | b'f' | b'n') if expects_value => {
                    let mut token = FixedString::<64>::new();
                    token.push_str(char::from(b).encode_utf8(&mut [0; 4]));
                    loop {
                        match reader.next_byte() {
                            Some(c)
                                if c.is_ascii_alphanumeric() || matches!(c, b'.' | b'+' | b'-') =>
                            {
                                token.push_str(char::from(c).encode_utf8(&mut [0; 4]));
                            }
                            // The file ends inside the token: it may be incomplete.
                            None => return Ok(()),
                            Some(c) => {
                                lookahead = Some(c);
                                break;
                            }
                        }
                    }
                    !token.is_truncated() && self.scalar(token.as_str())?
                }
                _ => false,
            };
            if !ok {
                crash_warn!("Stopped copying JSON at unexpected byte {b:#x}");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Reads a key into `self.key`. Returns false if the file ends first.
    fn read_key(&mut self, reader: &mut BufferedReader<'_>) -> bool {
        let mut key = FixedString::<MAX_KEY_LENGTH>::new();
        let complete = decode_string(reader, |text| {
            key.push_str(text);
            Ok::<(), EncodeError>(())
        });
        if !matches!(complete, Ok(true)) {
            return false;
        }
        self.key = key;
        self.has_key = true;
        true
    }

    /// Streams a string value. An unterminated string is closed where the file ends, minus any
    /// partial escape sequence. Returns whether the string was complete.
    fn copy_string(&mut self, reader: &mut BufferedReader<'_>) -> Result<bool, EncodeError> {
        let key = self.has_key.then_some(self.key);
        self.encoder
            .begin_string_element(key.as_ref().map(|k| k.as_str()))?;
        let encoder = &mut *self.encoder;
        let complete = decode_string(reader, |text| encoder.append_string_element(text))?;
        self.encoder.end_string_element()?;
        self.emitted_any = true;
        Ok(complete)
    }
}

/// Decodes the rest of a string whose opening quote was consumed, passing unescaped text to
/// `emit`. Returns whether the closing quote was found.
fn decode_string<E>(
    reader: &mut BufferedReader<'_>,
    mut emit: impl FnMut(&str) -> Result<(), E>,
) -> Result<bool, E> {
    let mut raw = [0u8; 256];
    let mut raw_len = 0;
    let mut utf8 = Utf8Stream::default();
    let mut escape = Escape::None;
    let mut high_surrogate: Option<u32> = None;

    let push_char = |c: char, raw: &mut [u8; 256], raw_len: &mut usize| {
        let mut encoded = [0u8; 4];
        let bytes = c.encode_utf8(&mut encoded).as_bytes();
        raw[*raw_len..*raw_len + bytes.len()].copy_from_slice(bytes);
        *raw_len += bytes.len();
    };

    while let Some(b) = reader.next_byte() {
        if raw_len + 4 > raw.len() {
            utf8.feed(&raw[..raw_len], &mut emit)?;
            raw_len = 0;
        }
        escape = match (escape, b) {
            (Escape::None, b'"') => {
                utf8.feed(&raw[..raw_len], &mut emit)?;
                return Ok(true);
            }
            (Escape::None, b'\\') => Escape::Backslash,
            (Escape::None, _) => {
                raw[raw_len] = b;
                raw_len += 1;
                Escape::None
            }
            (Escape::Backslash, b'u') => Escape::Unicode {
                digits: 0,
                value: 0,
            },
            (Escape::Backslash, _) => {
                let c = match b {
                    b'n' => '\n',
                    b'r' => '\r',
                    b't' => '\t',
                    b'b' => '\u{8}',
                    b'f' => '\u{c}',
                    other => char::from(other),
                };
                push_char(c, &mut raw, &mut raw_len);
                Escape::None
            }
            (Escape::Unicode { digits, value }, _) => {
                let value = (value << 4) | char::from(b).to_digit(16).unwrap_or(0);
                if digits < 3 {
                    Escape::Unicode {
                        digits: digits + 1,
                        value,
                    }
                } else {
                    let decoded = match (high_surrogate.take(), value) {
                        (None, 0xd800..=0xdbff) => {
                            high_surrogate = Some(value);
                            None
                        }
                        (Some(high), 0xdc00..=0xdfff) => {
                            char::from_u32(0x10000 + ((high - 0xd800) << 10) + (value - 0xdc00))
                        }
                        (_, value) => char::from_u32(value),
                    };
                    if let Some(c) = decoded {
                        push_char(c, &mut raw, &mut raw_len);
                    }
                    Escape::None
                }
            }
        };
    }
    // Partial escapes and UTF-8 sequences are dropped.
    utf8.feed(&raw[..raw_len], &mut emit)?;
    Ok(false)
}

impl<W: JsonSink> JsonEncoder<W> {
    /// Copies the JSON document in `path` as one element.
    ///
    /// A document cut short is copied up to its last complete value, with its open containers
    /// closed; an empty file becomes `null`.
    pub fn add_json_file(&mut self, key: Option<&str>, path: &CStr) -> Result<(), EncodeError> {
        let file = RawFile::open_read(path)?;
        let mut storage = [0u8; 4096];
        let mut reader = BufferedReader::new(file, &mut storage);
        let mut copier = Copier {
            encoder: self,
            stack: [false; MAX_CONTAINER_DEPTH],
            depth: 0,
            expect: Expect::Value,
            key: FixedString::from_str_truncated(key.unwrap_or_default()),
            has_key: key.is_some(),
            emitted_any: false,
        };
        let result = copier.run(&mut reader);
        let closed = copier.close_all();
        let emitted_any = copier.emitted_any;
        result?;
        closed?;
        if !emitted_any {
            self.add_null(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::ffi::CString;

    fn copy(content: &str) -> Value {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, content.as_bytes()).unwrap();
        let path = CString::new(file.path().to_str().unwrap()).unwrap();

        let mut encoder = JsonEncoder::new(Vec::new());
        encoder.begin_object(None).unwrap();
        encoder.add_json_file(Some("copy"), &path).unwrap();
        encoder.end_encode().unwrap();
        let bytes = encoder.into_sink();
        let value: Value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|e| panic!("{e}: {}", String::from_utf8_lossy(&bytes)));
        value["copy"].clone()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_complete_document() {
        let document = json!({
            "report": {"id": "abc", "version": "3.2.0"},
            "numbers": [0, -7, 18446744073709551615u64, 1.5, 2e-9],
            "flags": [true, false, null],
            "text": "tab\there \"quoted\" \\ é \u{1F600}",
            "empty": {},
            "nested": [[], [{}]],
        });
        assert_eq!(copy(&document.to_string()), document);
        assert_eq!(copy(&serde_json::to_string_pretty(&document).unwrap()), document);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_escaped_unicode() {
        assert_eq!(
            copy(r#"["\u00e9\ud83d\ude00\n\/"]"#),
            json!(["é\u{1F600}\n/"])
        );
        // A lone high surrogate has no character and is dropped.
        assert_eq!(copy(r#"["a\ud83db"]"#), json!(["ab"]));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_truncated_documents() {
        assert_eq!(copy(r#"{"a": 1, "b": [1, 2"#), json!({"a": 1, "b": [1]}));
        assert_eq!(copy(r#"{"a": 1, "b""#), json!({"a": 1}));
        assert_eq!(copy(r#"{"a": 1, "b": "cut"#), json!({"a": 1, "b": "cut"}));
        assert_eq!(copy(r#"{"a": "x\u00"#), json!({"a": "x"}));
        assert_eq!(copy(r#"{"a": {"b": tr"#), json!({"a": {}}));
        assert_eq!(copy(""), Value::Null);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_syntax_error_stops_copy() {
        assert_eq!(copy(r#"{"a": 1, "b": 2 "c": 3}"#), json!({"a": 1, "b": 2}));
        assert_eq!(copy(r#"[1, oops]"#), json!([1]));
    }
}
