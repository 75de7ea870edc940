// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Descriptions of memory referenced from registers, the stack and exception reasons.
//!
//! An address is "notable" when it points at something recognizable: an object a registered
//! [`ObjectRecognizer`] knows, an object freed shortly before the crash, or a short
//! NUL-terminated UTF-8 string. Each top-level description gets a budget of
//! [`DEFAULT_MEMORY_SEARCH_DEPTH`] elements shared by everything it nests.

use super::fields::{self, memory_type};
use super::json::EncodeError;
use super::ReportEncoder;
use crate::machine_context::registers::REGISTER_NAMES;
use crate::machine_context::MachineContext;
use crate::memory::{copy_max_possible, read_usize};
use crate::monitor::zombie::zombie_type_name;
use crate::shared::constants::{
    DEFAULT_MEMORY_SEARCH_DEPTH, MIN_STRING_LENGTH, STACK_NOTABLE_SEARCH_BACK_DISTANCE,
    STACK_NOTABLE_SEARCH_FORWARD_DISTANCE, STRING_PROBE_LENGTH,
};
use crate::shared::fixed_string::FixedString;
use std::fmt::Write;
use std::sync::OnceLock;

/// Recognizes objects of a runtime the host application embeds.
///
/// Both methods run inside a crash handler: they must not allocate, lock or dereference
/// `address` directly. Read memory through [`crate::memory`].
pub trait ObjectRecognizer: Send + Sync {
    /// Type of the object at `address`, if it is one this recognizer knows.
    fn type_name(&self, address: usize) -> Option<&'static str>;

    /// Writes the fields of the object at `address` into the open object of `writer`.
    ///
    /// Nested references should go through [`MemoryWriter::write_memory_contents`], which keeps
    /// the description within its budget.
    fn write_contents(
        &self,
        address: usize,
        writer: &mut MemoryWriter<'_>,
    ) -> Result<(), EncodeError>;
}

static RECOGNIZERS: OnceLock<Vec<Box<dyn ObjectRecognizer>>> = OnceLock::new();

/// Registers the object recognizers consulted by every report. Only the first call has an
/// effect; it must happen before monitoring starts. Returns false if recognizers were already
/// registered.
pub fn register_object_recognizers(recognizers: Vec<Box<dyn ObjectRecognizer>>) -> bool {
    RECOGNIZERS.set(recognizers).is_ok()
}

/// What memory descriptions may look at.
#[derive(Clone, Copy)]
pub(crate) struct Introspection<'a> {
    recognizers: &'a [Box<dyn ObjectRecognizer>],
    /// Types written by class only.
    restricted: &'a [String],
}

impl Introspection<'static> {
    pub(crate) fn current() -> Self {
        Self {
            recognizers: RECOGNIZERS.get().map_or(&[], Vec::as_slice),
            restricted: super::do_not_introspect_types(),
        }
    }
}

impl<'a> Introspection<'a> {
    #[cfg(test)]
    pub(crate) fn new(
        recognizers: &'a [Box<dyn ObjectRecognizer>],
        restricted: &'a [String],
    ) -> Self {
        Self {
            recognizers,
            restricted,
        }
    }

    fn recognize(&self, address: usize) -> Option<(&'a dyn ObjectRecognizer, &'static str)> {
        if address == 0 {
            return None;
        }
        self.recognizers
            .iter()
            .find_map(|r| r.type_name(address).map(|name| (r.as_ref(), name)))
    }

    fn is_restricted(&self, type_name: &str) -> bool {
        self.restricted.iter().any(|t| t == type_name)
    }

    fn is_notable(&self, address: usize) -> bool {
        if address == 0 {
            return false;
        }
        let mut probe = [0u8; STRING_PROBE_LENGTH];
        zombie_type_name(address).is_some()
            || self.recognize(address).is_some()
            || read_string(address, &mut probe).is_some()
    }

    pub(crate) fn write_memory_contents_if_notable(
        &self,
        encoder: &mut ReportEncoder,
        key: &str,
        address: usize,
    ) -> Result<(), EncodeError> {
        if !self.is_notable(address) {
            return Ok(());
        }
        MemoryWriter::new(encoder, *self).write_memory_contents(Some(key), address)
    }

    /// Describes the memory at the first hexadecimal address found in `text`.
    pub(crate) fn write_address_referenced_by_string(
        &self,
        encoder: &mut ReportEncoder,
        key: &str,
        text: &str,
    ) -> Result<(), EncodeError> {
        match extract_hex_value(text) {
            Some(address) => MemoryWriter::new(encoder, *self)
                .write_memory_contents(Some(key), address as usize),
            None => Ok(()),
        }
    }

    /// Describes whatever notable memory the registers and the nearby stack point at.
    pub(crate) fn write_notable_addresses(
        &self,
        encoder: &mut ReportEncoder,
        key: &str,
        context: &MachineContext,
    ) -> Result<(), EncodeError> {
        encoder.begin_object(Some(key))?;
        if let Some(registers) = context.registers() {
            for (name, value) in REGISTER_NAMES.iter().zip(registers.basic()) {
                self.write_memory_contents_if_notable(encoder, name, *value as usize)?;
            }
            self.write_notable_stack_contents(encoder, context, registers.stack_pointer())?;
        }
        encoder.end_container()
    }

    fn write_notable_stack_contents(
        &self,
        encoder: &mut ReportEncoder,
        context: &MachineContext,
        stack_pointer: usize,
    ) -> Result<(), EncodeError> {
        if stack_pointer == 0 {
            return Ok(());
        }
        let word = std::mem::size_of::<usize>();
        let back = STACK_NOTABLE_SEARCH_BACK_DISTANCE * word;
        let forward = STACK_NOTABLE_SEARCH_FORWARD_DISTANCE * word;
        // "Back" is towards the stack base, "forward" is where the next push goes.
        let (low, high) = if context.stack_grow_direction() < 0 {
            (
                stack_pointer.saturating_sub(forward),
                stack_pointer.saturating_add(back),
            )
        } else {
            (
                stack_pointer.saturating_sub(back),
                stack_pointer.saturating_add(forward),
            )
        };
        let mut name = FixedString::<32>::new();
        for address in (low..high).step_by(word) {
            let Some(value) = read_usize(address) else {
                continue;
            };
            name.clear();
            let _ = write!(name, "stack@{address:#x}");
            self.write_memory_contents_if_notable(encoder, name.as_str(), value)?;
        }
        Ok(())
    }
}

/// Writes nested memory descriptions within a shared element budget.
pub struct MemoryWriter<'a> {
    encoder: &'a mut ReportEncoder,
    introspection: Introspection<'a>,
    remaining: i32,
}

impl<'a> MemoryWriter<'a> {
    fn new(encoder: &'a mut ReportEncoder, introspection: Introspection<'a>) -> Self {
        Self {
            encoder,
            introspection,
            remaining: DEFAULT_MEMORY_SEARCH_DEPTH,
        }
    }

    pub fn encoder(&mut self) -> &mut ReportEncoder {
        &mut *self.encoder
    }

    /// Elements left in the budget.
    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    /// Writes an object describing the memory at `address`.
    pub fn write_memory_contents(
        &mut self,
        key: Option<&str>,
        address: usize,
    ) -> Result<(), EncodeError> {
        self.remaining -= 1;
        self.encoder.begin_object(key)?;
        self.encoder.add_uint(Some(fields::ADDRESS), address as u64)?;
        if let Some(zombie) = zombie_type_name(address) {
            self.encoder
                .add_string(Some(fields::LAST_DEALLOCATED_OBJECT), zombie)?;
        }
        if let Some((recognizer, class)) = self.introspection.recognize(address) {
            self.encoder.add_string(Some(fields::TYPE), memory_type::OBJECT)?;
            self.encoder.add_string(Some(fields::CLASS), class)?;
            if !self.introspection.is_restricted(class) && self.remaining > 0 {
                recognizer.write_contents(address, self)?;
            }
        } else if address == 0 {
            self.encoder
                .add_string(Some(fields::TYPE), memory_type::NULL_POINTER)?;
        } else {
            let mut probe = [0u8; STRING_PROBE_LENGTH];
            match read_string(address, &mut probe) {
                Some(text) => {
                    self.encoder.add_string(Some(fields::TYPE), memory_type::STRING)?;
                    self.encoder.add_string(Some(fields::VALUE), text)?;
                }
                None => self.encoder.add_string(Some(fields::TYPE), memory_type::UNKNOWN)?,
            }
        }
        self.encoder.end_container()
    }
}

/// The NUL-terminated UTF-8 string at `address`, if there is one of a plausible length.
fn read_string(address: usize, probe: &mut [u8]) -> Option<&str> {
    let copied = copy_max_possible(address, probe);
    as_text(&probe[..copied])
}

/// Text up to the first NUL, when it is long enough, valid UTF-8 and free of control
/// characters other than whitespace.
fn as_text(bytes: &[u8]) -> Option<&str> {
    let end = bytes.iter().position(|&b| b == 0)?;
    if end < MIN_STRING_LENGTH {
        return None;
    }
    let text = std::str::from_utf8(&bytes[..end]).ok()?;
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .then_some(text)
}

/// The first `0x`-prefixed hexadecimal number in `text`.
pub(crate) fn extract_hex_value(text: &str) -> Option<u64> {
    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(at) = text[from..].find("0x").map(|i| i + from) {
        let digits = &bytes[at + 2..];
        let len = digits.iter().take_while(|b| b.is_ascii_hexdigit()).count();
        if len > 0 && len <= 16 {
            return u64::from_str_radix(&text[at + 2..at + 2 + len], 16).ok();
        }
        from = at + 2;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::json::{BufferedFdWriter, JsonEncoder};
    use serde_json::Value;
    use std::ffi::CString;

    fn write_with(
        introspection: Introspection<'_>,
        f: impl FnOnce(&Introspection<'_>, &mut ReportEncoder) -> Result<(), EncodeError>,
    ) -> Value {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        {
            let mut encoder = JsonEncoder::new(BufferedFdWriter::create(&c_path).unwrap());
            encoder.begin_object(None).unwrap();
            f(&introspection, &mut encoder).unwrap();
            encoder.end_encode().unwrap();
        }
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap()
    }

    struct Gizmo {
        address: usize,
        inner: usize,
    }

    impl ObjectRecognizer for Gizmo {
        fn type_name(&self, address: usize) -> Option<&'static str> {
            (address == self.address).then_some("Gizmo")
        }

        fn write_contents(
            &self,
            _address: usize,
            writer: &mut MemoryWriter<'_>,
        ) -> Result<(), EncodeError> {
            writer.write_memory_contents(Some("inner"), self.inner)
        }
    }

    #[test]
    fn test_as_text() {
        assert_eq!(as_text(b"hello\0junk"), Some("hello"));
        assert_eq!(as_text(b"abc\0"), None, "too short");
        assert_eq!(as_text(b"no terminator"), None);
        assert_eq!(as_text(b"\xff\xfe\xfd\xfc\0"), None);
        assert_eq!(as_text(b"ab\x07cd\0"), None);
        assert_eq!(as_text(b"line\n\0"), Some("line\n"));
    }

    #[test]
    fn test_extract_hex_value() {
        assert_eq!(
            extract_hex_value("object at 0x7f00dead0000 was released"),
            Some(0x7f00dead0000)
        );
        assert_eq!(extract_hex_value("0x 0x1f"), Some(0x1f));
        assert_eq!(extract_hex_value("no address here"), None);
        assert_eq!(extract_hex_value("0xg"), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_string_null_and_unknown() {
        let text = CString::new("connection refused").unwrap();
        let junk = [0xffu8; 64];
        let report = write_with(Introspection::new(&[], &[]), |i, encoder| {
            let mut writer = MemoryWriter::new(encoder, *i);
            writer.write_memory_contents(Some("text"), text.as_ptr() as usize)?;
            writer.write_memory_contents(Some("null"), 0)?;
            writer.write_memory_contents(Some("junk"), junk.as_ptr() as usize)
        });
        assert_eq!(report["text"]["type"], "string");
        assert_eq!(report["text"]["value"], "connection refused");
        assert_eq!(report["text"]["address"], text.as_ptr() as u64);
        assert_eq!(report["null"]["type"], "null_pointer");
        assert_eq!(report["junk"]["type"], "unknown");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_only_notable_addresses_are_written() {
        let text = CString::new("worth reporting").unwrap();
        let report = write_with(Introspection::new(&[], &[]), |i, encoder| {
            i.write_memory_contents_if_notable(encoder, "r1", text.as_ptr() as usize)?;
            i.write_memory_contents_if_notable(encoder, "r2", 0)?;
            i.write_memory_contents_if_notable(encoder, "r3", 0x10)
        });
        assert_eq!(report["r1"]["value"], "worth reporting");
        assert!(report.get("r2").is_none());
        assert!(report.get("r3").is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_recognized_objects_and_restrictions() {
        let text = CString::new("inner value").unwrap();
        let gizmo = [0u8; 16];
        let recognizers: Vec<Box<dyn ObjectRecognizer>> = vec![Box::new(Gizmo {
            address: gizmo.as_ptr() as usize,
            inner: text.as_ptr() as usize,
        })];

        let report = write_with(Introspection::new(&recognizers, &[]), |i, encoder| {
            i.write_memory_contents_if_notable(encoder, "obj", gizmo.as_ptr() as usize)
        });
        assert_eq!(report["obj"]["type"], "object");
        assert_eq!(report["obj"]["class"], "Gizmo");
        assert_eq!(report["obj"]["inner"]["value"], "inner value");

        let restricted = ["Gizmo".to_string()];
        let report = write_with(Introspection::new(&recognizers, &restricted), |i, encoder| {
            i.write_memory_contents_if_notable(encoder, "obj", gizmo.as_ptr() as usize)
        });
        assert_eq!(report["obj"]["class"], "Gizmo");
        assert!(report["obj"].get("inner").is_none());
    }

    /// An object that refers to itself must not recurse past the budget.
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_budget_stops_recursion() {
        let cell = [0u8; 8];
        let address = cell.as_ptr() as usize;
        let recognizers: Vec<Box<dyn ObjectRecognizer>> = vec![Box::new(Gizmo {
            address,
            inner: address,
        })];
        let report = write_with(Introspection::new(&recognizers, &[]), |i, encoder| {
            i.write_memory_contents_if_notable(encoder, "obj", address)
        });
        let mut depth = 0;
        let mut node = &report["obj"];
        while let Some(inner) = node.get("inner") {
            depth += 1;
            node = inner;
        }
        assert_eq!(depth, DEFAULT_MEMORY_SEARCH_DEPTH as usize - 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_address_referenced_by_string() {
        let text = CString::new("released object").unwrap();
        let reason = format!("*** message sent to freed {:#x}", text.as_ptr() as usize);
        let report = write_with(Introspection::new(&[], &[]), |i, encoder| {
            i.write_address_referenced_by_string(encoder, "referenced_object", &reason)?;
            i.write_address_referenced_by_string(encoder, "missing", "nothing")
        });
        assert_eq!(report["referenced_object"]["value"], "released object");
        assert!(report.get("missing").is_none());
    }
}
