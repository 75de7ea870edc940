// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-processing of reports when they are read back.
//!
//! The crash path writes what it can without allocating: a raw `time(2)` value and symbol names
//! as the loader returns them. Readers get an RFC 3339 timestamp and demangled names instead.

use super::fields;
use chrono::{DateTime, SecondsFormat};
use serde_json::Value;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Fixes up the report in `text`, returning the new JSON text.
pub fn fixup_report_text(text: &str) -> serde_json::Result<String> {
    let mut report: Value = serde_json::from_str(text)?;
    fixup_report(&mut report);
    serde_json::to_string(&report)
}

pub fn fixup_report(report: &mut Value) {
    if let Some(info) = report.get_mut(fields::REPORT) {
        fixup_timestamp(info);
    }
    if let Some(crash) = report.get_mut(fields::CRASH) {
        if let Some(threads) = crash.get_mut(fields::THREADS).and_then(Value::as_array_mut) {
            threads.iter_mut().for_each(demangle_backtrace);
        }
        if let Some(thread) = crash.get_mut(fields::CRASHED_THREAD) {
            demangle_backtrace(thread);
        }
    }
    if let Some(recrash) = report.get_mut(fields::RECRASH_REPORT) {
        fixup_report(recrash);
    }
}

fn fixup_timestamp(info: &mut Value) {
    let Some(timestamp) = info.get_mut(fields::TIMESTAMP) else {
        return;
    };
    let Some(seconds) = timestamp.as_i64() else {
        return;
    };
    if let Some(time) = DateTime::from_timestamp(seconds, 0) {
        *timestamp = Value::String(time.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
}

fn demangle_backtrace(thread: &mut Value) {
    let Some(frames) = thread
        .get_mut(fields::BACKTRACE)
        .and_then(|backtrace| backtrace.get_mut(fields::CONTENTS))
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for frame in frames {
        let Some(symbol) = frame.get_mut(fields::SYMBOL_NAME) else {
            continue;
        };
        let Some(name) = symbol.as_str() else {
            continue;
        };
        let demangled = Name::from(name).demangle(DemangleOptions::name_only());
        if let Some(demangled) = demangled.filter(|d| d != name) {
            *symbol = Value::String(demangled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_and_symbols() {
        let mut report = json!({
            "report": {"id": "x", "timestamp": 1_700_000_000, "type": "standard"},
            "crash": {
                "threads": [
                    {"backtrace": {"contents": [
                        {"symbol_name": "_ZN4core9panicking5panic17h0123456789abcdefE"},
                        {"symbol_name": "_Z3fooi"},
                        {"symbol_name": "main"},
                        {"instruction_addr": 4096}
                    ]}},
                    {"index": 1}
                ]
            }
        });
        fixup_report(&mut report);
        assert_eq!(report["report"]["timestamp"], "2023-11-14T22:13:20Z");
        let frames = &report["crash"]["threads"][0]["backtrace"]["contents"];
        assert_eq!(frames[0]["symbol_name"], "core::panicking::panic");
        assert_eq!(frames[1]["symbol_name"], "foo");
        assert_eq!(frames[2]["symbol_name"], "main");
        assert_eq!(frames[3]["instruction_addr"], 4096);
    }

    #[test]
    fn test_recrash_report_is_fixed_up() -> anyhow::Result<()> {
        let text = json!({
            "recrash_report": {
                "report": {"timestamp": 0},
                "crash": {"threads": []}
            },
            "report": {"timestamp": 60, "type": "minimal"},
            "crash": {"crashed_thread": {"backtrace": {"contents": [{"symbol_name": "_Z3barv"}]}}}
        })
        .to_string();
        let fixed: Value = serde_json::from_str(&fixup_report_text(&text)?)?;
        assert_eq!(fixed["report"]["timestamp"], "1970-01-01T00:01:00Z");
        assert_eq!(fixed["recrash_report"]["report"]["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(
            fixed["crash"]["crashed_thread"]["backtrace"]["contents"][0]["symbol_name"],
            "bar"
        );
        Ok(())
    }

    #[test]
    fn test_already_fixed_report_is_unchanged() {
        let mut report = json!({"report": {"timestamp": "2023-11-14T22:13:20Z"}, "user": {}});
        let before = report.clone();
        fixup_report(&mut report);
        assert_eq!(report, before);
        assert!(fixup_report_text("{not json").is_err());
    }
}
