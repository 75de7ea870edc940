// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This crate implements an in-process crash capture: it detects fatal conditions, freezes the
//! process, snapshots every thread and writes a JSON report to disk before the process dies.
//!
//! Architecturally, it consists of three parts:
//! 1. Monitors, which detect one class of event each: fatal signals, Rust panics, exceptions
//!    reported by an embedding managed runtime, a deadlocked main thread, and errors reported
//!    explicitly by the application. Informational monitors (system, application state, freed
//!    objects) never fire but enrich every event. A dispatcher routes each event through all
//!    enabled monitors and then into a single callback.
//! 2. A machine context and stack cursor layer, which captures register state for every thread
//!    (other threads are parked with a real-time signal while the report is written) and walks
//!    their stacks by following frame pointers.
//! 3. A streaming report writer, which runs inside the crash handler. The handler runs under a
//!    constrained environment where many standard operations are illegal:
//!    https://man7.org/linux/man-pages/man7/signal-safety.7.html
//!    In particular memory allocation and locks are off limits, so the writer encodes JSON into
//!    a fixed buffer over a raw file descriptor and flushes after each section. If the writer
//!    itself crashes, a minimal "recrash" report embedding the partial one is written instead.
//!
//! Reports are read back through the report store, which formats timestamps and demangles
//! symbol names on the way out.
//!
//! Only Linux has a capture path. Elsewhere the crate provides the monitor flags, the JSON
//! encoder, the store and the fixup.
#![cfg(unix)]

#[cfg(target_os = "linux")]
mod api;
#[cfg(target_os = "linux")]
pub mod binary_images;
#[cfg(target_os = "linux")]
pub mod machine_context;
#[cfg(target_os = "linux")]
pub mod memory;
pub mod monitor;
pub mod report;
mod shared;
#[cfg(target_os = "linux")]
pub mod sig_info;
#[cfg(target_os = "linux")]
pub mod stack_cursor;
pub mod store;

#[cfg(target_os = "linux")]
pub use api::*;
pub use monitor::MonitorType;
pub use report::fixup::{fixup_report, fixup_report_text};
pub use report::{
    set_do_not_introspect_types, set_introspect_memory, set_stacktrace_collection,
    set_user_info_json, set_user_section_callback, ReportEncoder, UserSectionCallback,
};
pub use shared::configuration::{CrashCaptureConfiguration, StacktraceCollection};
pub use shared::fixed_string::FixedString;
pub use shared::log::{close_log_file, set_log_level, LogLevel};
pub use store::{ReportStore, StoreError};

#[cfg(target_os = "linux")]
pub use monitor::{
    app_state::{
        notify_app_active, notify_app_crash, notify_app_in_foreground, notify_app_terminate,
    },
    deadlock::notify_main_thread_alive,
    managed::report_managed_exception,
    user::{report_user_exception, UserException},
    zombie::{record_deallocation, record_exception_deallocation, TrackedType},
};
#[cfg(target_os = "linux")]
pub use report::introspection::{register_object_recognizers, MemoryWriter, ObjectRecognizer};
