// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash reports: the JSON encoder they are written with, the writer that lays them out and the
//! fixup applied when they are read back.
//!
//! The settings in this module are read by the writer from inside a crash handler. As with the
//! other crash-path state, they live behind atomic pointers rather than locks.

pub(crate) mod fields;
pub mod fixup;
pub mod json;
mod json_copy;

#[cfg(target_os = "linux")]
pub mod introspection;
#[cfg(target_os = "linux")]
mod writer;

#[cfg(target_os = "linux")]
pub use writer::{write_recrash_report, write_standard_report};

use crate::shared::configuration::StacktraceCollection;
use json::{BufferedFdWriter, JsonEncoder};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};

/// The encoder reports are written with.
pub type ReportEncoder = JsonEncoder<BufferedFdWriter>;

/// Adds application fields to the `user` section of a report. Called from the crash path, with
/// the `user` object open: it may only append elements to it.
pub type UserSectionCallback = fn(&mut ReportEncoder);

/// User info JSON, checked when it is set so the crash path never parses it.
#[derive(Debug)]
pub(crate) struct UserInfo {
    pub json: String,
    /// Why `json` is not well-formed.
    pub error: Option<String>,
}

// These should always be either: null_mut, or `Box::into_raw()`.
static USER_INFO: AtomicPtr<UserInfo> = AtomicPtr::new(ptr::null_mut());
static DO_NOT_INTROSPECT: AtomicPtr<Vec<String>> = AtomicPtr::new(ptr::null_mut());
static USER_SECTION_CALLBACK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static INTROSPECT_MEMORY: AtomicBool = AtomicBool::new(true);
static WRITE_BACKTRACES: AtomicBool = AtomicBool::new(true);
static SYMBOLICATE: AtomicBool = AtomicBool::new(true);

fn swap_boxed<T>(slot: &AtomicPtr<T>, value: Option<T>) {
    let new = value.map_or(ptr::null_mut(), |v| Box::into_raw(Box::new(v)));
    let old = slot.swap(new, SeqCst);
    if !old.is_null() {
        // SAFETY: This can only come from a box above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Sets the JSON object written as the `user` section of every report, or clears it.
///
/// Anything but a well-formed object is kept as is: the report then carries the error and the
/// raw text instead.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn set_user_info_json(json: Option<&str>) {
    let info = json.map(|json| UserInfo {
        json: json.to_string(),
        error: match serde_json::from_str::<serde::de::IgnoredAny>(json) {
            Err(e) => Some(e.to_string()),
            // More fields are appended to the section, so it has to stay an object.
            Ok(_) if !json.trim_start().starts_with('{') => Some("not an object".to_string()),
            Ok(_) => None,
        },
    });
    if let Some(error) = info.as_ref().and_then(|info| info.error.as_deref()) {
        tracing::warn!("User info is not valid JSON: {error}");
    }
    swap_boxed(&USER_INFO, info);
}

/// Type names whose contents are never written, only their class.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn set_do_not_introspect_types(types: &[String]) {
    swap_boxed(&DO_NOT_INTROSPECT, (!types.is_empty()).then(|| types.to_vec()));
}

/// Whether memory referenced from registers and the stack is described in reports.
pub fn set_introspect_memory(introspect: bool) {
    INTROSPECT_MEMORY.store(introspect, SeqCst);
}

/// How frames are written: not at all, as bare addresses, or with image and symbol names.
pub fn set_stacktrace_collection(collection: StacktraceCollection) {
    WRITE_BACKTRACES.store(collection != StacktraceCollection::Disabled, SeqCst);
    SYMBOLICATE.store(
        collection == StacktraceCollection::EnabledWithInprocessSymbols,
        SeqCst,
    );
}

pub fn set_user_section_callback(callback: Option<UserSectionCallback>) {
    let raw = callback.map_or(ptr::null_mut(), |f| f as *mut ());
    USER_SECTION_CALLBACK.store(raw, SeqCst);
}

pub(crate) fn user_info() -> Option<&'static UserInfo> {
    // SAFETY: non-null pointers come from `swap_boxed`, and the box is only freed by a later
    // setter, which must not run concurrently with a crash.
    unsafe { USER_INFO.load(SeqCst).as_ref() }
}

pub(crate) fn do_not_introspect_types() -> &'static [String] {
    // SAFETY: as for `user_info`.
    unsafe { DO_NOT_INTROSPECT.load(SeqCst).as_ref() }.map_or(&[], Vec::as_slice)
}

pub(crate) fn introspect_memory() -> bool {
    INTROSPECT_MEMORY.load(SeqCst)
}

pub(crate) fn write_backtraces() -> bool {
    WRITE_BACKTRACES.load(SeqCst)
}

pub(crate) fn symbolicate() -> bool {
    SYMBOLICATE.load(SeqCst)
}

pub(crate) fn user_section_callback() -> Option<UserSectionCallback> {
    let raw = USER_SECTION_CALLBACK.load(SeqCst);
    if raw.is_null() {
        return None;
    }
    // SAFETY: only `set_user_section_callback` stores into this slot, always from a
    // `UserSectionCallback`.
    Some(unsafe { std::mem::transmute::<*mut (), UserSectionCallback>(raw) })
}
