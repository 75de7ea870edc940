// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rust panics.
//!
//! When panics abort, a panic is always fatal and is reported as a `cpp_exception` event from
//! the hook. When panics unwind, the hook cannot know whether the panic will be caught, so it
//! only records the panic message. If the same thread then dies from `SIGABRT` (a panic while
//! unwinding, or an explicit abort after catching), the signal report carries that message as
//! its reason. Caught panics leave every monitor armed.
//!
//! The hook is registered once, on first enable, and chains to the hook that was in place
//! before. Disabling only turns the hook into a pass-through: replacing a panic hook is not
//! allowed while panicking, which is exactly when the dispatcher disables monitors.

use super::context::EventIdSlot;
use super::dispatch::dispatcher;
use super::{CrashDetails, Monitor, MonitorContext, MonitorType};
use crate::machine_context::{current_thread, MachineContext, SuspendedEnvironment};
use crate::shared::constants::MAX_CAPTURED_TEXT;
use crate::shared::fixed_string::FixedString;
use crate::shared::log::crash_debug;
use crate::stack_cursor::StackCursor;
use std::fmt::Write;
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};

/// Exception name written for every panic.
pub const PANIC_EXCEPTION_NAME: &str = "panic";

pub(crate) struct PanicMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: PanicMonitor = PanicMonitor {
    enabled: AtomicBool::new(false),
};

static EVENT_ID: EventIdSlot = EventIdSlot::new();

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());
static HOOK_REGISTERED: AtomicBool = AtomicBool::new(false);

struct PendingPanic {
    thread: libc::pid_t,
    message: String,
}

/// The last panic that unwound. The crash path takes it and never frees it.
static PENDING_PANIC: AtomicPtr<PendingPanic> = AtomicPtr::new(ptr::null_mut());

impl Monitor for PanicMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::LANGUAGE_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        if enabled {
            EVENT_ID.regenerate();
            register_panic_hook();
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

/// Registers the panic hook and keeps the previous one for chaining.
///
/// Only the first call does anything.
fn register_panic_hook() {
    if HOOK_REGISTERED.swap(true, SeqCst) {
        return;
    }
    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.store(old_hook_ptr, SeqCst);
    panic::set_hook(Box::new(|panic_info| {
        if MONITOR.is_enabled() {
            if cfg!(panic = "abort") {
                capture(panic_info);
            } else {
                record_pending_panic(panic_info);
            }
        }
        call_previous_panic_hook(panic_info);
    }));
}

/// Call the previous panic hook.
fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // Safety: This pointer can only come from Box::into_raw above in register_panic_hook.
        // We borrow it here without taking ownership so it remains valid for future calls.
        unsafe {
            let old_hook = &*old_hook_ptr;
            old_hook(panic_info);
        }
    }
}

/// Formats the payload and location of a panic, e.g. `boom at src/main.rs:3:5`.
fn describe_panic(panic_info: &PanicHookInfo<'_>, out: &mut FixedString<MAX_CAPTURED_TEXT>) {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&str>() {
        out.push_str(s);
    } else if let Some(s) = payload.downcast_ref::<String>() {
        out.push_str(s);
    } else {
        out.push_str("Box<dyn Any>");
    }
    if let Some(location) = panic_info.location() {
        let _ = write!(
            out,
            " at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
}

fn record_pending_panic(panic_info: &PanicHookInfo<'_>) {
    let mut message = FixedString::<MAX_CAPTURED_TEXT>::new();
    describe_panic(panic_info, &mut message);
    store_pending_panic(current_thread(), message.as_str());
}

fn store_pending_panic(thread: libc::pid_t, message: &str) {
    let pending = Box::new(PendingPanic {
        thread,
        message: message.to_string(),
    });
    let old = PENDING_PANIC.swap(Box::into_raw(pending), SeqCst);
    if !old.is_null() {
        // SAFETY: the pointer came from Box::into_raw above, and the swap made it ours.
        drop(unsafe { Box::from_raw(old) });
    }
}

/// The message of the last panic, if it happened on `thread`.
///
/// Does not allocate or free, so it can be called from the crash path. The record is consumed
/// whichever thread it belongs to.
pub(crate) fn take_pending_panic(thread: libc::pid_t) -> Option<&'static str> {
    let pending = PENDING_PANIC.swap(ptr::null_mut(), SeqCst);
    if pending.is_null() {
        return None;
    }
    // SAFETY: the pointer came from Box::into_raw in store_pending_panic and is leaked here.
    let pending: &'static PendingPanic = unsafe { &*pending };
    (pending.thread == thread).then_some(pending.message.as_str())
}

#[inline(never)]
fn capture(panic_info: &PanicHookInfo<'_>) {
    crash_debug!("Trapped a panic");
    let _suspended = SuspendedEnvironment::new();
    let dispatcher = dispatcher();
    dispatcher.notify_fatal_exception_captured(false);

    let mut reason = FixedString::<MAX_CAPTURED_TEXT>::new();
    describe_panic(panic_info, &mut reason);

    let mut machine_context = MachineContext::new();
    machine_context.get_context_for_thread(current_thread(), true);
    // Drops `capture` and the hook closure.
    let cursor = StackCursor::with_self_thread(2);

    let mut context = MonitorContext::new(MonitorType::LANGUAGE_EXCEPTION, EVENT_ID.get());
    context.offending_machine_context = Some(&machine_context);
    context.stack_cursor = Some(&cursor);
    context.crash_reason = Some(reason.as_str());
    context.details = CrashDetails::LanguageException {
        name: PANIC_EXCEPTION_NAME,
    };
    dispatcher.handle_exception(&mut context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_describe_panic() {
        let seen = Arc::new(Mutex::new(String::new()));
        let hook_seen = seen.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut out = FixedString::<MAX_CAPTURED_TEXT>::new();
            describe_panic(info, &mut out);
            // Other tests may panic concurrently.
            if out.as_str().starts_with("boom") {
                if let Ok(mut seen) = hook_seen.lock() {
                    *seen = out.as_str().to_string();
                }
            }
        }));
        let result = std::thread::spawn(|| panic!("boom {}", 42)).join();
        panic::set_hook(previous);

        assert!(result.is_err());
        let seen = seen.lock().unwrap();
        assert!(seen.starts_with("boom 42 at "), "{seen}");
        assert!(seen.contains("panic.rs"), "{seen}");
    }

    #[test]
    fn test_pending_panic_is_taken_once_by_its_thread() {
        let thread = current_thread();
        store_pending_panic(thread, "first");
        store_pending_panic(thread, "second at src/lib.rs:1:1");
        assert_eq!(take_pending_panic(thread), Some("second at src/lib.rs:1:1"));
        assert_eq!(take_pending_panic(thread), None);

        store_pending_panic(thread + 1, "elsewhere");
        assert_eq!(take_pending_panic(thread), None);
        assert_eq!(take_pending_panic(thread + 1), None);
    }
}
