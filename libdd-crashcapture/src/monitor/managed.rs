// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal exceptions raised by an embedding managed runtime, reported as `nsexception` events.
//!
//! The runtime calls [`report_managed_exception`] from its last-chance handler. The exception
//! is always fatal: once the report is written the process aborts.

use super::context::EventIdSlot;
use super::dispatch::dispatcher;
use super::{CrashDetails, Monitor, MonitorContext, MonitorType};
use crate::machine_context::{current_thread, MachineContext, SuspendedEnvironment};
use crate::shared::log::{crash_debug, crash_warn};
use crate::stack_cursor::StackCursor;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

pub(crate) struct ManagedExceptionMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: ManagedExceptionMonitor = ManagedExceptionMonitor {
    enabled: AtomicBool::new(false),
};

static EVENT_ID: EventIdSlot = EventIdSlot::new();

impl Monitor for ManagedExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MANAGED_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled && !self.enabled.load(SeqCst) {
            EVENT_ID.regenerate();
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

/// Records a fatal managed exception, then aborts.
///
/// `return_addresses` is the call stack the runtime captured when the exception was thrown,
/// innermost first. When it is empty the current thread's stack is used instead.
/// `user_info` is a free-form description of the exception's payload.
///
/// Returns without doing anything when the monitor is disabled.
pub fn report_managed_exception(
    name: &str,
    reason: &str,
    user_info: Option<&str>,
    return_addresses: &[usize],
) {
    if !MONITOR.is_enabled() {
        crash_warn!("Managed exception monitor is not enabled. Exception {name} not recorded.");
        return;
    }
    crash_debug!("Trapped managed exception {name}");
    {
        let _suspended = SuspendedEnvironment::new();
        let dispatcher = dispatcher();
        dispatcher.notify_fatal_exception_captured(false);

        let mut machine_context = MachineContext::new();
        machine_context.get_context_for_thread(current_thread(), true);
        let cursor = if return_addresses.is_empty() {
            StackCursor::with_self_thread(1)
        } else {
            StackCursor::with_backtrace(return_addresses, 0)
        };

        let mut context = MonitorContext::new(MonitorType::MANAGED_EXCEPTION, EVENT_ID.get());
        context.offending_machine_context = Some(&machine_context);
        context.stack_cursor = Some(&cursor);
        context.crash_reason = Some(reason);
        context.details = CrashDetails::ManagedException { name, user_info };
        dispatcher.handle_exception(&mut context);
    }
    crash_debug!("Calling abort()");
    // SAFETY: no preconditions.
    unsafe { libc::abort() };
}
