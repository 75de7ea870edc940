// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Errors reported explicitly by the application, written as `user` events.

use super::dispatch::dispatcher;
use super::{CrashDetails, Monitor, MonitorContext, MonitorType};
use crate::machine_context::{current_thread, MachineContext, SuspendedEnvironment};
use crate::shared::log::{crash_debug, crash_warn};
use crate::stack_cursor::StackCursor;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use uuid::Uuid;

pub(crate) struct UserReportedMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: UserReportedMonitor = UserReportedMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for UserReportedMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::USER_REPORTED
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

/// A user-reported error.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserException<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
    /// Language the error was raised in, for errors coming from an embedded interpreter.
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    /// Stack trace as JSON text, written verbatim into the report.
    pub stack_trace: Option<&'a str>,
}

/// Writes a report for `exception`.
///
/// With `log_all_threads`, every other thread is suspended while the report is written so their
/// stacks can be recorded too. With `terminate_program` the event is fatal: monitoring stops and
/// the process aborts once the report is on disk. Otherwise a new report is written on every
/// call and monitoring carries on.
///
/// Does nothing when the user-reported monitor is disabled.
pub fn report_user_exception(
    exception: &UserException<'_>,
    log_all_threads: bool,
    terminate_program: bool,
) {
    if !MONITOR.is_enabled() {
        crash_warn!(
            "User-reported exception monitor is not enabled. Exception {} not recorded.",
            exception.name
        );
        return;
    }
    {
        let _suspended = SuspendedEnvironment::new_if(log_all_threads);
        let dispatcher = dispatcher();
        if terminate_program {
            dispatcher.notify_fatal_exception_captured(false);
        }

        let mut machine_context = MachineContext::new();
        machine_context.get_context_for_thread(current_thread(), true);
        let cursor = StackCursor::with_self_thread(0);

        crash_debug!("Filling out context");
        let mut context = MonitorContext::new(MonitorType::USER_REPORTED, Uuid::new_v4());
        context.fatal = terminate_program;
        context.offending_machine_context = Some(&machine_context);
        context.stack_cursor = Some(&cursor);
        context.crash_reason = exception.reason;
        context.details = CrashDetails::UserReported {
            name: exception.name,
            language: exception.language,
            line_of_code: exception.line_of_code,
            custom_stack_trace: exception.stack_trace,
        };
        dispatcher.handle_exception(&mut context);
    }
    if terminate_program {
        crash_debug!("Calling abort()");
        // SAFETY: no preconditions.
        unsafe { libc::abort() };
    }
}
