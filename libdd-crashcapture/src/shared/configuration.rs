// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::monitor::MonitorType;
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stacktrace collection occurs in the context of a crashing process.
/// If the stack is sufficiently corrupted, it is possible (but unlikely),
/// for stack trace collection itself to crash.
/// Symbol lookup goes through the dynamic loader, which takes a lock that a
/// suspended thread may hold; `WithoutSymbols` avoids that risk and leaves
/// symbolication to whoever reads the report.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StacktraceCollection {
    /// No backtraces are written.
    Disabled,
    WithoutSymbols,
    /// Resolves image and symbol names in process with `dladdr`.
    EnabledWithInprocessSymbols,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashCaptureConfiguration {
    // Embed the console log file under `debug.console_log`
    add_console_log_to_report: bool,
    app_version: Option<String>,
    create_alt_stack: bool,
    // Zero disables the watchdog even when the deadlock monitor is enabled
    deadlock_watchdog_interval: Duration,
    do_not_introspect_types: Vec<String>,
    introspect_memory: bool,
    max_report_count: usize,
    monitors: MonitorType,
    print_previous_log: bool,
    resolve_frames: StacktraceCollection,
    // Real-time signal used to park threads while a report is written; `None` picks one
    suspend_signal: Option<i32>,
    suspend_timeout: Duration,
    use_alt_stack: bool,
}

impl Default for CrashCaptureConfiguration {
    fn default() -> Self {
        Self {
            add_console_log_to_report: false,
            app_version: None,
            create_alt_stack: true,
            deadlock_watchdog_interval: Duration::ZERO,
            do_not_introspect_types: vec![],
            introspect_memory: true,
            max_report_count: constants::DEFAULT_MAX_REPORT_COUNT,
            monitors: MonitorType::PRODUCTION_SAFE_MINIMAL,
            print_previous_log: false,
            resolve_frames: StacktraceCollection::EnabledWithInprocessSymbols,
            suspend_signal: None,
            suspend_timeout: constants::DEFAULT_SUSPEND_TIMEOUT,
            use_alt_stack: true,
        }
    }
}

impl CrashCaptureConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitors: MonitorType,
        create_alt_stack: bool,
        use_alt_stack: bool,
        resolve_frames: StacktraceCollection,
        introspect_memory: bool,
        do_not_introspect_types: Vec<String>,
        max_report_count: usize,
        deadlock_watchdog_interval: Option<Duration>,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(max_report_count > 0, "max_report_count must be at least 1");
        Ok(Self {
            monitors,
            create_alt_stack,
            use_alt_stack,
            resolve_frames,
            introspect_memory,
            do_not_introspect_types,
            max_report_count,
            deadlock_watchdog_interval: deadlock_watchdog_interval.unwrap_or(Duration::ZERO),
            ..Default::default()
        })
    }

    pub fn add_console_log_to_report(&self) -> bool {
        self.add_console_log_to_report
    }

    pub fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn deadlock_watchdog_interval(&self) -> Duration {
        self.deadlock_watchdog_interval
    }

    pub fn do_not_introspect_types(&self) -> &[String] {
        &self.do_not_introspect_types
    }

    pub fn introspect_memory(&self) -> bool {
        self.introspect_memory
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count
    }

    pub fn monitors(&self) -> MonitorType {
        self.monitors
    }

    pub fn print_previous_log(&self) -> bool {
        self.print_previous_log
    }

    pub fn resolve_frames(&self) -> StacktraceCollection {
        self.resolve_frames
    }

    pub fn suspend_signal(&self) -> Option<i32> {
        self.suspend_signal
    }

    pub fn suspend_timeout(&self) -> Duration {
        self.suspend_timeout
    }

    pub fn set_add_console_log_to_report(&mut self, add: bool) {
        self.add_console_log_to_report = add;
    }

    pub fn set_app_version(&mut self, app_version: Option<String>) {
        self.app_version = app_version;
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_deadlock_watchdog_interval(&mut self, interval: Duration) {
        self.deadlock_watchdog_interval = interval;
    }

    pub fn set_do_not_introspect_types(&mut self, types: Vec<String>) {
        self.do_not_introspect_types = types;
    }

    pub fn set_introspect_memory(&mut self, introspect_memory: bool) {
        self.introspect_memory = introspect_memory;
    }

    pub fn set_max_report_count(&mut self, max_report_count: usize) -> anyhow::Result<()> {
        anyhow::ensure!(max_report_count > 0, "max_report_count must be at least 1");
        self.max_report_count = max_report_count;
        Ok(())
    }

    pub fn set_monitors(&mut self, monitors: MonitorType) {
        self.monitors = monitors;
    }

    pub fn set_print_previous_log(&mut self, print_previous_log: bool) {
        self.print_previous_log = print_previous_log;
    }

    pub fn set_resolve_frames(&mut self, resolve_frames: StacktraceCollection) {
        self.resolve_frames = resolve_frames;
    }

    /// Only real-time signals are accepted: regular signals may already carry meaning for the
    /// host process.
    #[cfg(target_os = "linux")]
    pub fn set_suspend_signal(&mut self, signum: Option<i32>) -> anyhow::Result<()> {
        if let Some(signum) = signum {
            anyhow::ensure!(
                (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&signum),
                "Suspend signal {signum} is not a real-time signal"
            );
        }
        self.suspend_signal = signum;
        Ok(())
    }

    pub fn set_suspend_timeout(&mut self, timeout: Duration) {
        self.suspend_timeout = timeout;
    }
}
