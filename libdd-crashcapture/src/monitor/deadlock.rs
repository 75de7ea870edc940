// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watchdog on the monitored thread.
//!
//! A dedicated thread wakes up every watchdog interval. Each wakeup arms a flag that the
//! monitored thread clears by calling [`notify_main_thread_alive`]; finding the flag still armed
//! on the next wakeup means the monitored thread made no progress for a whole interval, and a
//! fatal `deadlock` event is raised on its behalf.

use super::context::EventIdSlot;
use super::dispatch::dispatcher;
use super::{Monitor, MonitorContext, MonitorType};
use crate::machine_context::{
    add_reserved_thread, current_thread, remove_reserved_thread, MachineContext,
    SuspendedEnvironment,
};
use crate::shared::constants::STACK_OVERFLOW_THRESHOLD;
use crate::shared::log::{crash_debug, crash_error, crash_info};
use crate::stack_cursor::StackCursor;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64};
use std::time::Duration;

pub const DEADLOCK_REASON: &str = "Main thread deadlocked";

pub(crate) struct DeadlockMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: DeadlockMonitor = DeadlockMonitor {
    enabled: AtomicBool::new(false),
};

static EVENT_ID: EventIdSlot = EventIdSlot::new();
static INTERVAL_NANOS: AtomicU64 = AtomicU64::new(0);
static MONITORED_THREAD: AtomicI32 = AtomicI32::new(0);
static AWAITING_RESPONSE: AtomicBool = AtomicBool::new(false);
static WATCHDOG_RUNNING: AtomicBool = AtomicBool::new(false);

/// Sets the watchdog period. Zero keeps the watchdog from starting.
pub fn set_watchdog_interval(interval: Duration) {
    INTERVAL_NANOS.store(interval.as_nanos() as u64, SeqCst);
}

/// Chooses the thread the watchdog expects to hear from.
pub fn set_monitored_thread(tid: libc::pid_t) {
    MONITORED_THREAD.store(tid, SeqCst);
}

/// Proof of life from the monitored thread. Call it at least once per watchdog interval.
pub fn notify_main_thread_alive() {
    AWAITING_RESPONSE.store(false, SeqCst);
}

impl Monitor for DeadlockMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MAIN_THREAD_DEADLOCK
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        self.enabled.store(enabled, SeqCst);
        if enabled {
            EVENT_ID.regenerate();
            start_watchdog();
        }
        // A running watchdog notices on its next wakeup and exits.
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

fn start_watchdog() {
    let interval = Duration::from_nanos(INTERVAL_NANOS.load(SeqCst));
    if interval.is_zero() {
        crash_debug!("Deadlock watchdog interval is zero, not starting it");
        return;
    }
    if WATCHDOG_RUNNING.swap(true, SeqCst) {
        return;
    }
    if MONITORED_THREAD.load(SeqCst) == 0 {
        set_monitored_thread(current_thread());
    }
    AWAITING_RESPONSE.store(false, SeqCst);
    let spawned = std::thread::Builder::new()
        .name("crashcapture-deadlock-watchdog".to_string())
        .spawn(move || watchdog_loop(interval));
    if let Err(e) = spawned {
        crash_error!("Failed to start the deadlock watchdog: {e}");
        WATCHDOG_RUNNING.store(false, SeqCst);
    }
}

fn watchdog_loop(interval: Duration) {
    let tid = current_thread();
    // Never suspended, so it can keep writing the report of another event.
    add_reserved_thread(tid);
    loop {
        std::thread::sleep(interval);
        if !MONITOR.is_enabled() {
            break;
        }
        if AWAITING_RESPONSE.swap(true, SeqCst) {
            handle_deadlock();
            break;
        }
    }
    remove_reserved_thread(tid);
    WATCHDOG_RUNNING.store(false, SeqCst);
    crash_debug!("Deadlock watchdog stopped");
}

fn handle_deadlock() {
    crash_info!("Main thread deadlocked, writing a report");
    {
        let _suspended = SuspendedEnvironment::new();
        let dispatcher = dispatcher();
        dispatcher.notify_fatal_exception_captured(false);

        let mut machine_context = MachineContext::new();
        machine_context.get_context_for_thread(MONITORED_THREAD.load(SeqCst), true);
        let cursor = StackCursor::with_machine_context(&machine_context, STACK_OVERFLOW_THRESHOLD);

        let mut context = MonitorContext::new(MonitorType::MAIN_THREAD_DEADLOCK, EVENT_ID.get());
        context.offending_machine_context = Some(&machine_context);
        context.stack_cursor = Some(&cursor);
        context.registers_are_valid = machine_context.registers().is_some();
        context.crash_reason = Some(DEADLOCK_REASON);
        dispatcher.handle_exception(&mut context);
    }
    crash_debug!("Calling abort()");
    // SAFETY: no preconditions.
    unsafe { libc::abort() };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_does_not_start() {
        set_watchdog_interval(Duration::ZERO);
        start_watchdog();
        assert!(!WATCHDOG_RUNNING.load(SeqCst));
    }

    #[test]
    fn test_alive_clears_the_flag() {
        AWAITING_RESPONSE.store(true, SeqCst);
        notify_main_thread_alive();
        assert!(!AWAITING_RESPONSE.load(SeqCst));
    }
}
