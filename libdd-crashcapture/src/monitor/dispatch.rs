// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routes a captured event through every enabled monitor and into the event callback.
//!
//! The dispatcher owns the only cross-cutting mutable state of the capture path: the active
//! mask, the sticky async-safety requirement and the handling state. All of it lives in atomics
//! so it can be read and written from a signal handler. Writers follow a single-writer
//! discipline: enabling and disabling must not race with an event being handled.

use super::{Monitor, MonitorContext, MonitorType, REGISTRY};
use crate::shared::log::{crash_debug, crash_error, crash_info, crash_warn};
use crate::shared::raw_io::{BufferedReader, RawFile};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8};

/// Receives every event once all enabled monitors have enriched it.
pub type EventCallback = fn(&mut MonitorContext<'_>);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlingState {
    Idle = 0,
    /// A fatal event is being handled.
    Handling = 1,
    /// A second fatal event arrived while handling the first.
    Recrashed = 2,
}

impl HandlingState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HandlingState::Handling,
            2 => HandlingState::Recrashed,
            _ => HandlingState::Idle,
        }
    }
}

pub(crate) struct Dispatcher {
    monitors: &'static [&'static dyn Monitor],
    active: AtomicU32,
    state: AtomicU8,
    requires_async_safety: AtomicBool,
    callback: AtomicPtr<()>,
    is_being_traced: fn() -> bool,
}

impl Dispatcher {
    pub(crate) const fn new(
        monitors: &'static [&'static dyn Monitor],
        is_being_traced: fn() -> bool,
    ) -> Self {
        Self {
            monitors,
            active: AtomicU32::new(0),
            state: AtomicU8::new(HandlingState::Idle as u8),
            requires_async_safety: AtomicBool::new(false),
            callback: AtomicPtr::new(ptr::null_mut()),
            is_being_traced,
        }
    }

    pub(crate) fn set_event_callback(&self, callback: Option<EventCallback>) {
        let raw = callback.map_or(ptr::null_mut(), |f| f as *mut ());
        self.callback.store(raw, SeqCst);
    }

    fn event_callback(&self) -> Option<EventCallback> {
        let raw = self.callback.load(SeqCst);
        if raw.is_null() {
            return None;
        }
        // SAFETY: only `set_event_callback` stores into `callback`, always from an
        // `EventCallback`.
        Some(unsafe { std::mem::transmute::<*mut (), EventCallback>(raw) })
    }

    /// Enables exactly the registered monitors whose type is in `requested`, after narrowing it
    /// to what the environment permits. Returns the monitors that actually ended up enabled.
    pub(crate) fn set_active_monitors(&self, requested: MonitorType) -> MonitorType {
        let mut mask = requested;
        if mask.intersects(MonitorType::DEBUGGER_UNSAFE) && (self.is_being_traced)() {
            crash_warn!(
                "A debugger is attached: monitors {:#x} are disabled",
                (mask & MonitorType::DEBUGGER_UNSAFE).bits()
            );
            mask &= MonitorType::DEBUGGER_SAFE;
        }
        if mask.intersects(MonitorType::ASYNC_UNSAFE) && self.requires_async_safety.load(SeqCst) {
            crash_debug!(
                "Async-safe environment required: masking out {:#x}",
                (mask & MonitorType::ASYNC_UNSAFE).bits()
            );
            mask &= MonitorType::ASYNC_SAFE;
        }

        crash_debug!("Changing active monitors to {:#x}", mask.bits());
        let mut active = MonitorType::NONE;
        for monitor in self.monitors {
            monitor.set_enabled(mask.contains(monitor.monitor_type()));
            if monitor.is_enabled() {
                active |= monitor.monitor_type();
            }
        }
        self.active.store(active.bits(), SeqCst);
        active
    }

    pub(crate) fn active_monitors(&self) -> MonitorType {
        MonitorType::from_bits_truncate(self.active.load(SeqCst))
    }

    /// Called by a monitor as soon as it catches a fatal condition.
    ///
    /// Returns true when this is a second fatal event arriving while the first is still being
    /// handled; every monitor has then been disabled so the next fault goes to the default
    /// handler.
    pub(crate) fn notify_fatal_exception_captured(&self, is_async_safe_environment: bool) -> bool {
        if is_async_safe_environment {
            self.requires_async_safety.store(true, SeqCst);
        }
        let previous =
            HandlingState::from_u8(self.state.swap(HandlingState::Handling as u8, SeqCst));
        if previous == HandlingState::Idle {
            return false;
        }
        self.state.store(HandlingState::Recrashed as u8, SeqCst);
        crash_info!("Detected crash in the crash reporter. Uninstalling handlers.");
        self.set_active_monitors(MonitorType::NONE);
        true
    }

    /// Enriches `context` with every enabled monitor, then hands it to the event callback.
    pub(crate) fn handle_exception(&self, context: &mut MonitorContext<'_>) {
        context.requires_async_safety = self.requires_async_safety.load(SeqCst);
        if self.handling_state() == HandlingState::Recrashed {
            context.crashed_during_crash_handling = true;
        }
        for monitor in self.monitors {
            if monitor.is_enabled() {
                monitor.add_contextual_info(context);
            }
        }

        match self.event_callback() {
            Some(callback) => callback(context),
            None => crash_error!("No event callback registered, event {} dropped", context.event_id),
        }

        if context.is_user_reported() && !context.fatal {
            // Reporting keeps going after a non-terminating report.
            let _ = self.state.compare_exchange(
                HandlingState::Handling as u8,
                HandlingState::Idle as u8,
                SeqCst,
                SeqCst,
            );
        } else if self.handling_state() == HandlingState::Handling {
            crash_debug!("Exception is fatal. Restoring original handlers.");
            self.set_active_monitors(MonitorType::NONE);
        }
    }

    pub(crate) fn handling_state(&self) -> HandlingState {
        HandlingState::from_u8(self.state.load(SeqCst))
    }

    pub(crate) fn requires_async_safety(&self) -> bool {
        self.requires_async_safety.load(SeqCst)
    }
}

/// Whether a tracer (debugger, strace) is attached, from `TracerPid` in `/proc/self/status`.
pub(crate) fn is_being_traced() -> bool {
    const KEY: &[u8] = b"TracerPid:";
    let Ok(file) = RawFile::open_read(c"/proc/self/status") else {
        return false;
    };
    let mut storage = [0u8; 512];
    let mut reader = BufferedReader::new(file, &mut storage);
    let mut line = [0u8; 128];
    while let Some(text) = reader.read_until(b'\n', &mut line) {
        if let Some(value) = text.strip_prefix(KEY) {
            return value.iter().any(|b| b.is_ascii_digit() && *b != b'0');
        }
    }
    false
}

static DISPATCHER: Dispatcher = Dispatcher::new(&REGISTRY, is_being_traced);

pub(crate) fn dispatcher() -> &'static Dispatcher {
    &DISPATCHER
}

/// Enables the monitors in `monitors` that this platform and environment permit, and disables
/// every other one. Returns the monitors now active.
pub fn set_active_monitors(monitors: MonitorType) -> MonitorType {
    DISPATCHER.set_active_monitors(monitors)
}

pub fn active_monitors() -> MonitorType {
    DISPATCHER.active_monitors()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    struct FakeMonitor {
        kind: MonitorType,
        enabled: AtomicBool,
        /// Refuses to turn on, like a backend that failed to install.
        broken: bool,
        enrichments: AtomicUsize,
    }

    impl FakeMonitor {
        const fn new(kind: MonitorType, broken: bool) -> Self {
            Self {
                kind,
                enabled: AtomicBool::new(false),
                broken,
                enrichments: AtomicUsize::new(0),
            }
        }
    }

    impl Monitor for FakeMonitor {
        fn monitor_type(&self) -> MonitorType {
            self.kind
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled && !self.broken, SeqCst);
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(SeqCst)
        }

        fn add_contextual_info(&self, context: &mut MonitorContext<'_>) {
            self.enrichments.fetch_add(1, SeqCst);
            if self.kind == MonitorType::SYSTEM {
                context.fault_address = 0x51;
            } else if self.kind == MonitorType::APPLICATION_STATE {
                // Registered after SYSTEM: its write wins.
                context.fault_address = 0xa5;
            }
        }
    }

    // Each test gets its own monitors so tests can run in parallel.
    macro_rules! fake_registry {
        ($name:ident) => {
            static SIGNAL: FakeMonitor = FakeMonitor::new(MonitorType::SIGNAL, false);
            static PANIC: FakeMonitor = FakeMonitor::new(MonitorType::LANGUAGE_EXCEPTION, false);
            static USER: FakeMonitor = FakeMonitor::new(MonitorType::USER_REPORTED, false);
            static SYSTEM: FakeMonitor = FakeMonitor::new(MonitorType::SYSTEM, false);
            static APP_STATE: FakeMonitor =
                FakeMonitor::new(MonitorType::APPLICATION_STATE, false);
            static ZOMBIE: FakeMonitor = FakeMonitor::new(MonitorType::ZOMBIE, true);
            static $name: [&dyn Monitor; 6] =
                [&SIGNAL, &PANIC, &USER, &SYSTEM, &APP_STATE, &ZOMBIE];
        };
    }

    fn not_traced() -> bool {
        false
    }

    fn traced() -> bool {
        true
    }

    static CALLBACK_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_callback(context: &mut MonitorContext<'_>) {
        assert_ne!(context.fault_address, 0);
        CALLBACK_CALLS.fetch_add(1, SeqCst);
    }

    #[test]
    fn test_set_active_monitors_is_idempotent() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        for requested in [
            MonitorType::ALL,
            MonitorType::PRODUCTION_SAFE_MINIMAL,
            MonitorType::MANUAL,
            MonitorType::SIGNAL | MonitorType::ZOMBIE,
            MonitorType::NONE,
        ] {
            // KERNEL_EXCEPTION is not registered and ZOMBIE refuses to start.
            let allowed = MonitorType::SIGNAL
                | MonitorType::LANGUAGE_EXCEPTION
                | MonitorType::USER_REPORTED
                | MonitorType::SYSTEM
                | MonitorType::APPLICATION_STATE;
            let first = dispatcher.set_active_monitors(requested);
            assert_eq!(first, requested & allowed);
            assert_eq!(dispatcher.active_monitors(), first);
            assert_eq!(dispatcher.set_active_monitors(requested), first);
        }
    }

    #[test]
    fn test_debugger_masks_unsafe_monitors() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, traced);
        let active = dispatcher.set_active_monitors(MonitorType::ALL);
        assert!(!active.intersects(MonitorType::DEBUGGER_UNSAFE));
        assert!(active.contains(MonitorType::USER_REPORTED | MonitorType::SYSTEM));
    }

    #[test]
    fn test_async_safety_is_sticky() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        assert!(!dispatcher.notify_fatal_exception_captured(true));
        assert!(dispatcher.requires_async_safety());
        let active = dispatcher.set_active_monitors(MonitorType::ALL);
        assert_eq!(active, MonitorType::SIGNAL);

        // A later, non async-safe event does not lift the requirement.
        dispatcher.state.store(HandlingState::Idle as u8, SeqCst);
        assert!(!dispatcher.notify_fatal_exception_captured(false));
        assert!(dispatcher.requires_async_safety());
    }

    #[test]
    fn test_recrash_disables_everything() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        dispatcher.set_active_monitors(MonitorType::ALL);
        assert!(!dispatcher.notify_fatal_exception_captured(false));
        assert_eq!(dispatcher.handling_state(), HandlingState::Handling);
        assert!(dispatcher.notify_fatal_exception_captured(false));
        assert_eq!(dispatcher.handling_state(), HandlingState::Recrashed);
        assert_eq!(dispatcher.active_monitors(), MonitorType::NONE);

        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::new_v4());
        dispatcher.handle_exception(&mut context);
        assert!(context.crashed_during_crash_handling);
    }

    #[test]
    fn test_fatal_event_enriches_then_disables() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        dispatcher.set_event_callback(Some(count_callback));
        dispatcher.set_active_monitors(MonitorType::ALL);

        assert!(!dispatcher.notify_fatal_exception_captured(false));
        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::new_v4());
        let before = CALLBACK_CALLS.load(SeqCst);
        dispatcher.handle_exception(&mut context);

        assert!(CALLBACK_CALLS.load(SeqCst) > before);
        assert_eq!(context.fault_address, 0xa5);
        assert!(!context.crashed_during_crash_handling);
        assert_eq!(SIGNAL.enrichments.load(SeqCst), 1);
        assert_eq!(dispatcher.active_monitors(), MonitorType::NONE);
    }

    #[test]
    fn test_non_terminating_user_report_keeps_monitors() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        dispatcher.set_event_callback(Some(count_callback));
        let active = dispatcher.set_active_monitors(MonitorType::ALL);

        let mut context = MonitorContext::new(MonitorType::USER_REPORTED, Uuid::new_v4());
        context.fatal = false;
        dispatcher.handle_exception(&mut context);
        assert_eq!(dispatcher.active_monitors(), active);
        assert_eq!(dispatcher.handling_state(), HandlingState::Idle);
        // The zombie monitor never came up, so it never enriched anything.
        assert_eq!(ZOMBIE.enrichments.load(SeqCst), 0);
        assert_eq!(SYSTEM.enrichments.load(SeqCst), 1);

        // A later fatal event is still handled in full.
        assert!(!dispatcher.notify_fatal_exception_captured(false));
        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::new_v4());
        dispatcher.handle_exception(&mut context);
        assert!(!context.crashed_during_crash_handling);
        assert_eq!(dispatcher.active_monitors(), MonitorType::NONE);
    }

    #[test]
    fn test_terminating_user_report_disables_monitors() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        dispatcher.set_event_callback(Some(count_callback));
        dispatcher.set_active_monitors(MonitorType::ALL);

        assert!(!dispatcher.notify_fatal_exception_captured(false));
        let mut context = MonitorContext::new(MonitorType::USER_REPORTED, Uuid::new_v4());
        dispatcher.handle_exception(&mut context);
        assert_eq!(dispatcher.active_monitors(), MonitorType::NONE);
    }

    #[test]
    fn test_missing_callback_is_not_fatal() {
        fake_registry!(MONITORS);
        let dispatcher = Dispatcher::new(&MONITORS, not_traced);
        dispatcher.set_active_monitors(MonitorType::MANUAL);
        let mut context = MonitorContext::new(MonitorType::USER_REPORTED, Uuid::new_v4());
        context.fatal = false;
        dispatcher.handle_exception(&mut context);
        assert_eq!(context.fault_address, 0xa5);
    }
}
