// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The record describing one captured event.
//!
//! A [`MonitorContext`] is built on the stack of the firing monitor, enriched by every enabled
//! monitor, handed to the event callback and dropped when handling returns. Everything it holds
//! is either inline or borrowed from the firing monitor's frame, so building it never allocates.

use super::app_state::AppStateCounters;
use super::system::SystemInfo;
use super::MonitorType;
use crate::machine_context::MachineContext;
use crate::shared::constants::MAX_CAPTURED_TEXT;
use crate::shared::fixed_string::FixedString;
use crate::stack_cursor::StackCursor;
use std::ffi::CStr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use uuid::Uuid;

/// An event id generated ahead of time, so the crash path never touches the random source.
#[derive(Debug)]
pub(crate) struct EventIdSlot {
    high: AtomicU64,
    low: AtomicU64,
}

impl EventIdSlot {
    pub(crate) const fn new() -> Self {
        Self {
            high: AtomicU64::new(0),
            low: AtomicU64::new(0),
        }
    }

    pub(crate) fn regenerate(&self) {
        let id = Uuid::new_v4().as_u128();
        self.high.store((id >> 64) as u64, SeqCst);
        self.low.store(id as u64, SeqCst);
    }

    pub(crate) fn get(&self) -> Uuid {
        let high = self.high.load(SeqCst) as u128;
        let low = self.low.load(SeqCst) as u128;
        Uuid::from_u128((high << 64) | low)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalInfo {
    pub signum: libc::c_int,
    pub sigcode: libc::c_int,
}

/// Kernel exception triple. Only present when the event came from the kernel exception monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelExceptionInfo {
    pub exception_type: i64,
    pub code: i64,
    pub subcode: i64,
}

/// Details specific to the monitor that fired.
#[derive(Debug, Clone, Copy, Default)]
pub enum CrashDetails<'a> {
    #[default]
    None,
    LanguageException {
        name: &'a str,
    },
    ManagedException {
        name: &'a str,
        user_info: Option<&'a str>,
    },
    UserReported {
        name: &'a str,
        language: Option<&'a str>,
        line_of_code: Option<&'a str>,
        /// Well-formed JSON text.
        custom_stack_trace: Option<&'a str>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub size: u64,
    pub usable: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSnapshot {
    pub info: Option<&'static SystemInfo>,
    pub memory: MemoryInfo,
}

/// The last exception object freed before the event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZombieException {
    pub address: usize,
    pub name: FixedString<128>,
    pub reason: FixedString<MAX_CAPTURED_TEXT>,
}

#[derive(Debug, Clone)]
pub struct MonitorContext<'a> {
    pub event_id: Uuid,
    /// The single monitor that fired.
    pub crash_type: MonitorType,
    /// False only for reports that let the process continue.
    pub fatal: bool,
    pub offending_machine_context: Option<&'a MachineContext>,
    pub stack_cursor: Option<&'a StackCursor<'a>>,
    pub registers_are_valid: bool,
    pub fault_address: usize,
    pub crash_reason: Option<&'a str>,
    pub signal: SignalInfo,
    pub kernel_exception: KernelExceptionInfo,
    pub details: CrashDetails<'a>,
    pub system: SystemSnapshot,
    pub app_state: AppStateCounters,
    pub zombie_exception: Option<ZombieException>,
    pub console_log_path: Option<&'a CStr>,
    pub requires_async_safety: bool,
    pub crashed_during_crash_handling: bool,
}

impl<'a> MonitorContext<'a> {
    pub fn new(crash_type: MonitorType, event_id: Uuid) -> Self {
        Self {
            event_id,
            crash_type,
            fatal: true,
            offending_machine_context: None,
            stack_cursor: None,
            registers_are_valid: false,
            fault_address: 0,
            crash_reason: None,
            signal: SignalInfo::default(),
            kernel_exception: KernelExceptionInfo::default(),
            details: CrashDetails::None,
            system: SystemSnapshot::default(),
            app_state: AppStateCounters::default(),
            zombie_exception: None,
            console_log_path: None,
            requires_async_safety: false,
            crashed_during_crash_handling: false,
        }
    }

    /// The `crash.error.type` string of the firing monitor.
    ///
    /// Informational monitors never fire events of their own and have none.
    pub fn crash_type_name(&self) -> Option<&'static str> {
        const TYPES: [(MonitorType, &str); 6] = [
            (MonitorType::KERNEL_EXCEPTION, "mach"),
            (MonitorType::SIGNAL, "signal"),
            (MonitorType::LANGUAGE_EXCEPTION, "cpp_exception"),
            (MonitorType::MANAGED_EXCEPTION, "nsexception"),
            (MonitorType::MAIN_THREAD_DEADLOCK, "deadlock"),
            (MonitorType::USER_REPORTED, "user"),
        ];
        TYPES
            .iter()
            .find(|(flag, _)| *flag == self.crash_type)
            .map(|(_, name)| *name)
    }

    /// Whether the event was reported explicitly rather than caught.
    pub fn is_user_reported(&self) -> bool {
        self.crash_type == MonitorType::USER_REPORTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_type_names() {
        let id = Uuid::nil();
        let name = |kind| MonitorContext::new(kind, id).crash_type_name();
        assert_eq!(name(MonitorType::SIGNAL), Some("signal"));
        assert_eq!(name(MonitorType::LANGUAGE_EXCEPTION), Some("cpp_exception"));
        assert_eq!(name(MonitorType::MANAGED_EXCEPTION), Some("nsexception"));
        assert_eq!(name(MonitorType::USER_REPORTED), Some("user"));
        assert_eq!(name(MonitorType::SYSTEM), None);
        assert_eq!(name(MonitorType::ZOMBIE), None);
    }

    #[test]
    fn test_event_id_slot() {
        let slot = EventIdSlot::new();
        assert!(slot.get().is_nil());
        slot.regenerate();
        let first = slot.get();
        assert_eq!(first.get_version_num(), 4);
        assert_eq!(slot.get(), first);
        slot.regenerate();
        assert_ne!(slot.get(), first);
    }
}
