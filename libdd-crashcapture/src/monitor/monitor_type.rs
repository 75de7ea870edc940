// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags::bitflags! {
    /// Detection backends, combinable into masks.
    ///
    /// The bit values are stored in configuration files and mirrored by report consumers; they
    /// must not change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MonitorType: u32 {
        /// Kernel exception ports. Never available on Linux.
        const KERNEL_EXCEPTION = 0x01;
        /// Fatal POSIX signals.
        const SIGNAL = 0x02;
        /// Uncaught Rust panics.
        const LANGUAGE_EXCEPTION = 0x04;
        /// Fatal exceptions reported by an embedding managed runtime.
        const MANAGED_EXCEPTION = 0x08;
        /// Watchdog on the monitored thread.
        const MAIN_THREAD_DEADLOCK = 0x10;
        /// Events reported through `report_user_exception`.
        const USER_REPORTED = 0x20;
        /// System information attached to every event.
        const SYSTEM = 0x40;
        /// Launch, session and crash counters.
        const APPLICATION_STATE = 0x80;
        /// Recently freed objects.
        const ZOMBIE = 0x100;

        const ALL = Self::KERNEL_EXCEPTION.bits()
            | Self::SIGNAL.bits()
            | Self::LANGUAGE_EXCEPTION.bits()
            | Self::MANAGED_EXCEPTION.bits()
            | Self::MAIN_THREAD_DEADLOCK.bits()
            | Self::USER_REPORTED.bits()
            | Self::SYSTEM.bits()
            | Self::APPLICATION_STATE.bits()
            | Self::ZOMBIE.bits();
        const EXPERIMENTAL = Self::MAIN_THREAD_DEADLOCK.bits();
        const DEBUGGER_UNSAFE = Self::KERNEL_EXCEPTION.bits()
            | Self::SIGNAL.bits()
            | Self::LANGUAGE_EXCEPTION.bits()
            | Self::MANAGED_EXCEPTION.bits();
        const ASYNC_SAFE = Self::KERNEL_EXCEPTION.bits() | Self::SIGNAL.bits();
        const OPTIONAL = Self::ZOMBIE.bits();
        const ASYNC_UNSAFE = Self::ALL.bits() & !Self::ASYNC_SAFE.bits();
        const DEBUGGER_SAFE = Self::ALL.bits() & !Self::DEBUGGER_UNSAFE.bits();
        const PRODUCTION_SAFE = Self::ALL.bits() & !Self::EXPERIMENTAL.bits();
        const PRODUCTION_SAFE_MINIMAL = Self::PRODUCTION_SAFE.bits() & !Self::OPTIONAL.bits();
        /// Informational monitors that are always wanted.
        const REQUIRED = Self::SYSTEM.bits() | Self::APPLICATION_STATE.bits();
        /// No automatic capture: only explicit reports.
        const MANUAL = Self::REQUIRED.bits() | Self::USER_REPORTED.bits();
    }
}

impl MonitorType {
    pub const NONE: Self = Self::empty();

    /// Short name of a single backend, for logs.
    pub fn name(&self) -> &'static str {
        const NAMES: [(MonitorType, &str); 9] = [
            (MonitorType::KERNEL_EXCEPTION, "kernel_exception"),
            (MonitorType::SIGNAL, "signal"),
            (MonitorType::LANGUAGE_EXCEPTION, "language_exception"),
            (MonitorType::MANAGED_EXCEPTION, "managed_exception"),
            (MonitorType::MAIN_THREAD_DEADLOCK, "main_thread_deadlock"),
            (MonitorType::USER_REPORTED, "user_reported"),
            (MonitorType::SYSTEM, "system"),
            (MonitorType::APPLICATION_STATE, "application_state"),
            (MonitorType::ZOMBIE, "zombie"),
        ];
        NAMES
            .iter()
            .find(|(flag, _)| flag == self)
            .map_or("unknown", |(_, name)| name)
    }
}

// Stored as the raw bit value, which is what configuration files carry.
impl Serialize for MonitorType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MonitorType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

impl Default for MonitorType {
    fn default() -> Self {
        Self::PRODUCTION_SAFE_MINIMAL
    }
}

#[cfg(test)]
mod tests {
    use super::MonitorType;

    #[test]
    fn test_mask_values() {
        assert_eq!(MonitorType::ALL.bits(), 0x1ff);
        assert_eq!(MonitorType::ASYNC_SAFE.bits(), 0x03);
        assert_eq!(MonitorType::ASYNC_UNSAFE.bits(), 0x1fc);
        assert_eq!(MonitorType::DEBUGGER_SAFE.bits(), 0x1f0);
        assert_eq!(MonitorType::PRODUCTION_SAFE.bits(), 0x1ef);
        assert_eq!(MonitorType::PRODUCTION_SAFE_MINIMAL.bits(), 0x0ef);
        assert_eq!(MonitorType::REQUIRED.bits(), 0xc0);
        assert_eq!(MonitorType::MANUAL.bits(), 0xe0);
        assert!(MonitorType::NONE.is_empty());
    }

    #[test]
    fn test_names() {
        assert_eq!(MonitorType::SIGNAL.name(), "signal");
        assert_eq!(MonitorType::ZOMBIE.name(), "zombie");
        assert_eq!((MonitorType::SIGNAL | MonitorType::ZOMBIE).name(), "unknown");
    }

    #[test]
    fn test_serde_as_bits() -> anyhow::Result<()> {
        let mask = MonitorType::SIGNAL | MonitorType::SYSTEM;
        assert_eq!(serde_json::to_string(&mask)?, "66");
        let back: MonitorType = serde_json::from_str("66")?;
        assert_eq!(back, mask);
        Ok(())
    }
}
