// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Detection backends and the dispatcher that arbitrates between them.
//!
//! Every backend is a [`Monitor`]: a type tag plus an enable switch and an optional hook that
//! enriches events fired by other backends. The set is closed and registered once, in a fixed
//! order, in [`REGISTRY`]. When two monitors write the same field of a [`MonitorContext`], the
//! one registered later wins.

mod monitor_type;

pub use monitor_type::MonitorType;

#[cfg(target_os = "linux")]
pub mod app_state;
#[cfg(target_os = "linux")]
pub(crate) mod context;
#[cfg(target_os = "linux")]
pub mod deadlock;
#[cfg(target_os = "linux")]
pub(crate) mod dispatch;
#[cfg(target_os = "linux")]
pub mod managed;
#[cfg(target_os = "linux")]
pub(crate) mod panic;
#[cfg(target_os = "linux")]
pub(crate) mod signal;
#[cfg(target_os = "linux")]
pub mod system;
#[cfg(target_os = "linux")]
pub mod user;
#[cfg(target_os = "linux")]
pub mod zombie;

#[cfg(target_os = "linux")]
pub use context::{
    CrashDetails, KernelExceptionInfo, MemoryInfo, MonitorContext, SignalInfo, SystemSnapshot,
    ZombieException,
};

/// One detection backend.
///
/// Implementations keep their state in statics: enabling and disabling may happen from inside a
/// crash handler and must not allocate or lock. Both must be idempotent.
#[cfg(target_os = "linux")]
pub(crate) trait Monitor: Sync {
    fn monitor_type(&self) -> MonitorType;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Adds what this backend knows to an event fired by any backend, itself included.
    fn add_contextual_info(&self, _context: &mut MonitorContext<'_>) {}
}

/// All backends available on this platform, in dispatch order.
///
/// There are no kernel exception ports on Linux, so that backend is never registered and its
/// bit can never become active.
#[cfg(target_os = "linux")]
pub(crate) static REGISTRY: [&dyn Monitor; 8] = [
    &signal::MONITOR,
    &managed::MONITOR,
    &deadlock::MONITOR,
    &zombie::MONITOR,
    &panic::MONITOR,
    &user::MONITOR,
    &system::MONITOR,
    &app_state::MONITOR,
];

#[cfg(target_os = "linux")]
pub use dispatch::{active_monitors, set_active_monitors};
