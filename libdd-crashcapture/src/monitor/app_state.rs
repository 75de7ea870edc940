// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Launch, session and usage-time counters, persisted across runs in `Data/CrashState.json`.
//!
//! Counters "since last crash" are reset at the first launch after a crash. Durations are
//! measured with `CLOCK_MONOTONIC` between state transitions reported by the host through the
//! `notify_app_*` functions.

use super::{Monitor, MonitorContext, MonitorType};
use crate::report::json::{BufferedFdWriter, EncodeError, JsonEncoder};
use crate::shared::constants::MAX_PATH_LENGTH;
use crate::shared::fixed_string::FixedString;
use crate::shared::log::crash_error;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, MutexGuard, TryLockError};

const STATE_FORMAT_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AppStateCounters {
    pub application_active: bool,
    pub application_in_foreground: bool,
    pub crashed_last_launch: bool,
    pub crashed_this_launch: bool,
    pub launches_since_last_crash: u64,
    pub sessions_since_last_crash: u64,
    pub sessions_since_launch: u64,
    /// Seconds.
    pub active_duration_since_last_crash: f64,
    pub background_duration_since_last_crash: f64,
    pub active_duration_since_launch: f64,
    pub background_duration_since_launch: f64,
}

impl AppStateCounters {
    const ZERO: Self = Self {
        application_active: false,
        application_in_foreground: false,
        crashed_last_launch: false,
        crashed_this_launch: false,
        launches_since_last_crash: 0,
        sessions_since_last_crash: 0,
        sessions_since_launch: 0,
        active_duration_since_last_crash: 0.0,
        background_duration_since_last_crash: 0.0,
        active_duration_since_launch: 0.0,
        background_duration_since_launch: 0.0,
    };
}

/// Content of the state file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PersistedState {
    version: u64,
    crashed_last_launch: bool,
    active_duration_since_last_crash: f64,
    background_duration_since_last_crash: f64,
    launches_since_last_crash: u64,
    sessions_since_last_crash: u64,
}

struct AppState {
    counters: AppStateCounters,
    /// Monotonic time of the last transition, in seconds.
    transition_time: f64,
    launched: bool,
    path: FixedString<MAX_PATH_LENGTH>,
}

impl AppState {
    const fn new() -> Self {
        Self {
            counters: AppStateCounters::ZERO,
            transition_time: 0.0,
            launched: false,
            path: FixedString::new(),
        }
    }

    fn load(&mut self, persisted: PersistedState) {
        let c = &mut self.counters;
        c.crashed_last_launch = persisted.crashed_last_launch;
        c.active_duration_since_last_crash = persisted.active_duration_since_last_crash;
        c.background_duration_since_last_crash = persisted.background_duration_since_last_crash;
        c.launches_since_last_crash = persisted.launches_since_last_crash;
        c.sessions_since_last_crash = persisted.sessions_since_last_crash;
    }

    /// Bookkeeping for the start of this process, done once.
    fn launch(&mut self, now: f64) {
        if self.launched {
            return;
        }
        self.launched = true;
        let c = &mut self.counters;
        if c.crashed_last_launch {
            c.active_duration_since_last_crash = 0.0;
            c.background_duration_since_last_crash = 0.0;
            c.launches_since_last_crash = 0;
            c.sessions_since_last_crash = 0;
        }
        c.crashed_this_launch = false;
        c.application_active = true;
        c.application_in_foreground = true;
        c.launches_since_last_crash += 1;
        c.sessions_since_last_crash += 1;
        c.sessions_since_launch = 1;
        self.transition_time = now;
    }

    fn set_active(&mut self, active: bool, now: f64) {
        let c = &mut self.counters;
        c.application_active = active;
        if active {
            self.transition_time = now;
        } else {
            let elapsed = now - self.transition_time;
            c.active_duration_since_last_crash += elapsed;
            c.active_duration_since_launch += elapsed;
        }
    }

    fn set_in_foreground(&mut self, in_foreground: bool, now: f64) {
        let c = &mut self.counters;
        c.application_in_foreground = in_foreground;
        if in_foreground {
            let elapsed = now - self.transition_time;
            c.background_duration_since_last_crash += elapsed;
            c.background_duration_since_launch += elapsed;
            c.sessions_since_last_crash += 1;
            c.sessions_since_launch += 1;
        } else {
            self.transition_time = now;
        }
    }

    /// Accounts the time since the last transition to the current state.
    fn update(&mut self, now: f64) {
        let elapsed = now - self.transition_time;
        let c = &mut self.counters;
        if c.application_active {
            c.active_duration_since_last_crash += elapsed;
            c.active_duration_since_launch += elapsed;
        } else if !c.application_in_foreground {
            c.background_duration_since_last_crash += elapsed;
            c.background_duration_since_launch += elapsed;
        }
        self.transition_time = now;
    }

    /// Writes the state file without allocating.
    fn save(&self) -> Result<(), EncodeError> {
        if self.path.is_empty() {
            return Ok(());
        }
        let c = &self.counters;
        let mut encoder = JsonEncoder::new(BufferedFdWriter::create(self.path.as_c_str())?);
        encoder.begin_object(None)?;
        encoder.add_uint(Some("version"), STATE_FORMAT_VERSION)?;
        encoder.add_bool(Some("crashedLastLaunch"), c.crashed_this_launch)?;
        encoder.add_float(
            Some("activeDurationSinceLastCrash"),
            c.active_duration_since_last_crash,
        )?;
        encoder.add_float(
            Some("backgroundDurationSinceLastCrash"),
            c.background_duration_since_last_crash,
        )?;
        encoder.add_uint(Some("launchesSinceLastCrash"), c.launches_since_last_crash)?;
        encoder.add_uint(Some("sessionsSinceLastCrash"), c.sessions_since_last_crash)?;
        encoder.end_encode()
    }

    fn save_logging_errors(&self) {
        if let Err(e) = self.save() {
            crash_error!("Failed to save the application state to {}: {e}", self.path);
        }
    }
}

static STATE: Mutex<AppState> = Mutex::new(AppState::new());

fn lock_state() -> MutexGuard<'static, AppState> {
    // The state stays consistent field by field: a panic while holding the lock is harmless.
    STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lock for the crash path: a suspended thread may own the lock, so never wait for it.
fn try_lock_state() -> Option<MutexGuard<'static, AppState>> {
    match STATE.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn monotonic_seconds() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer; clock_gettime is async-signal-safe.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// Loads the counters persisted by previous runs from `state_file`.
///
/// A missing file is a first launch. An unreadable or malformed one is logged and replaced.
pub(crate) fn initialize(state_file: &Path) -> anyhow::Result<()> {
    let path = state_file
        .to_str()
        .with_context(|| format!("state file path is not UTF-8: {}", state_file.display()))?;
    anyhow::ensure!(
        path.len() < MAX_PATH_LENGTH,
        "state file path is too long: {path}"
    );
    let persisted = match std::fs::read_to_string(state_file) {
        Ok(text) => serde_json::from_str::<PersistedState>(&text).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed state file {path}: {e}");
            PersistedState::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No state file at {path}, first launch");
            PersistedState::default()
        }
        Err(e) => {
            tracing::warn!("Cannot read state file {path}: {e}");
            PersistedState::default()
        }
    };
    if persisted.version > STATE_FORMAT_VERSION {
        tracing::warn!(
            "State file {path} has version {}, newer than {STATE_FORMAT_VERSION}",
            persisted.version
        );
    }
    let mut state = lock_state();
    state.path = FixedString::from_str_truncated(path);
    state.load(persisted);
    Ok(())
}

pub(crate) struct AppStateMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: AppStateMonitor = AppStateMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for AppStateMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::APPLICATION_STATE
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled && !self.enabled.load(SeqCst) {
            // Also reached from the crash path when monitors are re-armed; setup normally
            // happens long before.
            if let Some(mut state) = try_lock_state() {
                if !state.launched {
                    state.launch(monotonic_seconds());
                    state.save_logging_errors();
                }
            }
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, context: &mut MonitorContext<'_>) {
        let Some(state) = try_lock_state() else {
            crash_error!("Application state is locked, reporting empty counters");
            return;
        };
        let mut snapshot = AppState {
            counters: state.counters,
            transition_time: state.transition_time,
            launched: state.launched,
            path: FixedString::new(),
        };
        drop(state);
        snapshot.update(monotonic_seconds());
        context.app_state = snapshot.counters;
    }
}

/// The host application became active (`true`) or inactive.
pub fn notify_app_active(active: bool) {
    lock_state().set_active(active, monotonic_seconds());
}

/// The host application moved to the foreground (`true`) or the background.
pub fn notify_app_in_foreground(in_foreground: bool) {
    let mut state = lock_state();
    state.set_in_foreground(in_foreground, monotonic_seconds());
    if !in_foreground {
        state.save_logging_errors();
    }
}

/// The host application is shutting down normally.
pub fn notify_app_terminate() {
    let mut state = lock_state();
    state.update(monotonic_seconds());
    state.save_logging_errors();
}

/// The process is crashing. Safe to call from the crash path.
pub fn notify_app_crash() {
    let Some(mut state) = try_lock_state() else {
        crash_error!("Application state is locked, not recording the crash");
        return;
    };
    state.counters.crashed_this_launch = true;
    state.update(monotonic_seconds());
    state.save_logging_errors();
}

/// A copy of the current counters.
pub fn current_counters() -> AppStateCounters {
    lock_state().counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_session_accounting() {
        let mut state = AppState::new();
        state.launch(100.0);
        assert!(state.counters.application_active);
        assert_eq!(state.counters.launches_since_last_crash, 1);
        assert_eq!(state.counters.sessions_since_launch, 1);

        // A second enable of the monitor is not a new launch.
        state.launch(150.0);
        assert_eq!(state.counters.launches_since_last_crash, 1);

        state.set_active(false, 110.0);
        state.set_in_foreground(false, 110.0);
        state.set_in_foreground(true, 140.0);
        state.set_active(true, 140.0);
        state.update(145.0);

        let c = state.counters;
        assert_eq!(c.active_duration_since_launch, 15.0);
        assert_eq!(c.active_duration_since_last_crash, 15.0);
        assert_eq!(c.background_duration_since_launch, 30.0);
        assert_eq!(c.sessions_since_launch, 2);
        assert_eq!(c.sessions_since_last_crash, 2);
    }

    #[test]
    fn test_crash_resets_counters_on_next_launch() {
        let persisted: PersistedState = serde_json::from_str(
            r#"{"version": 1, "crashedLastLaunch": true, "launchesSinceLastCrash": 7,
                "sessionsSinceLastCrash": 9, "activeDurationSinceLastCrash": 12.5}"#,
        )
        .unwrap();
        let mut state = AppState::new();
        state.load(persisted);
        assert!(state.counters.crashed_last_launch);
        state.launch(0.0);
        assert_eq!(state.counters.launches_since_last_crash, 1);
        assert_eq!(state.counters.sessions_since_last_crash, 1);
        assert_eq!(state.counters.active_duration_since_last_crash, 0.0);

        let mut state = AppState::new();
        state.load(serde_json::from_str(r#"{"launchesSinceLastCrash": 7}"#).unwrap());
        state.launch(0.0);
        assert_eq!(state.counters.launches_since_last_crash, 8);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_save_writes_state_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("CrashState.json");
        let mut state = AppState::new();
        state.path = FixedString::from_str_truncated(path.to_str().unwrap());
        state.launch(0.0);
        state.counters.crashed_this_launch = true;
        state.update(2.5);
        state.save()?;

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(saved["version"], 1);
        assert_eq!(saved["crashedLastLaunch"], true);
        assert_eq!(saved["launchesSinceLastCrash"], 1);
        assert_eq!(saved["activeDurationSinceLastCrash"], 2.5);

        let reloaded: PersistedState = serde_json::from_value(saved)?;
        assert!(reloaded.crashed_last_launch);
        Ok(())
    }
}
