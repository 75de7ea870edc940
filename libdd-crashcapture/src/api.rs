// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installation, and the operations that need an installed crash capture.
//!
//! Installing lays out the install directory:
//!
//! ```text
//! <install_path>/Reports/<app_name>-report-<id>.json
//! <install_path>/Data/CrashState.json
//! <install_path>/Data/ConsoleLog.txt
//! ```
//!
//! and arms the configured monitors. From then on every event goes to [`on_crash`], which picks
//! the report file and hands the event to the report writer.

use crate::machine_context::current_thread;
use crate::machine_context::suspend::init_suspension;
use crate::monitor::dispatch::dispatcher;
use crate::monitor::{app_state, deadlock, signal, system, MonitorContext, MonitorType};
use crate::report::{
    set_do_not_introspect_types, set_introspect_memory, set_stacktrace_collection,
    write_recrash_report, write_standard_report,
};
use crate::shared::configuration::CrashCaptureConfiguration;
use crate::shared::constants::{
    CONSOLE_LOG_FILE_NAME, CRASH_STATE_FILE_NAME, DATA_DIR_NAME, MAX_PATH_LENGTH,
    REPORTS_DIR_NAME,
};
use crate::shared::fixed_string::FixedString;
use crate::shared::log::{self, crash_debug, crash_error};
use crate::store::{ReportStore, StoreError};
use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrashCaptureError {
    #[error("Crash capture is already installed")]
    AlreadyInstalled,
    #[error("Crash capture is not installed")]
    NotInstalled,
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Path contains a NUL byte: {0}")]
    InvalidPath(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to set up crash capture: {0}")]
    Setup(#[from] anyhow::Error),
}

struct Installation {
    store: ReportStore,
    console_log_path: CString,
    add_console_log_to_report: bool,
}

static INSTALLATION: OnceLock<Installation> = OnceLock::new();
static CURRENT_REPORT: CurrentReport = CurrentReport::new();

/// Where an event's report goes.
#[derive(Debug)]
enum ReportTarget {
    Standard(FixedString<MAX_PATH_LENGTH>),
    /// The crash happened while writing the report at this path.
    Recrash(FixedString<MAX_PATH_LENGTH>),
}

/// The id of the report being written, so a crash while writing it can find it.
///
/// 0 when no report is in progress. Reports that let the process continue are finished when
/// the callback returns; a fatal report is never finished since the process dies after it.
struct CurrentReport {
    id: AtomicI64,
}

impl CurrentReport {
    const fn new() -> Self {
        Self {
            id: AtomicI64::new(0),
        }
    }

    fn begin(&self, store: &ReportStore, crashed_during_crash_handling: bool) -> ReportTarget {
        let current = self.id.load(SeqCst);
        if crashed_during_crash_handling && current > 0 {
            return ReportTarget::Recrash(store.report_path_for(current));
        }
        let (id, path) = store.next_report_path();
        self.id.store(id, SeqCst);
        ReportTarget::Standard(path)
    }

    fn finish(&self) {
        self.id.store(0, SeqCst);
    }
}

fn create_dir(path: &Path) -> Result<(), CrashCaptureError> {
    std::fs::create_dir_all(path).map_err(|source| CrashCaptureError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn print_previous_log(path: &Path) {
    match std::fs::read(path) {
        Ok(contents) => {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "===== Previous console log =====");
            let _ = stderr.write_all(&contents);
            let _ = writeln!(stderr, "================================");
        }
        Err(e) => tracing::debug!("No previous console log at {}: {e}", path.display()),
    }
}

/// Installs crash capture for `app_name`, keeping its files under `install_path`, and returns
/// the monitors that ended up active.
///
/// Can only be done once per process.
///
/// PRECONDITIONS:
///     Must be called from the thread the deadlock watchdog should watch.
/// SAFETY:
///     Crash-tracking functions are not reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function is not atomic. A crash during its execution may lead to
///     unexpected crash-handling behaviour.
pub fn install(
    app_name: &str,
    install_path: &Path,
    config: CrashCaptureConfiguration,
) -> Result<MonitorType, CrashCaptureError> {
    if INSTALLATION.get().is_some() {
        return Err(CrashCaptureError::AlreadyInstalled);
    }
    tracing::debug!("Installing crash capture in {}", install_path.display());

    let reports_dir = install_path.join(REPORTS_DIR_NAME);
    let data_dir = install_path.join(DATA_DIR_NAME);
    create_dir(&reports_dir)?;
    create_dir(&data_dir)?;
    let store = ReportStore::new(&reports_dir, app_name, config.max_report_count())?;

    app_state::initialize(&data_dir.join(CRASH_STATE_FILE_NAME))?;

    let console_log = data_dir.join(CONSOLE_LOG_FILE_NAME);
    if config.print_previous_log() {
        print_previous_log(&console_log);
    }
    if let Err(e) = log::set_log_file(&console_log, true) {
        tracing::warn!("Could not open console log {}: {e}", console_log.display());
    }
    let console_log_path = CString::new(console_log.as_os_str().as_bytes())
        .map_err(|_| CrashCaptureError::InvalidPath(console_log.clone()))?;

    system::configure(app_name, config.app_version(), install_path);
    signal::configure(config.create_alt_stack(), config.use_alt_stack());
    deadlock::set_watchdog_interval(config.deadlock_watchdog_interval());
    deadlock::set_monitored_thread(current_thread());
    init_suspension(config.suspend_signal(), config.suspend_timeout())?;

    set_introspect_memory(config.introspect_memory());
    set_do_not_introspect_types(config.do_not_introspect_types());
    set_stacktrace_collection(config.resolve_frames());

    let installation = Installation {
        store,
        console_log_path,
        add_console_log_to_report: config.add_console_log_to_report(),
    };
    INSTALLATION
        .set(installation)
        .map_err(|_| CrashCaptureError::AlreadyInstalled)?;

    let dispatcher = dispatcher();
    dispatcher.set_event_callback(Some(on_crash));
    let active = dispatcher.set_active_monitors(config.monitors());
    tracing::info!(
        "Crash capture installed for {app_name}, active monitors {:#x}",
        active.bits()
    );
    Ok(active)
}

/// Changes the active monitors after install, returning the ones that ended up active.
pub fn set_monitoring(monitors: MonitorType) -> MonitorType {
    dispatcher().set_active_monitors(monitors)
}

/// Receives every event, on the thread that captured it.
fn on_crash(context: &mut MonitorContext<'_>) {
    let Some(installation) = INSTALLATION.get() else {
        crash_error!("Event captured before install completed, no report written");
        return;
    };
    if installation.add_console_log_to_report {
        context.console_log_path = Some(installation.console_log_path.as_c_str());
    }
    if !context.is_user_reported() {
        app_state::notify_app_crash();
    }

    let store = &installation.store;
    match CURRENT_REPORT.begin(store, context.crashed_during_crash_handling) {
        ReportTarget::Recrash(path) => {
            crash_debug!("Writing recrash report to {}", path);
            let (_, fallback_path) = store.next_report_path();
            write_recrash_report(context, path.as_c_str(), fallback_path.as_c_str());
        }
        ReportTarget::Standard(path) => {
            crash_debug!("Writing crash report to {}", path);
            write_standard_report(context, path.as_c_str());
        }
    }
    if !context.fatal {
        CURRENT_REPORT.finish();
    }

    if context.is_user_reported() && installation.add_console_log_to_report {
        log::clear_log_file();
    }
}

fn store() -> Result<&'static ReportStore, CrashCaptureError> {
    INSTALLATION
        .get()
        .map(|installation| &installation.store)
        .ok_or(CrashCaptureError::NotInstalled)
}

pub fn report_count() -> Result<usize, CrashCaptureError> {
    Ok(store()?.report_count()?)
}

/// Ids of the stored reports, oldest first.
pub fn report_ids() -> Result<Vec<i64>, CrashCaptureError> {
    Ok(store()?.report_ids()?)
}

/// The report with id `id`, with its timestamp formatted and its symbols demangled.
pub fn read_report(id: i64) -> Result<String, CrashCaptureError> {
    Ok(store()?.read_report(id)?)
}

/// Stores a report produced by the application itself and returns its id.
pub fn add_user_report(report: &[u8]) -> Result<i64, CrashCaptureError> {
    Ok(store()?.add_user_report(report)?)
}

pub fn delete_all_reports() -> Result<(), CrashCaptureError> {
    Ok(store()?.delete_all_reports()?)
}

pub fn delete_report_with_id(id: i64) -> Result<(), CrashCaptureError> {
    Ok(store()?.delete_report_with_id(id)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_store_operations_require_install() {
        // Installing arms process-wide signal handlers, so it is only done in the forked
        // integration tests.
        if INSTALLATION.get().is_some() {
            return;
        }
        assert!(matches!(report_count(), Err(CrashCaptureError::NotInstalled)));
        assert!(matches!(read_report(1), Err(CrashCaptureError::NotInstalled)));
        assert!(matches!(
            add_user_report(b"{}"),
            Err(CrashCaptureError::NotInstalled)
        ));
    }

    #[test]
    fn test_recrash_targets_only_the_report_in_progress() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ReportStore::new(dir.path(), "checkout", 5)?;
        let current = CurrentReport::new();

        // Nothing in progress: even a recrash gets a fresh report.
        let ReportTarget::Standard(first) = current.begin(&store, true) else {
            panic!("no report was in progress");
        };
        // A crash while writing it targets the same file.
        match current.begin(&store, true) {
            ReportTarget::Recrash(path) => assert_eq!(path.as_str(), first.as_str()),
            target => panic!("expected a recrash, got {target:?}"),
        }

        // A user report that completed is no longer in progress.
        current.finish();
        let ReportTarget::Standard(second) = current.begin(&store, true) else {
            panic!("the finished report must not be reused");
        };
        assert_ne!(second.as_str(), first.as_str());
        Ok(())
    }

    #[test]
    fn test_error_messages() {
        let err = CrashCaptureError::from(StoreError::InvalidId(0));
        assert_eq!(err.to_string(), "Report ids are positive, got 0");
        let err = CrashCaptureError::CreateDir {
            path: PathBuf::from("/nonexistent/Reports"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().starts_with("Failed to create directory /nonexistent/Reports"));
    }
}
