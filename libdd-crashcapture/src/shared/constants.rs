// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits, defaults and heuristic constants shared by the capture path and the report store.
//!
//! The heuristic values are part of the report format: consumers compare stack dumps and
//! notable-address windows across reports, so changing them changes the meaning of old reports.

use std::time::Duration;

/// Version string written as `report.version`.
pub const CRASH_REPORT_VERSION: &str = "3.2.0";

/// Name of the directory, under the install path, holding one JSON file per report.
pub const REPORTS_DIR_NAME: &str = "Reports";
/// Name of the directory, under the install path, holding the state file and the console log.
pub const DATA_DIR_NAME: &str = "Data";
/// File tracking crash, launch and session counters across restarts.
pub const CRASH_STATE_FILE_NAME: &str = "CrashState.json";
/// File receiving the crash-path log lines; embedded into reports when enabled.
pub const CONSOLE_LOG_FILE_NAME: &str = "ConsoleLog.txt";

pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;
pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Longest path the crash path can format without allocating.
pub const MAX_PATH_LENGTH: usize = 500;

/// Upper bound of threads recorded per report.
pub const MAX_CAPTURED_THREADS: usize = 512;
/// Threads that are never suspended (the watchdog, reporter-owned workers).
pub const MAX_RESERVED_THREADS: usize = 10;

/// Depth at which an unwind is considered runaway and flagged as a stack overflow.
pub const STACK_OVERFLOW_THRESHOLD: usize = 150;
/// Depth used for the cursor of the faulting thread in the signal path.
pub const SIGNAL_STACK_DEPTH: usize = 100;
/// Frames kept by the self-thread cursor.
pub const MAX_SELF_THREAD_FRAMES: usize = 128;

/// Shared budget of sub-elements visited when describing one notable address.
pub const DEFAULT_MEMORY_SEARCH_DEPTH: i32 = 15;
/// Pointer-widths scanned for notable addresses towards the stack base.
pub const STACK_NOTABLE_SEARCH_BACK_DISTANCE: usize = 20;
/// Pointer-widths scanned for notable addresses past the stack pointer.
pub const STACK_NOTABLE_SEARCH_FORWARD_DISTANCE: usize = 10;
/// Pointer-widths dumped on the pushed side of the stack pointer.
pub const STACK_CONTENTS_PUSHED_DISTANCE: usize = 20;
/// Pointer-widths dumped on the popped side of the stack pointer.
pub const STACK_CONTENTS_POPPED_DISTANCE: usize = 10;
pub const STACK_CONTENTS_TOTAL_DISTANCE: usize =
    STACK_CONTENTS_PUSHED_DISTANCE + STACK_CONTENTS_POPPED_DISTANCE;

/// Minimum length of a memory region accepted as a string.
pub const MIN_STRING_LENGTH: usize = 4;
/// Probe window used when checking whether an address holds a string.
pub const STRING_PROBE_LENGTH: usize = 500;

/// Capacity of fixed text fields captured on the crash path (reasons, names).
pub const MAX_CAPTURED_TEXT: usize = 1024;
