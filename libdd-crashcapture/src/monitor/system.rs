// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Description of the host, the process and the application.
//!
//! Everything except memory usage is gathered once, when the monitor is first enabled, and kept
//! for the life of the process; the crash path only reads it. Memory figures come from
//! `sysinfo(2)` at each event.

use super::{MemoryInfo, Monitor, MonitorContext, MonitorType};
use crate::binary_images;
use chrono::{DateTime, SecondsFormat};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub system_name: String,
    pub system_version: String,
    pub machine: String,
    pub model: Option<String>,
    pub hostname: String,
    pub kernel_version: String,
    pub os_version: String,
    /// Running as root.
    pub jailbroken: bool,
    pub boot_time: Option<String>,
    pub app_start_time: Option<String>,
    pub executable_path: Option<String>,
    pub executable: Option<String>,
    pub bundle_id: String,
    pub bundle_name: String,
    pub bundle_version: Option<String>,
    pub bundle_short_version: Option<String>,
    pub app_uuid: Option<[u8; 16]>,
    pub cpu_arch: &'static str,
    pub cpu_type: i64,
    pub cpu_subtype: i64,
    pub binary_cpu_type: i64,
    pub binary_cpu_subtype: i64,
    pub time_zone: Option<String>,
    pub process_name: String,
    pub process_id: i32,
    pub parent_process_id: i32,
    pub device_app_hash: String,
    pub build_type: &'static str,
    /// Size of the file system holding the install directory, in bytes.
    pub storage: u64,
}

#[derive(Debug, Clone, Default)]
struct SystemConfig {
    app_name: String,
    app_version: Option<String>,
    install_path: PathBuf,
}

static CONFIG: Mutex<Option<SystemConfig>> = Mutex::new(None);
static SYSTEM_INFO: OnceLock<SystemInfo> = OnceLock::new();

/// Records what the process cannot find out about itself. Must happen before the monitor is
/// enabled: later calls do not change the collected information.
pub(crate) fn configure(app_name: &str, app_version: Option<&str>, install_path: &Path) {
    let config = SystemConfig {
        app_name: app_name.to_string(),
        app_version: app_version.map(str::to_string),
        install_path: install_path.to_path_buf(),
    };
    match CONFIG.lock() {
        Ok(mut guard) => *guard = Some(config),
        Err(poisoned) => *poisoned.into_inner() = Some(config),
    }
}

/// The collected information, once the monitor has been enabled.
pub fn system_info() -> Option<&'static SystemInfo> {
    SYSTEM_INFO.get()
}

fn collect_once() -> &'static SystemInfo {
    SYSTEM_INFO.get_or_init(|| {
        let config = match CONFIG.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        collect(&config.unwrap_or_default())
    })
}

pub(crate) struct SystemMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: SystemMonitor = SystemMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for SystemMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SYSTEM
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            collect_once();
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, context: &mut MonitorContext<'_>) {
        context.system.info = system_info();
        context.system.memory = memory_info();
    }
}

/// Current memory figures. `usable` counts buffers, which the kernel gives back on demand.
pub fn memory_info() -> MemoryInfo {
    // SAFETY: all-zero is a valid `sysinfo`.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    // SAFETY: `info` is a valid out-pointer.
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return MemoryInfo::default();
    }
    let unit = u64::from(info.mem_unit.max(1));
    MemoryInfo {
        size: info.totalram as u64 * unit,
        usable: (info.freeram as u64 + info.bufferram as u64) * unit,
        free: info.freeram as u64 * unit,
    }
}

fn collect(config: &SystemConfig) -> SystemInfo {
    let os = os_info::get();
    let uname = Uname::get();
    let executable_path = std::env::current_exe().ok();
    let executable = executable_path
        .as_deref()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned());
    let executable_path_str = executable_path
        .as_deref()
        .map(|path| path.to_string_lossy().into_owned());
    let boot_time = read_boot_time();
    let app_name = if config.app_name.is_empty() {
        executable.clone().unwrap_or_default()
    } else {
        config.app_name.clone()
    };
    let process_name = std::fs::read_to_string("/proc/self/comm")
        .map(|comm| comm.trim_end().to_string())
        .ok()
        .or_else(|| executable.clone())
        .unwrap_or_default();

    let info = SystemInfo {
        system_name: os.os_type().to_string(),
        system_version: os.version().to_string(),
        machine: uname.machine,
        model: read_trimmed("/sys/devices/virtual/dmi/id/product_name"),
        hostname: uname.nodename,
        kernel_version: uname.version,
        os_version: uname.release,
        // SAFETY: no preconditions.
        jailbroken: unsafe { libc::geteuid() } == 0,
        boot_time: boot_time.and_then(format_timestamp),
        app_start_time: boot_time
            .and_then(read_process_start)
            .and_then(format_timestamp),
        executable_path: executable_path_str.clone(),
        executable,
        bundle_id: app_name.clone(),
        bundle_name: app_name.clone(),
        bundle_version: config.app_version.clone(),
        bundle_short_version: config.app_version.clone(),
        app_uuid: executable_path_str
            .as_deref()
            .and_then(binary_images::image_uuid_for_path),
        cpu_arch: std::env::consts::ARCH,
        cpu_type: binary_images::NATIVE_CPU_TYPE,
        cpu_subtype: 0,
        binary_cpu_type: binary_images::NATIVE_CPU_TYPE,
        binary_cpu_subtype: 0,
        time_zone: time_zone(),
        process_name,
        process_id: std::process::id() as i32,
        // SAFETY: no preconditions.
        parent_process_id: unsafe { libc::getppid() },
        device_app_hash: device_app_hash(
            read_trimmed("/etc/machine-id").as_deref().unwrap_or_default(),
            &app_name,
        ),
        build_type: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        storage: storage_size(&config.install_path),
    };
    tracing::debug!(
        "Collected system information: {} {} on {}",
        info.system_name,
        info.system_version,
        info.machine
    );
    info
}

struct Uname {
    machine: String,
    nodename: String,
    release: String,
    version: String,
}

impl Uname {
    fn get() -> Self {
        // SAFETY: all-zero is a valid `utsname`.
        let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: `buf` is a valid out-pointer.
        let ok = unsafe { libc::uname(&mut buf) } == 0;
        let field = |chars: &[libc::c_char]| {
            if !ok {
                return String::new();
            }
            // SAFETY: uname NUL-terminates every field.
            unsafe { CStr::from_ptr(chars.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        };
        Self {
            machine: field(&buf.machine),
            nodename: field(&buf.nodename),
            release: field(&buf.release),
            version: field(&buf.version),
        }
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Boot time in seconds since the epoch, from the `btime` line of `/proc/stat`.
fn read_boot_time() -> Option<i64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}

/// Process start time in seconds since the epoch.
fn read_process_start(boot_time: i64) -> Option<i64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The command name may contain spaces: fields are counted from its closing parenthesis,
    // which is followed by field 3.
    let fields = &stat[stat.rfind(')')? + 1..];
    let start_ticks: i64 = fields.split_whitespace().nth(19)?.parse().ok()?;
    // SAFETY: no preconditions.
    let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    (ticks_per_second > 0).then(|| boot_time + start_ticks / ticks_per_second as i64)
}

fn format_timestamp(seconds: i64) -> Option<String> {
    DateTime::from_timestamp(seconds, 0).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn time_zone() -> Option<String> {
    if let Ok(tz) = std::env::var("TZ") {
        let tz = tz.trim_start_matches(':');
        if !tz.is_empty() {
            return Some(tz.to_string());
        }
    }
    if let Ok(target) = std::fs::read_link("/etc/localtime") {
        let target = target.to_string_lossy();
        if let Some((_, zone)) = target.split_once("zoneinfo/") {
            return Some(zone.to_string());
        }
    }
    read_trimmed("/etc/timezone")
}

/// Stable for one application on one machine, without disclosing the machine id.
fn device_app_hash(machine_id: &str, app_name: &str) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let hash = machine_id
        .bytes()
        .chain(std::iter::once(0))
        .chain(app_name.bytes())
        .fold(FNV_OFFSET_BASIS, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
        });
    format!("{hash:016x}")
}

fn storage_size(path: &Path) -> u64 {
    let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    // SAFETY: all-zero is a valid `statvfs`.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `path` is NUL-terminated and `stat` a valid out-pointer.
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return 0;
    }
    stat.f_blocks as u64 * stat.f_frsize as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_collect() {
        let dir = tempfile::tempdir().unwrap();
        let info = collect(&SystemConfig {
            app_name: "checkout".to_string(),
            app_version: Some("1.2.3".to_string()),
            install_path: dir.path().to_path_buf(),
        });
        assert_eq!(info.bundle_id, "checkout");
        assert_eq!(info.bundle_version.as_deref(), Some("1.2.3"));
        assert_eq!(info.process_id, std::process::id() as i32);
        assert_eq!(info.cpu_arch, std::env::consts::ARCH);
        assert!(!info.machine.is_empty());
        assert!(!info.os_version.is_empty());
        assert!(info.storage > 0);
        assert_eq!(
            info.build_type,
            if cfg!(debug_assertions) { "debug" } else { "release" }
        );
        assert!(info.executable.is_some());
        assert_eq!(info.device_app_hash.len(), 16);
        if let (Some(boot), Some(start)) = (&info.boot_time, &info.app_start_time) {
            assert!(boot <= start, "{boot} > {start}");
        }
    }

    #[test]
    fn test_device_app_hash() {
        let hash = device_app_hash("0123456789abcdef", "checkout");
        assert_eq!(hash, device_app_hash("0123456789abcdef", "checkout"));
        assert_ne!(hash, device_app_hash("0123456789abcdef", "search"));
        // The separator keeps the two inputs apart.
        assert_ne!(device_app_hash("ab", "c"), device_app_hash("a", "bc"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_memory_info() {
        let memory = memory_info();
        assert!(memory.size > 0);
        assert!(memory.free <= memory.usable);
        assert!(memory.usable <= memory.size);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(1_700_000_000).as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
    }
}
