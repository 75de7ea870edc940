// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lays out crash reports.
//!
//! Both entry points run inside the event callback, possibly from a signal handler with every
//! other thread suspended. Nothing here allocates except through a self-thread stack cursor
//! (only built for user reports) or a user section callback. The encoder is flushed after each
//! section so a second crash still leaves the completed sections on disk.

use super::fields::{self, report_type};
use super::introspection::Introspection;
use super::json::{BufferedFdWriter, EncodeError, JsonEncoder, Utf8Stream};
use super::{ReportEncoder, UserInfo, UserSectionCallback};
use crate::binary_images::{self, BinaryImage};
use crate::machine_context::registers::{EXCEPTION_REGISTER_NAMES, REGISTER_NAMES};
use crate::machine_context::{current_thread, thread_name, MachineContext};
use crate::monitor::app_state::AppStateCounters;
use crate::monitor::system::SystemInfo;
use crate::monitor::{CrashDetails, MemoryInfo, MonitorContext, MonitorType};
use crate::shared::constants::{
    CRASH_REPORT_VERSION, MAX_PATH_LENGTH, STACK_CONTENTS_POPPED_DISTANCE,
    STACK_CONTENTS_PUSHED_DISTANCE, STACK_CONTENTS_TOTAL_DISTANCE, STACK_OVERFLOW_THRESHOLD,
};
use crate::shared::fixed_string::FixedString;
use crate::shared::log::{crash_error, crash_info, crash_warn};
use crate::sig_info::{signal_code_name, signal_name};
use crate::stack_cursor::StackCursor;
use std::ffi::CStr;
use std::fmt::Write;
use std::ops::ControlFlow;

/// Everything the writer reads besides the event itself.
#[derive(Clone, Copy)]
pub(crate) struct WriterSettings<'a> {
    pub introspection: Introspection<'a>,
    pub introspect_memory: bool,
    pub write_backtraces: bool,
    pub symbolicate: bool,
    pub user_info: Option<&'a UserInfo>,
    pub user_section: Option<UserSectionCallback>,
}

impl WriterSettings<'static> {
    pub(crate) fn current() -> Self {
        Self {
            introspection: Introspection::current(),
            introspect_memory: super::introspect_memory(),
            write_backtraces: super::write_backtraces(),
            symbolicate: super::symbolicate(),
            user_info: super::user_info(),
            user_section: super::user_section_callback(),
        }
    }
}

/// Writes a full report of `context` to `path`.
pub fn write_standard_report(context: &MonitorContext<'_>, path: &CStr) {
    write_standard_report_with(context, path, &WriterSettings::current());
}

/// Writes the report of a crash that happened while the report at `path` was being written.
///
/// The partial report is kept, embedded under `recrash_report`, next to a minimal description
/// of the second crash. If the partial report cannot be moved aside, it is left untouched and
/// the minimal report goes to `fallback_path` instead.
pub fn write_recrash_report(context: &MonitorContext<'_>, path: &CStr, fallback_path: &CStr) {
    write_recrash_report_with(context, path, fallback_path, &WriterSettings::current());
}

pub(crate) fn write_standard_report_with(
    context: &MonitorContext<'_>,
    path: &CStr,
    settings: &WriterSettings<'_>,
) {
    crash_info!("Writing crash report to {}", display_path(path));
    let result = BufferedFdWriter::create(path).and_then(|sink| {
        ReportWriter::new(JsonEncoder::new(sink), context, settings).standard_report()
    });
    if let Err(e) = result {
        crash_error!("Failed to write crash report {}: {e}", display_path(path));
    }
}

pub(crate) fn write_recrash_report_with(
    context: &MonitorContext<'_>,
    path: &CStr,
    fallback_path: &CStr,
    settings: &WriterSettings<'_>,
) {
    let mut temp = FixedString::<MAX_PATH_LENGTH>::from_bytes_lossy(path.to_bytes());
    let stem = temp
        .as_str()
        .strip_suffix(".json")
        .map_or(temp.len(), str::len);
    temp = FixedString::from_str_truncated(&temp.as_str()[..stem]);
    temp.push_str(".old");

    crash_info!(
        "Writing recrash report to {}, partial report moved to {}",
        display_path(path),
        temp
    );
    // SAFETY: both paths are NUL-terminated.
    let (target, partial_report) =
        if unsafe { libc::rename(path.as_ptr(), temp.as_c_str().as_ptr()) } < 0 {
            crash_error!(
                "Could not rename {} to {}: {}, writing to {} instead",
                display_path(path),
                temp,
                errno::errno(),
                display_path(fallback_path)
            );
            (fallback_path, None)
        } else {
            (path, Some(temp.as_c_str()))
        };
    let result = BufferedFdWriter::create(target).and_then(|sink| {
        ReportWriter::new(JsonEncoder::new(sink), context, settings).recrash_report(partial_report)
    });
    if let Err(e) = result {
        crash_error!("Failed to write recrash report {}: {e}", display_path(target));
    }
}

fn display_path(path: &CStr) -> &str {
    path.to_str().unwrap_or("<non UTF-8 path>")
}

struct ReportWriter<'w, 'c> {
    encoder: ReportEncoder,
    context: &'w MonitorContext<'c>,
    settings: &'w WriterSettings<'w>,
}

impl<'w, 'c> ReportWriter<'w, 'c> {
    fn new(
        encoder: ReportEncoder,
        context: &'w MonitorContext<'c>,
        settings: &'w WriterSettings<'w>,
    ) -> Self {
        Self {
            encoder,
            context,
            settings,
        }
    }

    fn standard_report(mut self) -> Result<(), EncodeError> {
        self.encoder.begin_object(None)?;

        self.write_report_info(fields::REPORT, report_type::STANDARD)?;
        self.encoder.flush()?;

        self.write_binary_images(fields::BINARY_IMAGES)?;
        self.encoder.flush()?;

        self.write_process_state(fields::PROCESS)?;
        self.encoder.flush()?;

        self.write_system_info(fields::SYSTEM)?;
        self.encoder.flush()?;

        self.encoder.begin_object(Some(fields::CRASH))?;
        self.write_error(fields::ERROR)?;
        self.encoder.flush()?;
        self.write_all_threads(fields::THREADS)?;
        self.encoder.end_container()?;
        self.encoder.flush()?;

        self.write_user_section(fields::USER)?;
        self.encoder.flush()?;

        if let Some(console_log) = self.context.console_log_path {
            self.encoder.begin_object(Some(fields::DEBUG))?;
            self.write_console_log(fields::CONSOLE_LOG, console_log);
            self.encoder.end_container()?;
        }
        self.encoder.end_encode()
    }

    fn recrash_report(mut self, partial_report: Option<&CStr>) -> Result<(), EncodeError> {
        self.encoder.begin_object(None)?;
        if let Some(partial_report) = partial_report {
            self.embed_partial_report(partial_report)?;
        }

        self.write_report_info(fields::REPORT, report_type::MINIMAL)?;
        self.encoder.flush()?;

        self.encoder.begin_object(Some(fields::CRASH))?;
        self.write_error(fields::ERROR)?;
        self.encoder.flush()?;
        if let Some(machine_context) = self.context.offending_machine_context {
            let index = machine_context.index_of_thread(machine_context.thread());
            self.write_thread(
                Some(fields::CRASHED_THREAD),
                machine_context,
                i64::from(index),
                false,
            )?;
        }
        self.encoder.end_container()?;
        self.encoder.end_encode()
    }

    /// Embeds the report the first crash left behind, deleting it once it is safely copied.
    fn embed_partial_report(&mut self, partial_report: &CStr) -> Result<(), EncodeError> {
        match self
            .encoder
            .add_json_file(Some(fields::RECRASH_REPORT), partial_report)
        {
            Ok(()) => {
                self.encoder.flush()?;
                // SAFETY: the path is NUL-terminated.
                if unsafe { libc::unlink(partial_report.as_ptr()) } < 0 {
                    crash_error!(
                        "Could not delete {}: {}",
                        display_path(partial_report),
                        errno::errno()
                    );
                }
            }
            Err(e) => crash_error!(
                "Could not embed {}: {e}",
                display_path(partial_report)
            ),
        }
        Ok(())
    }

    fn write_report_info(&mut self, key: &str, kind: &str) -> Result<(), EncodeError> {
        let mut id = uuid::Uuid::encode_buffer();
        let id = self.context.event_id.hyphenated().encode_lower(&mut id);
        // SAFETY: a null argument is allowed.
        let timestamp = unsafe { libc::time(std::ptr::null_mut()) };

        let e = &mut self.encoder;
        e.begin_object(Some(key))?;
        e.add_string(Some(fields::VERSION), CRASH_REPORT_VERSION)?;
        e.add_string(Some(fields::ID), id)?;
        if let Some(info) = self.context.system.info {
            e.add_string(Some(fields::PROCESS_NAME), &info.process_name)?;
        }
        e.add_int(Some(fields::TIMESTAMP), timestamp)?;
        e.add_string(Some(fields::TYPE), kind)?;
        e.end_container()
    }

    fn write_binary_images(&mut self, key: &str) -> Result<(), EncodeError> {
        self.encoder.begin_array(Some(key))?;
        let mut result = Ok(());
        binary_images::for_each_image(|image| {
            result = write_binary_image(&mut self.encoder, image);
            if result.is_err() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        result?;
        self.encoder.end_container()
    }

    fn write_process_state(&mut self, key: &str) -> Result<(), EncodeError> {
        self.encoder.begin_object(Some(key))?;
        if let Some(zombie) = &self.context.zombie_exception {
            let e = &mut self.encoder;
            e.begin_object(Some(fields::LAST_DEALLOCATED_EXCEPTION))?;
            e.add_uint(Some(fields::ADDRESS), zombie.address as u64)?;
            e.add_string(Some(fields::NAME), zombie.name.as_str())?;
            e.add_string(Some(fields::REASON), zombie.reason.as_str())?;
            self.settings.introspection.write_address_referenced_by_string(
                &mut self.encoder,
                fields::REFERENCED_OBJECT,
                zombie.reason.as_str(),
            )?;
            self.encoder.end_container()?;
        }
        self.encoder.end_container()
    }

    fn write_system_info(&mut self, key: &str) -> Result<(), EncodeError> {
        let e = &mut self.encoder;
        e.begin_object(Some(key))?;
        if let Some(info) = self.context.system.info {
            write_system_fields(e, info)?;
        }
        write_memory(e, fields::MEMORY, &self.context.system.memory)?;
        write_app_stats(e, fields::APPLICATION_STATS, &self.context.app_state)?;
        e.end_container()
    }

    fn write_error(&mut self, key: &str) -> Result<(), EncodeError> {
        let context = self.context;
        let e = &mut self.encoder;
        e.begin_object(Some(key))?;

        if context.crash_type == MonitorType::KERNEL_EXCEPTION {
            let kernel = &context.kernel_exception;
            e.begin_object(Some(fields::MACH))?;
            e.add_int(Some(fields::EXCEPTION), kernel.exception_type)?;
            e.add_int(Some(fields::CODE), kernel.code)?;
            e.add_int(Some(fields::SUBCODE), kernel.subcode)?;
            e.end_container()?;
        }

        let signal = &context.signal;
        e.begin_object(Some(fields::SIGNAL))?;
        e.add_uint(Some(fields::SIGNAL), signal.signum as u64)?;
        if let Some(name) = signal_name(signal.signum) {
            e.add_string(Some(fields::NAME), name)?;
        }
        e.add_int(Some(fields::CODE), i64::from(signal.sigcode))?;
        if let Some(name) = signal_code_name(signal.signum, signal.sigcode) {
            e.add_string(Some(fields::CODE_NAME), name)?;
        }
        e.end_container()?;

        e.add_uint(Some(fields::ADDRESS), context.fault_address as u64)?;
        if let Some(reason) = context.crash_reason {
            e.add_string(Some(fields::REASON), reason)?;
        }

        let Some(kind) = context.crash_type_name() else {
            crash_warn!("Unknown crash type {:#x}", context.crash_type.bits());
            return e.end_container();
        };
        e.add_string(Some(fields::TYPE), kind)?;
        match context.details {
            CrashDetails::LanguageException { name } => {
                e.begin_object(Some(fields::CPP_EXCEPTION))?;
                e.add_string(Some(fields::NAME), name)?;
                e.end_container()?;
            }
            CrashDetails::ManagedException { name, user_info } => {
                e.begin_object(Some(fields::MANAGED_EXCEPTION))?;
                e.add_string(Some(fields::NAME), name)?;
                if let Some(user_info) = user_info {
                    e.add_string(Some(fields::USER_INFO), user_info)?;
                }
                if let Some(reason) = context.crash_reason {
                    self.settings
                        .introspection
                        .write_address_referenced_by_string(
                            &mut self.encoder,
                            fields::REFERENCED_OBJECT,
                            reason,
                        )?;
                }
                self.encoder.end_container()?;
            }
            CrashDetails::UserReported {
                name,
                language,
                line_of_code,
                custom_stack_trace,
            } => {
                e.begin_object(Some(fields::USER_REPORTED))?;
                e.add_string(Some(fields::NAME), name)?;
                if let Some(language) = language {
                    e.add_string(Some(fields::LANGUAGE), language)?;
                }
                if let Some(line_of_code) = line_of_code {
                    e.add_string(Some(fields::LINE_OF_CODE), line_of_code)?;
                }
                if let Some(stack_trace) = custom_stack_trace {
                    add_json_or_error(e, fields::BACKTRACE, stack_trace, None, true)?;
                }
                self.encoder.end_container()?;
            }
            CrashDetails::None => {}
        }
        self.encoder.end_container()
    }

    fn write_all_threads(&mut self, key: &str) -> Result<(), EncodeError> {
        self.encoder.begin_array(Some(key))?;
        let Some(offending) = self.context.offending_machine_context else {
            return self.encoder.end_container();
        };
        let write_notable = self.settings.introspect_memory;
        let mut other = MachineContext::new();
        for index in 0..offending.thread_count() {
            let Some(thread) = offending.thread_at_index(index) else {
                break;
            };
            if thread == offending.thread() {
                self.write_thread(None, offending, index as i64, write_notable)?;
            } else {
                other.get_context_for_thread(thread, false);
                self.write_thread(None, &other, index as i64, write_notable)?;
            }
        }
        self.encoder.end_container()
    }

    /// The offending thread reuses the cursor the monitor built; others are unwound from their
    /// registers.
    fn cursor_for(&self, machine_context: &MachineContext) -> StackCursor<'c> {
        let is_offending = self
            .context
            .offending_machine_context
            .is_some_and(|offending| offending.thread() == machine_context.thread());
        match self.context.stack_cursor {
            Some(cursor) if is_offending => {
                let mut cursor = cursor.clone();
                cursor.reset();
                cursor
            }
            _ => StackCursor::with_machine_context(machine_context, STACK_OVERFLOW_THRESHOLD),
        }
    }

    fn write_thread(
        &mut self,
        key: Option<&str>,
        machine_context: &MachineContext,
        index: i64,
        write_notable_addresses: bool,
    ) -> Result<(), EncodeError> {
        let is_crashed = machine_context.is_crashed_context();
        let thread = machine_context.thread();
        let mut cursor = self.cursor_for(machine_context);

        self.encoder.begin_object(key)?;
        if self.settings.write_backtraces {
            self.write_backtrace(fields::BACKTRACE, &mut cursor)?;
        }
        if machine_context.can_have_cpu_state() {
            self.write_registers(fields::REGISTERS, machine_context)?;
        }
        self.encoder.add_int(Some(fields::INDEX), index)?;
        if let Some(name) = thread_name(thread) {
            self.encoder.add_string(Some(fields::NAME), name.as_str())?;
        }
        self.encoder.add_bool(Some(fields::CRASHED), is_crashed)?;
        self.encoder
            .add_bool(Some(fields::CURRENT_THREAD), thread == current_thread())?;
        if is_crashed {
            self.write_stack_contents(fields::STACK, machine_context, cursor.has_given_up())?;
            if write_notable_addresses {
                self.settings.introspection.write_notable_addresses(
                    &mut self.encoder,
                    fields::NOTABLE_ADDRESSES,
                    machine_context,
                )?;
            }
        }
        self.encoder.end_container()
    }

    fn write_backtrace(
        &mut self,
        key: &str,
        cursor: &mut StackCursor<'_>,
    ) -> Result<(), EncodeError> {
        let e = &mut self.encoder;
        e.begin_object(Some(key))?;
        e.begin_array(Some(fields::CONTENTS))?;
        while cursor.advance() {
            e.begin_object(None)?;
            if self.settings.symbolicate && cursor.symbolicate() {
                let entry = cursor.entry();
                if let Some(image) = entry.image_name {
                    let bytes = image.to_bytes();
                    let file_name = bytes
                        .iter()
                        .rposition(|&b| b == b'/')
                        .map_or(bytes, |slash| &bytes[slash + 1..]);
                    add_lossy_string(e, fields::OBJECT_NAME, file_name)?;
                }
                e.add_uint(Some(fields::OBJECT_ADDRESS), entry.image_address as u64)?;
                if let Some(symbol) = entry.symbol_name {
                    add_lossy_string(e, fields::SYMBOL_NAME, symbol.to_bytes())?;
                }
                e.add_uint(Some(fields::SYMBOL_ADDRESS), entry.symbol_address as u64)?;
            }
            e.add_uint(
                Some(fields::INSTRUCTION_ADDRESS),
                cursor.entry().address as u64,
            )?;
            e.end_container()?;
        }
        e.end_container()?;
        e.add_int(Some(fields::SKIPPED), 0)?;
        e.end_container()
    }

    fn write_registers(
        &mut self,
        key: &str,
        machine_context: &MachineContext,
    ) -> Result<(), EncodeError> {
        let Some(registers) = machine_context.registers() else {
            return Ok(());
        };
        let e = &mut self.encoder;
        e.begin_object(Some(key))?;
        e.begin_object(Some(fields::BASIC))?;
        for (&name, &value) in REGISTER_NAMES.iter().zip(registers.basic()) {
            e.add_uint(Some(name), value)?;
        }
        e.end_container()?;
        if machine_context.has_valid_exception_registers() {
            e.begin_object(Some(fields::EXCEPTION))?;
            for (&name, &value) in EXCEPTION_REGISTER_NAMES.iter().zip(registers.exception()) {
                e.add_uint(Some(name), value)?;
            }
            e.end_container()?;
        }
        e.end_container()
    }

    /// Raw words around the stack pointer: the pushed distance on the side the stack grows
    /// from, the popped distance on the other.
    fn write_stack_contents(
        &mut self,
        key: &str,
        machine_context: &MachineContext,
        is_stack_overflow: bool,
    ) -> Result<(), EncodeError> {
        let Some(stack_pointer) = machine_context
            .registers()
            .map(|r| r.stack_pointer())
            .filter(|sp| *sp != 0)
        else {
            return Ok(());
        };
        let word = std::mem::size_of::<usize>();
        let grow_direction = machine_context.stack_grow_direction();
        let pushed = STACK_CONTENTS_PUSHED_DISTANCE * word;
        let popped = STACK_CONTENTS_POPPED_DISTANCE * word;
        let (low, high) = if grow_direction < 0 {
            (
                stack_pointer.saturating_sub(popped),
                stack_pointer.saturating_add(pushed),
            )
        } else {
            (
                stack_pointer.saturating_sub(pushed),
                stack_pointer.saturating_add(popped),
            )
        };

        let e = &mut self.encoder;
        e.begin_object(Some(key))?;
        e.add_string(
            Some(fields::GROW_DIRECTION),
            if grow_direction > 0 { "+" } else { "-" },
        )?;
        e.add_uint(Some(fields::DUMP_START), low as u64)?;
        e.add_uint(Some(fields::DUMP_END), high as u64)?;
        e.add_uint(Some(fields::STACK_POINTER), stack_pointer as u64)?;
        e.add_bool(Some(fields::OVERFLOW), is_stack_overflow)?;
        let mut buffer = [0u8; STACK_CONTENTS_TOTAL_DISTANCE * std::mem::size_of::<usize>()];
        let contents = &mut buffer[..(high - low).min(STACK_CONTENTS_TOTAL_DISTANCE * word)];
        if crate::memory::copy_safely(low, contents) {
            e.add_data(Some(fields::CONTENTS), contents)?;
        } else {
            e.add_string(Some(fields::ERROR), "Stack contents not accessible")?;
        }
        e.end_container()
    }

    fn write_user_section(&mut self, key: &str) -> Result<(), EncodeError> {
        match self.settings.user_info {
            Some(info) => {
                add_json_or_error(&mut self.encoder, key, &info.json, info.error.as_deref(), false)?
            }
            None => self.encoder.begin_object(Some(key))?,
        }
        if !self.context.is_user_reported() {
            if let Some(callback) = self.settings.user_section {
                let depth = self.encoder.depth();
                callback(&mut self.encoder);
                if self.encoder.depth() != depth {
                    crash_error!("User section callback left the encoder unbalanced");
                    return Err(EncodeError::NoOpenContainer);
                }
            }
        }
        self.encoder.end_container()
    }

    /// Best effort: a missing or unreadable log leaves the section without it.
    fn write_console_log(&mut self, key: &str, path: &CStr) {
        if let Err(e) = self.encoder.add_text_lines_from_file(Some(key), path) {
            crash_error!("Could not add console log {}: {e}", display_path(path));
        }
    }
}

fn write_binary_image(e: &mut ReportEncoder, image: &BinaryImage) -> Result<(), EncodeError> {
    e.begin_object(None)?;
    e.add_uint(Some(fields::IMAGE_ADDRESS), image.address as u64)?;
    e.add_uint(Some(fields::IMAGE_VM_ADDRESS), image.vm_address as u64)?;
    e.add_uint(Some(fields::IMAGE_SIZE), image.size as u64)?;
    e.add_string(Some(fields::NAME), image.name.as_str())?;
    e.add_uuid(
        Some(fields::UUID),
        (image.uuid != [0; 16]).then_some(&image.uuid),
    )?;
    e.add_int(Some(fields::CPU_TYPE), image.cpu_type)?;
    e.add_int(Some(fields::CPU_SUBTYPE), image.cpu_subtype)?;
    e.add_uint(Some(fields::IMAGE_MAJOR_VERSION), image.major_version)?;
    e.add_uint(Some(fields::IMAGE_MINOR_VERSION), image.minor_version)?;
    e.add_uint(Some(fields::IMAGE_REVISION_VERSION), image.revision_version)?;
    e.end_container()
}

fn write_system_fields(e: &mut ReportEncoder, info: &SystemInfo) -> Result<(), EncodeError> {
    let optional = |e: &mut ReportEncoder, key: &str, value: &Option<String>| match value {
        Some(value) => e.add_string(Some(key), value),
        None => Ok(()),
    };
    e.add_string(Some("system_name"), &info.system_name)?;
    e.add_string(Some("system_version"), &info.system_version)?;
    e.add_string(Some("machine"), &info.machine)?;
    optional(e, "model", &info.model)?;
    e.add_string(Some("hostname"), &info.hostname)?;
    e.add_string(Some("kernel_version"), &info.kernel_version)?;
    e.add_string(Some("os_version"), &info.os_version)?;
    e.add_bool(Some("jailbroken"), info.jailbroken)?;
    optional(e, "boot_time", &info.boot_time)?;
    optional(e, "app_start_time", &info.app_start_time)?;
    optional(e, "CFBundleExecutablePath", &info.executable_path)?;
    optional(e, "CFBundleExecutable", &info.executable)?;
    e.add_string(Some("CFBundleIdentifier"), &info.bundle_id)?;
    e.add_string(Some("CFBundleName"), &info.bundle_name)?;
    optional(e, "CFBundleVersion", &info.bundle_version)?;
    optional(e, "CFBundleShortVersionString", &info.bundle_short_version)?;
    e.add_uuid(Some("app_uuid"), info.app_uuid.as_ref())?;
    e.add_string(Some("cpu_arch"), info.cpu_arch)?;
    e.add_int(Some(fields::CPU_TYPE), info.cpu_type)?;
    e.add_int(Some(fields::CPU_SUBTYPE), info.cpu_subtype)?;
    e.add_int(Some("binary_cpu_type"), info.binary_cpu_type)?;
    e.add_int(Some("binary_cpu_subtype"), info.binary_cpu_subtype)?;
    optional(e, "time_zone", &info.time_zone)?;
    e.add_string(Some(fields::PROCESS_NAME), &info.process_name)?;
    e.add_int(Some("process_id"), i64::from(info.process_id))?;
    e.add_int(Some("parent_process_id"), i64::from(info.parent_process_id))?;
    e.add_string(Some("device_app_hash"), &info.device_app_hash)?;
    e.add_string(Some("build_type"), info.build_type)?;
    e.add_uint(Some("storage"), info.storage)
}

fn write_memory(e: &mut ReportEncoder, key: &str, memory: &MemoryInfo) -> Result<(), EncodeError> {
    e.begin_object(Some(key))?;
    e.add_uint(Some(fields::SIZE), memory.size)?;
    e.add_uint(Some(fields::USABLE), memory.usable)?;
    e.add_uint(Some(fields::FREE), memory.free)?;
    e.end_container()
}

fn write_app_stats(
    e: &mut ReportEncoder,
    key: &str,
    stats: &AppStateCounters,
) -> Result<(), EncodeError> {
    e.begin_object(Some(key))?;
    e.add_bool(Some("application_active"), stats.application_active)?;
    e.add_bool(Some("application_in_foreground"), stats.application_in_foreground)?;
    e.add_uint(Some("launches_since_last_crash"), stats.launches_since_last_crash)?;
    e.add_uint(Some("sessions_since_last_crash"), stats.sessions_since_last_crash)?;
    e.add_float(
        Some("active_time_since_last_crash"),
        stats.active_duration_since_last_crash,
    )?;
    e.add_float(
        Some("background_time_since_last_crash"),
        stats.background_duration_since_last_crash,
    )?;
    e.add_uint(Some("sessions_since_launch"), stats.sessions_since_launch)?;
    e.add_float(
        Some("active_time_since_launch"),
        stats.active_duration_since_launch,
    )?;
    e.add_float(
        Some("background_time_since_launch"),
        stats.background_duration_since_launch,
    )?;
    e.end_container()
}

/// Loader and symbol names are bytes; invalid UTF-8 sequences are dropped.
fn add_lossy_string(e: &mut ReportEncoder, key: &str, bytes: &[u8]) -> Result<(), EncodeError> {
    e.begin_string_element(Some(key))?;
    Utf8Stream::default().feed(bytes, |text| e.append_string_element(text))?;
    e.end_string_element()
}

/// Embeds `json`, or an object carrying the error and the raw text when it is not well-formed.
///
/// `known_error` is an error found earlier, in which case `json` is not parsed again. Without
/// `close_last_container` the embedded object, or the error object, is left open.
fn add_json_or_error(
    e: &mut ReportEncoder,
    key: &str,
    json: &str,
    known_error: Option<&str>,
    close_last_container: bool,
) -> Result<(), EncodeError> {
    let mut detail = FixedString::<256>::new();
    match known_error {
        Some(error) => detail.push_str(error),
        None => match e.add_json_element(Some(key), json, close_last_container) {
            Err(EncodeError::InvalidJson { line, column }) => {
                let _ = write!(detail, "syntax error at line {line} column {column}");
            }
            other => return other,
        },
    }
    crash_error!("Invalid JSON under {key}: {detail}");
    e.begin_object(Some(key))?;
    e.begin_string_element(Some(fields::ERROR))?;
    e.append_string_element("Invalid JSON data: ")?;
    e.append_string_element(detail.as_str())?;
    e.end_string_element()?;
    e.add_string(Some("json_data"), json)?;
    if close_last_container {
        e.end_container()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{SignalInfo, ZombieException};
    use serde_json::Value;
    use std::ffi::CString;
    use std::path::Path;
    use uuid::Uuid;

    fn settings() -> WriterSettings<'static> {
        WriterSettings {
            introspection: Introspection::new(&[], &[]),
            introspect_memory: true,
            write_backtraces: true,
            symbolicate: true,
            user_info: None,
            user_section: None,
        }
    }

    fn c_path(path: &Path) -> CString {
        CString::new(path.to_str().unwrap()).unwrap()
    }

    fn read_json(path: &Path) -> Value {
        let text = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("{e}: {text}"))
    }

    #[inline(never)]
    fn user_event_report(settings: &WriterSettings<'_>, path: &Path) {
        let mut machine_context = MachineContext::new();
        machine_context.get_context_for_thread(current_thread(), true);
        let cursor = StackCursor::with_self_thread(0);
        let mut context =
            MonitorContext::new(MonitorType::USER_REPORTED, Uuid::from_u128(0xfeed));
        context.fatal = false;
        context.offending_machine_context = Some(&machine_context);
        context.stack_cursor = Some(&cursor);
        context.crash_reason = Some("cart is empty");
        context.details = CrashDetails::UserReported {
            name: "CheckoutError",
            language: Some("lua"),
            line_of_code: Some("42"),
            custom_stack_trace: Some(r#"[{"function": "checkout"}]"#),
        };
        write_standard_report_with(&context, &c_path(path), settings);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_standard_report_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        user_event_report(&settings(), &path);
        let report = read_json(&path);

        let keys: Vec<_> = report.as_object().unwrap().keys().cloned().collect();
        for section in ["report", "binary_images", "process", "system", "crash", "user"] {
            assert!(keys.contains(&section.to_string()), "missing {section}");
        }
        assert!(report.get("debug").is_none());

        let info = &report["report"];
        assert_eq!(info["version"], CRASH_REPORT_VERSION);
        assert_eq!(info["id"], Uuid::from_u128(0xfeed).to_string());
        assert_eq!(info["type"], "standard");
        assert!(info["timestamp"].as_i64().unwrap() > 1_600_000_000);

        assert!(!report["binary_images"].as_array().unwrap().is_empty());
        assert!(report["system"]["memory"].is_object());
        assert!(report["system"]["application_stats"].is_object());

        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "user");
        assert_eq!(error["reason"], "cart is empty");
        assert_eq!(error["signal"]["signal"], 0);
        assert!(error.get("mach").is_none());
        let user = &error["user_reported"];
        assert_eq!(user["name"], "CheckoutError");
        assert_eq!(user["language"], "lua");
        assert_eq!(user["line_of_code"], "42");
        assert_eq!(user["backtrace"][0]["function"], "checkout");

        let threads = report["crash"]["threads"].as_array().unwrap();
        let crashed: Vec<_> = threads.iter().filter(|t| t["crashed"] == true).collect();
        assert_eq!(crashed.len(), 1);
        let crashed = crashed[0];
        assert_eq!(crashed["current_thread"], true);
        let frames = crashed["backtrace"]["contents"].as_array().unwrap();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f["instruction_addr"].is_u64()));
        assert_eq!(crashed["backtrace"]["skipped"], 0);
        // The calling thread has no saved registers.
        assert!(crashed.get("registers").is_none());
    }

    fn append_build(encoder: &mut ReportEncoder) {
        let _ = encoder.add_string(Some("build"), "nightly");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_user_section() {
        let dir = tempfile::tempdir().unwrap();
        let info = UserInfo {
            json: r#"{"user_id": 7}"#.to_string(),
            error: None,
        };
        let mut settings = settings();
        settings.user_info = Some(&info);
        settings.user_section = Some(append_build);

        let path = dir.path().join("user.json");
        user_event_report(&settings, &path);
        let report = read_json(&path);
        assert_eq!(report["user"]["user_id"], 7);
        // Not called for user-reported events.
        assert!(report["user"].get("build").is_none());

        let broken = UserInfo {
            json: r#"{"user_id": "#.to_string(),
            error: Some("EOF while parsing".to_string()),
        };
        settings.user_info = Some(&broken);
        let path = dir.path().join("broken.json");
        user_event_report(&settings, &path);
        let report = read_json(&path);
        assert_eq!(report["user"]["error"], "Invalid JSON data: EOF while parsing");
        assert_eq!(report["user"]["json_data"], r#"{"user_id": "#);
        assert!(report["crash"].is_object());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_signal_error_and_zombie_exception() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.json");
        let referenced = CString::new("stale exception message").unwrap();
        let reason = format!("released at {:#x}", referenced.as_ptr() as usize);

        let mut machine_context = MachineContext::new();
        machine_context.get_context_for_thread(current_thread(), true);
        let addresses = [0x1000usize, 0x2000];
        let cursor = StackCursor::with_backtrace(&addresses, 0);
        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::nil());
        context.offending_machine_context = Some(&machine_context);
        context.stack_cursor = Some(&cursor);
        context.signal = SignalInfo {
            signum: libc::SIGSEGV,
            sigcode: 1,
        };
        context.fault_address = 0xdead;
        context.zombie_exception = Some(ZombieException {
            address: 0x5000,
            name: FixedString::from_str_truncated("InvalidState"),
            reason: FixedString::from_str_truncated(&reason),
        });
        let mut settings = settings();
        settings.symbolicate = false;
        write_standard_report_with(&context, &c_path(&path), &settings);

        let report = read_json(&path);
        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "signal");
        assert_eq!(error["signal"]["signal"], libc::SIGSEGV);
        assert_eq!(error["signal"]["name"], "SIGSEGV");
        assert_eq!(error["signal"]["code"], 1);
        assert_eq!(error["signal"]["code_name"], "SEGV_MAPERR");
        assert_eq!(error["address"], 0xdead);

        let zombie = &report["process"]["last_dealloced_nsexception"];
        assert_eq!(zombie["address"], 0x5000);
        assert_eq!(zombie["name"], "InvalidState");
        assert_eq!(zombie["referenced_object"]["value"], "stale exception message");

        let crashed = report["crash"]["threads"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["crashed"] == true)
            .unwrap()
            .clone();
        let frames = crashed["backtrace"]["contents"].as_array().unwrap();
        let addresses: Vec<_> = frames.iter().map(|f| f["instruction_addr"].clone()).collect();
        assert_eq!(addresses, [0x1000, 0x2000]);
        assert!(frames[0].get("symbol_name").is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_console_log_is_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("ConsoleLog.txt");
        std::fs::write(&log, "first line\nsecond line\n").unwrap();
        let log = c_path(&log);
        let path = dir.path().join("report.json");

        let mut context = MonitorContext::new(MonitorType::MAIN_THREAD_DEADLOCK, Uuid::nil());
        context.console_log_path = Some(&log);
        write_standard_report_with(&context, &c_path(&path), &settings());

        let report = read_json(&path);
        assert_eq!(report["crash"]["error"]["type"], "deadlock");
        assert_eq!(report["crash"]["threads"], serde_json::json!([]));
        assert_eq!(
            report["debug"]["console_log"],
            serde_json::json!(["first line", "second line"])
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_recrash_report_embeds_partial_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-report-0000000000000001.json");
        std::fs::write(&path, r#"{"report": {"type": "standard"}, "crash": {"threads": [{"#)
            .unwrap();

        let mut machine_context = MachineContext::new();
        machine_context.get_context_for_thread(current_thread(), true);
        let addresses = [0x4000usize];
        let cursor = StackCursor::with_backtrace(&addresses, 0);
        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::nil());
        context.offending_machine_context = Some(&machine_context);
        context.stack_cursor = Some(&cursor);
        context.signal.signum = libc::SIGBUS;
        context.crashed_during_crash_handling = true;
        let mut settings = settings();
        settings.symbolicate = false;
        let fallback = dir.path().join("app-report-0000000000000002.json");
        write_recrash_report_with(&context, &c_path(&path), &c_path(&fallback), &settings);

        assert!(!dir.path().join("app-report-0000000000000001.old").exists());
        assert!(!fallback.exists());
        let report = read_json(&path);
        assert_eq!(report["report"]["type"], "minimal");
        assert_eq!(report["recrash_report"]["report"]["type"], "standard");
        assert_eq!(report["recrash_report"]["crash"]["threads"], serde_json::json!([{}]));
        assert_eq!(report["crash"]["error"]["signal"]["name"], "SIGBUS");
        let crashed = &report["crash"]["crashed_thread"];
        assert_eq!(crashed["crashed"], true);
        assert_eq!(crashed["backtrace"]["contents"][0]["instruction_addr"], 0x4000);
        assert!(crashed.get("notable_addresses").is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_recrash_report_keeps_partial_report_it_cannot_move() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-report-0000000000000001.json");
        let partial = r#"{"report": {"type": "standard"}, "crash": {"#;
        std::fs::write(&path, partial).unwrap();
        // A non-empty directory cannot be replaced by a rename.
        let blocker = dir.path().join("app-report-0000000000000001.old");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "").unwrap();

        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::nil());
        context.signal.signum = libc::SIGSEGV;
        context.crashed_during_crash_handling = true;
        let fallback = dir.path().join("app-report-0000000000000002.json");
        write_recrash_report_with(&context, &c_path(&path), &c_path(&fallback), &settings());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), partial);
        let report = read_json(&fallback);
        assert_eq!(report["report"]["type"], "minimal");
        assert!(report.get("recrash_report").is_none());
        assert_eq!(report["crash"]["error"]["signal"]["name"], "SIGSEGV");
    }
}
