// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Field names of the report format, shared by the writer and by the fixup done on read.

pub mod report_type {
    pub const STANDARD: &str = "standard";
    pub const MINIMAL: &str = "minimal";
}

pub mod memory_type {
    pub const OBJECT: &str = "object";
    pub const NULL_POINTER: &str = "null_pointer";
    pub const STRING: &str = "string";
    pub const UNKNOWN: &str = "unknown";
}

// Sections
pub const REPORT: &str = "report";
pub const BINARY_IMAGES: &str = "binary_images";
pub const PROCESS: &str = "process";
pub const SYSTEM: &str = "system";
pub const CRASH: &str = "crash";
pub const USER: &str = "user";
pub const DEBUG: &str = "debug";
pub const RECRASH_REPORT: &str = "recrash_report";

// report
pub const VERSION: &str = "version";
pub const ID: &str = "id";
pub const PROCESS_NAME: &str = "process_name";
pub const TIMESTAMP: &str = "timestamp";
pub const TYPE: &str = "type";

// binary_images
pub const IMAGE_ADDRESS: &str = "image_addr";
pub const IMAGE_VM_ADDRESS: &str = "image_vmaddr";
pub const IMAGE_SIZE: &str = "image_size";
pub const NAME: &str = "name";
pub const UUID: &str = "uuid";
pub const CPU_TYPE: &str = "cpu_type";
pub const CPU_SUBTYPE: &str = "cpu_subtype";
pub const IMAGE_MAJOR_VERSION: &str = "major_version";
pub const IMAGE_MINOR_VERSION: &str = "minor_version";
pub const IMAGE_REVISION_VERSION: &str = "revision_version";

// process
pub const LAST_DEALLOCATED_EXCEPTION: &str = "last_dealloced_nsexception";
pub const ADDRESS: &str = "address";
pub const REASON: &str = "reason";
pub const REFERENCED_OBJECT: &str = "referenced_object";

// crash
pub const ERROR: &str = "error";
pub const THREADS: &str = "threads";
pub const CRASHED_THREAD: &str = "crashed_thread";
pub const MACH: &str = "mach";
pub const EXCEPTION: &str = "exception";
pub const CODE: &str = "code";
pub const SUBCODE: &str = "subcode";
pub const CODE_NAME: &str = "code_name";
pub const SIGNAL: &str = "signal";
pub const CPP_EXCEPTION: &str = "cpp_exception";
pub const MANAGED_EXCEPTION: &str = "nsexception";
pub const USER_INFO: &str = "userInfo";
pub const USER_REPORTED: &str = "user_reported";
pub const LANGUAGE: &str = "language";
pub const LINE_OF_CODE: &str = "line_of_code";
pub const BACKTRACE: &str = "backtrace";

// threads
pub const CONTENTS: &str = "contents";
pub const SKIPPED: &str = "skipped";
pub const OBJECT_NAME: &str = "object_name";
pub const OBJECT_ADDRESS: &str = "object_addr";
pub const SYMBOL_NAME: &str = "symbol_name";
pub const SYMBOL_ADDRESS: &str = "symbol_addr";
pub const INSTRUCTION_ADDRESS: &str = "instruction_addr";
pub const REGISTERS: &str = "registers";
pub const BASIC: &str = "basic";
pub const INDEX: &str = "index";
pub const CRASHED: &str = "crashed";
pub const CURRENT_THREAD: &str = "current_thread";
pub const STACK: &str = "stack";
pub const GROW_DIRECTION: &str = "grow_direction";
pub const DUMP_START: &str = "dump_start";
pub const DUMP_END: &str = "dump_end";
pub const STACK_POINTER: &str = "stack_pointer";
pub const OVERFLOW: &str = "overflow";
pub const NOTABLE_ADDRESSES: &str = "notable_addresses";

// memory contents
pub const LAST_DEALLOCATED_OBJECT: &str = "last_deallocated_obj";
pub const CLASS: &str = "class";
pub const VALUE: &str = "value";

// system
pub const MEMORY: &str = "memory";
pub const SIZE: &str = "size";
pub const USABLE: &str = "usable";
pub const FREE: &str = "free";
pub const APPLICATION_STATS: &str = "application_stats";

// debug
pub const CONSOLE_LOG: &str = "console_log";
