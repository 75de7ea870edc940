// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Snapshots of a thread's CPU state, and the list of threads alive at crash time.
//!
//! A [`MachineContext`] is a fixed-size value: the capture path declares one on the (alternate)
//! stack and fills it without allocating. Registers come either from the `ucontext_t` the kernel
//! hands to a signal handler, or from the copy a thread saved while it was suspended.

pub mod registers;
pub mod suspend;

pub use registers::Registers;
pub use suspend::{resume_environment, suspend_environment, SuspendedEnvironment};

use crate::shared::constants::{
    MAX_CAPTURED_THREADS, MAX_RESERVED_THREADS, STACK_OVERFLOW_THRESHOLD,
};
use crate::shared::fixed_string::FixedString;
use crate::shared::raw_io::{self, RawFile};
use crate::stack_cursor::StackCursor;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::SeqCst;

/// Kernel id of the calling thread.
pub fn current_thread() -> libc::pid_t {
    // SAFETY: gettid cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

static RESERVED_THREADS: [AtomicI32; MAX_RESERVED_THREADS] =
    [const { AtomicI32::new(0) }; MAX_RESERVED_THREADS];

/// Marks `tid` as owned by the reporter: it is never suspended.
///
/// Returns false when every reserved slot is taken.
pub fn add_reserved_thread(tid: libc::pid_t) -> bool {
    is_reserved_thread(tid)
        || RESERVED_THREADS
            .iter()
            .any(|slot| slot.compare_exchange(0, tid, SeqCst, SeqCst).is_ok())
}

pub fn remove_reserved_thread(tid: libc::pid_t) {
    for slot in &RESERVED_THREADS {
        let _ = slot.compare_exchange(tid, 0, SeqCst, SeqCst);
    }
}

pub fn is_reserved_thread(tid: libc::pid_t) -> bool {
    tid != 0 && RESERVED_THREADS.iter().any(|slot| slot.load(SeqCst) == tid)
}

/// Fills `out` with the ids of the threads of this process, returning how many were written.
///
/// Reads `/proc/self/task` with `getdents64`, which, unlike `readdir`, does not allocate.
pub fn list_threads(out: &mut [libc::pid_t]) -> usize {
    let Ok(dir) = RawFile::open_directory(c"/proc/self/task") else {
        return 0;
    };
    let mut buf = [0u8; 4096];
    let mut count = 0;
    loop {
        // SAFETY: `buf` is a valid writable buffer of the given length.
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                dir.fd(),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
        let mut offset = 0;
        while offset < n as usize {
            // struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; }
            let reclen = u16::from_ne_bytes([buf[offset + 16], buf[offset + 17]]) as usize;
            if reclen == 0 {
                break;
            }
            let name = &buf[offset + 19..offset + reclen];
            let name = name.split(|b| *b == 0).next().unwrap_or_default();
            if let Some(tid) = parse_decimal(name) {
                if count < out.len() {
                    out[count] = tid;
                    count += 1;
                }
            }
            offset += reclen;
        }
    }
    count
}

fn parse_decimal(bytes: &[u8]) -> Option<libc::pid_t> {
    if bytes.is_empty() {
        return None;
    }
    bytes.iter().try_fold(0 as libc::pid_t, |acc, b| {
        let digit = (*b as char).to_digit(10)? as libc::pid_t;
        acc.checked_mul(10)?.checked_add(digit)
    })
}

/// Reads the kernel name of `tid` from `/proc/self/task/<tid>/comm`.
pub fn thread_name(tid: libc::pid_t) -> Option<FixedString<32>> {
    let mut path = [0u8; 64];
    let prefix = b"/proc/self/task/";
    path[..prefix.len()].copy_from_slice(prefix);
    let mut len = prefix.len();
    len += raw_io::write_decimal(&mut path[len..], tid as u64)?;
    let suffix = b"/comm\0";
    path.get_mut(len..len + suffix.len())?.copy_from_slice(suffix);
    let path = std::ffi::CStr::from_bytes_until_nul(&path).ok()?;

    let mut file = RawFile::open_read(path).ok()?;
    let mut name = [0u8; 32];
    let n = file.read(&mut name).ok()?;
    let trimmed = name[..n].strip_suffix(b"\n").unwrap_or(&name[..n]);
    (!trimmed.is_empty()).then(|| FixedString::from_bytes_lossy(trimmed))
}

/// CPU state of one thread, plus the thread list when it is the crashed context.
#[derive(Clone)]
pub struct MachineContext {
    thread: libc::pid_t,
    all_threads: [libc::pid_t; MAX_CAPTURED_THREADS],
    thread_count: usize,
    is_current_thread: bool,
    is_crashed_context: bool,
    is_signal_context: bool,
    is_stack_overflow: bool,
    has_cpu_state: bool,
    registers: Registers,
}

impl Default for MachineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MachineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineContext")
            .field("thread", &self.thread)
            .field("thread_count", &self.thread_count)
            .field("is_current_thread", &self.is_current_thread)
            .field("is_crashed_context", &self.is_crashed_context)
            .field("is_signal_context", &self.is_signal_context)
            .field("is_stack_overflow", &self.is_stack_overflow)
            .field("has_cpu_state", &self.has_cpu_state)
            .finish()
    }
}

impl MachineContext {
    pub const fn new() -> Self {
        Self {
            thread: 0,
            all_threads: [0; MAX_CAPTURED_THREADS],
            thread_count: 0,
            is_current_thread: false,
            is_crashed_context: false,
            is_signal_context: false,
            is_stack_overflow: false,
            has_cpu_state: false,
            registers: Registers::new(),
        }
    }

    /// Fills the context of `thread`.
    ///
    /// The calling thread has no meaningful live registers, so its context carries no CPU
    /// state. Another thread only has one while it is parked by [`suspend_environment`].
    /// A crashed context also records the thread list and the stack overflow probe.
    pub fn get_context_for_thread(&mut self, thread: libc::pid_t, is_crashed_context: bool) {
        *self = Self::new();
        self.thread = thread;
        self.is_current_thread = thread == current_thread();
        self.is_crashed_context = is_crashed_context;
        if !self.is_current_thread {
            if let Some(registers) = suspend::captured_registers(thread) {
                self.registers = registers;
                self.has_cpu_state = true;
            }
        }
        if is_crashed_context {
            self.capture_thread_list();
            if self.has_cpu_state {
                self.is_stack_overflow = self.probe_stack_overflow();
            }
        }
    }

    /// Fills the context of the calling thread from the `ucontext` of a `SA_SIGINFO` handler.
    ///
    /// # Safety
    /// `ucontext` must be null or the third argument received by the signal handler.
    pub unsafe fn get_context_for_signal(&mut self, ucontext: *const libc::c_void) {
        *self = Self::new();
        self.thread = current_thread();
        self.is_current_thread = true;
        self.is_crashed_context = true;
        self.is_signal_context = true;
        self.has_cpu_state = !ucontext.is_null();
        self.registers = Registers::from_raw_ucontext(ucontext);
        self.capture_thread_list();
        self.is_stack_overflow = self.has_cpu_state && self.probe_stack_overflow();
    }

    fn capture_thread_list(&mut self) {
        self.thread_count = list_threads(&mut self.all_threads);
    }

    fn probe_stack_overflow(&self) -> bool {
        let mut cursor = StackCursor::with_machine_context(self, STACK_OVERFLOW_THRESHOLD);
        while cursor.advance() {}
        cursor.has_given_up()
    }

    pub fn thread(&self) -> libc::pid_t {
        self.thread
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn thread_at_index(&self, index: usize) -> Option<libc::pid_t> {
        self.all_threads[..self.thread_count].get(index).copied()
    }

    /// Position of `thread` in the captured list, or -1.
    pub fn index_of_thread(&self, thread: libc::pid_t) -> i32 {
        self.all_threads[..self.thread_count]
            .iter()
            .position(|t| *t == thread)
            .map_or(-1, |i| i as i32)
    }

    pub fn is_current_thread(&self) -> bool {
        self.is_current_thread
    }

    pub fn is_crashed_context(&self) -> bool {
        self.is_crashed_context
    }

    pub fn is_signal_context(&self) -> bool {
        self.is_signal_context
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.is_stack_overflow
    }

    /// Whether registers may be reported for this thread at all.
    pub fn can_have_cpu_state(&self) -> bool {
        !self.is_current_thread || self.is_signal_context
    }

    /// Whether the fault registers describe the crash.
    pub fn has_valid_exception_registers(&self) -> bool {
        self.can_have_cpu_state() && self.is_crashed_context
    }

    /// Registers, when the context actually holds a CPU state.
    pub fn registers(&self) -> Option<&Registers> {
        (self.has_cpu_state && self.can_have_cpu_state()).then_some(&self.registers)
    }

    /// The stack grows towards lower addresses on every supported architecture.
    pub fn stack_grow_direction(&self) -> isize {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_list_threads_contains_self() {
        let mut threads = [0; MAX_CAPTURED_THREADS];
        let count = list_threads(&mut threads);
        assert!(count >= 1);
        assert!(threads[..count].contains(&current_thread()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_context_for_current_thread() {
        let mut ctx = MachineContext::new();
        ctx.get_context_for_thread(current_thread(), true);
        assert!(ctx.is_current_thread());
        assert!(ctx.is_crashed_context());
        assert!(!ctx.can_have_cpu_state());
        assert!(!ctx.has_valid_exception_registers());
        assert!(ctx.registers().is_none());
        assert!(ctx.index_of_thread(current_thread()) >= 0);
        assert_eq!(ctx.index_of_thread(-5), -1);
        assert_eq!(ctx.thread_at_index(ctx.thread_count()), None);
    }

    #[test]
    fn test_reserved_threads() {
        assert!(add_reserved_thread(424242));
        assert!(add_reserved_thread(424242));
        assert!(is_reserved_thread(424242));
        remove_reserved_thread(424242);
        assert!(!is_reserved_thread(424242));
        assert!(!is_reserved_thread(0));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_thread_name() {
        std::thread::Builder::new()
            .name("capture-name".to_string())
            .spawn(|| {
                let name = thread_name(current_thread()).unwrap();
                // The kernel keeps 15 bytes.
                assert_eq!(name.as_str(), "capture-name");
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(parse_decimal(b"1234"), Some(1234));
        assert_eq!(parse_decimal(b"."), None);
    }
}
