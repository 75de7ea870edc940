// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal POSIX signals.
//!
//! The handler runs on the faulting thread, possibly on the alternate signal stack, with the
//! heap and any lock in an unknown state. It only uses the async-signal-safe functions listed in
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>:
//! - getpid, gettid (thread list and suspension)
//! - open, read, getdents64, close (`/proc/self/task`)
//! - tgkill, raise
//! - sigaction
//! - write, rename, unlink (the report)

use super::context::EventIdSlot;
use super::dispatch::dispatcher;
use super::{Monitor, MonitorContext, MonitorType, SignalInfo};
use crate::machine_context::{current_thread, MachineContext, SuspendedEnvironment};
use crate::shared::constants::SIGNAL_STACK_DEPTH;
use crate::shared::log::{crash_debug, crash_error};
use crate::sig_info::{signal_from_signum, FATAL_SIGNALS};
use crate::stack_cursor::StackCursor;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

pub(crate) struct SignalMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: SignalMonitor = SignalMonitor {
    enabled: AtomicBool::new(false),
};

static EVENT_ID: EventIdSlot = EventIdSlot::new();
static CREATE_ALT_STACK: AtomicBool = AtomicBool::new(false);
static USE_ALT_STACK: AtomicBool = AtomicBool::new(true);
static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

/// The actions that were in place before ours, one per entry of [`FATAL_SIGNALS`].
///
/// Written only while installing, under the single-writer discipline of the dispatcher; read
/// by the handler to chain. Entries outlive uninstallation so a handler already running can
/// still chain after the previous actions are back in place.
struct PreviousActions(UnsafeCell<[Option<SigAction>; FATAL_SIGNALS.len()]>);

// SAFETY: see the type documentation.
unsafe impl Sync for PreviousActions {}

static PREVIOUS_ACTIONS: PreviousActions =
    PreviousActions(UnsafeCell::new([None; FATAL_SIGNALS.len()]));

/// Chooses whether the next install creates and uses an alternate signal stack.
pub(crate) fn configure(create_alt_stack: bool, use_alt_stack: bool) {
    CREATE_ALT_STACK.store(create_alt_stack, SeqCst);
    USE_ALT_STACK.store(use_alt_stack, SeqCst);
}

impl Monitor for SignalMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SIGNAL
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        if enabled {
            EVENT_ID.regenerate();
            match install_handlers() {
                Ok(()) => self.enabled.store(true, SeqCst),
                Err(e) => crash_error!("Failed to install signal handlers: {e}"),
            }
        } else {
            self.enabled.store(false, SeqCst);
            uninstall_handlers();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, context: &mut MonitorContext<'_>) {
        if !context
            .crash_type
            .intersects(MonitorType::SIGNAL | MonitorType::KERNEL_EXCEPTION)
        {
            context.signal.signum = libc::SIGABRT;
        }
    }
}

fn install_handlers() -> anyhow::Result<()> {
    if CREATE_ALT_STACK.load(SeqCst) && !ALT_STACK_CREATED.load(SeqCst) {
        // SAFETY: no preconditions.
        unsafe { create_alt_stack()? };
        ALT_STACK_CREATED.store(true, SeqCst);
    }
    let extra_saflags = if USE_ALT_STACK.load(SeqCst) {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };
    let action = SigAction::new(
        SigHandler::SigAction(handle_signal),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    for (index, signum) in FATAL_SIGNALS.iter().enumerate() {
        crash_debug!("Assigning handler for signal {signum}");
        let installed = signal_from_signum(*signum)
            // SAFETY: `handle_signal` only performs async-signal-safe work.
            .and_then(|sig| Ok(unsafe { signal::sigaction(sig, &action) }?));
        match installed {
            // SAFETY: single writer, see `PreviousActions`.
            Ok(previous) => unsafe { (*PREVIOUS_ACTIONS.0.get())[index] = Some(previous) },
            Err(e) => {
                // Put back everything installed so far, newest first.
                restore_previous_actions(index);
                anyhow::bail!("sigaction for signal {signum} failed: {e}");
            }
        }
    }
    Ok(())
}

fn uninstall_handlers() {
    crash_debug!("Uninstalling signal handlers");
    restore_previous_actions(FATAL_SIGNALS.len());
}

/// Restores the saved action of the first `count` fatal signals.
fn restore_previous_actions(count: usize) {
    for index in (0..count).rev() {
        // SAFETY: single writer, see `PreviousActions`.
        let previous = unsafe { (*PREVIOUS_ACTIONS.0.get())[index] };
        let (Some(previous), Ok(sig)) = (previous, signal_from_signum(FATAL_SIGNALS[index])) else {
            continue;
        };
        // SAFETY: restoring an action the OS handed to us.
        if unsafe { signal::sigaction(sig, &previous) }.is_err() {
            crash_error!("Failed to restore the handler of signal {}", FATAL_SIGNALS[index]);
        }
    }
}

extern "C" fn handle_signal(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    crash_debug!("Trapped signal {signum}");
    if MONITOR.is_enabled() {
        capture(signum, sig_info, ucontext);
    }
    crash_debug!("Chaining signal {signum} to the previous handler");
    // SAFETY: arguments are the ones the kernel handed to us.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

fn capture(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let _suspended = SuspendedEnvironment::new();
    let dispatcher = dispatcher();
    dispatcher.notify_fatal_exception_captured(false);

    let mut machine_context = MachineContext::new();
    // SAFETY: `ucontext` is the handler's third argument.
    unsafe { machine_context.get_context_for_signal(ucontext) };
    let cursor = StackCursor::with_machine_context(&machine_context, SIGNAL_STACK_DEPTH);

    let (fault_address, sigcode) = if sig_info.is_null() {
        (0, 0)
    } else {
        // SAFETY: non-null `siginfo_t` provided by the kernel.
        unsafe { ((*sig_info).si_addr() as usize, (*sig_info).si_code) }
    };

    let mut context = MonitorContext::new(MonitorType::SIGNAL, EVENT_ID.get());
    context.offending_machine_context = Some(&machine_context);
    context.stack_cursor = Some(&cursor);
    context.registers_are_valid = true;
    context.fault_address = fault_address;
    context.signal = SignalInfo { signum, sigcode };
    if signum == libc::SIGABRT {
        context.crash_reason = super::panic::take_pending_panic(current_thread());
    }
    dispatcher.handle_exception(&mut context);
}

/// Hands the signal to whatever was installed before us.
///
/// # Safety
/// Only to be called from [`handle_signal`].
unsafe fn chain_signal_handler(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let Some(index) = FATAL_SIGNALS.iter().position(|s| *s == signum) else {
        crash_error!("Unexpected signal {signum}, cannot chain, aborting");
        libc::abort();
    };
    let (Some(previous), Ok(sig)) = ((*PREVIOUS_ACTIONS.0.get())[index], signal_from_signum(signum))
    else {
        crash_error!("Missing chain handler for {signum}, aborting");
        libc::abort();
    };
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    match previous.handler() {
        SigHandler::SigDfl => {
            // Restore the default so the re-raised signal terminates the process (and dumps
            // core) with the expected status. A fault re-triggers on return anyway.
            if signal::sigaction(sig, &previous).is_err() {
                libc::abort();
            }
            libc::raise(signum);
        }
        SigHandler::SigIgn => (),
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The report writer walks every thread and formats on the stack: give it 64 pages.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 64 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_abort_is_implied_for_other_monitors() {
        let mut context = MonitorContext::new(MonitorType::LANGUAGE_EXCEPTION, Uuid::nil());
        MONITOR.add_contextual_info(&mut context);
        assert_eq!(context.signal.signum, libc::SIGABRT);

        let mut context = MonitorContext::new(MonitorType::SIGNAL, Uuid::nil());
        context.signal.signum = libc::SIGSEGV;
        MONITOR.add_contextual_info(&mut context);
        assert_eq!(context.signal.signum, libc::SIGSEGV);
    }
}
