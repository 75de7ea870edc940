// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stopping every other thread while a report is written.
//!
//! Linux has no "suspend thread" call, so each thread is sent a real-time signal with `tgkill`.
//! Its handler saves the interrupted registers into a preallocated slot, marks the slot parked
//! and sleeps until the handling thread releases it. The saved registers give the report a CPU
//! state for every thread, which the kernel would otherwise only expose to a tracer.
//!
//! Slot protocol, per thread:
//! `EMPTY -> SIGNALLED` (suspender) `-> CAPTURING -> PARKED` (target)
//! `-> RELEASED` (resumer) `-> EMPTY` (target acknowledges).
//! A target whose slot is not `SIGNALLED` when its handler runs returns at once.

use super::registers::Registers;
use super::{current_thread, is_reserved_thread, list_threads};
use crate::shared::constants::{DEFAULT_SUSPEND_TIMEOUT, MAX_CAPTURED_THREADS};
use crate::shared::log::{crash_debug, crash_warn};
use std::cell::UnsafeCell;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, AtomicUsize};
use std::time::Duration;

const EMPTY: u8 = 0;
const SIGNALLED: u8 = 1;
const CAPTURING: u8 = 2;
const PARKED: u8 = 3;
const RELEASED: u8 = 4;

struct ThreadSlot {
    tid: AtomicI32,
    state: AtomicU8,
    // Written by the target between CAPTURING and PARKED, read by others only once PARKED.
    registers: UnsafeCell<Registers>,
}

// SAFETY: `registers` is handed over through `state` as described above.
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            tid: AtomicI32::new(0),
            state: AtomicU8::new(EMPTY),
            registers: UnsafeCell::new(Registers::new()),
        }
    }
}

static SLOTS: [ThreadSlot; MAX_CAPTURED_THREADS] =
    [const { ThreadSlot::new() }; MAX_CAPTURED_THREADS];
static SLOTS_USED: AtomicUsize = AtomicUsize::new(0);
static SUSPEND_DEPTH: AtomicUsize = AtomicUsize::new(0);
// 0 until `init_suspension` installed the handler.
static SUSPEND_SIGNAL: AtomicI32 = AtomicI32::new(0);
static TIMEOUT_NANOS: AtomicU64 = AtomicU64::new(DEFAULT_SUSPEND_TIMEOUT.as_nanos() as u64);

/// Installs the handler of the suspension signal. Idempotent.
///
/// `signum` defaults to the first real-time signal that nobody handles yet.
pub fn init_suspension(signum: Option<i32>, timeout: Duration) -> anyhow::Result<()> {
    TIMEOUT_NANOS.store(timeout.as_nanos().min(u64::MAX as u128) as u64, SeqCst);
    if SUSPEND_SIGNAL.load(SeqCst) != 0 {
        return Ok(());
    }
    let signum = match signum {
        Some(signum) => signum,
        None => free_realtime_signal()?,
    };
    // nix only models the standard signals, so the real-time handler goes through libc.
    // SAFETY: the handler only touches atomics, its own slot and async-signal-safe calls.
    let installed = unsafe { install_handler(signum) };
    anyhow::ensure!(installed, "Unable to install the suspension handler on {signum}");
    SUSPEND_SIGNAL.store(signum, SeqCst);
    tracing::debug!(signum, "thread suspension ready");
    Ok(())
}

fn free_realtime_signal() -> anyhow::Result<i32> {
    for signum in libc::SIGRTMIN()..=libc::SIGRTMAX() {
        // SAFETY: querying only, `old` is a valid out pointer.
        let (rc, old) = unsafe {
            let mut old: libc::sigaction = std::mem::zeroed();
            (libc::sigaction(signum, std::ptr::null(), &mut old), old)
        };
        if rc == 0 && old.sa_sigaction == libc::SIG_DFL {
            return Ok(signum);
        }
    }
    anyhow::bail!("No free real-time signal for thread suspension")
}

unsafe fn install_handler(signum: i32) -> bool {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handle_suspend_signal as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(signum, &action, std::ptr::null_mut()) == 0
}

extern "C" fn handle_suspend_signal(
    _signum: i32,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let errno_before = errno::errno();
    let me = current_thread();
    let used = SLOTS_USED.load(SeqCst);
    let Some(slot) = SLOTS[..used].iter().find(|slot| slot.tid.load(SeqCst) == me) else {
        return;
    };
    if slot
        .state
        .compare_exchange(SIGNALLED, CAPTURING, SeqCst, SeqCst)
        .is_err()
    {
        return;
    }
    // SAFETY: the CAPTURING state gives this thread exclusive access; `ucontext` comes from the
    // kernel.
    unsafe { *slot.registers.get() = Registers::from_raw_ucontext(ucontext) };
    slot.state.store(PARKED, SeqCst);
    while slot.state.load(SeqCst) == PARKED {
        nap();
    }
    slot.state.store(EMPTY, SeqCst);
    errno::set_errno(errno_before);
}

fn nap() {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 100_000,
    };
    // SAFETY: `ts` is valid; an early wakeup is harmless.
    unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
}

fn now_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime is async-signal-safe and `ts` is a valid out pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = now_nanos().saturating_add(TIMEOUT_NANOS.load(SeqCst));
    loop {
        if done() {
            return true;
        }
        if now_nanos() >= deadline {
            return false;
        }
        nap();
    }
}

/// Stops every thread except the caller and the reserved threads.
///
/// Threads that cannot be signalled or do not park before the timeout are skipped: a partial
/// snapshot beats none. Nested calls only count. Returns the number of parked threads.
pub fn suspend_environment() -> usize {
    if SUSPEND_DEPTH.fetch_add(1, SeqCst) > 0 {
        return 0;
    }
    let signum = SUSPEND_SIGNAL.load(SeqCst);
    if signum == 0 {
        crash_debug!("Thread suspension not initialized, continuing without it");
        return 0;
    }
    let me = current_thread();
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };
    let mut threads = [0 as libc::pid_t; MAX_CAPTURED_THREADS];
    let count = list_threads(&mut threads);

    let mut used = 0;
    for &tid in &threads[..count] {
        if tid == me || is_reserved_thread(tid) {
            continue;
        }
        let slot = &SLOTS[used];
        slot.tid.store(tid, SeqCst);
        slot.state.store(SIGNALLED, SeqCst);
        SLOTS_USED.store(used + 1, SeqCst);
        // SAFETY: plain syscall.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signum) };
        if rc != 0 {
            crash_warn!("Could not suspend thread {}: {}", tid, errno::errno());
            slot.state.store(EMPTY, SeqCst);
            slot.tid.store(0, SeqCst);
            continue;
        }
        used += 1;
    }
    SLOTS_USED.store(used, SeqCst);

    let all_parked = wait_until(|| {
        SLOTS[..used]
            .iter()
            .all(|slot| !matches!(slot.state.load(SeqCst), SIGNALLED | CAPTURING))
    });
    let parked = SLOTS[..used]
        .iter()
        .filter(|slot| slot.state.load(SeqCst) == PARKED)
        .count();
    if !all_parked {
        crash_warn!("Only {} of {} threads parked in time", parked, used);
    }
    parked
}

/// Restarts the threads stopped by the matching [`suspend_environment`].
pub fn resume_environment() {
    let depth = SUSPEND_DEPTH.load(SeqCst);
    if depth == 0 {
        crash_warn!("resume_environment called without a matching suspend");
        return;
    }
    if SUSPEND_DEPTH.fetch_sub(1, SeqCst) > 1 {
        return;
    }
    let used = SLOTS_USED.load(SeqCst);
    // A capture in progress finishes quickly; wait for it so the thread is not left parked.
    wait_until(|| SLOTS[..used].iter().all(|slot| slot.state.load(SeqCst) != CAPTURING));
    for slot in &SLOTS[..used] {
        let _ = slot.state.compare_exchange(SIGNALLED, EMPTY, SeqCst, SeqCst);
        let _ = slot.state.compare_exchange(PARKED, RELEASED, SeqCst, SeqCst);
    }
    let acknowledged =
        wait_until(|| SLOTS[..used].iter().all(|slot| slot.state.load(SeqCst) != RELEASED));
    if !acknowledged {
        crash_warn!("Some threads did not acknowledge their release");
    }
    SLOTS_USED.store(0, SeqCst);
    for slot in &SLOTS[..used] {
        slot.tid.store(0, SeqCst);
    }
}

/// Current nesting of [`suspend_environment`] calls.
pub fn suspend_depth() -> usize {
    SUSPEND_DEPTH.load(SeqCst)
}

/// Registers a parked thread saved when it received the suspension signal.
pub fn captured_registers(tid: libc::pid_t) -> Option<Registers> {
    let used = SLOTS_USED.load(SeqCst);
    SLOTS[..used]
        .iter()
        .find(|slot| slot.tid.load(SeqCst) == tid && slot.state.load(SeqCst) == PARKED)
        // SAFETY: PARKED means the target finished writing and waits.
        .map(|slot| unsafe { *slot.registers.get() })
}

/// Suspends the environment for as long as it lives.
///
/// Every capture path holds one of these so that an early return still resumes the threads.
#[must_use]
pub struct SuspendedEnvironment {
    _private: (),
}

impl SuspendedEnvironment {
    pub fn new() -> Self {
        suspend_environment();
        Self { _private: () }
    }

    /// Only suspends when `suspend` is set; dropping the result still pairs correctly.
    pub fn new_if(suspend: bool) -> Option<Self> {
        suspend.then(Self::new)
    }
}

impl Default for SuspendedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuspendedEnvironment {
    fn drop(&mut self) {
        resume_environment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Mutex};

    // Suspension is process wide, serialize the tests touching it.
    static LOCK: Mutex<()> = Mutex::new(());

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_suspend_resume_symmetry() {
        let _guard = LOCK.lock().unwrap();
        let before = suspend_depth();
        {
            let _outer = SuspendedEnvironment::new();
            assert_eq!(suspend_depth(), before + 1);
            {
                let _inner = SuspendedEnvironment::new();
                assert_eq!(suspend_depth(), before + 2);
            }
            let skipped = SuspendedEnvironment::new_if(false);
            assert!(skipped.is_none());
            assert_eq!(suspend_depth(), before + 1);
        }
        assert_eq!(suspend_depth(), before);

        // Early return paths release through the guard too.
        fn capture(fail: bool) -> Result<(), ()> {
            let _env = SuspendedEnvironment::new();
            if fail {
                return Err(());
            }
            Ok(())
        }
        assert!(capture(true).is_err());
        assert!(capture(false).is_ok());
        assert_eq!(suspend_depth(), before);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_worker_thread_is_parked_and_released() -> anyhow::Result<()> {
        let _guard = LOCK.lock().unwrap();
        init_suspension(None, Duration::from_secs(2))?;

        let stop = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicUsize::new(0));
        let tid = Arc::new(AtomicI32::new(0));
        let worker = {
            let (stop, ticks, tid) = (stop.clone(), ticks.clone(), tid.clone());
            std::thread::spawn(move || {
                tid.store(current_thread(), SeqCst);
                while !stop.load(SeqCst) {
                    ticks.fetch_add(1, SeqCst);
                    std::hint::spin_loop();
                }
            })
        };
        while tid.load(SeqCst) == 0 {
            std::thread::yield_now();
        }

        let parked = suspend_environment();
        assert!(parked >= 1);
        let regs = captured_registers(tid.load(SeqCst));
        assert!(regs.is_some_and(|r| r.stack_pointer() != 0));
        let frozen = ticks.load(SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(SeqCst), frozen);
        resume_environment();

        assert!(captured_registers(tid.load(SeqCst)).is_none());
        while ticks.load(SeqCst) == frozen {
            std::thread::yield_now();
        }
        stop.store(true, SeqCst);
        worker.join().unwrap();
        Ok(())
    }
}
