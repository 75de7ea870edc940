// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal numbers and `si_code` values, and their names as written in reports.

/// Signals treated as fatal and trapped by the signal monitor.
pub const FATAL_SIGNALS: [libc::c_int; 8] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGPIPE,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGTRAP,
];

pub fn fatal_signals() -> &'static [libc::c_int] {
    &FATAL_SIGNALS
}

/// See <https://man7.org/linux/man-pages/man7/signal.7.html>
pub fn signal_name(signum: libc::c_int) -> Option<&'static str> {
    let name = match signum {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGSYS => "SIGSYS",
        _ => return None,
    };
    Some(name)
}

// These are defined in siginfo.h
// They are only derived here because there doesn't appear to be a crate that provides them in a
// comparable way.
pub mod siginfo_code {
    pub const SI_USER: i32 = 0;
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_QUEUE: i32 = -1;
    pub const SI_TIMER: i32 = -2;
    pub const SI_MESGQ: i32 = -3;
    pub const SI_ASYNCIO: i32 = -4;
    pub const SI_TKILL: i32 = -6;

    pub mod ill {
        pub const ILLOPC: i32 = 1;
        pub const ILLOPN: i32 = 2;
        pub const ILLADR: i32 = 3;
        pub const ILLTRP: i32 = 4;
        pub const PRVOPC: i32 = 5;
        pub const PRVREG: i32 = 6;
        pub const COPROC: i32 = 7;
        pub const BADSTK: i32 = 8;
    }

    pub mod fpe {
        pub const INTDIV: i32 = 1;
        pub const INTOVF: i32 = 2;
        pub const FLTDIV: i32 = 3;
        pub const FLTOVF: i32 = 4;
        pub const FLTUND: i32 = 5;
        pub const FLTRES: i32 = 6;
        pub const FLTINV: i32 = 7;
        pub const FLTSUB: i32 = 8;
    }

    pub mod segv {
        pub const MAPERR: i32 = 1;
        pub const ACCERR: i32 = 2;
    }

    pub mod bus {
        pub const ADRALN: i32 = 1;
        pub const ADRERR: i32 = 2;
        pub const OBJERR: i32 = 3;
    }

    pub mod trap {
        pub const BRKPT: i32 = 1;
        pub const TRACE: i32 = 2;
    }

    pub mod sys {
        pub const SECCOMP: i32 = 1;
    }
}

/// Names the `si_code` of `signum`, or `None` when the pair is not known.
pub fn signal_code_name(signum: libc::c_int, si_code: libc::c_int) -> Option<&'static str> {
    use siginfo_code::*;
    let specific = match signum {
        libc::SIGILL => match si_code {
            ill::ILLOPC => Some("ILL_ILLOPC"),
            ill::ILLOPN => Some("ILL_ILLOPN"),
            ill::ILLADR => Some("ILL_ILLADR"),
            ill::ILLTRP => Some("ILL_ILLTRP"),
            ill::PRVOPC => Some("ILL_PRVOPC"),
            ill::PRVREG => Some("ILL_PRVREG"),
            ill::COPROC => Some("ILL_COPROC"),
            ill::BADSTK => Some("ILL_BADSTK"),
            _ => None,
        },
        libc::SIGFPE => match si_code {
            fpe::INTDIV => Some("FPE_INTDIV"),
            fpe::INTOVF => Some("FPE_INTOVF"),
            fpe::FLTDIV => Some("FPE_FLTDIV"),
            fpe::FLTOVF => Some("FPE_FLTOVF"),
            fpe::FLTUND => Some("FPE_FLTUND"),
            fpe::FLTRES => Some("FPE_FLTRES"),
            fpe::FLTINV => Some("FPE_FLTINV"),
            fpe::FLTSUB => Some("FPE_FLTSUB"),
            _ => None,
        },
        libc::SIGSEGV => match si_code {
            segv::MAPERR => Some("SEGV_MAPERR"),
            segv::ACCERR => Some("SEGV_ACCERR"),
            _ => None,
        },
        libc::SIGBUS => match si_code {
            bus::ADRALN => Some("BUS_ADRALN"),
            bus::ADRERR => Some("BUS_ADRERR"),
            bus::OBJERR => Some("BUS_OBJERR"),
            _ => None,
        },
        libc::SIGTRAP => match si_code {
            trap::BRKPT => Some("TRAP_BRKPT"),
            trap::TRACE => Some("TRAP_TRACE"),
            _ => None,
        },
        libc::SIGSYS => match si_code {
            sys::SECCOMP => Some("SYS_SECCOMP"),
            _ => None,
        },
        _ => None,
    };
    specific.or(match si_code {
        SI_USER => Some("SI_USER"),
        SI_KERNEL => Some("SI_KERNEL"),
        SI_QUEUE => Some("SI_QUEUE"),
        SI_TIMER => Some("SI_TIMER"),
        SI_MESGQ => Some("SI_MESGQ"),
        SI_ASYNCIO => Some("SI_ASYNCIO"),
        SI_TKILL => Some("SI_TKILL"),
        _ => None,
    })
}

/// Converts a signum into a Signal.  Can't use the from trait because we don't own either type.
pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
    Ok(nix::sys::signal::Signal::try_from(value)?)
}
