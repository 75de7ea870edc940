// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-architecture register banks, filled from a signal `ucontext_t`.

#[cfg(target_arch = "x86_64")]
mod arch {
    use libc::{
        ucontext_t, REG_CR2, REG_CSGSFS, REG_EFL, REG_ERR, REG_R10, REG_R11, REG_R12, REG_R13,
        REG_R14, REG_R15, REG_R8, REG_R9, REG_RAX, REG_RBP, REG_RBX, REG_RCX, REG_RDI, REG_RDX,
        REG_RIP, REG_RSI, REG_RSP, REG_TRAPNO,
    };

    pub const REGISTER_NAMES: [&str; 21] = [
        "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip", "rflags", "cs", "fs", "gs",
    ];
    pub const EXCEPTION_REGISTER_NAMES: [&str; 3] = ["trapno", "err", "faultvaddr"];

    const GREG_ORDER: [libc::c_int; 18] = [
        REG_RAX, REG_RBX, REG_RCX, REG_RDX, REG_RDI, REG_RSI, REG_RBP, REG_RSP, REG_R8, REG_R9,
        REG_R10, REG_R11, REG_R12, REG_R13, REG_R14, REG_R15, REG_RIP, REG_EFL,
    ];

    pub(super) const IP: usize = 16;
    pub(super) const SP: usize = 7;
    pub(super) const FP: usize = 6;
    pub(super) const LR: Option<usize> = None;
    pub(super) const FAULT: usize = 2;

    pub(super) fn fill(uc: &ucontext_t, basic: &mut [u64], exception: &mut [u64]) {
        let gregs = &uc.uc_mcontext.gregs;
        for (slot, reg) in basic.iter_mut().zip(GREG_ORDER) {
            *slot = gregs[reg as usize] as u64;
        }
        // cs, gs and fs share one 64-bit slot, 16 bits each.
        let csgsfs = gregs[REG_CSGSFS as usize] as u64;
        basic[18] = csgsfs & 0xffff;
        basic[19] = (csgsfs >> 32) & 0xffff;
        basic[20] = (csgsfs >> 16) & 0xffff;

        exception[0] = gregs[REG_TRAPNO as usize] as u64;
        exception[1] = gregs[REG_ERR as usize] as u64;
        exception[2] = gregs[REG_CR2 as usize] as u64;
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use libc::ucontext_t;

    pub const REGISTER_NAMES: [&str; 34] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc", "cpsr",
    ];
    pub const EXCEPTION_REGISTER_NAMES: [&str; 1] = ["far"];

    pub(super) const IP: usize = 32;
    pub(super) const SP: usize = 31;
    pub(super) const FP: usize = 29;
    pub(super) const LR: Option<usize> = Some(30);
    pub(super) const FAULT: usize = 0;

    pub(super) fn fill(uc: &ucontext_t, basic: &mut [u64], exception: &mut [u64]) {
        let mc = &uc.uc_mcontext;
        // x0..x28, fp (x29), lr (x30)
        basic[..31].copy_from_slice(&mc.regs);
        basic[31] = mc.sp;
        basic[32] = mc.pc;
        basic[33] = mc.pstate;
        exception[0] = mc.fault_address;
    }
}

pub use arch::{EXCEPTION_REGISTER_NAMES, REGISTER_NAMES};

pub const REGISTER_COUNT: usize = REGISTER_NAMES.len();
pub const EXCEPTION_REGISTER_COUNT: usize = EXCEPTION_REGISTER_NAMES.len();

/// General purpose and exception registers of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    basic: [u64; REGISTER_COUNT],
    exception: [u64; EXCEPTION_REGISTER_COUNT],
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    pub const fn new() -> Self {
        Self {
            basic: [0; REGISTER_COUNT],
            exception: [0; EXCEPTION_REGISTER_COUNT],
        }
    }

    pub fn from_ucontext(uc: &libc::ucontext_t) -> Self {
        let mut regs = Self::new();
        arch::fill(uc, &mut regs.basic, &mut regs.exception);
        regs
    }

    /// Reads the registers saved in `ucontext`.
    ///
    /// # Safety
    /// `ucontext` must be null or point to the context handed to a `SA_SIGINFO` handler.
    pub unsafe fn from_raw_ucontext(ucontext: *const libc::c_void) -> Self {
        match (ucontext as *const libc::ucontext_t).as_ref() {
            Some(uc) => Self::from_ucontext(uc),
            None => Self::new(),
        }
    }

    pub fn basic(&self) -> &[u64] {
        &self.basic
    }

    pub fn exception(&self) -> &[u64] {
        &self.exception
    }

    pub fn instruction_address(&self) -> usize {
        self.basic[arch::IP] as usize
    }

    pub fn stack_pointer(&self) -> usize {
        self.basic[arch::SP] as usize
    }

    pub fn frame_pointer(&self) -> usize {
        self.basic[arch::FP] as usize
    }

    /// The return address register, on architectures that have one.
    pub fn link_register(&self) -> Option<usize> {
        arch::LR.map(|lr| self.basic[lr] as usize)
    }

    pub fn fault_address(&self) -> usize {
        self.exception[arch::FAULT] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_banks() {
        let regs = Registers::default();
        assert_eq!(regs.basic().len(), REGISTER_NAMES.len());
        assert_eq!(regs.exception().len(), EXCEPTION_REGISTER_NAMES.len());
        assert_eq!(regs.instruction_address(), 0);
        // SAFETY: null is accepted.
        assert_eq!(unsafe { Registers::from_raw_ucontext(std::ptr::null()) }, regs);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_from_ucontext_x86_64() {
        // SAFETY: ucontext_t is plain old data.
        let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x1000;
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7000;
        uc.uc_mcontext.gregs[libc::REG_RBP as usize] = 0x7010;
        uc.uc_mcontext.gregs[libc::REG_CR2 as usize] = 0xbad;
        uc.uc_mcontext.gregs[libc::REG_CSGSFS as usize] = 0x0000_0001_0002_0033;
        let regs = Registers::from_ucontext(&uc);
        assert_eq!(regs.instruction_address(), 0x1000);
        assert_eq!(regs.stack_pointer(), 0x7000);
        assert_eq!(regs.frame_pointer(), 0x7010);
        assert_eq!(regs.fault_address(), 0xbad);
        assert_eq!(regs.link_register(), None);
        // cs, fs, gs
        assert_eq!(&regs.basic()[18..], &[0x33, 0x1, 0x2]);
    }
}
