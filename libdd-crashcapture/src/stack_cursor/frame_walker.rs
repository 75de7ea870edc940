// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame-pointer unwinding from a captured register set.
//!
//! Both x86_64 and aarch64 keep a two-word record at the frame pointer: the caller's frame
//! pointer followed by the return address. Every record is read through
//! [`crate::memory::read_value`], so a corrupt chain ends the walk instead of faulting.

use crate::machine_context::Registers;
use crate::memory;
use std::mem::size_of;

/// The record a frame pointer points to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FrameRecord {
    previous: usize,
    return_address: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    InstructionPointer,
    LinkRegister,
    FrameChain,
    Done,
}

#[derive(Debug, Clone)]
pub(crate) struct FrameWalker {
    ip: usize,
    lr: Option<usize>,
    fp: usize,
    stage: Stage,
    next_fp: usize,
}

impl FrameWalker {
    pub(crate) fn new(registers: Option<&Registers>) -> Self {
        let (ip, lr, fp) = registers
            .map(|r| (r.instruction_address(), r.link_register(), r.frame_pointer()))
            .unwrap_or_default();
        Self {
            ip,
            lr,
            fp,
            stage: Stage::InstructionPointer,
            next_fp: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.stage = Stage::InstructionPointer;
        self.next_fp = 0;
    }

    /// Next return address, or `None` once the chain ends or looks corrupt.
    pub(crate) fn next_address(&mut self) -> Option<usize> {
        loop {
            match self.stage {
                Stage::InstructionPointer => {
                    self.stage = Stage::LinkRegister;
                    if self.ip == 0 {
                        self.stage = Stage::Done;
                        return None;
                    }
                    return Some(self.ip);
                }
                Stage::LinkRegister => {
                    self.stage = Stage::FrameChain;
                    self.next_fp = self.fp;
                    // A leaf function may not have saved lr in its frame record yet.
                    if let Some(lr) = self.lr.filter(|lr| *lr != 0) {
                        return Some(lr);
                    }
                }
                Stage::FrameChain => return self.follow_chain(),
                Stage::Done => return None,
            }
        }
    }

    fn follow_chain(&mut self) -> Option<usize> {
        let fp = self.next_fp;
        if fp == 0 || fp % size_of::<usize>() != 0 {
            self.stage = Stage::Done;
            return None;
        }
        let Some(record) = memory::read_value::<FrameRecord>(fp) else {
            self.stage = Stage::Done;
            return None;
        };
        // Callers live at higher addresses; anything else is a loop or garbage.
        if record.previous == 0 || record.return_address == 0 || record.previous <= fp {
            self.stage = Stage::Done;
            return None;
        }
        self.next_fp = record.previous;
        Some(record.return_address)
    }
}
