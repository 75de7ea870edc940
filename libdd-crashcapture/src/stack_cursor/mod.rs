// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Restartable iteration over the frames of one call stack.
//!
//! A [`StackCursor`] yields one [`StackEntry`] per [`StackCursor::advance`]. Three sources are
//! supported: a pre-captured address list, a [`MachineContext`] walked through its frame
//! pointers, and the calling thread's own backtrace. The first two never allocate and can be
//! built and walked inside a signal handler.

mod address_list;
mod frame_walker;
mod self_thread;

use crate::machine_context::MachineContext;
use address_list::AddressListWalker;
use frame_walker::FrameWalker;
use self_thread::SelfThreadFrames;
use std::ffi::CStr;

/// One resolved frame. Fields stay zero or `None` when symbolication fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackEntry {
    pub address: usize,
    pub image_address: usize,
    /// Path of the owning object, as returned by the dynamic loader.
    pub image_name: Option<&'static CStr>,
    pub symbol_address: usize,
    pub symbol_name: Option<&'static CStr>,
}

#[derive(Clone)]
enum Source<'a> {
    Backtrace(AddressListWalker<'a>),
    MachineContext(FrameWalker),
    SelfThread(Box<SelfThreadFrames>),
}

#[derive(Clone)]
pub struct StackCursor<'a> {
    entry: StackEntry,
    depth: usize,
    max_depth: usize,
    given_up: bool,
    source: Source<'a>,
}

impl std::fmt::Debug for StackCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackCursor")
            .field("entry", &self.entry)
            .field("depth", &self.depth)
            .field("max_depth", &self.max_depth)
            .field("given_up", &self.given_up)
            .finish()
    }
}

impl<'a> StackCursor<'a> {
    fn with_source(source: Source<'a>, max_depth: usize) -> Self {
        Self {
            entry: StackEntry::default(),
            depth: 0,
            max_depth,
            given_up: false,
            source,
        }
    }

    /// Iterates `addresses[skip..]`.
    pub fn with_backtrace(addresses: &'a [usize], skip: usize) -> Self {
        Self::with_source(
            Source::Backtrace(AddressListWalker::new(addresses, skip)),
            usize::MAX,
        )
    }

    /// Unwinds from the registers of `context`, giving up after `max_depth` frames.
    ///
    /// A context without CPU state yields no frames.
    pub fn with_machine_context(context: &MachineContext, max_depth: usize) -> Self {
        Self::with_source(
            Source::MachineContext(FrameWalker::new(context.registers())),
            max_depth,
        )
    }

    /// Captures the calling thread's stack now, dropping `skip` frames of the capture path.
    #[inline(never)]
    pub fn with_self_thread(skip: usize) -> StackCursor<'static> {
        // Boxed so cursors stay small; this path is never taken from a signal handler.
        let frames = Box::new(SelfThreadFrames::capture(skip + 1));
        StackCursor::with_source(Source::SelfThread(frames), usize::MAX)
    }

    /// Steps to the next frame. Returns false once the stack is exhausted or the depth limit is
    /// hit; the latter also sets [`StackCursor::has_given_up`].
    pub fn advance(&mut self) -> bool {
        if self.depth >= self.max_depth {
            self.given_up = true;
            return false;
        }
        let next = match &mut self.source {
            Source::Backtrace(walker) => walker.address_at(self.depth),
            Source::MachineContext(walker) => walker.next_address(),
            Source::SelfThread(frames) => frames.addresses().get(self.depth).copied(),
        };
        match next {
            Some(address) => {
                self.entry = StackEntry {
                    address,
                    ..StackEntry::default()
                };
                self.depth += 1;
                true
            }
            None => false,
        }
    }

    /// Restarts from the first frame.
    pub fn reset(&mut self) {
        self.entry = StackEntry::default();
        self.depth = 0;
        self.given_up = false;
        if let Source::MachineContext(walker) = &mut self.source {
            walker.reset();
        }
    }

    /// Fills image and symbol information of the current entry. Best effort: on failure the
    /// fields stay empty and false is returned.
    pub fn symbolicate(&mut self) -> bool {
        let address = self.lookup_address();
        if address == 0 {
            return false;
        }
        // SAFETY: `info` is a valid out pointer; dladdr does not dereference `address`.
        let (found, info) = unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            (libc::dladdr(address as *const libc::c_void, &mut info) != 0, info)
        };
        if !found {
            return false;
        }
        // SAFETY: the loader returns NUL-terminated strings that live as long as the image.
        unsafe {
            self.entry.image_address = info.dli_fbase as usize;
            self.entry.image_name =
                (!info.dli_fname.is_null()).then(|| CStr::from_ptr(info.dli_fname));
            self.entry.symbol_address = info.dli_saddr as usize;
            self.entry.symbol_name =
                (!info.dli_sname.is_null()).then(|| CStr::from_ptr(info.dli_sname));
        }
        true
    }

    /// Return addresses point after the call; look up the call instruction itself.
    fn lookup_address(&self) -> usize {
        let address = self.entry.address;
        let is_interrupted_instruction =
            self.depth == 1 && matches!(self.source, Source::MachineContext(_));
        if is_interrupted_instruction {
            address
        } else {
            address.saturating_sub(1)
        }
    }

    pub fn entry(&self) -> &StackEntry {
        &self.entry
    }

    /// Number of frames returned so far.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_given_up(&self) -> bool {
        self.given_up
    }
}
