// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::MAX_SELF_THREAD_FRAMES;

/// The calling thread's backtrace, captured once into inline storage.
#[derive(Clone)]
pub(crate) struct SelfThreadFrames {
    frames: [usize; MAX_SELF_THREAD_FRAMES],
    len: usize,
}

impl SelfThreadFrames {
    /// Captures the current backtrace, dropping the first `skip` frames.
    ///
    /// `capture` itself is always dropped.
    #[inline(never)]
    pub(crate) fn capture(skip: usize) -> Self {
        let mut this = Self {
            frames: [0; MAX_SELF_THREAD_FRAMES],
            len: 0,
        };
        let mut seen = 0;
        // SAFETY: no other thread unwinds through this storage; the unwinder does not allocate.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                seen += 1;
                if seen <= skip + 1 {
                    return true;
                }
                this.frames[this.len] = frame.ip() as usize;
                this.len += 1;
                this.len < MAX_SELF_THREAD_FRAMES
            });
        }
        this
    }

    pub(crate) fn addresses(&self) -> &[usize] {
        &self.frames[..self.len]
    }
}

impl std::fmt::Debug for SelfThreadFrames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfThreadFrames").field("len", &self.len).finish()
    }
}
