// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-tolerant reads of our own address space.
//!
//! Frame pointers, stack slots and introspected objects may point anywhere. Reading them through
//! `process_vm_readv(2)` on our own pid makes the kernel do the copy: an unmapped or protected
//! source yields `EFAULT` instead of a nested `SIGSEGV`. The call is a plain syscall and is safe
//! to use from a signal handler.

use std::mem::{size_of, MaybeUninit};

fn own_pid() -> libc::pid_t {
    // SAFETY: no preconditions.
    unsafe { libc::getpid() }
}

fn read_remote(src: usize, dst: &mut [u8]) -> isize {
    let local = libc::iovec {
        iov_base: dst.as_mut_ptr() as *mut libc::c_void,
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: src as *mut libc::c_void,
        iov_len: dst.len(),
    };
    // SAFETY: `local` describes a valid mutable slice; the kernel validates `remote`.
    unsafe { libc::process_vm_readv(own_pid(), &local, 1, &remote, 1, 0) }
}

/// Copies `dst.len()` bytes from `src`. Returns false, leaving `dst` in an unspecified state,
/// if any part of the source range is not readable.
pub fn copy_safely(src: usize, dst: &mut [u8]) -> bool {
    if dst.is_empty() {
        return true;
    }
    if src == 0 || src.checked_add(dst.len()).is_none() {
        return false;
    }
    read_remote(src, dst) == dst.len() as isize
}

/// Copies as many leading bytes from `src` as are readable, returning how many were copied.
///
/// Readability is decided per page, so the copy goes page by page and stops at the first
/// page that cannot be read.
pub fn copy_max_possible(src: usize, dst: &mut [u8]) -> usize {
    if dst.is_empty() || src == 0 {
        return 0;
    }
    let page = page_size::get();
    let len = dst.len().min(usize::MAX - src);
    let mut copied = 0;
    while copied < len {
        let at = src + copied;
        let to_page_end = page - (at % page);
        let chunk = to_page_end.min(len - copied);
        if !copy_safely(at, &mut dst[copied..copied + chunk]) {
            break;
        }
        copied += chunk;
    }
    copied
}

pub fn is_memory_readable(address: usize, len: usize) -> bool {
    let mut probe = [0u8; 64];
    let mut offset = 0;
    while offset < len {
        let chunk = (len - offset).min(probe.len());
        let Some(src) = address.checked_add(offset) else {
            return false;
        };
        if !copy_safely(src, &mut probe[..chunk]) {
            return false;
        }
        offset += chunk;
    }
    true
}

/// Reads a plain value of type `T` from `address`.
///
/// `T` must be valid for any bit pattern (integers and `#[repr(C)]` aggregates of them).
pub fn read_value<T: Copy>(address: usize) -> Option<T> {
    let mut value = MaybeUninit::<T>::zeroed();
    // SAFETY: the slice covers exactly the storage of `value`.
    let bytes =
        unsafe { std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>()) };
    if copy_safely(address, bytes) {
        // SAFETY: fully written and `T` accepts any bit pattern.
        Some(unsafe { value.assume_init() })
    } else {
        None
    }
}

pub fn read_usize(address: usize) -> Option<usize> {
    read_value::<usize>(address)
}
