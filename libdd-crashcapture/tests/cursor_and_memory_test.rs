// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]

use libdd_crashcapture::memory::{copy_max_possible, copy_safely, is_memory_readable};
use libdd_crashcapture::stack_cursor::StackCursor;

fn count_frames(cursor: &mut StackCursor<'_>) -> usize {
    let mut count = 0;
    while cursor.advance() {
        count += 1;
    }
    count
}

#[test]
fn test_backtrace_cursor_yields_every_address_once() {
    let addresses = [0x4010_usize, 0x4020, 0x4030, 0x4040, 0x4050];
    let mut cursor = StackCursor::with_backtrace(&addresses, 0);
    let mut seen = vec![];
    while cursor.advance() {
        seen.push(cursor.entry().address);
        assert_eq!(cursor.depth(), seen.len());
    }
    assert_eq!(seen, addresses);
    assert!(!cursor.advance(), "exhausted cursors stay exhausted");

    cursor.reset();
    assert_eq!(count_frames(&mut cursor), addresses.len());
}

#[test]
fn test_backtrace_cursor_skips_and_filters_sentinel() {
    let addresses = [0x4010_usize, 0x4020, 0x4030, 0x1];
    assert_eq!(count_frames(&mut StackCursor::with_backtrace(&addresses, 0)), 3);
    assert_eq!(count_frames(&mut StackCursor::with_backtrace(&addresses, 2)), 1);
    assert_eq!(count_frames(&mut StackCursor::with_backtrace(&addresses, 10)), 0);
    assert_eq!(count_frames(&mut StackCursor::with_backtrace(&[], 0)), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_self_thread_cursor_symbolicates_best_effort() {
    let mut cursor = StackCursor::with_self_thread(0);
    let mut frames = 0;
    while cursor.advance() {
        frames += 1;
        // Failing to resolve a frame leaves its fields empty rather than erroring.
        let _ = cursor.symbolicate();
        assert_ne!(cursor.entry().address, 0);
    }
    assert!(frames > 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_safe_copy_of_unmapped_memory_fails() {
    let mut buf = [0u8; 64];
    assert!(!copy_safely(0x10, &mut buf));
    assert!(!is_memory_readable(0x10, 8));

    let page = page_size::get();
    // SAFETY: anonymous private mapping, unmapped below.
    let guard = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            page,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(guard, libc::MAP_FAILED);
    assert!(!copy_safely(guard as usize, &mut buf));
    assert_eq!(copy_max_possible(guard as usize, &mut buf), 0);
    // SAFETY: mapped above.
    unsafe { libc::munmap(guard, page) };
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_safe_copy_of_readable_memory() {
    let source = *b"notable string\0";
    let mut buf = [0u8; 15];
    assert!(copy_safely(source.as_ptr() as usize, &mut buf));
    assert_eq!(buf, source);
    assert!(is_memory_readable(source.as_ptr() as usize, source.len()));
}
