// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracking of recently freed objects, so a crash on a dangling pointer can name what used to
//! live there.
//!
//! The cache is a fixed table of [`CACHE_SIZE`] slots indexed by a hash of the address; a newer
//! deallocation simply overwrites an older one in the same slot. All of it is lock-free, so the
//! report writer can query it from inside a crash handler. Entries are best effort: a reader
//! racing a writer may see a stale type name.

use super::{Monitor, MonitorContext, MonitorType, ZombieException};
use crate::shared::constants::MAX_CAPTURED_TEXT;
use crate::shared::fixed_string::FixedString;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};

pub const CACHE_SIZE: usize = 0x1000;
const HASH_MASK: usize = CACHE_SIZE - 1;

/// A type whose deallocations are tracked. Declare one `static` per tracked type.
#[derive(Debug)]
pub struct TrackedType {
    name: &'static str,
}

impl TrackedType {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

struct Slot {
    address: AtomicUsize,
    tracked: AtomicPtr<TrackedType>,
}

struct ZombieCache {
    slots: [Slot; CACHE_SIZE],
}

impl ZombieCache {
    const fn new() -> Self {
        Self {
            slots: [const {
                Slot {
                    address: AtomicUsize::new(0),
                    tracked: AtomicPtr::new(ptr::null_mut()),
                }
            }; CACHE_SIZE],
        }
    }

    fn slot(&self, address: usize) -> &Slot {
        // Allocations are at least 16-byte aligned: the low bits carry no information.
        &self.slots[(address >> 4) & HASH_MASK]
    }

    fn insert(&self, address: usize, tracked: &'static TrackedType) {
        let slot = self.slot(address);
        slot.address.store(0, SeqCst);
        slot.tracked
            .store(tracked as *const TrackedType as *mut TrackedType, SeqCst);
        slot.address.store(address, SeqCst);
    }

    fn type_name(&self, address: usize) -> Option<&'static str> {
        if address == 0 {
            return None;
        }
        let slot = self.slot(address);
        if slot.address.load(SeqCst) != address {
            return None;
        }
        let tracked = slot.tracked.load(SeqCst);
        // SAFETY: only `&'static TrackedType` are ever stored.
        (!tracked.is_null()).then(|| unsafe { (*tracked).name })
    }

    fn clear(&self) {
        for slot in &self.slots {
            slot.address.store(0, SeqCst);
            slot.tracked.store(ptr::null_mut(), SeqCst);
        }
    }
}

/// The last exception object freed, guarded by a sequence counter: odd while a write is in
/// progress. Readers retry a few times and give up rather than wait.
struct LastException {
    sequence: AtomicU64,
    writing: AtomicBool,
    value: UnsafeCell<ZombieException>,
}

// SAFETY: writers are serialized by `writing`; readers validate their copy with `sequence`.
unsafe impl Sync for LastException {}

impl LastException {
    const fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            writing: AtomicBool::new(false),
            value: UnsafeCell::new(ZombieException {
                address: 0,
                name: FixedString::new(),
                reason: FixedString::new(),
            }),
        }
    }

    fn store(&self, address: usize, name: &str, reason: &str) {
        if self.writing.swap(true, SeqCst) {
            // Another deallocation is being recorded: keep that one.
            return;
        }
        self.sequence.fetch_add(1, SeqCst);
        // SAFETY: `writing` gives us exclusive write access.
        unsafe {
            let value = &mut *self.value.get();
            value.address = address;
            value.name = FixedString::from_str_truncated(name);
            value.reason = FixedString::<MAX_CAPTURED_TEXT>::from_str_truncated(reason);
        }
        self.sequence.fetch_add(1, SeqCst);
        self.writing.store(false, SeqCst);
    }

    fn load(&self) -> Option<ZombieException> {
        for _ in 0..8 {
            let before = self.sequence.load(SeqCst);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: a torn copy is detected by the sequence check below and discarded.
            let copy = unsafe { ptr::read_volatile(self.value.get()) };
            if self.sequence.load(SeqCst) == before {
                return (copy.address != 0).then_some(copy);
            }
        }
        None
    }
}

static CACHE: ZombieCache = ZombieCache::new();
static LAST_EXCEPTION: LastException = LastException::new();

pub(crate) struct ZombieMonitor {
    enabled: AtomicBool,
}

pub(crate) static MONITOR: ZombieMonitor = ZombieMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for ZombieMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::ZOMBIE
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled && !self.enabled.load(SeqCst) {
            CACHE.clear();
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, context: &mut MonitorContext<'_>) {
        context.zombie_exception = LAST_EXCEPTION.load();
    }
}

/// Records that the object of type `tracked` at `address` was just freed.
pub fn record_deallocation(address: usize, tracked: &'static TrackedType) {
    if MONITOR.is_enabled() && address != 0 {
        CACHE.insert(address, tracked);
    }
}

/// Records a freed exception object, reported under `process.last_dealloced_nsexception`.
pub fn record_exception_deallocation(address: usize, name: &str, reason: &str) {
    if MONITOR.is_enabled() && address != 0 {
        LAST_EXCEPTION.store(address, name, reason);
    }
}

/// Type name of the object last freed at `address`, if tracked.
pub fn zombie_type_name(address: usize) -> Option<&'static str> {
    if !MONITOR.is_enabled() {
        return None;
    }
    CACHE.type_name(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    static WIDGET: TrackedType = TrackedType::new("Widget");
    static GADGET: TrackedType = TrackedType::new("Gadget");

    #[test]
    fn test_cache_lookup_and_overwrite() {
        let cache = Box::new(ZombieCache::new());
        let address = 0x7f00_1230;
        cache.insert(address, &WIDGET);
        assert_eq!(cache.type_name(address), Some("Widget"));
        assert_eq!(cache.type_name(address + 16), None);
        assert_eq!(cache.type_name(0), None);

        // Same slot, different address: the newer entry wins.
        let colliding = address + CACHE_SIZE * 16;
        cache.insert(colliding, &GADGET);
        assert_eq!(cache.type_name(colliding), Some("Gadget"));
        assert_eq!(cache.type_name(address), None);

        cache.clear();
        assert_eq!(cache.type_name(colliding), None);
    }

    #[test]
    fn test_last_exception() {
        let last = Box::new(LastException::new());
        assert!(last.load().is_none());
        last.store(0xdead0, "NSInvalidArgumentException", "unrecognized selector");
        let loaded = last.load().unwrap();
        assert_eq!(loaded.address, 0xdead0);
        assert_eq!(loaded.name.as_str(), "NSInvalidArgumentException");
        assert_eq!(loaded.reason.as_str(), "unrecognized selector");
    }
}
