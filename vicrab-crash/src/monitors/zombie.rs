// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Use-after-free detection.
//!
//! Deallocations are fed to a fixed-size, lock-free table on the normal
//! path. Which deallocations get recorded is decided by a pluggable
//! [`ZombiePolicy`]; recording everything would cost a table write on every
//! `free`. At crash time, the faulting address is looked up in the table,
//! and a hit is attached to the crash context as a likely cause.
//!
//! Deallocations reach the table through [`ZombieAllocator`], a wrapper for
//! the process's global allocator, or through [`note_deallocation`] and
//! [`note_allocation`] called by a custom allocator.

use super::{Monitor, MonitorError, MonitorKind};
use crate::recording::{CrashContext, ZombieHit};
use crate::shared::configuration::{CrashMonitorConfiguration, ZombiePolicyKind};
use std::alloc::{GlobalAlloc, Layout};
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize};

/// Decides which deallocations the tracker remembers. Called on every
/// deallocation while the monitor is installed: it must not allocate and
/// must not block.
pub trait ZombiePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_track(&self, address: usize, size: usize) -> bool;
}

/// Tracks one deallocation out of `n`.
#[derive(Debug)]
pub struct EveryNth {
    n: u32,
    counter: AtomicU32,
}

impl EveryNth {
    pub const fn new(n: u32) -> Self {
        Self {
            n: if n == 0 { 1 } else { n },
            counter: AtomicU32::new(0),
        }
    }
}

impl ZombiePolicy for EveryNth {
    fn name(&self) -> &'static str {
        "every_nth"
    }

    fn should_track(&self, _address: usize, _size: usize) -> bool {
        self.counter.fetch_add(1, Relaxed) % self.n == 0
    }
}

/// Tracks every deallocation of at most this many bytes. Small objects are
/// the ones reused quickly enough for a dangling pointer to matter.
#[derive(Debug)]
pub struct SizeAtMost(pub usize);

impl ZombiePolicy for SizeAtMost {
    fn name(&self) -> &'static str {
        "size_at_most"
    }

    fn should_track(&self, _address: usize, size: usize) -> bool {
        size <= self.0
    }
}

pub fn policy_from_kind(kind: ZombiePolicyKind) -> Box<dyn ZombiePolicy> {
    match kind {
        ZombiePolicyKind::EveryNth(n) => Box::new(EveryNth::new(n)),
        ZombiePolicyKind::SizeAtMost(size) => Box::new(SizeAtMost(size)),
    }
}

const TABLE_SIZE: usize = 4096;

struct Entry {
    address: AtomicUsize,
    size: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ENTRY: Entry = Entry {
    address: AtomicUsize::new(0),
    size: AtomicUsize::new(0),
};

/// A direct-mapped table of recently freed blocks. Collisions overwrite: the
/// table only ever claims "this was freed recently", never the opposite.
pub struct ZombieTracker {
    entries: [Entry; TABLE_SIZE],
}

impl ZombieTracker {
    pub const fn new() -> Self {
        Self {
            entries: [EMPTY_ENTRY; TABLE_SIZE],
        }
    }

    fn slot(address: usize) -> usize {
        // Allocations are at least 16 byte aligned; mix the rest.
        let hash = (address >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize);
        (hash >> 20) % TABLE_SIZE
    }

    pub fn record_free(&self, policy: &dyn ZombiePolicy, address: usize, size: usize) {
        if address == 0 || !policy.should_track(address, size) {
            return;
        }
        let entry = &self.entries[Self::slot(address)];
        // Invalidate first so a concurrent lookup never pairs this address
        // with the previous occupant's size.
        entry.address.store(0, Release);
        entry.size.store(size, Release);
        entry.address.store(address, Release);
    }

    /// The block at `address` is live again.
    pub fn record_allocation(&self, address: usize) {
        let entry = &self.entries[Self::slot(address)];
        let _ = entry
            .address
            .compare_exchange(address, 0, Release, Relaxed);
    }

    /// The freed block containing `address`, if one is remembered.
    /// Async-signal-safe: a linear scan of atomics.
    pub fn find(&self, address: usize) -> Option<ZombieHit> {
        if address == 0 {
            return None;
        }
        self.entries.iter().find_map(|entry| {
            let start = entry.address.load(Acquire);
            let size = entry.size.load(Acquire);
            let hit = start != 0 && address >= start && address - start < size.max(1);
            hit.then_some(ZombieHit {
                address: start,
                size,
            })
        })
    }

    pub fn clear(&self) {
        for entry in &self.entries {
            entry.address.store(0, Relaxed);
            entry.size.store(0, Relaxed);
        }
    }
}

impl Default for ZombieTracker {
    fn default() -> Self {
        Self::new()
    }
}

static TRACKER: ZombieTracker = ZombieTracker::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);
/// Policies are leaked when replaced: a deallocation on another thread may
/// still be using the old one.
static POLICY: AtomicPtr<Box<dyn ZombiePolicy>> = AtomicPtr::new(ptr::null_mut());

/// Reports a deallocation to the zombie monitor. A no-op unless it is
/// installed.
pub fn note_deallocation(address: usize, size: usize) {
    if !INSTALLED.load(Relaxed) {
        return;
    }
    let policy = POLICY.load(Acquire);
    if policy.is_null() {
        return;
    }
    // SAFETY: published from a leaked Box in `install`, never freed.
    let policy: &dyn ZombiePolicy = unsafe { &**policy };
    TRACKER.record_free(policy, address, size);
}

/// Reports that the block at `address` was handed out again.
pub fn note_allocation(address: usize) {
    if INSTALLED.load(Relaxed) && address != 0 {
        TRACKER.record_allocation(address);
    }
}

/// A `GlobalAlloc` wrapper that feeds deallocations to the zombie monitor.
///
/// ```no_run
/// use std::alloc::System;
/// use vicrab_crash::monitors::ZombieAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: ZombieAllocator<System> = ZombieAllocator::new(System);
/// ```
pub struct ZombieAllocator<A> {
    inner: A,
}

impl<A> ZombieAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for ZombieAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        note_allocation(ptr as usize);
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        note_deallocation(ptr as usize, layout.size());
        self.inner.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        note_allocation(ptr as usize);
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() && new_ptr != ptr {
            note_deallocation(ptr as usize, layout.size());
            note_allocation(new_ptr as usize);
        }
        new_ptr
    }
}

pub(crate) struct ZombieMonitor;

pub(crate) static ZOMBIE_MONITOR: ZombieMonitor = ZombieMonitor;

impl Monitor for ZombieMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Zombie
    }

    fn install(&self, config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        if INSTALLED.load(SeqCst) {
            return Ok(());
        }
        let policy = policy_from_kind(config.zombie_policy());
        tracing::debug!(policy = policy.name(), "Zombie tracking enabled");
        POLICY.store(Box::into_raw(Box::new(policy)), Release);
        TRACKER.clear();
        INSTALLED.store(true, SeqCst);
        Ok(())
    }

    fn uninstall(&self) {
        INSTALLED.store(false, SeqCst);
    }

    fn is_installed(&self) -> bool {
        INSTALLED.load(SeqCst)
    }

    fn add_contextual_info(&self, context: &mut CrashContext<'_>) {
        if let Some(address) = context.fault_address() {
            context.zombie = TRACKER.find(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_nth() {
        let policy = EveryNth::new(4);
        let tracked = (0..16).filter(|_| policy.should_track(0x1000, 8)).count();
        assert_eq!(tracked, 4);
        // A period of zero is treated as one.
        let policy = EveryNth::new(0);
        assert!(policy.should_track(0x1000, 8));
        assert!(policy.should_track(0x1000, 8));
    }

    #[test]
    fn test_size_at_most() {
        let policy = SizeAtMost(64);
        assert!(policy.should_track(0x1000, 64));
        assert!(!policy.should_track(0x1000, 65));
    }

    #[test]
    fn test_tracker_finds_interior_addresses() {
        let tracker = ZombieTracker::new();
        let policy = SizeAtMost(usize::MAX);
        tracker.record_free(&policy, 0x5550_0000, 64);
        assert_eq!(
            tracker.find(0x5550_0010),
            Some(ZombieHit {
                address: 0x5550_0000,
                size: 64
            })
        );
        assert_eq!(tracker.find(0x5550_0040), None);
        assert_eq!(tracker.find(0), None);
    }

    #[test]
    fn test_reallocation_clears_entry() {
        let tracker = ZombieTracker::new();
        let policy = SizeAtMost(usize::MAX);
        tracker.record_free(&policy, 0x7000_0000, 32);
        tracker.record_allocation(0x7000_0000);
        assert_eq!(tracker.find(0x7000_0000), None);
    }

    #[test]
    fn test_policy_filters_records() {
        let tracker = ZombieTracker::new();
        tracker.record_free(&SizeAtMost(16), 0x8000_0000, 32);
        assert_eq!(tracker.find(0x8000_0000), None);
    }

    #[test]
    fn test_policy_from_kind() {
        assert_eq!(
            policy_from_kind(ZombiePolicyKind::EveryNth(3)).name(),
            "every_nth"
        );
        assert_eq!(
            policy_from_kind(ZombiePolicyKind::SizeAtMost(8)).name(),
            "size_at_most"
        );
    }
}
