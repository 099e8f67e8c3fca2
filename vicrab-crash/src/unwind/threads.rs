// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Freezing the other threads of the process so their stacks can be walked
//! while the capture is in progress.
//!
//! The platform layer is injected through [`ThreadSuspender`]. Linux has no
//! way to stop a sibling thread from inside the process, so each thread is
//! sent a real-time signal whose handler publishes its own registers and
//! parks until released. macOS stops threads directly with
//! `thread_suspend` and reads their state with `thread_get_state`.

use super::MachineContext;
use crate::recording_tools::FixedBuf;
use crate::shared::timeout::TimeoutManager;

pub const MAX_THREADS: usize = 256;

/// What the capture knows about one thread.
#[derive(Clone, Copy)]
pub struct ThreadSnapshot {
    /// Kernel thread id on Linux, `pthread_threadid_np` on macOS.
    pub tid: u64,
    /// Platform handle used to resume the thread (Mach port on macOS).
    pub handle: u64,
    pub name: FixedBuf<64>,
    /// Registers at the moment the thread was stopped. Empty if the thread
    /// could not be stopped in time.
    pub context: MachineContext,
}

impl ThreadSnapshot {
    pub const fn new(tid: u64) -> Self {
        Self {
            tid,
            handle: tid,
            name: FixedBuf::new(),
            context: MachineContext::empty(),
        }
    }
}

/// A fixed-capacity table of snapshots, sized to live in static memory.
pub struct ThreadTable {
    entries: [ThreadSnapshot; MAX_THREADS],
    len: usize,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            entries: [ThreadSnapshot::new(0); MAX_THREADS],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// `false` when the table is full; the snapshot is dropped.
    pub fn push(&mut self, snapshot: ThreadSnapshot) -> bool {
        if self.len == MAX_THREADS {
            return false;
        }
        self.entries[self.len] = snapshot;
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadSnapshot> {
        self.entries[..self.len].iter()
    }

    pub fn find(&self, tid: u64) -> Option<&ThreadSnapshot> {
        self.iter().find(|snapshot| snapshot.tid == tid)
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops and restarts every other thread of the process.
///
/// `prepare` and `release` run in normal context at install and uninstall.
/// `suspend_all` and `resume_all` run inside the capture window and must
/// stick to async-signal-safe operations.
pub trait ThreadSuspender: Sync {
    fn name(&self) -> &'static str;

    fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release(&self) {}

    /// Stops every thread except the caller and records one snapshot per
    /// thread into `table`. Threads that do not stop before the timeout are
    /// recorded without registers. Returns the number of snapshots.
    fn suspend_all(&self, table: &mut ThreadTable, timeout: &TimeoutManager) -> usize;

    /// Restarts everything `suspend_all` stopped.
    fn resume_all(&self, table: &ThreadTable);
}

/// Captures nothing. Used when suspension is disabled or unsupported.
#[derive(Debug, Default)]
pub struct NoopSuspender;

impl ThreadSuspender for NoopSuspender {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn suspend_all(&self, _table: &mut ThreadTable, _timeout: &TimeoutManager) -> usize {
        0
    }

    fn resume_all(&self, _table: &ThreadTable) {}
}

/// The suspender for the current platform.
pub fn default_suspender() -> &'static dyn ThreadSuspender {
    #[cfg(target_os = "linux")]
    {
        &linux::SignalSuspender
    }
    #[cfg(target_os = "macos")]
    {
        &macos::MachSuspender
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        &NoopSuspender
    }
}

/// The id of the calling thread, as recorded in [`ThreadSnapshot::tid`].
pub fn current_tid() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
    #[cfg(target_os = "macos")]
    {
        let mut tid = 0u64;
        // SAFETY: a null thread means the calling thread.
        unsafe { libc::pthread_threadid_np(0, &mut tid) };
        tid
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        0
    }
}

/// Reads the name of thread `tid` into `name`, leaving it empty when the
/// platform cannot tell. Async-signal-safe.
pub fn thread_name(tid: u64, name: &mut FixedBuf<64>) {
    #[cfg(target_os = "linux")]
    linux::read_thread_name(tid, name);
    #[cfg(not(target_os = "linux"))]
    if tid == current_tid() {
        let mut buf = [0 as libc::c_char; 64];
        // SAFETY: the buffer is large enough and nul terminated on success.
        let rval =
            unsafe { libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), buf.len()) };
        if rval == 0 {
            let bytes = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }.to_bytes();
            name.set_lossy(bytes);
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) mod linux {
    use super::*;
    use crate::recording_tools::{read_file_into, CPath};
    use crate::shared::timeout::signal_safe_sleep;
    use std::cell::UnsafeCell;
    use std::sync::atomic::Ordering::{Acquire, Release, SeqCst};
    use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8};
    use std::time::Duration;

    /// Offset above `SIGRTMIN` of the signal used to park threads.
    const SUSPEND_SIGNAL_OFFSET: libc::c_int = 3;
    /// A parked thread gives up after this long, so a capture that died
    /// half way cannot freeze the process forever.
    const MAX_PARK_TIME: Duration = Duration::from_secs(30);
    const PARK_POLL: Duration = Duration::from_millis(1);

    const SLOT_EMPTY: u8 = 0;
    const SLOT_REQUESTED: u8 = 1;
    const SLOT_PARKED: u8 = 2;
    const SLOT_RELEASED: u8 = 3;

    struct ParkSlot {
        tid: AtomicU64,
        state: AtomicU8,
        context: UnsafeCell<MachineContext>,
    }

    // SAFETY: `context` is written by the parked thread before it publishes
    // SLOT_PARKED with release ordering, and read by the capturing thread
    // only after observing SLOT_PARKED with acquire ordering.
    unsafe impl Sync for ParkSlot {}

    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY_SLOT: ParkSlot = ParkSlot {
        tid: AtomicU64::new(0),
        state: AtomicU8::new(SLOT_EMPTY),
        context: UnsafeCell::new(MachineContext::empty()),
    };
    static SLOTS: [ParkSlot; MAX_THREADS] = [EMPTY_SLOT; MAX_THREADS];
    static PREPARED: AtomicBool = AtomicBool::new(false);
    static PREVIOUS_ACTION: AtomicPtr<libc::sigaction> = AtomicPtr::new(std::ptr::null_mut());

    fn suspend_signal() -> libc::c_int {
        libc::SIGRTMIN() + SUSPEND_SIGNAL_OFFSET
    }

    pub struct SignalSuspender;

    impl ThreadSuspender for SignalSuspender {
        fn name(&self) -> &'static str {
            "signal"
        }

        fn prepare(&self) -> anyhow::Result<()> {
            if PREPARED.swap(true, SeqCst) {
                return Ok(());
            }
            let signum = suspend_signal();
            // nix has no `Signal` for real-time signals, so use libc directly.
            // SAFETY: installs a handler for a real-time signal reserved for
            // parking threads; the previous disposition is kept for release.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = park_handler as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);
                let mut previous: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(signum, &action, &mut previous) != 0 {
                    PREPARED.store(false, SeqCst);
                    anyhow::bail!(
                        "Unable to install the thread park handler on signal {signum}: {}",
                        std::io::Error::last_os_error()
                    );
                }
                let old = PREVIOUS_ACTION.swap(Box::into_raw(Box::new(previous)), SeqCst);
                if !old.is_null() {
                    drop(Box::from_raw(old));
                }
            }
            Ok(())
        }

        fn release(&self) {
            if !PREPARED.swap(false, SeqCst) {
                return;
            }
            let previous = PREVIOUS_ACTION.swap(std::ptr::null_mut(), SeqCst);
            if previous.is_null() {
                return;
            }
            // SAFETY: only ever set from a Box in `prepare`; restores the
            // disposition that was there before.
            unsafe {
                let previous = Box::from_raw(previous);
                libc::sigaction(suspend_signal(), &*previous, std::ptr::null_mut());
            }
        }

        fn suspend_all(&self, table: &mut ThreadTable, timeout: &TimeoutManager) -> usize {
            if !PREPARED.load(SeqCst) {
                return 0;
            }
            let me = current_tid();
            // SAFETY: getpid has no preconditions.
            let pid = unsafe { libc::getpid() };
            let mut requested = 0;
            for_each_task(|tid| {
                if tid == me || requested == MAX_THREADS {
                    return;
                }
                let slot = &SLOTS[requested];
                slot.tid.store(tid, SeqCst);
                slot.state.store(SLOT_REQUESTED, SeqCst);
                // SAFETY: tgkill is async-signal-safe and has no memory
                // preconditions.
                let rval = unsafe {
                    libc::syscall(libc::SYS_tgkill, pid, tid as libc::pid_t, suspend_signal())
                };
                if rval != 0 {
                    // The thread exited in the meantime.
                    slot.state.store(SLOT_EMPTY, SeqCst);
                    return;
                }
                requested += 1;
            });

            while !timeout.expired()
                && SLOTS[..requested]
                    .iter()
                    .any(|slot| slot.state.load(Acquire) == SLOT_REQUESTED)
            {
                signal_safe_sleep(PARK_POLL);
            }

            for slot in &SLOTS[..requested] {
                let tid = slot.tid.load(SeqCst);
                let mut snapshot = ThreadSnapshot::new(tid);
                read_thread_name(tid, &mut snapshot.name);
                if slot.state.load(Acquire) == SLOT_PARKED {
                    // SAFETY: see `ParkSlot`.
                    snapshot.context = unsafe { *slot.context.get() };
                }
                table.push(snapshot);
            }
            table.len()
        }

        fn resume_all(&self, _table: &ThreadTable) {
            for slot in SLOTS.iter() {
                let state = slot.state.load(SeqCst);
                if state == SLOT_PARKED || state == SLOT_REQUESTED {
                    slot.state.store(SLOT_RELEASED, Release);
                }
            }
        }
    }

    extern "C" fn park_handler(
        _signum: libc::c_int,
        _sig_info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        let saved_errno = errno::errno();
        let me = current_tid();
        let Some(slot) = SLOTS
            .iter()
            .find(|slot| slot.tid.load(SeqCst) == me && slot.state.load(SeqCst) == SLOT_REQUESTED)
        else {
            // A late delivery after the capture gave up on us.
            errno::set_errno(saved_errno);
            return;
        };
        // SAFETY: the kernel hands us our own context; the slot is ours
        // until we publish SLOT_PARKED.
        unsafe {
            *slot.context.get() =
                MachineContext::from_ucontext(ucontext as *const libc::ucontext_t)
                    .unwrap_or(MachineContext::empty());
        }
        slot.state.store(SLOT_PARKED, Release);
        let park = TimeoutManager::new(MAX_PARK_TIME);
        while slot.state.load(Acquire) == SLOT_PARKED && !park.expired() {
            signal_safe_sleep(PARK_POLL);
        }
        errno::set_errno(saved_errno);
    }

    /// Calls `f` with each thread id listed in `/proc/self/task`.
    pub(crate) fn for_each_task(mut f: impl FnMut(u64)) {
        let Some(path) = CPath::from_fmt(format_args!("/proc/self/task")) else {
            return;
        };
        let fd = path.open(libc::O_RDONLY | libc::O_DIRECTORY);
        if fd < 0 {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            // SAFETY: the buffer outlives the call.
            let read = unsafe {
                libc::syscall(
                    libc::SYS_getdents64,
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if read <= 0 {
                break;
            }
            let read = read as usize;
            let mut offset = 0;
            // struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen;
            //                         u8 d_type; char d_name[]; }
            while offset + 19 <= read {
                let reclen = u16::from_ne_bytes([buf[offset + 16], buf[offset + 17]]) as usize;
                if reclen == 0 || offset + reclen > read {
                    break;
                }
                let name = &buf[offset + 19..offset + reclen];
                let name = &name[..name.iter().position(|b| *b == 0).unwrap_or(name.len())];
                if let Some(tid) = parse_decimal(name) {
                    f(tid);
                }
                offset += reclen;
            }
        }
        // SAFETY: fd was opened above.
        unsafe { libc::close(fd) };
    }

    fn parse_decimal(digits: &[u8]) -> Option<u64> {
        if digits.is_empty() {
            return None;
        }
        digits.iter().try_fold(0u64, |acc, b| {
            if b.is_ascii_digit() {
                acc.checked_mul(10)?.checked_add((b - b'0') as u64)
            } else {
                None
            }
        })
    }

    /// Reads `/proc/self/task/<tid>/comm` without allocating.
    pub(crate) fn read_thread_name(tid: u64, name: &mut FixedBuf<64>) {
        let Some(path) = CPath::from_fmt(format_args!("/proc/self/task/{tid}/comm")) else {
            return;
        };
        let mut buf = [0u8; 64];
        let len = read_file_into(&path, &mut buf);
        let text = &buf[..len];
        let text = text.strip_suffix(b"\n").unwrap_or(text);
        name.set_lossy(text);
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_decimal() {
            assert_eq!(parse_decimal(b"1234"), Some(1234));
            assert_eq!(parse_decimal(b"."), None);
            assert_eq!(parse_decimal(b""), None);
        }

        #[test]
        #[cfg_attr(miri, ignore)]
        fn test_for_each_task_sees_current_thread() {
            let me = current_tid();
            let mut found = false;
            for_each_task(|tid| found |= tid == me);
            assert!(found);
        }

        #[test]
        #[cfg_attr(miri, ignore)]
        fn test_read_thread_name() {
            let handle = std::thread::Builder::new()
                .name("vicrab-name".to_string())
                .spawn(|| {
                    let mut name = FixedBuf::<64>::new();
                    read_thread_name(current_tid(), &mut name);
                    name.as_str().to_string()
                })
                .unwrap();
            // comm is limited to 15 bytes.
            assert_eq!(handle.join().unwrap(), "vicrab-name");
        }
    }
}

#[cfg(target_os = "macos")]
pub(crate) mod macos {
    use super::*;
    use libc::{kern_return_t, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t};
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;

    #[cfg(target_arch = "x86_64")]
    const THREAD_STATE_FLAVOR: libc::c_int = 4; // x86_THREAD_STATE64
    #[cfg(target_arch = "x86_64")]
    const THREAD_STATE_COUNT: mach_msg_type_number_t = 42;
    #[cfg(target_arch = "aarch64")]
    const THREAD_STATE_FLAVOR: libc::c_int = 6; // ARM_THREAD_STATE64
    #[cfg(target_arch = "aarch64")]
    const THREAD_STATE_COUNT: mach_msg_type_number_t = 68;

    extern "C" {
        fn task_threads(
            target_task: mach_port_t,
            act_list: *mut *mut thread_act_t,
            act_list_count: *mut mach_msg_type_number_t,
        ) -> kern_return_t;
        fn thread_suspend(target_act: thread_act_t) -> kern_return_t;
        fn thread_resume(target_act: thread_act_t) -> kern_return_t;
        fn thread_get_state(
            target_act: thread_act_t,
            flavor: libc::c_int,
            old_state: *mut natural_t,
            old_state_count: *mut mach_msg_type_number_t,
        ) -> kern_return_t;
        fn mach_thread_self() -> mach_port_t;
        fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;
        fn vm_deallocate(target_task: mach_port_t, address: usize, size: usize) -> kern_return_t;
        fn pthread_from_mach_thread_np(port: mach_port_t) -> libc::pthread_t;
    }

    pub struct MachSuspender;

    impl ThreadSuspender for MachSuspender {
        fn name(&self) -> &'static str {
            "mach"
        }

        fn suspend_all(&self, table: &mut ThreadTable, _timeout: &TimeoutManager) -> usize {
            // SAFETY: Mach calls on our own task; the thread list is released
            // with vm_deallocate as documented.
            unsafe {
                let task = mach_task_self();
                let me = mach_thread_self();
                let mut threads: *mut thread_act_t = std::ptr::null_mut();
                let mut count: mach_msg_type_number_t = 0;
                if task_threads(task, &mut threads, &mut count) != KERN_SUCCESS {
                    mach_port_deallocate(task, me);
                    return 0;
                }
                let list = std::slice::from_raw_parts(threads, count as usize);
                for &thread in list {
                    if thread == me {
                        continue;
                    }
                    if thread_suspend(thread) != KERN_SUCCESS {
                        continue;
                    }
                    let pthread = pthread_from_mach_thread_np(thread);
                    let mut tid = thread as u64;
                    if pthread != 0 {
                        libc::pthread_threadid_np(pthread, &mut tid);
                    }
                    let mut snapshot = ThreadSnapshot::new(tid);
                    snapshot.handle = thread as u64;
                    let mut state = [0 as natural_t; THREAD_STATE_COUNT as usize];
                    let mut state_count = THREAD_STATE_COUNT;
                    if thread_get_state(
                        thread,
                        THREAD_STATE_FLAVOR,
                        state.as_mut_ptr(),
                        &mut state_count,
                    ) == KERN_SUCCESS
                    {
                        snapshot.context =
                            MachineContext::from_mach_thread_state(&state[..state_count as usize]);
                    }
                    if !table.push(snapshot) {
                        thread_resume(thread);
                    }
                }
                vm_deallocate(
                    task,
                    threads as usize,
                    count as usize * std::mem::size_of::<thread_act_t>(),
                );
                mach_port_deallocate(task, me);
            }
            table.len()
        }

        fn resume_all(&self, table: &ThreadTable) {
            for snapshot in table.iter() {
                // SAFETY: every handle in the table was suspended above.
                unsafe {
                    thread_resume(snapshot.handle as thread_act_t);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_table_capacity() {
        let mut table = Box::new(ThreadTable::new());
        for tid in 0..MAX_THREADS as u64 {
            assert!(table.push(ThreadSnapshot::new(tid)));
        }
        assert!(!table.push(ThreadSnapshot::new(9999)));
        assert_eq!(table.len(), MAX_THREADS);
        assert!(table.find(17).is_some());
        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_noop_suspender() {
        let mut table = Box::new(ThreadTable::new());
        let timeout = TimeoutManager::new(Duration::from_millis(1));
        assert_eq!(NoopSuspender.suspend_all(&mut table, &timeout), 0);
        NoopSuspender.resume_all(&table);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_suspends_and_resumes_other_threads() {
        let suspender = default_suspender();
        suspender.prepare().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            tx.send(current_tid()).unwrap();
            while !worker_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let worker_tid = rx.recv().unwrap();

        let mut table = Box::new(ThreadTable::new());
        let timeout = TimeoutManager::new(Duration::from_secs(2));
        let count = suspender.suspend_all(&mut table, &timeout);
        suspender.resume_all(&table);

        assert!(count >= 1);
        assert!(table.find(current_tid()).is_none());
        let worker_snapshot = table.find(worker_tid).expect("worker to be listed");
        assert_ne!(worker_snapshot.context.ip, 0);

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
    }
}
