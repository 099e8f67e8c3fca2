// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hardware exceptions delivered through Mach exception ports (macOS).
//!
//! The kernel sends an exception message to the task's exception port
//! before it converts the fault into a signal. A dedicated thread receives
//! it, captures the report while the faulting thread is blocked waiting for
//! the reply, then puts the previous exception ports back and replies with a
//! failure code, so the fault continues to the next handler and eventually
//! becomes a signal. By then the engine has handled the crash and the signal
//! monitor passes it through.
//!
//! Other platforms have no Mach ports; the monitor reports itself as
//! unsupported there.

use super::{Monitor, MonitorError, MonitorKind};
use crate::shared::configuration::CrashMonitorConfiguration;

pub(crate) struct MachExceptionMonitor;

pub(crate) static MACH_EXCEPTION_MONITOR: MachExceptionMonitor = MachExceptionMonitor;

#[cfg(not(target_os = "macos"))]
impl Monitor for MachExceptionMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::MachException
    }

    fn install(&self, _config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        Err(MonitorError::UnsupportedPlatform(MonitorKind::MachException))
    }

    fn uninstall(&self) {}

    fn is_installed(&self) -> bool {
        false
    }
}

#[cfg(target_os = "macos")]
impl Monitor for MachExceptionMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::MachException
    }

    fn install(&self, _config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        macos::install()
    }

    fn uninstall(&self) {
        macos::uninstall()
    }

    fn is_installed(&self) -> bool {
        macos::is_installed()
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use crate::recording::{CrashContext, CrashKind, MachExceptionInfo, RecordingEngine, SignalInfo};
    use crate::unwind::MachineContext;
    use libc::{c_int, mach_port_t, natural_t};
    use mach2::exc::{__Reply__exception_raise_t, __Request__exception_raise_t};
    use mach2::exception_types::{
        exception_type_t, EXC_ARITHMETIC, EXC_BAD_ACCESS, EXC_BAD_INSTRUCTION, EXC_BREAKPOINT,
        EXC_SOFTWARE,
    };
    use mach2::kern_return::{kern_return_t, KERN_FAILURE, KERN_SUCCESS};
    use mach2::message::{
        mach_msg, mach_msg_header_t, mach_msg_size_t, MACH_MSGH_BITS, MACH_MSG_SUCCESS,
        MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MAKE_SEND, MACH_MSG_TYPE_MOVE_SEND_ONCE,
        MACH_RCV_LARGE, MACH_RCV_MSG, MACH_SEND_MSG,
    };
    use mach2::ndr::NDR_record;
    use mach2::port::MACH_PORT_NULL;
    use mach2::traps::mach_task_self;
    use std::mem::MaybeUninit;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Mutex;
    use std::thread::JoinHandle;

    // From <mach/exception_types.h>.
    const EXC_MASK_BAD_ACCESS: u32 = 1 << EXC_BAD_ACCESS;
    const EXC_MASK_BAD_INSTRUCTION: u32 = 1 << EXC_BAD_INSTRUCTION;
    const EXC_MASK_ARITHMETIC: u32 = 1 << EXC_ARITHMETIC;
    const EXC_MASK_SOFTWARE: u32 = 1 << EXC_SOFTWARE;
    const EXC_MASK_BREAKPOINT: u32 = 1 << EXC_BREAKPOINT;
    const EXCEPTION_DEFAULT: c_int = 1;
    const THREAD_STATE_NONE: c_int = 13;
    const MACH_PORT_RIGHT_RECEIVE: u32 = 1;
    const EXC_TYPES_COUNT: usize = 14;

    const WATCHED_MASK: u32 = EXC_MASK_BAD_ACCESS
        | EXC_MASK_BAD_INSTRUCTION
        | EXC_MASK_ARITHMETIC
        | EXC_MASK_SOFTWARE
        | EXC_MASK_BREAKPOINT;

    #[cfg(target_arch = "x86_64")]
    const THREAD_STATE_FLAVOR: c_int = 4;
    #[cfg(target_arch = "x86_64")]
    const THREAD_STATE_COUNT: u32 = 42;
    #[cfg(target_arch = "aarch64")]
    const THREAD_STATE_FLAVOR: c_int = 6;
    #[cfg(target_arch = "aarch64")]
    const THREAD_STATE_COUNT: u32 = 68;

    extern "C" {
        fn mach_port_allocate(task: mach_port_t, right: u32, name: *mut mach_port_t) -> kern_return_t;
        fn mach_port_insert_right(
            task: mach_port_t,
            name: mach_port_t,
            poly: mach_port_t,
            poly_poly: u32,
        ) -> kern_return_t;
        fn mach_port_mod_refs(
            task: mach_port_t,
            name: mach_port_t,
            right: u32,
            delta: i32,
        ) -> kern_return_t;
        fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;
        fn task_get_exception_ports(
            task: mach_port_t,
            exception_mask: u32,
            masks: *mut u32,
            masks_count: *mut u32,
            handlers: *mut mach_port_t,
            behaviors: *mut c_int,
            flavors: *mut c_int,
        ) -> kern_return_t;
        fn task_set_exception_ports(
            task: mach_port_t,
            exception_mask: u32,
            new_port: mach_port_t,
            behavior: c_int,
            new_flavor: c_int,
        ) -> kern_return_t;
        fn thread_get_state(
            thread: mach_port_t,
            flavor: c_int,
            state: *mut natural_t,
            count: *mut u32,
        ) -> kern_return_t;
        fn pthread_from_mach_thread_np(thread: mach_port_t) -> libc::pthread_t;
    }

    /// The exception ports that were in place before ours.
    #[derive(Clone, Copy)]
    struct PreviousPorts {
        count: u32,
        masks: [u32; EXC_TYPES_COUNT],
        handlers: [mach_port_t; EXC_TYPES_COUNT],
        behaviors: [c_int; EXC_TYPES_COUNT],
        flavors: [c_int; EXC_TYPES_COUNT],
    }

    static INSTALLED: AtomicBool = AtomicBool::new(false);
    static PORT: AtomicU32 = AtomicU32::new(MACH_PORT_NULL);
    /// Written at install, read by the handler thread and at uninstall, both
    /// in normal context.
    static PREVIOUS: Mutex<Option<PreviousPorts>> = Mutex::new(None);
    static HANDLER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

    fn failed(what: &str, kr: kern_return_t) -> MonitorError {
        MonitorError::install_failed(MonitorKind::MachException, format!("{what}: {kr}"))
    }

    pub(super) fn is_installed() -> bool {
        INSTALLED.load(SeqCst)
    }

    pub(super) fn install() -> Result<(), MonitorError> {
        if INSTALLED.load(SeqCst) {
            return Ok(());
        }
        // SAFETY: plain Mach calls on our own task with valid out pointers.
        unsafe {
            let task = mach_task_self();
            let mut previous = PreviousPorts {
                count: EXC_TYPES_COUNT as u32,
                masks: [0; EXC_TYPES_COUNT],
                handlers: [MACH_PORT_NULL; EXC_TYPES_COUNT],
                behaviors: [0; EXC_TYPES_COUNT],
                flavors: [0; EXC_TYPES_COUNT],
            };
            let kr = task_get_exception_ports(
                task,
                WATCHED_MASK,
                previous.masks.as_mut_ptr(),
                &mut previous.count,
                previous.handlers.as_mut_ptr(),
                previous.behaviors.as_mut_ptr(),
                previous.flavors.as_mut_ptr(),
            );
            if kr != KERN_SUCCESS {
                return Err(failed("task_get_exception_ports", kr));
            }

            let mut port: mach_port_t = MACH_PORT_NULL;
            let kr = mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut port);
            if kr != KERN_SUCCESS {
                return Err(failed("mach_port_allocate", kr));
            }
            let kr = mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND);
            if kr != KERN_SUCCESS {
                mach_port_mod_refs(task, port, MACH_PORT_RIGHT_RECEIVE, -1);
                return Err(failed("mach_port_insert_right", kr));
            }

            if let Ok(mut slot) = PREVIOUS.lock() {
                *slot = Some(previous);
            }
            PORT.store(port, SeqCst);

            let handle = std::thread::Builder::new()
                .name("vicrab-mach-exc".to_string())
                .spawn(move || exception_loop(port))
                .map_err(|e| MonitorError::install_failed(MonitorKind::MachException, e))?;
            if let Ok(mut slot) = HANDLER.lock() {
                *slot = Some(handle);
            }

            let kr = task_set_exception_ports(
                task,
                WATCHED_MASK,
                port,
                EXCEPTION_DEFAULT,
                THREAD_STATE_NONE,
            );
            if kr != KERN_SUCCESS {
                release_port();
                return Err(failed("task_set_exception_ports", kr));
            }
        }
        INSTALLED.store(true, SeqCst);
        Ok(())
    }

    pub(super) fn uninstall() {
        if !INSTALLED.swap(false, SeqCst) {
            return;
        }
        restore_previous_ports();
        release_port();
    }

    /// Puts back the ports saved at install.
    fn restore_previous_ports() {
        let Some(previous) = PREVIOUS.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        // SAFETY: the ports came from task_get_exception_ports.
        unsafe {
            let task = mach_task_self();
            for index in 0..(previous.count as usize).min(EXC_TYPES_COUNT) {
                task_set_exception_ports(
                    task,
                    previous.masks[index],
                    previous.handlers[index],
                    previous.behaviors[index],
                    previous.flavors[index],
                );
            }
        }
    }

    /// Destroys our port, which ends the handler thread's receive loop.
    fn release_port() {
        let port = PORT.swap(MACH_PORT_NULL, SeqCst);
        if port == MACH_PORT_NULL {
            return;
        }
        // SAFETY: we own both rights on `port`.
        unsafe {
            let task = mach_task_self();
            mach_port_mod_refs(task, port, MACH_PORT_RIGHT_RECEIVE, -1);
            mach_port_deallocate(task, port);
        }
        let handle = HANDLER.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::warn!("Mach exception thread panicked");
            }
        }
    }

    fn exception_loop(port: mach_port_t) {
        loop {
            let mut request = MaybeUninit::<__Request__exception_raise_t>::uninit();
            let recv_size = std::mem::size_of::<__Request__exception_raise_t>() as mach_msg_size_t;
            // SAFETY: the buffer is as large as we claim.
            let kr = unsafe {
                mach_msg(
                    request.as_mut_ptr() as *mut mach_msg_header_t,
                    MACH_RCV_MSG | MACH_RCV_LARGE,
                    0,
                    recv_size,
                    port,
                    MACH_MSG_TIMEOUT_NONE,
                    MACH_PORT_NULL,
                )
            };
            if kr != MACH_MSG_SUCCESS {
                if kr == mach2::message::MACH_RCV_PORT_DIED
                    || kr == mach2::message::MACH_RCV_INVALID_NAME
                {
                    return;
                }
                continue;
            }
            // SAFETY: mach_msg filled it in.
            let message = unsafe { request.assume_init() };
            capture(&message);
            // Later exceptions go to whoever was there before us.
            restore_previous_ports();
            INSTALLED.store(false, SeqCst);
            send_failure_reply(&message);
            return;
        }
    }

    /// The signal the kernel turns this exception into.
    fn signal_for(exception: exception_type_t, code: i64) -> c_int {
        match exception as u32 {
            EXC_BAD_ACCESS if code == KERN_INVALID_ADDRESS => libc::SIGSEGV,
            EXC_BAD_ACCESS => libc::SIGBUS,
            EXC_BAD_INSTRUCTION => libc::SIGILL,
            EXC_ARITHMETIC => libc::SIGFPE,
            EXC_BREAKPOINT => libc::SIGTRAP,
            _ => 0,
        }
    }

    const KERN_INVALID_ADDRESS: i64 = 1;

    fn capture(message: &__Request__exception_raise_t) {
        let thread = message.thread.name;
        let mut tid = 0u64;
        // SAFETY: `thread` is a live thread port of our task.
        unsafe { libc::pthread_threadid_np(pthread_from_mach_thread_np(thread), &mut tid) };

        let mut state = [0 as natural_t; THREAD_STATE_COUNT as usize];
        let mut count = THREAD_STATE_COUNT;
        // SAFETY: `state` holds `count` words.
        let kr = unsafe { thread_get_state(thread, THREAD_STATE_FLAVOR, state.as_mut_ptr(), &mut count) };

        let code = message.code[0] as i64;
        let subcode = message.code[1] as i64;
        let mut context = CrashContext::new(CrashKind::MachException, MonitorKind::MachException, tid);
        context.mach = Some(MachExceptionInfo {
            exception: message.exception,
            code,
            subcode,
        });
        let signal = signal_for(message.exception, code);
        if signal != 0 {
            context.signal = Some(SignalInfo {
                number: signal,
                code: 0,
                address: (message.exception as u32 == EXC_BAD_ACCESS).then_some(subcode as usize),
            });
        }
        if kr == KERN_SUCCESS {
            context.machine = Some(MachineContext::from_mach_thread_state(&state[..count as usize]));
        }
        context.stack_overflow = context.looks_like_stack_overflow();
        let _ = RecordingEngine::global().handle(&context);
    }

    fn send_failure_reply(request: &__Request__exception_raise_t) {
        let mut reply = __Reply__exception_raise_t {
            Head: mach_msg_header_t {
                msgh_bits: MACH_MSGH_BITS(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0),
                msgh_size: std::mem::size_of::<__Reply__exception_raise_t>() as mach_msg_size_t,
                msgh_remote_port: request.Head.msgh_remote_port,
                msgh_local_port: MACH_PORT_NULL,
                msgh_voucher_port: MACH_PORT_NULL,
                msgh_id: request.Head.msgh_id + 100,
            },
            NDR: unsafe { NDR_record },
            RetCode: KERN_FAILURE,
        };
        // SAFETY: a well formed reply on the send-once right of the request.
        unsafe {
            mach_msg(
                &mut reply.Head,
                MACH_SEND_MSG,
                reply.Head.msgh_size,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );
        }
    }
}
