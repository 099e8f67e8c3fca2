// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal POSIX signals.
//!
//! Note that this file makes use of the following async-signal safe functions
//! in a signal handler.
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - sigaction
//! - raise
//! - write (diagnostics only)

use super::{
    has_fault_address, signal_from_signum, siginfo_code, Monitor, MonitorError, MonitorKind,
};
use crate::recording::{CrashContext, CrashKind, RecordingEngine, SignalInfo};
use crate::recording_tools::write_stderr;
use crate::shared::configuration::CrashMonitorConfiguration;
use crate::unwind::{current_tid, MachineContext};
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, ucontext_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE,
    PROT_NONE, PROT_READ, PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU8};

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];

const UNINSTALLED: u8 = 0;
const BUSY: u8 = 1;
const INSTALLED: u8 = 2;
/// Guards `HANDLERS`: only the thread that moved the state to `BUSY` may
/// write it, and the handler only reads it once `INSTALLED` is visible.
static STATE: AtomicU8 = AtomicU8::new(UNINSTALLED);
static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

pub(crate) struct SignalMonitor;

pub(crate) static SIGNAL_MONITOR: SignalMonitor = SignalMonitor;

impl Monitor for SignalMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Signal
    }

    /// Registers the handlers for every configured signal.
    ///
    /// ATOMICITY:
    ///     Setting the handlers is not atomic. A crash in the middle of this
    ///     function can find our handler registered before the previous one
    ///     was stored; the handler then has nothing to chain to and exits.
    fn install(&self, config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        if STATE
            .compare_exchange(UNINSTALLED, BUSY, SeqCst, SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = register_all(config);
        if let Err(e) = &result {
            // SAFETY: we hold BUSY.
            unsafe { restore_all() };
            STATE.store(UNINSTALLED, SeqCst);
            tracing::warn!("Signal monitor not installed: {e}");
        } else {
            STATE.store(INSTALLED, SeqCst);
        }
        result
    }

    fn uninstall(&self) {
        if STATE
            .compare_exchange(INSTALLED, BUSY, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }
        // SAFETY: we hold BUSY.
        unsafe { restore_all() };
        STATE.store(UNINSTALLED, SeqCst);
    }

    fn is_installed(&self) -> bool {
        STATE.load(SeqCst) == INSTALLED
    }
}

fn register_all(config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
    let kind = MonitorKind::Signal;
    for signum in config.signals() {
        if *signum <= 0 || *signum >= MAX_SIGNALS as i32 {
            return Err(MonitorError::install_failed(
                kind,
                format!("signal {signum} out of range"),
            ));
        }
    }

    if config.create_alt_stack() && !ALT_STACK_CREATED.load(SeqCst) {
        // SAFETY: This function has no documented preconditions.
        unsafe { create_alt_stack() }.map_err(|e| MonitorError::install_failed(kind, e))?;
        ALT_STACK_CREATED.store(true, SeqCst);
    }

    for signum in config.signals() {
        // SAFETY: called with BUSY held, see `STATE`.
        let handler = unsafe { register_signal_handler(*signum, config.use_alt_stack()) }
            .map_err(|e| {
                MonitorError::install_failed(kind, format!("signal {signum}: {e:?}"))
            })?;
        // SAFETY: see `STATE`.
        unsafe { HANDLERS[*signum as usize] = Some(handler) };
    }
    tracing::debug!(signals = ?config.signals(), "Signal handlers registered");
    Ok(())
}

/// Puts back every handler we replaced.
///
/// SAFETY: caller holds `STATE == BUSY`.
unsafe fn restore_all() {
    for index in 0..MAX_SIGNALS {
        let entry = HANDLERS[index];
        HANDLERS[index] = None;
        if let Some((signal, old)) = entry {
            if let Err(e) = signal::sigaction(signal, &old) {
                tracing::warn!("Unable to restore the handler for {signal}: {e}");
            }
        }
    }
}

unsafe fn register_signal_handler(
    signum: i32,
    use_alt_stack: bool,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal_from_signum(signum)?;

    // Stack overflows can only be reported from an alternate stack. Some
    // runtimes bring their own altstack and check the stack pointer in their
    // chained handler, in which case it has to be used but not created.
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    // SA_NODEFER lets a fault inside the handler reach the handler again,
    // where the engine turns it into a recrash marker instead of a hang.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The capture walks every thread from this stack, so the default
    // SIGSTKSZ (8KB) is not enough. 16 pages is a small part of the RSS.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

extern "C" fn handle_posix_sigaction(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    // The engine guarantees one report per process; whatever it decides, the
    // signal then takes its course through the previous handler.
    // SAFETY: both pointers come from the kernel.
    let _ = unsafe { capture_signal(signum, sig_info, ucontext as *const ucontext_t) };
    // SAFETY: No preconditions.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

unsafe fn capture_signal(
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) -> crate::recording::HandleOutcome {
    let mut context = CrashContext::new(CrashKind::Signal, MonitorKind::Signal, current_tid());
    let (code, address) = if sig_info.is_null() {
        (0, None)
    } else {
        let info = &*sig_info;
        let address = has_fault_address(signum).then(|| info.si_addr() as usize);
        (info.si_code, address)
    };
    context.signal = Some(SignalInfo {
        number: signum,
        code,
        address,
    });
    context.machine = MachineContext::from_ucontext(ucontext);
    context.stack_overflow = context.looks_like_stack_overflow();
    RecordingEngine::global().handle(&context)
}

/// Once we've handled the signal, chain to any previous handlers.
///
/// A default or ignored disposition is restored and the signal raised again,
/// so that the process dies the way it would have without us (core dump
/// included). If we run into an unexpected condition we just `_exit`.
unsafe fn chain_signal_handler(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    if STATE.load(SeqCst) != INSTALLED {
        write_stderr(format_args!(
            "vicrab-crash: no handler to chain for signal {signum}, exiting"
        ));
        libc::_exit(128 + signum);
    }
    if signum <= 0 || signum >= MAX_SIGNALS as i32 {
        write_stderr(format_args!(
            "vicrab-crash: unexpected signal {signum}, exiting"
        ));
        libc::_exit(128);
    }
    // SAFETY: `HANDLERS` is only written while `STATE` is BUSY, and it was
    // INSTALLED above.
    let Some((signal, sigaction)) = (unsafe { HANDLERS[signum as usize] }) else {
        write_stderr(format_args!(
            "vicrab-crash: missing chain handler for {signum}, exiting"
        ));
        libc::_exit(128 + signum);
    };
    // How we chain depends on what kind of handler we're chaining to.
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    match sigaction.handler() {
        // An ignored synchronous fault would re-execute the faulting
        // instruction forever, so both end in the default action.
        SigHandler::SigDfl | SigHandler::SigIgn => raise_with_default_action(signal, signum),
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
    // A previous handler that returns expects the faulting instruction to run
    // again and fault into whatever it restored. A sent signal has no such
    // instruction, so it is raised again here or the process would go on.
    if is_user_generated(sig_info) {
        raise_with_default_action(signal, signum);
    }
}

unsafe fn raise_with_default_action(signal: signal::Signal, signum: i32) {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty());
    if signal::sigaction(signal, &default).is_err() {
        libc::_exit(128 + signum);
    }
    // Returning from a hardware fault re-executes the instruction, which
    // faults again into the default handler. A `raise` needs the explicit
    // re-raise.
    libc::raise(signum);
}

/// Whether the signal came from `kill`, `raise`, `sigqueue` or `tgkill`
/// rather than from the kernel for a fault.
fn is_user_generated(sig_info: *const siginfo_t) -> bool {
    // SAFETY: from the kernel, or null.
    unsafe { sig_info.as_ref() }.map_or(true, |info| info.si_code <= siginfo_code::SI_USER)
}
