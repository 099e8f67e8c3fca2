// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! C++ exceptions that reach `std::terminate`.
//!
//! The C++ runtime is looked up at install time with `dlsym`, so a process
//! that does not link one simply reports the monitor as unsupported. The
//! terminate handler records the mangled type name of the in-flight
//! exception; demangling happens later, in the filter pipeline.

use super::{Monitor, MonitorError, MonitorKind};
use crate::recording::{CrashContext, CrashKind, RecordingEngine};
use crate::recording_tools::{read_memory_safely, read_word, FixedBuf};
use crate::shared::configuration::CrashMonitorConfiguration;
use crate::unwind::current_tid;
use std::ffi::{c_void, CStr};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};

type TerminateHandler = unsafe extern "C" fn();
type SetTerminate = unsafe extern "C" fn(Option<TerminateHandler>) -> Option<TerminateHandler>;
type CurrentExceptionType = unsafe extern "C" fn() -> *const c_void;

/// `std::set_terminate(void (*)())`
const SET_TERMINATE_SYMBOL: &CStr = c"_ZSt13set_terminatePFvvE";
/// `std::type_info* __cxa_current_exception_type()`
const CURRENT_EXCEPTION_TYPE_SYMBOL: &CStr = c"__cxa_current_exception_type";

static INSTALLED: AtomicBool = AtomicBool::new(false);
/// The handler we replaced, as a `usize` so it fits in an atomic. 0 = none.
static PREVIOUS_TERMINATE: AtomicUsize = AtomicUsize::new(0);
static CURRENT_EXCEPTION_TYPE: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct CppExceptionMonitor;

pub(crate) static CPP_EXCEPTION_MONITOR: CppExceptionMonitor = CppExceptionMonitor;

fn lookup(symbol: &CStr) -> Option<*mut c_void> {
    // SAFETY: RTLD_DEFAULT with a nul terminated name.
    let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
    (!address.is_null()).then_some(address)
}

fn set_terminate() -> Option<SetTerminate> {
    // SAFETY: the symbol is `std::set_terminate`, whose signature matches.
    lookup(SET_TERMINATE_SYMBOL)
        .map(|address| unsafe { std::mem::transmute::<*mut c_void, SetTerminate>(address) })
}

impl Monitor for CppExceptionMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::CppException
    }

    fn install(&self, _config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        if INSTALLED.load(SeqCst) {
            return Ok(());
        }
        let (Some(set_terminate), Some(current_type)) =
            (set_terminate(), lookup(CURRENT_EXCEPTION_TYPE_SYMBOL))
        else {
            return Err(MonitorError::UnsupportedPlatform(MonitorKind::CppException));
        };
        CURRENT_EXCEPTION_TYPE.store(current_type as usize, SeqCst);
        // SAFETY: `set_terminate` is thread safe in every C++ runtime.
        let previous = unsafe { set_terminate(Some(handle_terminate as TerminateHandler)) };
        PREVIOUS_TERMINATE.store(previous.map_or(0, |handler| handler as usize), SeqCst);
        INSTALLED.store(true, SeqCst);
        Ok(())
    }

    fn uninstall(&self) {
        if !INSTALLED.swap(false, SeqCst) {
            return;
        }
        if let Some(set_terminate) = set_terminate() {
            let previous = PREVIOUS_TERMINATE.swap(0, SeqCst);
            // SAFETY: `previous` came out of `set_terminate` in `install`.
            let previous = (previous != 0)
                .then(|| unsafe { std::mem::transmute::<usize, TerminateHandler>(previous) });
            unsafe { set_terminate(previous) };
        }
    }

    fn is_installed(&self) -> bool {
        INSTALLED.load(SeqCst)
    }
}

/// Reads the mangled name out of the `std::type_info` of the exception being
/// handled. The layout is a vtable pointer followed by `const char* name`.
fn current_exception_type_name(out: &mut FixedBuf<256>) {
    let function = CURRENT_EXCEPTION_TYPE.load(SeqCst);
    if function == 0 {
        return;
    }
    // SAFETY: stored from the `__cxa_current_exception_type` symbol.
    let current_type =
        unsafe { std::mem::transmute::<usize, CurrentExceptionType>(function) };
    let type_info = unsafe { current_type() } as usize;
    if type_info == 0 {
        return;
    }
    let Some(name) = read_word(type_info + std::mem::size_of::<usize>()) else {
        return;
    };
    let mut bytes = [0u8; 256];
    let read = read_memory_safely(name, &mut bytes);
    let len = bytes[..read].iter().position(|b| *b == 0).unwrap_or(read);
    // Some runtimes mark names that must be compared by pointer with a '*'.
    let name = bytes[..len].strip_prefix(b"*").unwrap_or(&bytes[..len]);
    out.set_lossy(name);
}

unsafe extern "C" fn handle_terminate() {
    let mut type_name = FixedBuf::<256>::new();
    current_exception_type_name(&mut type_name);

    let mut context = CrashContext::new(
        CrashKind::CppException,
        MonitorKind::CppException,
        current_tid(),
    );
    context.exception_name = Some("std::terminate");
    if !type_name.is_empty() {
        context.cpp_type = Some(type_name.as_str());
    }
    let _ = RecordingEngine::global().handle(&context);

    let previous = PREVIOUS_TERMINATE.load(SeqCst);
    if previous != 0 {
        // SAFETY: came out of `set_terminate` in `install`.
        let previous = std::mem::transmute::<usize, TerminateHandler>(previous);
        previous();
    }
    // A terminate handler must not return.
    libc::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_install_reports_missing_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrashMonitorConfiguration::with_defaults(dir.path()).unwrap();
        match CPP_EXCEPTION_MONITOR.install(&config) {
            Ok(()) => {
                assert!(CPP_EXCEPTION_MONITOR.is_installed());
                CPP_EXCEPTION_MONITOR.uninstall();
                assert!(!CPP_EXCEPTION_MONITOR.is_installed());
            }
            Err(error) => {
                assert!(error.is_unsupported());
                assert!(!CPP_EXCEPTION_MONITOR.is_installed());
            }
        }
    }

    #[test]
    fn test_no_exception_means_no_type() {
        let mut name = FixedBuf::<256>::new();
        current_exception_type_name(&mut name);
        assert!(name.is_empty());
    }
}
