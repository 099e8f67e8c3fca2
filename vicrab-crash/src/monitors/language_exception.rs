// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rust panics, the language level uncaught exception.
//!
//! The monitor is a panic hook chained in front of the previous one. Once it
//! is installed, every panic is fatal: after the report is written and the
//! previous hook has printed its message, the process aborts, as it would
//! with `panic = "abort"`.

use super::{Monitor, MonitorError, MonitorKind};
use crate::recording::{CrashContext, CrashKind, HandleOutcome, RecordingEngine};
use crate::recording_tools::FixedBuf;
use crate::shared::configuration::CrashMonitorConfiguration;
use crate::unwind::current_tid;
use std::fmt::Write;
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());

pub(crate) struct LanguageExceptionMonitor;

pub(crate) static LANGUAGE_EXCEPTION_MONITOR: LanguageExceptionMonitor = LanguageExceptionMonitor;

impl Monitor for LanguageExceptionMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::LanguageException
    }

    /// Registers the panic hook and stores the previous one.
    ///
    /// ATOMICITY:
    ///     This function uses a swap on an atomic pointer.
    fn install(&self, _config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        // register only once, if it is already registered, do nothing
        if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
            return Ok(());
        }
        let old_hook = panic::take_hook();
        let old_hook_ptr = Box::into_raw(Box::new(old_hook));
        PREVIOUS_PANIC_HOOK.store(old_hook_ptr, SeqCst);
        panic::set_hook(Box::new(handle_panic));
        Ok(())
    }

    /// Puts the previous hook back in place.
    fn uninstall(&self) {
        let old_hook_ptr = PREVIOUS_PANIC_HOOK.swap(ptr::null_mut(), SeqCst);
        if old_hook_ptr.is_null() {
            return;
        }
        // Safety: This pointer can only come from Box::into_raw in `install`.
        let old_hook = unsafe { Box::from_raw(old_hook_ptr) };
        // `set_hook` drops our hook; the previous one becomes current again.
        panic::set_hook(*old_hook);
    }

    fn is_installed(&self) -> bool {
        !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null()
    }
}

/// The text of a panic: its payload, then where it happened.
fn describe_panic(panic_info: &PanicHookInfo<'_>, out: &mut FixedBuf<1024>) {
    let payload = panic_info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    out.push_str(message);
    if let Some(location) = panic_info.location() {
        let _ = write!(
            out,
            " at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
}

fn handle_panic(panic_info: &PanicHookInfo<'_>) {
    let mut reason = FixedBuf::<1024>::new();
    describe_panic(panic_info, &mut reason);

    let mut context = CrashContext::new(
        CrashKind::Panic,
        MonitorKind::LanguageException,
        current_tid(),
    );
    context.exception_name = Some("panic");
    context.reason = Some(reason.as_str());
    let outcome = RecordingEngine::global().handle(&context);

    call_previous_panic_hook(panic_info);
    if matches!(outcome, HandleOutcome::Captured | HandleOutcome::ReentrantCrash) {
        std::process::abort();
    }
}

fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // Safety: This pointer can only come from Box::into_raw in `install`.
        // We borrow it here without taking ownership so it remains valid for future calls.
        unsafe {
            let old_hook = &*old_hook_ptr;
            old_hook(panic_info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_describe_panic_formats_payload_and_location() {
        let captured = Arc::new(Mutex::new(String::new()));
        let sink = captured.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut out = FixedBuf::<1024>::new();
            describe_panic(info, &mut out);
            *sink.lock().unwrap() = out.as_str().to_string();
        }));
        let _ = panic::catch_unwind(|| panic!("boom {}", 42));
        panic::set_hook(previous);

        let text = captured.lock().unwrap().clone();
        assert!(text.starts_with("boom 42 at "), "{text}");
        assert!(text.contains("language_exception.rs"), "{text}");
    }
}
