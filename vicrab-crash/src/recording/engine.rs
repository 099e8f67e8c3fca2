// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide recording engine: installs the monitors, arbitrates
//! between them and runs the capture-to-disk sequence.
//!
//! Note that the capture path makes use of the following async-signal safe
//! functions.
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - clock_gettime
//! - close
//! - getpid, getppid, uname
//! - nanosleep
//! - open
//! - write
//! - _exit

use super::crash_context::{CrashContext, CrashKind};
use super::system_info::{CapturedSystemInfo, PreparedSystemInfo};
use super::user_context::TakenUserData;
use super::writer::{emit_crash_report, emit_recrash_marker, Capture};
use crate::monitors::{is_debugger_attached, monitor_for, MonitorError, MonitorKind, MonitorSet};
use crate::raw_report::emit::HeaderLine;
use crate::raw_report::ReportType;
use crate::recording_tools::{init_memory_probe, write_stderr, CPath, FdWriter, FixedBuf};
use crate::shared::configuration::{CrashMonitorConfiguration, PostCaptureAction};
use crate::shared::constants::THREAD_SUSPEND_TIMEOUT;
use crate::shared::timeout::{signal_safe_sleep, TimeoutManager};
use crate::shared::constants::{RECRASH_EXTENSION, REPORT_EXTENSION};
use crate::store::{ReportId, ReportStore, StoreError};
use crate::unwind::{current_tid, default_suspender, thread_name, ThreadTable};
use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a trigger waits for a capture running on another thread.
const CONCURRENT_CAPTURE_WAIT: Duration = Duration::from_secs(10);
const CONCURRENT_CAPTURE_POLL: Duration = Duration::from_millis(5);

/// Where the engine is in its lifecycle.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EnginePhase {
    Uninstalled = 0,
    Installing = 1,
    Installed = 2,
    Handling = 3,
    /// A fatal capture finished. Terminal: nothing else is captured.
    Handled = 4,
}

impl EnginePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EnginePhase::Installing,
            2 => EnginePhase::Installed,
            3 => EnginePhase::Handling,
            4 => EnginePhase::Handled,
            _ => EnginePhase::Uninstalled,
        }
    }
}

/// What [`RecordingEngine::handle`] did with a crash context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A fatal report was written. The caller lets the process die.
    Captured,
    /// A non-fatal report was written and monitoring continues.
    Resumed,
    /// Another capture was already running; at most a marker was written.
    ReentrantCrash,
    /// Nothing installed, or a fatal crash was already handled.
    Inactive,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Crash monitoring is already installed")]
    AlreadyInstalled,
    #[error("Crash monitoring is not installed")]
    NotInstalled,
    #[error("A crash is being handled")]
    Busy,
    #[error("Report path does not fit the preallocated buffer: {0}")]
    PathTooLong(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`RecordingEngine::install`].
#[derive(Debug)]
pub struct InstallReport {
    pub installed: MonitorSet,
    /// Monitors that were enabled but did not install, with the reason.
    pub declined: Vec<(MonitorKind, MonitorError)>,
}

/// Everything the capture path reads. Built at install time, never mutated
/// while published.
struct EngineState {
    config: CrashMonitorConfiguration,
    store: ReportStore,
    system: PreparedSystemInfo,
    suspend_threads: bool,
}

/// Ids tried past the reserved one when another process already wrote a
/// report under it.
const SLOT_CREATE_ATTEMPTS: u64 = 64;

/// The on-disk location of the next report, decided before any crash.
struct ReportSlot {
    /// `<dir>/<app>-report-`
    prefix: CPath,
    /// Moves forward if the reserved file turns out to exist.
    id: AtomicU64,
    event_id: String,
}

impl ReportSlot {
    fn reserve(store: &ReportStore) -> Result<Self, EngineError> {
        let (id, _) = store.next_report_path()?;
        let prefix = store.report_path_prefix();
        let prefix = CPath::from_fmt(format_args!("{}", prefix.display()))
            .ok_or_else(|| EngineError::PathTooLong(prefix.display().to_string()))?;
        let slot = Self {
            prefix,
            id: AtomicU64::new(id.0),
            event_id: uuid::Uuid::new_v4().hyphenated().to_string(),
        };
        // The longest path the handler will build.
        let last = ReportId(id.0 + SLOT_CREATE_ATTEMPTS);
        if slot.recrash_path(last).is_empty() {
            return Err(EngineError::PathTooLong(
                store.recrash_path(last).display().to_string(),
            ));
        }
        Ok(slot)
    }

    fn id(&self) -> ReportId {
        ReportId(self.id.load(SeqCst))
    }

    /// Empty if the path does not fit, which `reserve` rules out.
    fn path(&self, id: ReportId) -> CPath {
        CPath::from_fmt(format_args!(
            "{}{id}.{REPORT_EXTENSION}",
            self.prefix.as_str()
        ))
        .unwrap_or(CPath::empty())
    }

    fn recrash_path(&self, id: ReportId) -> CPath {
        let mut path = self.path(id);
        if !path.push_str(".") || !path.push_str(RECRASH_EXTENSION) {
            return CPath::empty();
        }
        path
    }

    /// Creates the report file, never truncating an existing one. Another
    /// process may have written a report under the reserved id, in which case
    /// the slot moves to the next free id.
    fn create(&self) -> (ReportId, CPath, RawFd) {
        let mut id = self.id();
        for _ in 0..SLOT_CREATE_ATTEMPTS {
            let path = self.path(id);
            let fd = path.open(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL);
            if fd >= 0 || errno::errno().0 != libc::EEXIST {
                return (id, path, fd);
            }
            id = ReportId(id.0 + 1);
            self.id.store(id.0, SeqCst);
        }
        (id, self.path(id), -1)
    }
}

// These should always be either: null_mut, or `Box::into_raw()`.
static STATE: AtomicPtr<EngineState> = AtomicPtr::new(ptr::null_mut());
static SLOT: AtomicPtr<ReportSlot> = AtomicPtr::new(ptr::null_mut());

static PHASE: AtomicU8 = AtomicU8::new(EnginePhase::Uninstalled as u8);
static INSTALLED_MONITORS: AtomicU32 = AtomicU32::new(0);
static HANDLING_TID: AtomicU64 = AtomicU64::new(0);
static HANDLING_FATAL: AtomicBool = AtomicBool::new(false);
/// Only one recrash marker is written per process.
static RECRASH_WRITTEN: AtomicBool = AtomicBool::new(false);

/// Snapshots of the suspended threads. Static so the capture does not need
/// a large stack frame on the alternate signal stack.
struct CaptureThreads(UnsafeCell<ThreadTable>);

// SAFETY: only the thread that moved the phase to Handling touches it.
unsafe impl Sync for CaptureThreads {}

static CAPTURE_THREADS: CaptureThreads = CaptureThreads(UnsafeCell::new(ThreadTable::new()));

fn swap_owned<T>(slot: &AtomicPtr<T>, value: Option<Box<T>>) {
    let new = value.map_or(ptr::null_mut(), Box::into_raw);
    let old = slot.swap(new, SeqCst);
    if !old.is_null() {
        // SAFETY: can only come from a box above.
        drop(unsafe { Box::from_raw(old) });
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as u64)
}

/// The process-wide engine. See [`RecordingEngine::global`].
pub struct RecordingEngine {
    _private: (),
}

static ENGINE: RecordingEngine = RecordingEngine { _private: () };

impl RecordingEngine {
    pub fn global() -> &'static RecordingEngine {
        &ENGINE
    }

    pub fn phase(&self) -> EnginePhase {
        EnginePhase::from_u8(PHASE.load(SeqCst))
    }

    /// Monitors currently installed.
    pub fn installed_monitors(&self) -> MonitorSet {
        MonitorSet::from_bits_truncate(INSTALLED_MONITORS.load(SeqCst))
    }

    /// The store reports are written to, while installed.
    pub fn report_store(&self) -> Option<ReportStore> {
        // SAFETY: the state is only freed by uninstall, which is not
        // concurrent with other engine calls.
        unsafe { STATE.load(SeqCst).as_ref() }.map(|state| state.store.clone())
    }

    /// Installs every enabled monitor, in priority order.
    ///
    /// Monitors that decline (unsupported platform, failed registration) are
    /// listed in the result; the others stay installed. Debugger unsafe
    /// monitors are skipped while a debugger is attached.
    ///
    /// PRECONDITIONS:
    ///     Not called concurrently with `uninstall_all`.
    pub fn install(&self, config: CrashMonitorConfiguration) -> anyhow::Result<InstallReport> {
        PHASE
            .compare_exchange(
                EnginePhase::Uninstalled as u8,
                EnginePhase::Installing as u8,
                SeqCst,
                SeqCst,
            )
            .map_err(|_| EngineError::AlreadyInstalled)?;
        match self.install_inner(config) {
            Ok(report) => {
                PHASE.store(EnginePhase::Installed as u8, SeqCst);
                Ok(report)
            }
            Err(e) => {
                self.teardown();
                PHASE.store(EnginePhase::Uninstalled as u8, SeqCst);
                Err(e)
            }
        }
    }

    fn install_inner(&self, config: CrashMonitorConfiguration) -> anyhow::Result<InstallReport> {
        init_memory_probe()?;
        let store = ReportStore::new(config.report_dir(), config.app_name())?;
        let pruned = store.prune(config.max_report_count())?;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned old reports");
        }
        swap_owned(&SLOT, Some(Box::new(ReportSlot::reserve(&store)?)));

        let mut enabled = config.monitors();
        if !enabled.difference(MonitorSet::DEBUGGER_SAFE).is_empty() && is_debugger_attached() {
            tracing::info!("Debugger attached, skipping debugger unsafe monitors");
            enabled = enabled.difference(MonitorSet::DEBUGGER_UNSAFE);
        }

        let suspender = default_suspender();
        let suspend_threads = config.suspend_threads()
            && match suspender.prepare() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(suspender = suspender.name(), "Thread suspension disabled: {e}");
                    false
                }
            };

        let state = EngineState {
            system: PreparedSystemInfo::gather(),
            store,
            suspend_threads,
            config,
        };
        swap_owned(&STATE, Some(Box::new(state)));
        // SAFETY: just published, only freed by uninstall.
        let Some(state) = (unsafe { STATE.load(SeqCst).as_ref() }) else {
            anyhow::bail!("Engine state vanished during install");
        };

        let mut installed = MonitorSet::NONE;
        let mut declined = vec![];
        for kind in enabled.iter() {
            match monitor_for(kind).install(&state.config) {
                Ok(()) => installed.insert(kind),
                Err(e) => {
                    if e.is_unsupported() {
                        tracing::debug!("{e}");
                    } else {
                        tracing::warn!("{e}");
                    }
                    declined.push((kind, e));
                }
            }
        }
        INSTALLED_MONITORS.store(installed.bits(), SeqCst);
        tracing::info!(
            ?installed,
            report_dir = %state.config.report_dir().display(),
            suspend_threads,
            "Crash monitoring installed"
        );
        Ok(InstallReport {
            installed,
            declined,
        })
    }

    /// Uninstalls every monitor, in reverse priority order, and releases
    /// the engine state. Also valid after a fatal capture was handled.
    pub fn uninstall_all(&self) -> Result<(), EngineError> {
        let from = [EnginePhase::Installed, EnginePhase::Handled]
            .into_iter()
            .find(|from| {
                PHASE
                    .compare_exchange(*from as u8, EnginePhase::Installing as u8, SeqCst, SeqCst)
                    .is_ok()
            });
        if from.is_none() {
            return match self.phase() {
                EnginePhase::Handling => Err(EngineError::Busy),
                _ => Err(EngineError::NotInstalled),
            };
        }
        self.teardown();
        RECRASH_WRITTEN.store(false, SeqCst);
        PHASE.store(EnginePhase::Uninstalled as u8, SeqCst);
        tracing::info!("Crash monitoring uninstalled");
        Ok(())
    }

    fn teardown(&self) {
        let installed: Vec<_> = self.installed_monitors().iter().collect();
        for kind in installed.into_iter().rev() {
            monitor_for(kind).uninstall();
        }
        INSTALLED_MONITORS.store(0, SeqCst);
        // SAFETY: still published until the swap below.
        if unsafe { STATE.load(SeqCst).as_ref() }.is_some_and(|state| state.suspend_threads) {
            default_suspender().release();
        }
        swap_owned(&STATE, None);
        swap_owned(&SLOT, None);
    }

    /// Entry point for a triggered monitor.
    ///
    /// At most one capture runs at a time; the only guard is the phase
    /// compare-and-swap. A trigger that finds a capture in progress on its
    /// own thread (the capture itself crashed) or a fatal capture on another
    /// thread writes a recrash marker once and backs off. A trigger that
    /// finds a non-fatal capture in progress waits for it and then runs.
    ///
    /// SIGNAL SAFETY:
    ///     Everything up to the return is async-signal safe, except the slot
    ///     rotation after a non-fatal capture, which only non-fatal
    ///     (normal context) triggers reach.
    pub fn handle(&self, context: &CrashContext<'_>) -> HandleOutcome {
        let tid = current_tid();
        loop {
            match PHASE.compare_exchange(
                EnginePhase::Installed as u8,
                EnginePhase::Handling as u8,
                SeqCst,
                SeqCst,
            ) {
                Ok(_) => break,
                Err(phase) if phase == EnginePhase::Handling as u8 => {
                    if HANDLING_TID.load(SeqCst) == tid {
                        self.write_recrash_marker(context);
                        return HandleOutcome::ReentrantCrash;
                    }
                    if HANDLING_FATAL.load(SeqCst) {
                        self.write_recrash_marker(context);
                        wait_while_handling();
                        return HandleOutcome::ReentrantCrash;
                    }
                    if !wait_while_handling() {
                        self.write_recrash_marker(context);
                        return HandleOutcome::ReentrantCrash;
                    }
                }
                Err(_) => return HandleOutcome::Inactive,
            }
        }
        HANDLING_TID.store(tid, SeqCst);
        HANDLING_FATAL.store(context.fatal, SeqCst);

        // SAFETY: published before the phase became Installed and only freed
        // by uninstall, which cannot run while Handling.
        let (Some(state), Some(slot)) = (unsafe { STATE.load(SeqCst).as_ref() }, unsafe {
            SLOT.load(SeqCst).as_ref()
        }) else {
            end_handling(EnginePhase::Installed);
            return HandleOutcome::Inactive;
        };

        let mut context = *context;
        for kind in self.installed_monitors().iter() {
            monitor_for(kind).add_contextual_info(&mut context);
        }
        self.capture(state, slot, &context, tid);

        if context.fatal {
            if state.config.post_capture() == PostCaptureAction::Exit {
                // SAFETY: no preconditions.
                unsafe { libc::_exit(1) };
            }
            end_handling(EnginePhase::Handled);
            return HandleOutcome::Captured;
        }

        // Normal context from here on.
        match ReportSlot::reserve(&state.store) {
            Ok(next) => swap_owned(&SLOT, Some(Box::new(next))),
            Err(e) => tracing::warn!("Keeping the previous report slot: {e}"),
        }
        if let Err(e) = state.store.prune(state.config.max_report_count()) {
            tracing::warn!("Failed to prune reports: {e}");
        }
        end_handling(EnginePhase::Installed);
        HandleOutcome::Resumed
    }

    /// Runs steps (1) to (6) of the capture: suspend, open the reserved
    /// slot, stream the report, resume.
    fn capture(
        &self,
        state: &EngineState,
        slot: &ReportSlot,
        context: &CrashContext<'_>,
        current_tid: u64,
    ) {
        // SAFETY: see `CaptureThreads`.
        let threads = unsafe { &mut *CAPTURE_THREADS.0.get() };
        threads.clear();
        let suspender = default_suspender();
        let suspend = state.suspend_threads
            && (context.all_threads || context.kind == CrashKind::Deadlock);
        if suspend {
            suspender.suspend_all(threads, &TimeoutManager::new(THREAD_SUSPEND_TIMEOUT));
        }

        let (id, path, fd) = slot.create();
        if fd < 0 {
            write_stderr(format_args!(
                "vicrab-crash: cannot open {} (errno {})",
                path.as_str(),
                errno::errno().0
            ));
        } else {
            let user = TakenUserData::take();
            let mut name = FixedBuf::<64>::new();
            thread_name(context.tid, &mut name);
            let system = CapturedSystemInfo::capture();
            let capture = Capture {
                header: HeaderLine {
                    report_id: id.0,
                    event_id: &slot.event_id,
                    timestamp_micros: now_micros(),
                    report_type: report_type_of(context),
                    process_name: &state.system.process_name,
                    app_name: state.config.app_name(),
                },
                context,
                thread_name: name.as_str(),
                system: system.as_line(&state.system),
                user: &user,
                threads,
                current_tid,
                max_depth: state.config.max_stack_depth(),
                introspect_memory: state.config.introspect_memory(),
            };
            let mut w = FdWriter::new(fd);
            if emit_crash_report(&mut w, &capture).is_err() {
                write_stderr(format_args!(
                    "vicrab-crash: report {} is incomplete",
                    path.as_str()
                ));
            }
            drop(w);
            // SAFETY: we opened it.
            unsafe { libc::close(fd) };
            if context.fatal {
                // Freeing could deadlock in a broken allocator; the process
                // is going away anyway.
                std::mem::forget(user);
            } else {
                user.restore();
            }
        }

        if suspend {
            suspender.resume_all(threads);
        }
    }

    fn write_recrash_marker(&self, context: &CrashContext<'_>) {
        if RECRASH_WRITTEN.swap(true, SeqCst) {
            return;
        }
        // SAFETY: see `handle`.
        let (Some(state), Some(slot)) = (unsafe { STATE.load(SeqCst).as_ref() }, unsafe {
            SLOT.load(SeqCst).as_ref()
        }) else {
            return;
        };
        let id = slot.id();
        let fd = slot
            .recrash_path(id)
            .open(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC);
        if fd < 0 {
            return;
        }
        let mut name = FixedBuf::<64>::new();
        thread_name(context.tid, &mut name);
        let header = HeaderLine {
            report_id: id.0,
            event_id: &slot.event_id,
            timestamp_micros: now_micros(),
            report_type: ReportType::Recrash,
            process_name: &state.system.process_name,
            app_name: state.config.app_name(),
        };
        let mut w = FdWriter::new(fd);
        let _ = emit_recrash_marker(&mut w, &header, context, name.as_str());
        drop(w);
        // SAFETY: we opened it.
        unsafe { libc::close(fd) };
    }
}

fn report_type_of(context: &CrashContext<'_>) -> ReportType {
    match context.kind {
        CrashKind::UserReported => ReportType::User,
        _ => ReportType::Standard,
    }
}

/// Leaves the Handling phase. The owner is cleared first so that a trigger
/// winning the next compare-and-swap never sees it.
fn end_handling(next: EnginePhase) {
    HANDLING_TID.store(0, SeqCst);
    HANDLING_FATAL.store(false, SeqCst);
    PHASE.store(next as u8, SeqCst);
}

/// Sleeps until no capture is running. Returns false on timeout.
fn wait_while_handling() -> bool {
    let timeout = TimeoutManager::new(CONCURRENT_CAPTURE_WAIT);
    while PHASE.load(SeqCst) == EnginePhase::Handling as u8 {
        if timeout.expired() {
            return false;
        }
        signal_safe_sleep(CONCURRENT_CAPTURE_POLL);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_report::Breadcrumb;
    use crate::recording::crash_context::UserReportInfo;
    use crate::recording::{add_breadcrumb, clear_breadcrumbs, update_user_context};
    use crate::test_utils::{lock_process_state, TestInstance};

    fn config(dir: &std::path::Path, monitors: MonitorSet) -> CrashMonitorConfiguration {
        CrashMonitorConfiguration::new(
            dir,
            "engine-test",
            monitors,
            2,
            false,
            PostCaptureAction::Reraise,
            vec![],
        )
        .unwrap()
    }

    fn user_context(name: &str) -> CrashContext<'_> {
        let mut context =
            CrashContext::new(CrashKind::UserReported, MonitorKind::UserReported, current_tid());
        context.exception_name = Some(name);
        context.user = Some(UserReportInfo {
            name,
            ..Default::default()
        });
        context
    }

    #[test]
    fn test_inactive_when_uninstalled() {
        let _guard = lock_process_state();
        let engine = RecordingEngine::global();
        assert_eq!(engine.phase(), EnginePhase::Uninstalled);
        assert_eq!(engine.handle(&user_context("nothing")), HandleOutcome::Inactive);
        assert!(matches!(
            engine.uninstall_all(),
            Err(EngineError::NotInstalled)
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_install_twice_fails() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        let report = engine
            .install(config(dir.path(), MonitorKind::UserReported.into()))
            .unwrap();
        assert_eq!(report.installed, MonitorKind::UserReported.into());
        assert!(report.declined.is_empty());
        let again = engine.install(config(dir.path(), MonitorSet::NONE));
        assert!(again.is_err());
        engine.uninstall_all().unwrap();
        assert_eq!(engine.installed_monitors(), MonitorSet::NONE);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_non_fatal_capture_resumes() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        engine
            .install(config(dir.path(), MonitorKind::UserReported.into()))
            .unwrap();
        let store = engine.report_store().unwrap();

        clear_breadcrumbs();
        add_breadcrumb(&Breadcrumb::new("ui", "clicked save")).unwrap();
        update_user_context(
            serde_json::json!({"user": "bob"})
                .as_object()
                .unwrap()
                .clone(),
        )
        .unwrap();

        assert_eq!(engine.handle(&user_context("First")), HandleOutcome::Resumed);
        assert_eq!(engine.phase(), EnginePhase::Installed);
        assert_eq!(engine.handle(&user_context("Second")), HandleOutcome::Resumed);

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        let first = store.read_report(ids[0]).unwrap();
        assert_eq!(first.header.report_type, ReportType::User);
        assert_eq!(first.header.app_name, "engine-test");
        assert_eq!(first.user_context.as_deref(), Some("{\"user\":\"bob\"}"));
        assert_eq!(first.breadcrumbs.len(), 1);
        assert!(first.crashed_thread().is_some());
        let second = store.read_report(ids[1]).unwrap();
        assert_ne!(first.header.event_id, second.header.event_id);
        // User data survives a non-fatal capture.
        assert_eq!(second.breadcrumbs.len(), 1);

        // Retention is enforced after every non-fatal capture.
        engine.handle(&user_context("Third"));
        assert_eq!(store.list().unwrap().len(), 2);

        engine.uninstall_all().unwrap();
        clear_breadcrumbs();
        update_user_context(serde_json::Map::new()).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_fatal_capture_is_terminal() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        engine.install(config(dir.path(), MonitorSet::NONE)).unwrap();
        let store = engine.report_store().unwrap();

        let mut context = user_context("Fatal");
        context.fatal = true;
        assert_eq!(engine.handle(&context), HandleOutcome::Captured);
        assert_eq!(engine.phase(), EnginePhase::Handled);
        assert_eq!(engine.handle(&user_context("Late")), HandleOutcome::Inactive);
        assert_eq!(store.list().unwrap().len(), 1);

        engine.uninstall_all().unwrap();
        assert_eq!(engine.phase(), EnginePhase::Uninstalled);
    }

    fn recrash_markers(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_str().unwrap().ends_with(&format!(".{RECRASH_EXTENSION}"))
            })
            .count()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_fatal_triggers_write_one_report() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        engine.install(config(dir.path(), MonitorSet::NONE)).unwrap();
        let store = engine.report_store().unwrap();

        let barrier = std::sync::Barrier::new(2);
        let outcomes: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = ["Left", "Right"]
                .into_iter()
                .map(|name| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        let mut context = user_context(name);
                        context.fatal = true;
                        barrier.wait();
                        engine.handle(&context)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| **outcome == HandleOutcome::Captured)
                .count(),
            1,
            "{outcomes:?}"
        );
        assert!(outcomes.iter().all(|outcome| matches!(
            outcome,
            HandleOutcome::Captured | HandleOutcome::ReentrantCrash | HandleOutcome::Inactive
        )));
        assert_eq!(engine.phase(), EnginePhase::Handled);
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.list_partial().unwrap().is_empty());
        assert!(recrash_markers(dir.path()) <= 1);

        engine.uninstall_all().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_existing_report_is_never_overwritten() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        engine
            .install(config(dir.path(), MonitorKind::UserReported.into()))
            .unwrap();
        let store = engine.report_store().unwrap();

        // Another process of the same app took the reserved id meanwhile.
        let taken = unsafe { SLOT.load(SeqCst).as_ref() }.unwrap().id();
        let mut other = crate::raw_report::RawReport::test_instance(1);
        other.header.report_id = taken.0;
        let other = other.to_bytes().unwrap();
        std::fs::write(store.report_path(taken), &other).unwrap();

        assert_eq!(engine.handle(&user_context("Mine")), HandleOutcome::Resumed);
        assert_eq!(std::fs::read(store.report_path(taken)).unwrap(), other);
        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], taken);
        let mine = store.read_report(ids[1]).unwrap();
        assert_eq!(mine.header.report_id, ids[1].0);
        assert_eq!(mine.context.unwrap().user.unwrap().name, "Mine");

        engine.uninstall_all().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_owner_is_cleared() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        engine
            .install(config(dir.path(), MonitorKind::UserReported.into()))
            .unwrap();

        assert_eq!(engine.handle(&user_context("Once")), HandleOutcome::Resumed);
        assert_eq!(HANDLING_TID.load(SeqCst), 0);
        assert!(!HANDLING_FATAL.load(SeqCst));
        // A later trigger on this thread is a new capture, not a nested one.
        assert_eq!(engine.handle(&user_context("Twice")), HandleOutcome::Resumed);
        assert_eq!(recrash_markers(dir.path()), 0);

        engine.uninstall_all().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reentrant_trigger_writes_marker() {
        let _guard = lock_process_state();
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::global();
        engine.install(config(dir.path(), MonitorSet::NONE)).unwrap();
        let store = engine.report_store().unwrap();

        // Pretend a capture on this thread is in flight.
        PHASE.store(EnginePhase::Handling as u8, SeqCst);
        HANDLING_TID.store(current_tid(), SeqCst);
        let outcome = engine.handle(&user_context("Nested"));
        assert_eq!(outcome, HandleOutcome::ReentrantCrash);
        end_handling(EnginePhase::Installed);

        let slot_id = unsafe { SLOT.load(SeqCst).as_ref() }.unwrap().id();
        let marker = store.read_recrash(slot_id).unwrap().unwrap();
        assert_eq!(marker.header.report_type, ReportType::Recrash);
        assert_eq!(marker.header.report_id, slot_id.0);
        // The primary report was never written: nothing complete to list.
        assert!(store.list().unwrap().is_empty());

        engine.uninstall_all().unwrap();
    }
}
