// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deadlock detection.
//!
//! The thread that installs the monitor becomes the watched thread and is
//! expected to call [`heartbeat`] more often than the configured interval,
//! typically once per iteration of its event loop. A background thread
//! checks the heartbeat; when it goes stale, the watchdog synthesizes a
//! deadlock crash for the watched thread, whose registers come from the
//! thread suspender, and then aborts the process.

use super::{Monitor, MonitorError, MonitorKind};
use crate::recording::{CrashContext, CrashKind, HandleOutcome, RecordingEngine};
use crate::shared::configuration::CrashMonitorConfiguration;
use crate::unwind::current_tid;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static WATCHED_TID: AtomicU64 = AtomicU64::new(0);
/// Milliseconds since [`epoch`] at the last heartbeat.
static LAST_BEAT_MS: AtomicU64 = AtomicU64::new(0);
static INTERVAL_MS: AtomicU64 = AtomicU64::new(0);
static STOP: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static WORKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Tells the watchdog the watched thread is making progress.
pub fn heartbeat() {
    LAST_BEAT_MS.store(now_ms(), SeqCst);
}

/// Whether the last heartbeat is older than the interval, given the time
/// now. Both in milliseconds.
fn is_stale(last_beat: u64, now: u64, interval: u64) -> bool {
    now.saturating_sub(last_beat) > interval
}

pub(crate) struct WatchdogMonitor;

pub(crate) static WATCHDOG_MONITOR: WatchdogMonitor = WatchdogMonitor;

impl Monitor for WatchdogMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Watchdog
    }

    fn install(&self, config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        let mut worker = WORKER
            .lock()
            .map_err(|e| MonitorError::install_failed(MonitorKind::Watchdog, e))?;
        if worker.is_some() {
            return Ok(());
        }
        let interval = config.watchdog_interval();
        WATCHED_TID.store(current_tid(), SeqCst);
        INTERVAL_MS.store(interval.as_millis() as u64, SeqCst);
        STOP.store(false, SeqCst);
        heartbeat();
        let handle = std::thread::Builder::new()
            .name("vicrab-watchdog".to_string())
            .spawn(move || watch(interval))
            .map_err(|e| MonitorError::install_failed(MonitorKind::Watchdog, e))?;
        *worker = Some(handle);
        INSTALLED.store(true, SeqCst);
        tracing::debug!(
            watched_tid = WATCHED_TID.load(SeqCst),
            ?interval,
            "Watchdog started"
        );
        Ok(())
    }

    fn uninstall(&self) {
        let Ok(mut worker) = WORKER.lock() else {
            return;
        };
        let Some(handle) = worker.take() else {
            return;
        };
        INSTALLED.store(false, SeqCst);
        STOP.store(true, SeqCst);
        handle.thread().unpark();
        if handle.join().is_err() {
            tracing::warn!("Watchdog thread panicked");
        }
    }

    fn is_installed(&self) -> bool {
        INSTALLED.load(SeqCst)
    }
}

fn watch(interval: Duration) {
    // Poll a few times per interval so a deadlock is caught close to the
    // deadline.
    let poll = (interval / 4).max(Duration::from_millis(5));
    loop {
        std::thread::park_timeout(poll);
        if STOP.load(SeqCst) {
            return;
        }
        let last_beat = LAST_BEAT_MS.load(SeqCst);
        if !is_stale(last_beat, now_ms(), INTERVAL_MS.load(SeqCst)) {
            continue;
        }
        tracing::error!(
            watched_tid = WATCHED_TID.load(SeqCst),
            stale_for_ms = now_ms().saturating_sub(last_beat),
            "Watched thread stopped responding"
        );
        let mut context = CrashContext::new(
            CrashKind::Deadlock,
            MonitorKind::Watchdog,
            WATCHED_TID.load(SeqCst),
        );
        context.exception_name = Some("deadlock");
        context.reason = Some("The watched thread stopped sending heartbeats");
        match RecordingEngine::global().handle(&context) {
            HandleOutcome::Captured | HandleOutcome::ReentrantCrash => std::process::abort(),
            // Another crash is being handled or already was; nothing to add.
            HandleOutcome::Inactive | HandleOutcome::Resumed => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness() {
        assert!(!is_stale(1_000, 1_500, 1_000));
        assert!(!is_stale(1_000, 2_000, 1_000));
        assert!(is_stale(1_000, 2_001, 1_000));
        // A heartbeat racing ahead of the reading is never stale.
        assert!(!is_stale(2_000, 1_000, 10));
    }

    #[test]
    fn test_heartbeat_moves_forward() {
        heartbeat();
        let first = LAST_BEAT_MS.load(SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        heartbeat();
        assert!(LAST_BEAT_MS.load(SeqCst) >= first + 5);
    }
}
