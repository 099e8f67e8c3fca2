// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Monitor, MonitorError, MonitorKind};
use crate::recording::{CrashContext, CrashKind, HandleOutcome, RecordingEngine, UserReportInfo};
use crate::shared::configuration::CrashMonitorConfiguration;
use crate::unwind::current_tid;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

static INSTALLED: AtomicBool = AtomicBool::new(false);

pub(crate) struct UserReportedMonitor;

pub(crate) static USER_REPORTED_MONITOR: UserReportedMonitor = UserReportedMonitor;

impl Monitor for UserReportedMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::UserReported
    }

    fn install(&self, _config: &CrashMonitorConfiguration) -> Result<(), MonitorError> {
        INSTALLED.store(true, SeqCst);
        Ok(())
    }

    fn uninstall(&self) {
        INSTALLED.store(false, SeqCst);
    }

    fn is_installed(&self) -> bool {
        INSTALLED.load(SeqCst)
    }
}

/// Writes a report for an exception the application caught itself, typically
/// one raised by a scripting language it embeds.
///
/// `stack_json`, when given, is a JSON document describing the caller's own
/// backtrace and is stored as-is. With `log_all_threads`, every thread is
/// suspended and walked as for a real crash. With `terminate`, the report is
/// fatal: the process ends once it has been written.
///
/// Returns [`HandleOutcome::Inactive`] without writing anything if the
/// monitor is not installed.
pub fn report_user_exception(
    name: &str,
    reason: Option<&str>,
    language: Option<&str>,
    line_of_code: Option<&str>,
    stack_json: Option<&str>,
    log_all_threads: bool,
    terminate: bool,
) -> HandleOutcome {
    if !INSTALLED.load(SeqCst) {
        return HandleOutcome::Inactive;
    }
    let mut context =
        CrashContext::new(CrashKind::UserReported, MonitorKind::UserReported, current_tid());
    context.fatal = terminate;
    context.all_threads = log_all_threads;
    context.exception_name = Some(name);
    context.reason = reason;
    context.user = Some(UserReportInfo {
        name,
        reason,
        language,
        line_of_code,
        stack_json,
    });
    let outcome = RecordingEngine::global().handle(&context);
    if terminate && outcome == HandleOutcome::Captured {
        std::process::abort();
    }
    outcome
}
