// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::MonitorKind;
use crate::recording::CrashContext;
use crate::shared::configuration::CrashMonitorConfiguration;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Not available on this platform or build. The registry carries on
    /// without the monitor.
    #[error("The {0} monitor is not supported on this platform")]
    UnsupportedPlatform(MonitorKind),
    #[error("Failed to install the {kind} monitor: {reason}")]
    InstallFailed { kind: MonitorKind, reason: String },
}

impl MonitorError {
    pub(crate) fn install_failed(kind: MonitorKind, reason: impl std::fmt::Display) -> Self {
        MonitorError::InstallFailed {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, MonitorError::UnsupportedPlatform(_))
    }
}

/// A crash detector.
///
/// `install` is idempotent: installing an installed monitor succeeds without
/// doing anything. `uninstall` puts back whatever the monitor replaced and is
/// a no-op when nothing is installed.
pub trait Monitor: Sync {
    fn kind(&self) -> MonitorKind;

    fn install(&self, config: &CrashMonitorConfiguration) -> Result<(), MonitorError>;

    fn uninstall(&self);

    fn is_installed(&self) -> bool;

    /// Called for every installed monitor once a capture has started,
    /// whichever monitor fired. Runs inside the capture window.
    fn add_contextual_info(&self, _context: &mut CrashContext<'_>) {}
}

/// The process-wide instance of the monitor for `kind`.
pub fn monitor_for(kind: MonitorKind) -> &'static dyn Monitor {
    match kind {
        MonitorKind::MachException => &super::mach_exception::MACH_EXCEPTION_MONITOR,
        MonitorKind::Signal => &super::signal::SIGNAL_MONITOR,
        MonitorKind::CppException => &super::cpp_exception::CPP_EXCEPTION_MONITOR,
        MonitorKind::LanguageException => &super::language_exception::LANGUAGE_EXCEPTION_MONITOR,
        MonitorKind::Zombie => &super::zombie::ZOMBIE_MONITOR,
        MonitorKind::Watchdog => &super::watchdog::WATCHDOG_MONITOR,
        MonitorKind::UserReported => &super::user_reported::USER_REPORTED_MONITOR,
    }
}

/// Whether a debugger is tracing this process.
///
/// Linux reads `TracerPid` from `/proc/self/status`; macOS checks `P_TRACED`
/// through `sysctl`. Anything that cannot be determined counts as "no".
pub fn is_debugger_attached() -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return false;
        };
        tracer_pid(&status).is_some_and(|pid| pid != 0)
    }
    #[cfg(target_os = "macos")]
    {
        // From <sys/proc.h>.
        const P_TRACED: i32 = 0x0000_0800;
        let mut mib = [
            libc::CTL_KERN,
            libc::KERN_PROC,
            libc::KERN_PROC_PID,
            // SAFETY: getpid has no preconditions.
            unsafe { libc::getpid() },
        ];
        // SAFETY: kinfo_proc is plain data.
        let mut info: libc::kinfo_proc = unsafe { std::mem::zeroed() };
        let mut size = std::mem::size_of::<libc::kinfo_proc>();
        // SAFETY: the buffers match the sizes passed in.
        let rval = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as libc::c_uint,
                &mut info as *mut _ as *mut libc::c_void,
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        rval == 0 && info.kp_proc.p_flag & P_TRACED != 0
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

#[cfg(any(target_os = "linux", test))]
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_consistent() {
        for kind in MonitorKind::ALL {
            assert_eq!(monitor_for(kind).kind(), kind);
        }
    }

    #[test]
    fn test_tracer_pid() {
        let status = "Name:\tcat\nState:\tR (running)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(tracer_pid(status), Some(4242));
        assert_eq!(tracer_pid("TracerPid:\t0\n"), Some(0));
        assert_eq!(tracer_pid("Name:\tcat\n"), None);
    }

    #[test]
    fn test_error_classification() {
        assert!(MonitorError::UnsupportedPlatform(MonitorKind::MachException).is_unsupported());
        let error = MonitorError::install_failed(MonitorKind::Signal, "sigaction failed");
        assert!(!error.is_unsupported());
        assert_eq!(
            error.to_string(),
            "Failed to install the signal monitor: sigaction failed"
        );
    }
}
