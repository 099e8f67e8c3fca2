// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Below the first mapped page, yet aligned and non-null so that debug
/// builds do not turn the write into a panic.
pub const UNMAPPED_ADDRESS: u64 = 0x10;

/// The faults `crashing_app` knows how to trigger once monitoring is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    /// Write to an unmapped page near null (SIGSEGV)
    NullDeref,
    /// `abort()` (SIGABRT)
    Abort,
    /// Raise SIGBUS
    RaiseSigBus,
    /// Rust panic
    Panic,
    /// Non-fatal user report, the process keeps running and exits cleanly
    UserReport,
}

impl FaultType {
    /// Returns the string representation used in command-line arguments.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NullDeref => "null_deref",
            Self::Abort => "abort",
            Self::RaiseSigBus => "raise_sigbus",
            Self::Panic => "panic",
            Self::UserReport => "user_report",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::NullDeref,
            Self::Abort,
            Self::RaiseSigBus,
            Self::Panic,
            Self::UserReport,
        ]
    }

    /// The signal that ends the process once the report has been written and
    /// the original disposition restored. `None` when the process survives.
    pub const fn terminating_signal(self) -> Option<i32> {
        match self {
            Self::NullDeref => Some(libc::SIGSEGV),
            Self::RaiseSigBus => Some(libc::SIGBUS),
            // A panic ends in abort() once it is captured.
            Self::Abort | Self::Panic => Some(libc::SIGABRT),
            Self::UserReport => None,
        }
    }

    /// The faulting address `crashing_app` writes to, for the faults that
    /// have one.
    pub const fn fault_address(self) -> Option<u64> {
        match self {
            Self::NullDeref => Some(UNMAPPED_ADDRESS),
            _ => None,
        }
    }

    /// The monitor expected to claim the fault.
    pub const fn monitor(self) -> &'static str {
        match self {
            Self::NullDeref | Self::Abort | Self::RaiseSigBus => "signal",
            Self::Panic => "language_exception",
            Self::UserReport => "user_reported",
        }
    }

    /// The `report.type` of the written report.
    pub const fn report_type(self) -> &'static str {
        match self {
            Self::UserReport => "user",
            _ => "standard",
        }
    }
}

impl std::fmt::Display for FaultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FaultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|fault| fault.as_str() == s)
            .ok_or_else(|| format!("Unknown fault type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_type_str_roundtrip() {
        for fault in FaultType::all() {
            let parsed: FaultType = fault.as_str().parse().unwrap();
            assert_eq!(*fault, parsed);
        }
        assert!("sigpipe".parse::<FaultType>().is_err());
    }

    #[test]
    fn test_fault_type_outcomes() {
        assert_eq!(FaultType::NullDeref.terminating_signal(), Some(libc::SIGSEGV));
        assert_eq!(FaultType::Panic.terminating_signal(), Some(libc::SIGABRT));
        assert_eq!(FaultType::UserReport.terminating_signal(), None);
        assert_eq!(FaultType::Panic.monitor(), "language_exception");
        assert_eq!(FaultType::UserReport.report_type(), "user");
        assert_eq!(FaultType::NullDeref.fault_address(), Some(UNMAPPED_ADDRESS));
        assert_eq!(FaultType::Abort.fault_address(), None);
    }
}
