// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash detectors, one per crash source.
//!
//! Every monitor converts its native crash representation into a
//! [`crate::recording::CrashContext`] and hands it to the recording engine.
//! Until that hand-off, monitors only do what is legal inside a signal
//! handler.

mod kind;
mod siginfo;

#[cfg(feature = "recording")]
mod cpp_exception;
#[cfg(feature = "recording")]
mod language_exception;
#[cfg(feature = "recording")]
mod mach_exception;
#[cfg(feature = "recording")]
mod monitor;
#[cfg(feature = "recording")]
mod signal;
#[cfg(feature = "recording")]
mod user_reported;
#[cfg(feature = "recording")]
mod watchdog;
#[cfg(feature = "recording")]
mod zombie;

pub use kind::{MonitorKind, MonitorSet};
pub use siginfo::{code_name, has_fault_address, signal_from_signum, signal_name, siginfo_code};

#[cfg(feature = "recording")]
pub use monitor::{is_debugger_attached, monitor_for, Monitor, MonitorError};
#[cfg(feature = "recording")]
pub use user_reported::report_user_exception;
#[cfg(feature = "recording")]
pub use watchdog::heartbeat;
#[cfg(feature = "recording")]
pub use zombie::{
    note_allocation, note_deallocation, policy_from_kind, EveryNth, SizeAtMost, ZombieAllocator,
    ZombiePolicy, ZombieTracker,
};
