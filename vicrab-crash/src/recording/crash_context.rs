// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::monitors::MonitorKind;
use crate::unwind::MachineContext;

/// What kind of event produced a crash context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrashKind {
    Signal,
    MachException,
    Panic,
    CppException,
    Deadlock,
    UserReported,
}

impl CrashKind {
    pub const fn name(self) -> &'static str {
        match self {
            CrashKind::Signal => "signal",
            CrashKind::MachException => "mach_exception",
            CrashKind::Panic => "panic",
            CrashKind::CppException => "cpp_exception",
            CrashKind::Deadlock => "deadlock",
            CrashKind::UserReported => "user_reported",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            CrashKind::Signal,
            CrashKind::MachException,
            CrashKind::Panic,
            CrashKind::CppException,
            CrashKind::Deadlock,
            CrashKind::UserReported,
        ]
        .into_iter()
        .find(|kind| kind.name() == name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub number: i32,
    pub code: i32,
    /// Faulting address, for the signals that carry one.
    pub address: Option<usize>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MachExceptionInfo {
    pub exception: i32,
    pub code: i64,
    pub subcode: i64,
}

/// The fields of an explicit report made through `report_user_exception`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct UserReportInfo<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    /// A caller supplied backtrace, as a JSON document.
    pub stack_json: Option<&'a str>,
}

/// A freed allocation the crash appears to have touched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZombieHit {
    pub address: usize,
    pub size: usize,
}

/// Everything a monitor knows about the event it caught.
///
/// Built on the stack of the handler that caught the event and dropped when
/// the handler returns. Strings are borrowed from the monitor; nothing here
/// owns heap memory.
#[derive(Debug, Copy, Clone)]
pub struct CrashContext<'a> {
    pub kind: CrashKind,
    pub monitor: MonitorKind,
    /// Whether the process is expected to end once the report is written.
    pub fatal: bool,
    /// Whether the other threads are suspended and walked too, when the
    /// configuration allows it.
    pub all_threads: bool,
    /// Thread the event is about. For a deadlock this is the watched
    /// thread, not the one running the capture.
    pub tid: u64,
    /// Registers of that thread, when the event delivered them.
    pub machine: Option<MachineContext>,
    pub signal: Option<SignalInfo>,
    pub mach: Option<MachExceptionInfo>,
    /// Language level exception or panic: name and message.
    pub exception_name: Option<&'a str>,
    pub reason: Option<&'a str>,
    /// Demangled or raw name of a C++ exception type.
    pub cpp_type: Option<&'a str>,
    pub user: Option<UserReportInfo<'a>>,
    pub stack_overflow: bool,
    pub zombie: Option<ZombieHit>,
}

impl<'a> CrashContext<'a> {
    pub fn new(kind: CrashKind, monitor: MonitorKind, tid: u64) -> Self {
        Self {
            kind,
            monitor,
            fatal: kind != CrashKind::UserReported,
            all_threads: true,
            tid,
            machine: None,
            signal: None,
            mach: None,
            exception_name: None,
            reason: None,
            cpp_type: None,
            user: None,
            stack_overflow: false,
            zombie: None,
        }
    }

    /// The address worth checking against recently freed memory.
    pub fn fault_address(&self) -> Option<usize> {
        if let Some(address) = self.signal.and_then(|signal| signal.address) {
            return Some(address);
        }
        self.mach
            .filter(|mach| mach.subcode != 0)
            .map(|mach| mach.subcode as usize)
    }

    /// Whether the fault is a bad access close to the stack pointer, which is
    /// what running off the end of the stack looks like.
    pub fn looks_like_stack_overflow(&self) -> bool {
        let (Some(address), Some(machine)) = (self.fault_address(), self.machine) else {
            return false;
        };
        let page = crate::recording_tools::cached_page_size();
        machine.sp != 0 && address.abs_diff(machine.sp) <= 2 * page
    }
}
