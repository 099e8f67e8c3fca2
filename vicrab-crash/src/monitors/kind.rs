// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of crash sources this crate knows how to monitor.
///
/// The discriminants are the bits used by [`MonitorSet`] and are stable: they
/// end up in configuration files.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MonitorKind {
    /// Hardware exceptions delivered through Mach exception ports.
    MachException = 0x01,
    /// Fatal POSIX signals.
    Signal = 0x02,
    /// A C++ exception reaching `std::terminate`.
    CppException = 0x04,
    /// A Rust panic, the language level uncaught exception.
    LanguageException = 0x08,
    /// The watched thread stopped making progress.
    Watchdog = 0x10,
    /// Explicit, synchronous report requested by the application.
    UserReported = 0x20,
    /// Use of memory that was recently freed.
    Zombie = 0x100,
}

impl MonitorKind {
    /// Every kind, in handling priority order. When more than one monitor can
    /// plausibly claim a fault, the earlier one wins: the Mach port sees a bad
    /// access before the kernel turns it into a signal, and the language
    /// handlers run before they end in `abort()`.
    pub const ALL: [MonitorKind; 7] = [
        MonitorKind::MachException,
        MonitorKind::Signal,
        MonitorKind::CppException,
        MonitorKind::LanguageException,
        MonitorKind::Zombie,
        MonitorKind::Watchdog,
        MonitorKind::UserReported,
    ];

    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Position in [`MonitorKind::ALL`]; lower runs first.
    pub fn priority(self) -> usize {
        match self {
            MonitorKind::MachException => 0,
            MonitorKind::Signal => 1,
            MonitorKind::CppException => 2,
            MonitorKind::LanguageException => 3,
            MonitorKind::Zombie => 4,
            MonitorKind::Watchdog => 5,
            MonitorKind::UserReported => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MonitorKind::MachException => "mach_exception",
            MonitorKind::Signal => "signal",
            MonitorKind::CppException => "cpp_exception",
            MonitorKind::LanguageException => "language_exception",
            MonitorKind::Watchdog => "watchdog",
            MonitorKind::UserReported => "user_reported",
            MonitorKind::Zombie => "zombie",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Monitors that break or confuse an attached debugger.
    pub fn is_debugger_unsafe(self) -> bool {
        MonitorSet::DEBUGGER_UNSAFE.contains(self)
    }

    /// Monitors whose trigger path runs in async-signal context.
    pub fn is_async_safe(self) -> bool {
        MonitorSet::ASYNC_SAFE.contains(self)
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bitmask of [`MonitorKind`]s.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorSet(u32);

impl MonitorSet {
    pub const NONE: MonitorSet = MonitorSet(0);
    pub const ALL: MonitorSet = MonitorSet(0x01 | 0x02 | 0x04 | 0x08 | 0x10 | 0x20 | 0x100);
    /// Mach | Signal | LanguageException
    pub const DEBUGGER_UNSAFE: MonitorSet = MonitorSet(0x01 | 0x02 | 0x08);
    /// Mach | Signal
    pub const ASYNC_SAFE: MonitorSet = MonitorSet(0x01 | 0x02);
    /// Everything except the watchdog, whose false positives are unacceptable
    /// in production builds.
    pub const PRODUCTION_SAFE: MonitorSet = MonitorSet(Self::ALL.0 & !0x10);
    /// Everything that does not need a debugger to be absent.
    pub const DEBUGGER_SAFE: MonitorSet = MonitorSet(Self::ALL.0 & !Self::DEBUGGER_UNSAFE.0);

    pub const fn from_bits_truncate(bits: u32) -> Self {
        MonitorSet(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, kind: MonitorKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: MonitorKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: MonitorKind) {
        self.0 &= !kind.bit();
    }

    pub const fn union(self, other: MonitorSet) -> MonitorSet {
        MonitorSet(self.0 | other.0)
    }

    pub const fn difference(self, other: MonitorSet) -> MonitorSet {
        MonitorSet(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the contained kinds in priority order.
    pub fn iter(self) -> impl Iterator<Item = MonitorKind> {
        MonitorKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<MonitorKind> for MonitorSet {
    fn from_iter<T: IntoIterator<Item = MonitorKind>>(iter: T) -> Self {
        let mut set = MonitorSet::NONE;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl From<MonitorKind> for MonitorSet {
    fn from(kind: MonitorKind) -> Self {
        MonitorSet(kind.bit())
    }
}

impl fmt::Debug for MonitorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groupings() {
        assert!(MonitorSet::DEBUGGER_UNSAFE.contains(MonitorKind::Signal));
        assert!(!MonitorSet::DEBUGGER_SAFE.contains(MonitorKind::MachException));
        assert!(MonitorSet::DEBUGGER_SAFE.contains(MonitorKind::Zombie));
        assert!(!MonitorSet::PRODUCTION_SAFE.contains(MonitorKind::Watchdog));
        assert_eq!(MonitorSet::ALL.iter().count(), MonitorKind::ALL.len());
    }

    #[test]
    fn test_iteration_follows_priority() {
        let set: MonitorSet = [
            MonitorKind::UserReported,
            MonitorKind::Signal,
            MonitorKind::MachException,
        ]
        .into_iter()
        .collect();
        let order: Vec<_> = set.iter().collect();
        assert_eq!(
            order,
            vec![
                MonitorKind::MachException,
                MonitorKind::Signal,
                MonitorKind::UserReported
            ]
        );
        for pair in MonitorKind::ALL.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    #[test]
    fn test_names_round_trip() {
        for kind in MonitorKind::ALL {
            assert_eq!(MonitorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MonitorKind::from_name("nope"), None);
    }

    #[test]
    fn test_truncates_unknown_bits() {
        let set = MonitorSet::from_bits_truncate(0xFFFF_FFFF);
        assert_eq!(set, MonitorSet::ALL);
        assert_eq!(serde_json::to_string(&MonitorSet::ASYNC_SAFE).unwrap(), "3");
    }
}
