// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delimiters of the on-disk raw report format.
//!
//! A raw report is a line oriented stream. The first line is the format
//! magic followed by the format version. Every block is framed by a
//! `VICRAB_CRASH_BEGIN_*` and a matching `VICRAB_CRASH_END_*` line, and the
//! lines in between carry one JSON value each. A report is complete once the
//! [`VICRAB_CRASH_DONE`] line has been written; anything without it is a
//! partial report.

use std::time::Duration;

/// First token of every raw report.
pub const VICRAB_CRASH_MAGIC: &str = "VICRAB_CRASH_REPORT";
/// Format version written by this build.
pub const VICRAB_CRASH_FORMAT_VERSION: u32 = 1;
/// Oldest format version the decoder still understands.
pub const VICRAB_CRASH_MIN_FORMAT_VERSION: u32 = 1;

/// Header block: report id, event id, timestamp, report type and process name.
pub const VICRAB_CRASH_BEGIN_HEADER: &str = "VICRAB_CRASH_BEGIN_HEADER";
pub const VICRAB_CRASH_END_HEADER: &str = "VICRAB_CRASH_END_HEADER";

/// Crash context block: what fired, on which thread, and why.
pub const VICRAB_CRASH_BEGIN_CONTEXT: &str = "VICRAB_CRASH_BEGIN_CONTEXT";
pub const VICRAB_CRASH_END_CONTEXT: &str = "VICRAB_CRASH_END_CONTEXT";

/// Process and host information gathered at capture time.
pub const VICRAB_CRASH_BEGIN_SYSTEM: &str = "VICRAB_CRASH_BEGIN_SYSTEM";
pub const VICRAB_CRASH_END_SYSTEM: &str = "VICRAB_CRASH_END_SYSTEM";

/// The user context as it was last set before the crash, one JSON object.
pub const VICRAB_CRASH_BEGIN_USER_CONTEXT: &str = "VICRAB_CRASH_BEGIN_USER_CONTEXT";
pub const VICRAB_CRASH_END_USER_CONTEXT: &str = "VICRAB_CRASH_END_USER_CONTEXT";

/// Breadcrumbs, oldest first, one JSON object per line.
pub const VICRAB_CRASH_BEGIN_BREADCRUMBS: &str = "VICRAB_CRASH_BEGIN_BREADCRUMBS";
pub const VICRAB_CRASH_END_BREADCRUMBS: &str = "VICRAB_CRASH_END_BREADCRUMBS";

/// One block per captured thread. Registers, frames and the optional stack
/// dump are nested blocks inside it.
pub const VICRAB_CRASH_BEGIN_THREAD: &str = "VICRAB_CRASH_BEGIN_THREAD";
pub const VICRAB_CRASH_END_THREAD: &str = "VICRAB_CRASH_END_THREAD";
pub const VICRAB_CRASH_BEGIN_REGISTERS: &str = "VICRAB_CRASH_BEGIN_REGISTERS";
pub const VICRAB_CRASH_END_REGISTERS: &str = "VICRAB_CRASH_END_REGISTERS";
pub const VICRAB_CRASH_BEGIN_FRAMES: &str = "VICRAB_CRASH_BEGIN_FRAMES";
pub const VICRAB_CRASH_END_FRAMES: &str = "VICRAB_CRASH_END_FRAMES";
/// Written inside a frames block when the walk hit the depth bound.
pub const VICRAB_CRASH_FRAMES_TRUNCATED: &str = "VICRAB_CRASH_FRAMES_TRUNCATED";
pub const VICRAB_CRASH_BEGIN_STACK_DUMP: &str = "VICRAB_CRASH_BEGIN_STACK_DUMP";
pub const VICRAB_CRASH_END_STACK_DUMP: &str = "VICRAB_CRASH_END_STACK_DUMP";

/// Loaded objects and their load addresses, one JSON object per line.
pub const VICRAB_CRASH_BEGIN_BINARY_IMAGES: &str = "VICRAB_CRASH_BEGIN_BINARY_IMAGES";
pub const VICRAB_CRASH_END_BINARY_IMAGES: &str = "VICRAB_CRASH_END_BINARY_IMAGES";

/// Prefix shared by every block delimiter.
pub const VICRAB_CRASH_BEGIN_PREFIX: &str = "VICRAB_CRASH_BEGIN_";
pub const VICRAB_CRASH_END_PREFIX: &str = "VICRAB_CRASH_END_";

/// Terminator. Once written, the report is complete and immutable.
pub const VICRAB_CRASH_DONE: &str = "VICRAB_CRASH_DONE";

/// Extension of complete and partial raw reports.
pub const REPORT_EXTENSION: &str = "vcr";
/// Extension of the marker left by a crash during crash handling.
pub const RECRASH_EXTENSION: &str = "recrash";

/// How long the capturing thread waits for other threads to park themselves.
pub const THREAD_SUSPEND_TIMEOUT: Duration = Duration::from_millis(500);
/// Default watchdog period.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of complete reports kept on disk.
pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;
