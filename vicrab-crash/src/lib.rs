// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash monitoring and postmortem reports.
//!
//! The crate has two halves:
//! 1. Capture. Monitors ([`monitors`]) detect one kind of fault each (fatal
//!    signals, Mach exceptions, uncaught C++ and language exceptions, hangs,
//!    use of freed memory, explicit user reports) and hand a crash context
//!    to the recording engine. The engine lets the first monitor to fire
//!    win, optionally suspends the other threads, and streams the context,
//!    every thread's registers and stack, the binary image list and the
//!    user context to a report file. All of that runs in a signal handler or
//!    on a thread interrupted by one, so it uses only async-signal-safe
//!    operations: no allocation, no locks, fixed-size buffers prepared at
//!    install time.
//!    https://man7.org/linux/man-pages/man7/signal-safety.7.html
//! 2. Processing. At the next start of the application the report store
//!    ([`store`]) lists the complete reports, and the filter pipeline
//!    ([`filters`]) decodes each into a tree and runs a chain of
//!    transformations over it: symbolication, demangling, enrichment,
//!    redaction, merging of related reports, and finally conversion into a
//!    transmittable event.
//!
//! A report whose capture was interrupted lacks its terminating line. The
//! store lists such reports separately and the pipeline can attach them to
//! the next report as context.
#![cfg(unix)]

#[cfg(feature = "filters")]
pub mod filters;
pub mod monitors;
pub mod raw_report;
#[cfg(feature = "recording")]
pub mod recording;
pub mod recording_tools;
pub mod shared;
pub mod store;
pub mod unwind;

mod test_utils;

pub use monitors::{MonitorError, MonitorKind, MonitorSet};
pub use raw_report::{ParsedReport, RawReport, ReportType};
pub use shared::configuration::{CrashMonitorConfiguration, PostCaptureAction};
pub use store::{ReportId, ReportStore, StoreError};
