// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture side: the crash context monitors fill in, the engine that
//! arbitrates between them, and the writer that streams a capture to disk.

mod binary_images;
mod crash_context;
mod engine;
mod system_info;
mod user_context;
mod writer;

pub use binary_images::{for_each_image, parse_maps_line};
pub use crash_context::{
    CrashContext, CrashKind, MachExceptionInfo, SignalInfo, UserReportInfo, ZombieHit,
};
pub use engine::{EngineError, EnginePhase, HandleOutcome, InstallReport, RecordingEngine};
pub use user_context::{add_breadcrumb, clear_breadcrumbs, update_user_context, MAX_BREADCRUMBS};

pub use crate::monitors::{heartbeat, report_user_exception};

/// Installs crash monitoring for the process with `config`.
///
/// Shorthand for [`RecordingEngine::install`] on the global engine.
pub fn install(
    config: crate::shared::configuration::CrashMonitorConfiguration,
) -> anyhow::Result<InstallReport> {
    RecordingEngine::global().install(config)
}

/// Uninstalls every monitor and forgets the configuration.
pub fn uninstall_all() -> Result<(), EngineError> {
    RecordingEngine::global().uninstall_all()
}
