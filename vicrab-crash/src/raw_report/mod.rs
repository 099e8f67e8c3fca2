// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The on-disk raw report: how the capture path writes it, how the store
//! decodes it, and how a decoded report becomes the tree the filters work on.
//!
//! The format is line oriented. The first line is
//! `VICRAB_CRASH_REPORT <version>`, followed by blocks framed by
//! `VICRAB_CRASH_BEGIN_<NAME>` / `VICRAB_CRASH_END_<NAME>` lines (see
//! [`crate::shared::constants`]), and a final `VICRAB_CRASH_DONE` line. Each
//! line inside a block is one JSON value. Lines are written through the
//! borrowed `*Line` types of [`emit`] so the crash handler never allocates;
//! the decoder produces the owned `*Record` types, which convert back to the
//! line types, so a decoded report re-encodes to the same bytes.

pub mod emit;
mod decode;
mod encode;
mod records;
mod tree;

pub use decode::{decode, decode_partial};
pub use records::{
    BinaryImageRecord, Breadcrumb, BreadcrumbLevel, ContextRecord, CppExceptionRecord,
    CrashRecord, ExceptionRecord, FrameRecord, HeaderRecord, MachRecord, RawReport,
    SignalRecord, StackChunkRecord, SystemRecord, ThreadRecord, UnknownBlock, UserRecord,
    ZombieRecord,
};
pub use tree::ParsedReport;

use serde::{Deserialize, Serialize};

/// What a report file documents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// A crash caught by a monitor.
    Standard,
    /// A crash that happened while another crash was being captured. Written
    /// next to the primary report, which is usually left partial.
    Recrash,
    /// An explicit report made by the application.
    User,
}

impl ReportType {
    pub const fn name(self) -> &'static str {
        match self {
            ReportType::Standard => "standard",
            ReportType::Recrash => "recrash",
            ReportType::User => "user",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Missing report magic on the first line")]
    MissingMagic,
    #[error("Unsupported report format version {0}")]
    UnsupportedVersion(u32),
    #[error("Line {line_no}: unexpected line {line:?}")]
    UnexpectedLine { line_no: usize, line: String },
    #[error("Line {line_no}: {source}")]
    Json {
        line_no: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Line {line_no}: invalid value: {reason}")]
    InvalidValue { line_no: usize, reason: String },
    #[error("Report has no header block")]
    MissingHeader,
    #[error("Report is not valid UTF-8")]
    NotUtf8,
}
