// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-capture processing of reports.
//!
//! Everything here runs in normal context, usually on a background thread
//! at the next start of the application. A [`Filter`] transforms a
//! [`ParsedReport`] in place; a [`FilterChain`] runs filters in order and
//! is a filter itself, so chains nest. [`build_chain`] turns a serialized
//! list of [`FilterSpec`]s into a chain and [`process_reports`] runs a chain
//! over every complete report of a store.

mod chain;
mod demangle;
mod discard;
mod enrich;
mod event;
mod merge_previous;
mod passthrough;
mod pipeline;
mod redact;
mod sanitize;
mod spec;
mod subset;
mod symbolicate;
pub mod tools;

pub use chain::{ChainOutcome, FilterChain, PROCESSING_ERRORS_KEY};
pub use demangle::Demangle;
pub use discard::DiscardWhen;
pub use enrich::{Enrich, Metadata};
pub use event::{event_schema, CrashEvent, EventConversion, EventFrame, EventThread};
pub use merge_previous::MergePreviousSession;
pub use passthrough::Passthrough;
pub use pipeline::{process_reports, ProcessedReport};
pub use redact::Redact;
pub use sanitize::Sanitize;
pub use spec::{build_chain, FilterKind, FilterSpec};
pub use subset::Subset;
pub use symbolicate::{BlazesymResolver, ResolvedSymbol, SymbolResolver, Symbolicate};

use crate::raw_report::ParsedReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a filter wants done with the report after it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Hand the report to the next filter.
    Continue,
    /// Stop here and drop the report. This is a decision, not a failure.
    Discard { reason: String },
}

/// One step of report processing.
pub trait Filter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Transforms `report` in place. On error the chain restores the report
    /// to what it was before the call.
    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction>;

    /// Lets a chain evaluate a nested chain in place instead of through
    /// [`Filter::apply`].
    fn as_chain(&self) -> Option<&FilterChain> {
        None
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterErrorKind {
    /// The filter was skipped and the chain went on.
    Processing,
    /// The chain stopped.
    Fatal,
}

impl fmt::Display for FilterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterErrorKind::Processing => f.write_str("processing"),
            FilterErrorKind::Fatal => f.write_str("fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error in filter {filter}: {message}")]
pub struct FilterError {
    pub filter: String,
    pub kind: FilterErrorKind,
    pub message: String,
}

impl FilterError {
    pub fn new(filter: &str, kind: FilterErrorKind, error: &anyhow::Error) -> Self {
        Self {
            filter: filter.to_string(),
            kind,
            message: format!("{error:#}"),
        }
    }
}
