// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Filter, FilterAction, FilterError, FilterErrorKind};
use crate::raw_report::ParsedReport;
use serde_json::Value;

/// Key under which the non-fatal errors of a run are recorded in the report.
pub const PROCESSING_ERRORS_KEY: &str = "processing_errors";

#[derive(Debug)]
struct ChainEntry {
    filter: Box<dyn Filter>,
    fatal: bool,
}

/// An ordered sequence of filters, itself a filter.
///
/// Filters run left to right. A nested chain is evaluated in place, depth
/// first, so `[a, b].then([c])` behaves exactly like `[a, b, c]`.
///
/// A filter that returns an error is undone: the report goes on as it was
/// before that filter ran and the error is recorded. If the filter was added
/// as fatal, or sits inside a chain added as fatal, the run stops instead.
#[derive(Debug)]
pub struct FilterChain {
    name: String,
    entries: Vec<ChainEntry>,
}

/// What a run of a chain produced.
#[derive(Debug)]
pub enum ChainOutcome {
    Completed {
        report: ParsedReport,
        errors: Vec<FilterError>,
    },
    /// A filter decided the report should not be sent.
    Discarded {
        filter: String,
        reason: String,
        errors: Vec<FilterError>,
    },
    /// A fatal filter failed. The raw report should be kept for a retry.
    Failed {
        error: FilterError,
        errors: Vec<FilterError>,
    },
}

impl ChainOutcome {
    pub fn errors(&self) -> &[FilterError] {
        match self {
            ChainOutcome::Completed { errors, .. }
            | ChainOutcome::Discarded { errors, .. }
            | ChainOutcome::Failed { errors, .. } => errors,
        }
    }

    pub fn report(&self) -> Option<&ParsedReport> {
        match self {
            ChainOutcome::Completed { report, .. } => Some(report),
            _ => None,
        }
    }

    pub fn into_report(self) -> Option<ParsedReport> {
        match self {
            ChainOutcome::Completed { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

enum Step {
    Continue,
    Discard { filter: String, reason: String },
    Abort(FilterError),
}

impl FilterChain {
    pub fn new() -> Self {
        Self::named("chain")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: vec![],
        }
    }

    pub fn push(&mut self, filter: impl Filter + 'static, fatal: bool) {
        self.push_boxed(Box::new(filter), fatal)
    }

    pub fn push_boxed(&mut self, filter: Box<dyn Filter>, fatal: bool) {
        self.entries.push(ChainEntry { filter, fatal });
    }

    pub fn with(mut self, filter: impl Filter + 'static) -> Self {
        self.push(filter, false);
        self
    }

    pub fn with_fatal(mut self, filter: impl Filter + 'static) -> Self {
        self.push(filter, true);
        self
    }

    /// Appends `other` as a nested chain.
    pub fn then(mut self, other: FilterChain) -> Self {
        self.push(other, false);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the leaf filters in the order they run.
    pub fn filter_names(&self) -> Vec<String> {
        let mut names = vec![];
        for entry in &self.entries {
            match entry.filter.as_chain() {
                Some(chain) => names.extend(chain.filter_names()),
                None => names.push(entry.filter.name().to_string()),
            }
        }
        names
    }

    /// Runs the chain over `report`. Non-fatal errors are returned and also
    /// appended to the report under [`PROCESSING_ERRORS_KEY`].
    pub fn run(&self, mut report: ParsedReport) -> ChainOutcome {
        let mut errors = vec![];
        match self.run_entries(&mut report, &mut errors, false) {
            Step::Continue => {
                record_errors(&mut report, &errors);
                ChainOutcome::Completed { report, errors }
            }
            Step::Discard { filter, reason } => {
                tracing::debug!(%filter, %reason, "Report discarded by filter");
                ChainOutcome::Discarded {
                    filter,
                    reason,
                    errors,
                }
            }
            Step::Abort(error) => {
                tracing::warn!(%error, "Filter chain aborted");
                ChainOutcome::Failed { error, errors }
            }
        }
    }

    fn run_entries(
        &self,
        report: &mut ParsedReport,
        errors: &mut Vec<FilterError>,
        fatal_scope: bool,
    ) -> Step {
        for entry in &self.entries {
            let fatal = fatal_scope || entry.fatal;
            if let Some(chain) = entry.filter.as_chain() {
                match chain.run_entries(report, errors, fatal) {
                    Step::Continue => continue,
                    step => return step,
                }
            }
            let before = report.clone();
            match entry.filter.apply(report) {
                Ok(FilterAction::Continue) => {}
                Ok(FilterAction::Discard { reason }) => {
                    return Step::Discard {
                        filter: entry.filter.name().to_string(),
                        reason,
                    }
                }
                Err(e) => {
                    *report = before;
                    let kind = if fatal {
                        FilterErrorKind::Fatal
                    } else {
                        FilterErrorKind::Processing
                    };
                    let error = FilterError::new(entry.filter.name(), kind, &e);
                    if fatal {
                        return Step::Abort(error);
                    }
                    tracing::debug!(%error, "Filter failed, passing the report on unchanged");
                    errors.push(error);
                }
            }
        }
        Step::Continue
    }
}

fn record_errors(report: &mut ParsedReport, errors: &[FilterError]) {
    if errors.is_empty() {
        return;
    }
    let map = report.as_map_mut();
    let slot = map
        .entry(PROCESSING_ERRORS_KEY.to_string())
        .or_insert_with(|| Value::Array(vec![]));
    if !slot.is_array() {
        *slot = Value::Array(vec![]);
    }
    if let Value::Array(recorded) = slot {
        recorded.extend(
            errors
                .iter()
                .filter_map(|error| serde_json::to_value(error).ok()),
        );
    }
}

impl Filter for FilterChain {
    fn name(&self) -> &str {
        &self.name
    }

    /// Used when a chain is applied on its own rather than through
    /// [`FilterChain::run`]. Recorded errors are written into the report.
    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let mut errors = vec![];
        match self.run_entries(report, &mut errors, false) {
            Step::Continue => {
                record_errors(report, &errors);
                Ok(FilterAction::Continue)
            }
            Step::Discard { reason, .. } => Ok(FilterAction::Discard { reason }),
            Step::Abort(error) => Err(error.into()),
        }
    }

    fn as_chain(&self) -> Option<&FilterChain> {
        Some(self)
    }
}
