// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tools::KeyPath;
use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use serde_json::Value;
use std::fmt;

type Predicate = Box<dyn Fn(&ParsedReport) -> bool + Send + Sync>;

/// Ends the chain with a discard when the predicate holds.
pub struct DiscardWhen {
    reason: String,
    predicate: Predicate,
}

impl fmt::Debug for DiscardWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscardWhen")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl DiscardWhen {
    pub fn new(
        reason: impl Into<String>,
        predicate: impl Fn(&ParsedReport) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            reason: reason.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Discards reports where any value at `path` equals `value`, or, with
    /// no `value`, where anything exists at `path`.
    pub fn path_matches(
        reason: impl Into<String>,
        path: &str,
        value: Option<Value>,
    ) -> anyhow::Result<Self> {
        let path = KeyPath::parse(path)?;
        Ok(Self::new(reason, move |report| {
            let selected = path.select_in(report.as_map());
            match &value {
                Some(value) => selected.into_iter().any(|found| found == value),
                None => !selected.is_empty(),
            }
        }))
    }
}

impl Filter for DiscardWhen {
    fn name(&self) -> &str {
        "discard_when"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        if (self.predicate)(report) {
            return Ok(FilterAction::Discard {
                reason: self.reason.clone(),
            });
        }
        Ok(FilterAction::Continue)
    }
}
