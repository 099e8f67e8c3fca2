// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;

/// Leaves the report alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Filter for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn apply(&self, _report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        Ok(FilterAction::Continue)
    }
}
