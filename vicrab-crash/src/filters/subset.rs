// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tools::KeyPath;
use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use serde_json::{Map, Value};

/// Keeps only the parts of the report named by the key paths.
#[derive(Debug, Clone)]
pub struct Subset {
    paths: Vec<KeyPath>,
}

impl Subset {
    pub fn new<P>(paths: P) -> anyhow::Result<Self>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|path| KeyPath::parse(path.as_ref()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!paths.is_empty(), "Subset needs at least one key path");
        Ok(Self { paths })
    }
}

impl Filter for Subset {
    fn name(&self) -> &str {
        "subset"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let source = Value::Object(std::mem::take(report.as_map_mut()));
        let mut kept = Value::Object(Map::new());
        for path in &self.paths {
            path.copy_into(&source, &mut kept);
        }
        if let Value::Object(map) = kept {
            *report = ParsedReport::from_map(map);
        }
        Ok(FilterAction::Continue)
    }
}
