// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tools::parse_address;
use super::{Filter, FilterAction};
use crate::raw_report::{ParsedReport, RawReport};
use crate::store::{ReportId, ReportStore};
use serde_json::{Map, Value};

/// Attaches supplementary context found in the store.
///
/// - `previous_session`: the newest partial report older than this one. A
///   partial report means the previous run crashed while a crash was being
///   written, which often explains the current one.
/// - `recrash`: the marker left by a crash during this report's capture.
#[derive(Debug, Clone)]
pub struct MergePreviousSession {
    store: ReportStore,
}

impl MergePreviousSession {
    pub fn new(store: ReportStore) -> Self {
        Self { store }
    }
}

/// The parts of a secondary report worth carrying along.
fn summary(report: &RawReport) -> Value {
    let tree = report.to_tree();
    let mut summary = Map::new();
    for key in ["report", "crash", "incomplete"] {
        if let Some(value) = tree.get(key) {
            summary.insert(key.to_string(), value.clone());
        }
    }
    if let Some(threads) = tree.get("threads").and_then(Value::as_array) {
        let crashed: Vec<Value> = threads
            .iter()
            .filter(|thread| thread["crashed"] == Value::Bool(true))
            .cloned()
            .collect();
        summary.insert("threads".to_string(), Value::Array(crashed));
    }
    Value::Object(summary)
}

impl Filter for MergePreviousSession {
    fn name(&self) -> &str {
        "merge_previous_session"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let id = report
            .get_path(&["report", "id"])
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Report has no id"))?;
        let id = ReportId(parse_address(id)?);

        let previous = self
            .store
            .list_partial()?
            .into_iter()
            .filter(|partial| *partial < id)
            .max();
        if let Some(previous) = previous {
            let partial = self.store.read_partial(previous)?;
            tracing::debug!(%id, %previous, "Attaching previous session report");
            report
                .as_map_mut()
                .insert("previous_session".to_string(), summary(&partial));
        }

        if let Some(marker) = self.store.read_recrash(id)? {
            tracing::debug!(%id, "Attaching recrash marker");
            report
                .as_map_mut()
                .insert("recrash".to_string(), summary(&marker));
        }
        Ok(FilterAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_report::ReportType;
    use crate::test_utils::TestInstance;
    use serde_json::json;
    use std::fs;

    fn report_with(seed: u64, complete: bool) -> RawReport {
        let mut report = RawReport::test_instance(seed);
        report.complete = complete;
        report
    }

    fn write(path: std::path::PathBuf, report: &RawReport) {
        fs::write(path, report.to_bytes().unwrap()).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_attaches_previous_partial_and_recrash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path(), "demo").unwrap();

        let older = report_with(1, false);
        let oldest = report_with(0, false);
        let current = report_with(5, true);
        let newer = report_with(9, false);
        for report in [&older, &oldest, &current, &newer] {
            let id = ReportId(report.header.report_id);
            write(store.report_path(id), report);
        }
        let mut marker = report_with(5, false);
        marker.header.report_type = ReportType::Recrash;
        marker.threads.clear();
        let current_id = ReportId(current.header.report_id);
        write(store.recrash_path(current_id), &marker);

        let mut tree = current.to_tree();
        MergePreviousSession::new(store).apply(&mut tree).unwrap();

        let previous = tree.get("previous_session").unwrap();
        assert_eq!(previous["report"]["id"], json!(format!("{:#018x}", older.header.report_id)));
        assert_eq!(previous["incomplete"], json!(true));
        assert_eq!(previous["threads"].as_array().unwrap().len(), 1);
        assert_eq!(tree.get_path(&["recrash", "report", "type"]), Some(&json!("recrash")));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_nothing_to_attach() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path(), "demo").unwrap();
        let mut tree = RawReport::test_instance(3).to_tree();
        let before = tree.clone();
        MergePreviousSession::new(store).apply(&mut tree).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_without_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path(), "demo").unwrap();
        let mut tree = ParsedReport::new();
        assert!(MergePreviousSession::new(store).apply(&mut tree).is_err());
    }
}
