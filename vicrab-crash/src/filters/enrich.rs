// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tools::deep_merge;
use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes the application a report belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Metadata {
    pub app_name: String,
    pub app_version: String,
    /// e.g. "native", "rust", "cpp".
    pub family: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Metadata {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        family: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            family: family.into(),
            tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OsInfo {
    pub architecture: String,
    pub bitness: String,
    pub os_type: String,
    pub version: String,
}

impl From<os_info::Info> for OsInfo {
    fn from(value: os_info::Info) -> Self {
        Self {
            architecture: value.architecture().unwrap_or("unknown").to_string(),
            bitness: value.bitness().to_string(),
            os_type: value.os_type().to_string(),
            version: value.version().to_string(),
        }
    }
}

/// Adds application metadata and a description of the machine processing
/// the report.
///
/// Metadata is merged into any `metadata` object already present; tags are
/// appended without duplicates. `os` is only set when the report has none.
#[derive(Debug, Clone)]
pub struct Enrich {
    metadata: Metadata,
    os_info: OsInfo,
}

impl Enrich {
    pub fn new(metadata: Metadata, os_info: OsInfo) -> Self {
        Self { metadata, os_info }
    }

    /// Describes the current machine. Runs a subprocess on some platforms.
    pub fn this_machine(metadata: Metadata) -> Self {
        Self::new(metadata, os_info::get().into())
    }
}

impl Filter for Enrich {
    fn name(&self) -> &str {
        "enrich"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let map = report.as_map_mut();
        let mut tags: Vec<Value> = map
            .get("metadata")
            .and_then(|metadata| metadata.get("tags"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for tag in &self.metadata.tags {
            let tag = Value::String(tag.clone());
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        deep_merge(metadata, serde_json::to_value(&self.metadata)?);
        metadata["tags"] = Value::Array(tags);

        if !map.contains_key("os") {
            map.insert("os".to_string(), serde_json::to_value(&self.os_info)?);
        }
        Ok(FilterAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enrich() -> Enrich {
        Enrich::new(
            Metadata::new("demo", "1.2.3", "native", vec!["env:test".to_string()]),
            os_info::Info::unknown().into(),
        )
    }

    #[test]
    fn test_adds_metadata_and_os() {
        let mut report = ParsedReport::new();
        enrich().apply(&mut report).unwrap();
        assert_eq!(
            report.get("metadata"),
            Some(&json!({
                "app_name": "demo",
                "app_version": "1.2.3",
                "family": "native",
                "tags": ["env:test"],
            }))
        );
        assert_eq!(report.get_path(&["os", "os_type"]), Some(&json!("Unknown")));
    }

    #[test]
    fn test_merges_with_existing() {
        let mut report = ParsedReport::new();
        report.set_path(&["metadata", "tags"], json!(["env:test", "region:eu"]));
        report.set_path(&["metadata", "build"], json!(7));
        report.set_path(&["os", "os_type"], json!("Linux"));
        enrich().apply(&mut report).unwrap();
        assert_eq!(
            report.get_path(&["metadata", "tags"]),
            Some(&json!(["env:test", "region:eu"]))
        );
        assert_eq!(report.get_path(&["metadata", "build"]), Some(&json!(7)));
        assert_eq!(report.get_path(&["metadata", "app_version"]), Some(&json!("1.2.3")));
        assert_eq!(report.get("os"), Some(&json!({"os_type": "Linux"})));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // os_info::get() spawns subprocess, unsupported by Miri
    fn test_this_machine() {
        let enrich = Enrich::this_machine(Metadata::default());
        assert!(!enrich.os_info.os_type.is_empty());
        assert!(!enrich.os_info.bitness.is_empty());
    }
}
