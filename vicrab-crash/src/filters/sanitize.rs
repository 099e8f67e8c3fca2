// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use serde_json::Value;

/// Keys starting with this are internal bookkeeping and never leave the
/// process.
pub const INTERNAL_KEY_PREFIX: &str = "__vicrab";

const DEFAULT_MAX_STRING_LEN: usize = 16 * 1024;
const TRUNCATION_MARKER: &str = "...";

/// Drops internal keys at any depth and truncates over-long strings.
#[derive(Debug, Clone)]
pub struct Sanitize {
    max_string_len: usize,
}

impl Default for Sanitize {
    fn default() -> Self {
        Self {
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

impl Sanitize {
    pub fn new(max_string_len: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            max_string_len > TRUNCATION_MARKER.len(),
            "max_string_len must be larger than {}",
            TRUNCATION_MARKER.len()
        );
        Ok(Self { max_string_len })
    }

    fn sanitize(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                map.retain(|key, _| !key.starts_with(INTERNAL_KEY_PREFIX));
                map.values_mut().for_each(|v| self.sanitize(v));
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.sanitize(v)),
            Value::String(s) if s.len() > self.max_string_len => {
                let mut end = self.max_string_len - TRUNCATION_MARKER.len();
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                s.truncate(end);
                s.push_str(TRUNCATION_MARKER);
            }
            _ => {}
        }
    }
}

impl Filter for Sanitize {
    fn name(&self) -> &str {
        "sanitize"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let map = report.as_map_mut();
        map.retain(|key, _| !key.starts_with(INTERNAL_KEY_PREFIX));
        map.values_mut().for_each(|v| self.sanitize(v));
        Ok(FilterAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_drops_internal_keys() {
        let mut report = ParsedReport::from_map(
            json!({
                "__vicrab_pending": true,
                "user": {"id": 7, "__vicrab_scope": {"x": 1}},
                "breadcrumbs": [{"message": "m", "__vicrab": 1}],
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        Sanitize::default().apply(&mut report).unwrap();
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"user": {"id": 7}, "breadcrumbs": [{"message": "m"}]})
        );
    }

    #[test]
    fn test_truncates_long_strings() {
        let mut report = ParsedReport::new();
        report.set_path(&["user", "bio"], json!("héllo wörld"));
        report.set_path(&["user", "name"], json!("bob"));
        Sanitize::new(5).unwrap().apply(&mut report).unwrap();
        // 'é' straddles the cut and is dropped whole.
        assert_eq!(report.get_path(&["user", "bio"]), Some(&json!("h...")));
        assert_eq!(report.get_path(&["user", "name"]), Some(&json!("bob")));
        assert!(Sanitize::new(2).is_err());
    }
}
