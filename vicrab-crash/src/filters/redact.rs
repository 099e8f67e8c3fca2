// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use regex::{Regex, RegexSet};
use serde_json::Value;

pub const DEFAULT_REPLACEMENT: &str = "[redacted]";

/// Replaces sensitive data anywhere in the report.
///
/// The whole value of an object key matching one of the key patterns is
/// replaced. Within the remaining strings, every match of a value pattern
/// is replaced.
#[derive(Debug, Clone)]
pub struct Redact {
    keys: RegexSet,
    values: Vec<Regex>,
    replacement: String,
}

impl Redact {
    pub fn new<K, V>(key_patterns: K, value_patterns: V) -> anyhow::Result<Self>
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
        V: IntoIterator,
        V::Item: AsRef<str>,
    {
        let keys = RegexSet::new(key_patterns)?;
        let values = value_patterns
            .into_iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            keys,
            values,
            replacement: DEFAULT_REPLACEMENT.to_string(),
        })
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }

    fn redact(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, value) in map.iter_mut() {
                    if self.keys.is_match(key) {
                        *value = Value::String(self.replacement.clone());
                    } else {
                        self.redact(value);
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact(item)),
            Value::String(s) => {
                for pattern in &self.values {
                    if pattern.is_match(s) {
                        *s = pattern
                            .replace_all(s, regex::NoExpand(&self.replacement))
                            .into_owned();
                    }
                }
            }
            _ => {}
        }
    }
}

impl Filter for Redact {
    fn name(&self) -> &str {
        "redact"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        for (key, value) in report.as_map_mut().iter_mut() {
            if self.keys.is_match(key) {
                *value = Value::String(self.replacement.clone());
            } else {
                self.redact(value);
            }
        }
        Ok(FilterAction::Continue)
    }
}
