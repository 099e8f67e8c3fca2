// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{RawReport, ThreadRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A decoded report as a JSON tree: the unit the filters transform.
///
/// Top level keys: `report`, `crash`, `system`, `user`, `breadcrumbs`,
/// `threads`, `binary_images`, and `incomplete` / `extra_blocks` when they
/// apply. Filters add their own keys next to these.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParsedReport(Map<String, Value>);

impl ParsedReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Follows object keys from the root.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.0.get(*first)?, |value, key| value.get(*key))
    }

    pub fn get_path_mut(&mut self, path: &[&str]) -> Option<&mut Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.0.get_mut(*first)?, |value, key| value.get_mut(*key))
    }

    /// Sets the value at `path`, creating intermediate objects and replacing
    /// non-object values that are in the way.
    pub fn set_path(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut map = &mut self.0;
        for key in parents {
            let slot = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(inner) = slot else {
                return;
            };
            map = inner;
        }
        map.insert(last.to_string(), value);
    }

    pub fn remove_path(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let map = if parents.is_empty() {
            &mut self.0
        } else {
            self.get_path_mut(parents)?.as_object_mut()?
        };
        map.remove(*last)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }
}

impl From<Map<String, Value>> for ParsedReport {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn value_of<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn thread_tree(thread: &ThreadRecord) -> Value {
    let registers: Map<String, Value> = thread
        .registers
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(format!("{value:#018x}"))))
        .collect();
    let mut tree = json!({
        "index": thread.index,
        "tid": thread.tid,
        "name": thread.name,
        "crashed": thread.crashed,
        "current": thread.current,
        "registers": registers,
        "frames": value_of(&thread.frames),
        "frames_truncated": thread.frames_truncated,
    });
    if let Some(stack_dump) = &thread.stack_dump {
        tree["stack_dump"] = value_of(stack_dump);
    }
    tree
}

impl RawReport {
    pub fn to_tree(&self) -> ParsedReport {
        let mut root = Map::new();
        root.insert(
            "report".to_string(),
            json!({
                "version": self.version,
                "id": format!("{:#018x}", self.header.report_id),
                "event_id": self.header.event_id,
                "timestamp_micros": self.header.timestamp_micros,
                "type": self.header.report_type,
                "process_name": self.header.process_name,
                "app_name": self.header.app_name,
            }),
        );
        if let Some(context) = &self.context {
            let mut crash = value_of(&context.crash);
            let groups = [
                ("signal", context.signal.as_ref().map(value_of)),
                ("mach", context.mach.as_ref().map(value_of)),
                ("exception", context.exception.as_ref().map(value_of)),
                ("cpp_exception", context.cpp_exception.as_ref().map(value_of)),
                ("user", context.user.as_ref().map(value_of)),
                ("zombie", context.zombie.as_ref().map(value_of)),
            ];
            for (key, group) in groups {
                if let Some(group) = group {
                    crash[key] = group;
                }
            }
            for line in &context.extra {
                if let Ok(Value::Object(extra)) = serde_json::from_str::<Value>(line) {
                    for (key, value) in extra {
                        crash[key.as_str()] = value;
                    }
                }
            }
            root.insert("crash".to_string(), crash);
        }
        if let Some(system) = &self.system {
            root.insert("system".to_string(), value_of(system));
        }
        if let Some(user_context) = &self.user_context {
            if let Ok(user) = serde_json::from_str::<Value>(user_context) {
                root.insert("user".to_string(), user);
            }
        }
        if !self.breadcrumbs.is_empty() {
            root.insert("breadcrumbs".to_string(), value_of(&self.breadcrumbs));
        }
        root.insert(
            "threads".to_string(),
            Value::Array(self.threads.iter().map(thread_tree).collect()),
        );
        if let Some(images) = &self.binary_images {
            root.insert("binary_images".to_string(), value_of(images));
        }
        if !self.unknown_blocks.is_empty() {
            let blocks: Map<String, Value> = self
                .unknown_blocks
                .iter()
                .map(|block| (block.name.clone(), json!(block.lines)))
                .collect();
            root.insert("extra_blocks".to_string(), Value::Object(blocks));
        }
        if !self.complete {
            root.insert("incomplete".to_string(), Value::Bool(true));
        }
        ParsedReport(root)
    }
}
