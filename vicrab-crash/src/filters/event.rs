// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The transmittable form of a report.
//!
//! [`EventConversion`] is meant to run last. It reads the report tree
//! leniently, since earlier filters may have removed or added parts, and
//! replaces it with a [`CrashEvent`]: timestamps become ISO-8601 strings,
//! stack dumps become base64, and the crash context is folded into a single
//! exception description. Top level keys it does not know end up in
//! `contexts`.

use super::tools::{hex_to_base64, micros_to_iso8601};
use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const EVENT_PLATFORM: &str = "native";

/// Keys of the report tree the event takes apart. The rest go to `contexts`.
const CONSUMED_KEYS: [&str; 8] = [
    "report",
    "crash",
    "system",
    "user",
    "breadcrumbs",
    "threads",
    "binary_images",
    "processing_errors",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CrashEvent {
    pub event_id: String,
    pub report_id: String,
    /// ISO-8601, UTC.
    pub timestamp: String,
    pub report_type: String,
    /// "fatal" for crashes that ended the process, "error" otherwise.
    pub level: String,
    pub platform: String,
    pub app_name: String,
    pub process_name: String,
    pub exception: Option<EventException>,
    pub threads: Vec<EventThread>,
    pub binary_images: Vec<EventImage>,
    pub breadcrumbs: Vec<EventBreadcrumb>,
    pub user: Option<Value>,
    pub system: Option<Value>,
    /// Whether the capture was cut short.
    pub incomplete: bool,
    pub contexts: Map<String, Value>,
    pub processing_errors: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventException {
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: Option<String>,
    pub thread_id: Option<u64>,
    pub mechanism: EventMechanism,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventMechanism {
    /// The kind of crash, e.g. "signal", "cpp_exception".
    pub kind: String,
    pub monitor: String,
    pub handled: bool,
    pub stack_overflow: bool,
    /// Everything the monitor recorded, as captured.
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventThread {
    pub index: u32,
    pub tid: u64,
    pub name: String,
    pub crashed: bool,
    pub current: bool,
    pub registers: BTreeMap<String, String>,
    /// Innermost frame first.
    pub frames: Vec<EventFrame>,
    pub frames_truncated: bool,
    pub stack_memory: Vec<EventMemory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EventFrame {
    #[serde(rename = "ip")]
    pub instruction_addr: String,
    #[serde(rename = "sp")]
    pub stack_pointer: String,
    #[serde(rename = "fp")]
    pub frame_pointer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mangled_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EventMemory {
    pub address: String,
    /// Base64 of the bytes starting at `address`.
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EventImage {
    pub start: String,
    pub end: String,
    pub offset: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventBreadcrumb {
    pub timestamp: String,
    pub level: String,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

/// JSON schema of the event document.
pub fn event_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(CrashEvent)
}

// What the tree looks like, read leniently.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreeHeader {
    id: String,
    event_id: String,
    timestamp_micros: Option<u64>,
    #[serde(rename = "type")]
    report_type: String,
    process_name: String,
    app_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreeThread {
    index: u32,
    tid: u64,
    name: String,
    crashed: bool,
    current: bool,
    registers: BTreeMap<String, String>,
    frames: Vec<EventFrame>,
    frames_truncated: bool,
    stack_dump: Vec<TreeChunk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreeChunk {
    address: String,
    bytes: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreeBreadcrumb {
    timestamp_micros: u64,
    level: String,
    category: String,
    message: String,
    data: Map<String, Value>,
}

fn take<T: serde::de::DeserializeOwned + Default>(
    tree: &mut Map<String, Value>,
    key: &str,
) -> anyhow::Result<T> {
    match tree.remove(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| anyhow::anyhow!("Malformed {key} in report: {e}")),
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn exception_of(crash: &Value) -> Option<EventException> {
    let crash_obj = crash.as_object()?;
    let kind = text(crash, "kind").unwrap_or_else(|| "unknown".to_string());
    let (type_name, value) = if let Some(exception) = crash.get("exception") {
        (text(exception, "name")?, text(exception, "reason"))
    } else if let Some(cpp) = crash.get("cpp_exception") {
        (text(cpp, "type_name")?, None)
    } else if let Some(user) = crash.get("user") {
        (text(user, "name")?, text(user, "reason"))
    } else if let Some(signal) = crash.get("signal") {
        let mut value = text(signal, "code_name");
        if let (Some(v), Some(address)) = (value.as_mut(), text(signal, "address")) {
            v.push_str(" at ");
            v.push_str(&address);
        }
        (text(signal, "name")?, value)
    } else if let Some(mach) = crash.get("mach") {
        let exception = mach.get("exception").and_then(Value::as_i64).unwrap_or(0);
        (format!("EXC_{exception}"), text(mach, "subcode"))
    } else {
        (kind.clone(), None)
    };
    let fatal = crash.get("fatal").and_then(Value::as_bool).unwrap_or(true);
    let meta = crash_obj
        .iter()
        .filter(|(_, value)| value.is_object())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Some(EventException {
        type_name,
        value,
        thread_id: crash.get("tid").and_then(Value::as_u64),
        mechanism: EventMechanism {
            kind,
            monitor: text(crash, "monitor").unwrap_or_default(),
            handled: !fatal,
            stack_overflow: crash
                .get("stack_overflow")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            meta,
        },
    })
}

fn convert_thread(thread: TreeThread) -> anyhow::Result<EventThread> {
    let stack_memory = thread
        .stack_dump
        .into_iter()
        .map(|chunk| {
            Ok(EventMemory {
                data: hex_to_base64(&chunk.bytes)?,
                address: chunk.address,
            })
        })
        .collect::<anyhow::Result<_>>()?;
    Ok(EventThread {
        index: thread.index,
        tid: thread.tid,
        name: thread.name,
        crashed: thread.crashed,
        current: thread.current,
        registers: thread.registers,
        frames: thread.frames,
        frames_truncated: thread.frames_truncated,
        stack_memory,
    })
}

impl CrashEvent {
    pub fn from_report(report: ParsedReport) -> anyhow::Result<Self> {
        let mut tree = report.into_map();
        anyhow::ensure!(tree.contains_key("report"), "Report has no header");
        let header: TreeHeader = take(&mut tree, "report")?;
        let timestamp_micros = header
            .timestamp_micros
            .ok_or_else(|| anyhow::anyhow!("Report has no timestamp"))?;
        let timestamp = micros_to_iso8601(timestamp_micros)
            .ok_or_else(|| anyhow::anyhow!("Timestamp {timestamp_micros} out of range"))?;

        let crash = tree.remove("crash").unwrap_or(Value::Null);
        let exception = exception_of(&crash);
        let fatal = crash.get("fatal").and_then(Value::as_bool).unwrap_or(true);

        let threads: Vec<TreeThread> = take(&mut tree, "threads")?;
        let threads = threads
            .into_iter()
            .map(convert_thread)
            .collect::<anyhow::Result<_>>()?;
        let binary_images: Vec<EventImage> = take(&mut tree, "binary_images")?;
        let breadcrumbs: Vec<TreeBreadcrumb> = take(&mut tree, "breadcrumbs")?;
        let breadcrumbs = breadcrumbs
            .into_iter()
            .map(|crumb| {
                Ok(EventBreadcrumb {
                    timestamp: micros_to_iso8601(crumb.timestamp_micros).ok_or_else(|| {
                        anyhow::anyhow!("Breadcrumb timestamp {} out of range", crumb.timestamp_micros)
                    })?,
                    level: crumb.level,
                    category: crumb.category,
                    message: crumb.message,
                    data: crumb.data,
                })
            })
            .collect::<anyhow::Result<_>>()?;
        let processing_errors: Vec<Value> = take(&mut tree, "processing_errors")?;
        let incomplete = tree
            .remove("incomplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let user = tree.remove("user");
        let system = tree.remove("system");
        debug_assert!(CONSUMED_KEYS.iter().all(|key| !tree.contains_key(*key)));

        Ok(CrashEvent {
            event_id: header.event_id,
            report_id: header.id,
            timestamp,
            report_type: header.report_type,
            level: if fatal { "fatal" } else { "error" }.to_string(),
            platform: EVENT_PLATFORM.to_string(),
            app_name: header.app_name,
            process_name: header.process_name,
            exception,
            threads,
            binary_images,
            breadcrumbs,
            user,
            system,
            incomplete,
            contexts: tree,
            processing_errors,
        })
    }
}

/// Replaces the report tree with its [`CrashEvent`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EventConversion;

impl Filter for EventConversion {
    fn name(&self) -> &str {
        "event_conversion"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let event = CrashEvent::from_report(report.clone())?;
        match serde_json::to_value(event)? {
            Value::Object(map) => *report = ParsedReport::from_map(map),
            other => anyhow::bail!("Event serialized to a non-object: {other}"),
        }
        Ok(FilterAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_report::RawReport;
    use crate::test_utils::TestInstance;
    use serde_json::json;

    #[test]
    fn test_convert_signal_report() {
        let mut tree = RawReport::test_instance(1).to_tree();
        tree.set_path(&["metadata", "app_version"], json!("1.2.3"));
        let event = CrashEvent::from_report(tree).unwrap();

        assert_eq!(event.timestamp, "2023-11-14T22:13:20.000001Z");
        assert_eq!(event.level, "fatal");
        assert_eq!(event.report_type, "standard");
        assert_eq!(event.event_id, "00000000-0000-4000-8000-000000000001");
        let exception = event.exception.unwrap();
        assert_eq!(exception.type_name, "SIGSEGV");
        assert_eq!(
            exception.value.as_deref(),
            Some("SEGV_MAPERR at 0x0000000000000010")
        );
        assert_eq!(exception.thread_id, Some(4242));
        assert!(!exception.mechanism.handled);
        assert!(exception.mechanism.meta.contains_key("zombie"));

        assert_eq!(event.threads.len(), 2);
        let crashed = &event.threads[0];
        assert!(crashed.crashed);
        assert_eq!(crashed.frames.len(), 3);
        assert_eq!(crashed.stack_memory[0].data, "3q2+7w==");
        assert_eq!(crashed.registers["rsp"], "0x00007ffc00000000");
        assert!(event.threads[1].frames_truncated);

        assert_eq!(event.breadcrumbs[0].timestamp, "2023-11-14T22:13:19.000000Z");
        assert_eq!(event.binary_images[0].path, "/usr/bin/crashing_app");
        assert_eq!(event.user.as_ref().unwrap()["user"], "alice@example.com");
        assert_eq!(event.contexts["metadata"]["app_version"], "1.2.3");
        assert!(!event.incomplete);
    }

    #[test]
    fn test_exception_kinds() {
        let crash = json!({
            "kind": "language_exception",
            "monitor": "language_exception",
            "fatal": false,
            "tid": 7,
            "exception": {"name": "KeyError", "reason": "'missing'"},
        });
        let exception = exception_of(&crash).unwrap();
        assert_eq!(exception.type_name, "KeyError");
        assert_eq!(exception.value.as_deref(), Some("'missing'"));
        assert!(exception.mechanism.handled);

        let crash = json!({"kind": "cpp_exception", "cpp_exception": {"type_name": "std::runtime_error"}});
        assert_eq!(exception_of(&crash).unwrap().type_name, "std::runtime_error");

        let crash = json!({"kind": "watchdog", "fatal": false});
        assert_eq!(exception_of(&crash).unwrap().type_name, "watchdog");
    }

    #[test]
    fn test_filter_replaces_tree() {
        let mut tree = RawReport::test_instance(2).to_tree();
        EventConversion.apply(&mut tree).unwrap();
        assert_eq!(tree.get("platform"), Some(&json!("native")));
        assert!(tree.get("crash").is_none());
        assert_eq!(
            tree.get_path(&["threads"]).unwrap()[0]["frames"][0]["ip"],
            json!(format!("{:#018x}", 0x5555_0000_0000u64 + 2 * 0x1000 + 0x100))
        );
    }

    #[test]
    fn test_missing_header_fails() {
        let mut tree = ParsedReport::new();
        tree.set_path(&["threads"], json!([]));
        assert!(EventConversion.apply(&mut tree).is_err());
    }

    #[test]
    fn test_schema() {
        let schema = serde_json::to_value(event_schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for key in ["event_id", "timestamp", "exception", "threads", "contexts"] {
            assert!(properties.contains_key(key), "{key} missing from schema");
        }
    }
}
