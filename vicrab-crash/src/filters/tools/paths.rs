// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dotted key paths into a report tree: `crash.signal.name`,
//! `threads.0.frames`, `threads.*.name`.

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    /// Array index. Also matches an object key spelled the same.
    Index(usize),
    /// Every element of an array or every value of an object.
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath(Vec<Segment>);

impl KeyPath {
    pub fn parse(path: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!path.is_empty(), "Empty key path");
        let segments = path
            .split('.')
            .map(|segment| {
                anyhow::ensure!(!segment.is_empty(), "Empty segment in key path {path:?}");
                Ok(match segment {
                    "*" => Segment::Wildcard,
                    _ => match segment.parse() {
                        Ok(index) => Segment::Index(index),
                        Err(_) => Segment::Key(segment.to_string()),
                    },
                })
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Every value the path matches.
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.0 {
            current = current
                .into_iter()
                .flat_map(|value| children(value, segment))
                .collect();
        }
        current
    }

    /// Like [`KeyPath::select`], starting from an object's entries.
    pub fn select_in<'a>(&self, map: &'a Map<String, Value>) -> Vec<&'a Value> {
        let Some((first, rest)) = self.0.split_first() else {
            return vec![];
        };
        let mut current: Vec<&Value> = match first {
            Segment::Key(key) => map.get(key).into_iter().collect(),
            Segment::Index(index) => map.get(&index.to_string()).into_iter().collect(),
            Segment::Wildcard => map.values().collect(),
        };
        for segment in rest {
            current = current
                .into_iter()
                .flat_map(|value| children(value, segment))
                .collect();
        }
        current
    }

    /// Calls `f` on every value the path matches.
    pub fn for_each_mut(&self, root: &mut Value, f: &mut impl FnMut(&mut Value)) {
        fn walk(value: &mut Value, segments: &[Segment], f: &mut impl FnMut(&mut Value)) {
            let Some((segment, rest)) = segments.split_first() else {
                f(value);
                return;
            };
            match (segment, value) {
                (Segment::Wildcard, Value::Array(items)) => {
                    items.iter_mut().for_each(|item| walk(item, rest, f))
                }
                (Segment::Wildcard, Value::Object(map)) => {
                    map.values_mut().for_each(|item| walk(item, rest, f))
                }
                (Segment::Index(index), Value::Array(items)) => {
                    if let Some(item) = items.get_mut(*index) {
                        walk(item, rest, f);
                    }
                }
                (Segment::Index(index), Value::Object(map)) => {
                    if let Some(item) = map.get_mut(&index.to_string()) {
                        walk(item, rest, f);
                    }
                }
                (Segment::Key(key), Value::Object(map)) => {
                    if let Some(item) = map.get_mut(key) {
                        walk(item, rest, f);
                    }
                }
                _ => {}
            }
        }
        walk(root, &self.0, f)
    }

    /// Copies the parts of `src` the path matches into `dst`, keeping their
    /// position. Arrays are copied element-wise so `threads.*.name` keeps one
    /// object per thread.
    pub fn copy_into(&self, src: &Value, dst: &mut Value) {
        fn copy(src: &Value, dst: &mut Value, segments: &[Segment]) {
            let Some((segment, rest)) = segments.split_first() else {
                *dst = src.clone();
                return;
            };
            match (segment, src) {
                (Segment::Wildcard, Value::Array(items)) => {
                    if !dst.is_array() {
                        *dst = Value::Array(vec![]);
                    }
                    if let Value::Array(out) = dst {
                        out.resize(out.len().max(items.len()), Value::Null);
                        for (item, slot) in items.iter().zip(out.iter_mut()) {
                            copy(item, slot, rest);
                        }
                    }
                }
                (Segment::Wildcard, Value::Object(map)) => {
                    for (key, item) in map {
                        copy(item, object_slot(dst, key), rest);
                    }
                }
                (Segment::Index(index), Value::Array(items)) => {
                    if let Some(item) = items.get(*index) {
                        if !dst.is_array() {
                            *dst = Value::Array(vec![]);
                        }
                        if let Value::Array(out) = dst {
                            if out.len() <= *index {
                                out.resize(index + 1, Value::Null);
                            }
                            copy(item, &mut out[*index], rest);
                        }
                    }
                }
                (Segment::Index(index), Value::Object(map)) => {
                    let key = index.to_string();
                    if let Some(item) = map.get(&key) {
                        copy(item, object_slot(dst, &key), rest);
                    }
                }
                (Segment::Key(key), Value::Object(map)) => {
                    if let Some(item) = map.get(key) {
                        copy(item, object_slot(dst, key), rest);
                    }
                }
                _ => {}
            }
        }
        copy(src, dst, &self.0)
    }
}

fn object_slot<'a>(dst: &'a mut Value, key: &str) -> &'a mut Value {
    if !dst.is_object() {
        *dst = Value::Object(Map::new());
    }
    match dst {
        Value::Object(map) => map.entry(key.to_string()).or_insert(Value::Null),
        _ => unreachable!("just made an object"),
    }
}

fn children<'a>(value: &'a Value, segment: &Segment) -> Vec<&'a Value> {
    match (segment, value) {
        (Segment::Wildcard, Value::Array(items)) => items.iter().collect(),
        (Segment::Wildcard, Value::Object(map)) => map.values().collect(),
        (Segment::Index(index), Value::Array(items)) => items.get(*index).into_iter().collect(),
        (Segment::Index(index), Value::Object(map)) => {
            map.get(&index.to_string()).into_iter().collect()
        }
        (Segment::Key(key), Value::Object(map)) => map.get(key).into_iter().collect(),
        _ => vec![],
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                Segment::Key(key) => f.write_str(key)?,
                Segment::Index(index) => write!(f, "{index}")?,
                Segment::Wildcard => f.write_str("*")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> Value {
        json!({
            "crash": {"signal": {"name": "SIGSEGV", "number": 11}},
            "threads": [
                {"name": "main", "frames": [1, 2]},
                {"name": "worker", "frames": [3]},
            ],
        })
    }

    #[test]
    fn test_parse_and_display() {
        let path = KeyPath::parse("threads.*.frames.0").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("threads".to_string()),
                Segment::Wildcard,
                Segment::Key("frames".to_string()),
                Segment::Index(0),
            ]
        );
        assert_eq!(path.to_string(), "threads.*.frames.0");
        assert!(KeyPath::parse("").is_err());
        assert!(KeyPath::parse("a..b").is_err());
    }

    #[test]
    fn test_select() {
        let tree = tree();
        let names = KeyPath::parse("threads.*.name").unwrap().select(&tree);
        assert_eq!(names, vec![&json!("main"), &json!("worker")]);
        let signal = KeyPath::parse("crash.signal.name").unwrap().select(&tree);
        assert_eq!(signal, vec![&json!("SIGSEGV")]);
        assert!(KeyPath::parse("crash.nope").unwrap().select(&tree).is_empty());
        let map = tree.as_object().unwrap();
        let frames = KeyPath::parse("threads.0.frames").unwrap().select_in(map);
        assert_eq!(frames, vec![&json!([1, 2])]);
    }

    #[test]
    fn test_for_each_mut() {
        let mut tree = tree();
        KeyPath::parse("threads.*.name")
            .unwrap()
            .for_each_mut(&mut tree, &mut |value| *value = json!("x"));
        assert_eq!(tree["threads"][0]["name"], "x");
        assert_eq!(tree["threads"][1]["name"], "x");
    }

    #[test]
    fn test_copy_into() {
        let tree = tree();
        let mut out = Value::Null;
        KeyPath::parse("threads.*.name")
            .unwrap()
            .copy_into(&tree, &mut out);
        KeyPath::parse("crash.signal.number")
            .unwrap()
            .copy_into(&tree, &mut out);
        assert_eq!(
            out,
            json!({
                "threads": [{"name": "main"}, {"name": "worker"}],
                "crash": {"signal": {"number": 11}},
            })
        );
    }
}
