// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

/// Merges `src` into `dst`. Objects merge key by key, recursively; any
/// other value in `src` replaces the one in `dst`, except `null`, which
/// leaves `dst` alone.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge() {
        let mut dst = json!({
            "app": {"name": "demo", "version": "1.0"},
            "tags": ["a"],
            "keep": 1,
        });
        deep_merge(
            &mut dst,
            json!({
                "app": {"version": "1.1", "build": 7},
                "tags": ["b"],
                "keep": null,
                "new": true,
            }),
        );
        assert_eq!(
            dst,
            json!({
                "app": {"name": "demo", "version": "1.1", "build": 7},
                "tags": ["b"],
                "keep": 1,
                "new": true,
            })
        );
    }

    #[test]
    fn test_scalar_replaced_by_object() {
        let mut dst = json!({"a": 1});
        deep_merge(&mut dst, json!({"a": {"b": 2}}));
        assert_eq!(dst, json!({"a": {"b": 2}}));
    }
}
