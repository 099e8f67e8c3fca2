// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use serde_json::{json, Value};
use symbolic_common::Name;
use symbolic_demangle::{Demangle as _, DemangleOptions};

/// Demangles the `symbol` of every frame, keeping the original under
/// `mangled_symbol`. Names that are not mangled are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct Demangle;

fn demangle_frame(frame: &mut Value) {
    let Some(name) = frame.get("symbol").and_then(Value::as_str).map(str::to_owned) else {
        return;
    };
    match Name::from(&name).demangle(DemangleOptions::name_only()) {
        Some(demangled) if demangled != name => {
            frame["mangled_symbol"] = json!(name);
            frame["symbol"] = json!(demangled);
        }
        _ => {}
    }
}

impl Filter for Demangle {
    fn name(&self) -> &str {
        "demangle"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let Some(threads) = report.get_path_mut(&["threads"]).and_then(Value::as_array_mut)
        else {
            return Ok(FilterAction::Continue);
        };
        for thread in threads {
            if let Some(frames) = thread.get_mut("frames").and_then(Value::as_array_mut) {
                frames.iter_mut().for_each(demangle_frame);
            }
        }
        Ok(FilterAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(symbol: Option<&str>) -> Value {
        match symbol {
            Some(symbol) => json!({"ip": "0x0000000000001000", "symbol": symbol}),
            None => json!({"ip": "0x0000000000001000"}),
        }
    }

    fn demangled(symbol: Option<&str>) -> Value {
        let mut report = ParsedReport::new();
        report.set_path(&["threads"], json!([{"frames": [frame(symbol)]}]));
        Demangle.apply(&mut report).unwrap();
        report.get("threads").unwrap()[0]["frames"][0].clone()
    }

    #[test]
    fn test_demangle_rust() {
        let frame = demangled(Some("_ZN3std2rt10lang_start17h7a87e81ecc4a9d6cE"));
        assert_eq!(frame["symbol"], "std::rt::lang_start");
        assert_eq!(
            frame["mangled_symbol"],
            "_ZN3std2rt10lang_start17h7a87e81ecc4a9d6cE"
        );
    }

    #[test]
    fn test_demangle_cpp() {
        let frame = demangled(Some("_ZN3Foo3barEv"));
        assert_eq!(frame["symbol"], "Foo::bar");
        assert_eq!(frame["mangled_symbol"], "_ZN3Foo3barEv");
    }

    #[test]
    fn test_demangle_msvc() {
        let frame = demangled(Some("?bar@Foo@@QEAAXXZ"));
        assert_eq!(frame["symbol"], "Foo::bar");
        assert_eq!(frame["mangled_symbol"], "?bar@Foo@@QEAAXXZ");
    }

    #[test]
    fn test_demangle_unmangled() {
        let frame = demangled(Some("main"));
        assert_eq!(frame["symbol"], "main");
        assert!(frame.get("mangled_symbol").is_none());
    }

    #[test]
    fn test_demangle_no_symbol() {
        let frame = demangled(None);
        assert!(frame.get("symbol").is_none());
        assert!(frame.get("mangled_symbol").is_none());
    }

    #[test]
    fn test_no_threads() {
        let mut report = ParsedReport::new();
        assert_eq!(Demangle.apply(&mut report).unwrap(), FilterAction::Continue);
    }
}
