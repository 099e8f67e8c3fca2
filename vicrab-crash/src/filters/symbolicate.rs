// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tools::{format_address, parse_address};
use super::{Filter, FilterAction};
use crate::raw_report::ParsedReport;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Resolves file offsets within one binary to symbols.
pub trait SymbolResolver: Send + Sync + fmt::Debug {
    /// One result per offset, in order. `None` when the offset has no
    /// symbol. An error means the binary itself could not be used.
    fn resolve(&self, path: &str, file_offsets: &[u64])
        -> anyhow::Result<Vec<Option<ResolvedSymbol>>>;
}

/// Reads symbols from the ELF files named in the binary image list.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlazesymResolver;

impl SymbolResolver for BlazesymResolver {
    fn resolve(
        &self,
        path: &str,
        file_offsets: &[u64],
    ) -> anyhow::Result<Vec<Option<ResolvedSymbol>>> {
        use blazesym::helper::ElfResolver;
        use blazesym::symbolize::source::{Elf, Source};
        use blazesym::symbolize::{Input, Symbolized, Symbolizer, TranslateFileOffset};

        let resolver = ElfResolver::open(path)?;
        let symbolizer = Symbolizer::new();
        let src = Source::Elf(Elf::new(path));
        file_offsets
            .iter()
            .map(|&file_offset| {
                let Some(virt_offset) = resolver.file_offset_to_virt_offset(file_offset)? else {
                    return Ok(None);
                };
                match symbolizer.symbolize_single(&src, Input::VirtOffset(virt_offset))? {
                    Symbolized::Sym(s) => {
                        let mut symbol = ResolvedSymbol {
                            name: s.name.into_owned(),
                            file: None,
                            line: None,
                            column: None,
                        };
                        if let Some(c) = s.code_info {
                            symbol.column = c.column.map(u32::from);
                            symbol.file = Some(c.to_path().display().to_string());
                            symbol.line = c.line;
                        }
                        Ok(Some(symbol))
                    }
                    Symbolized::Unknown(_) => Ok(None),
                }
            })
            .collect()
    }
}

/// Maps every frame's instruction pointer to its binary image and, where the
/// resolver knows it, to a symbol.
///
/// Adds `image`, `image_offset` and, when resolved, `symbol`, `file`, `line`
/// and `column` to each frame. Frames the resolver has nothing for get a
/// `comments` entry. The filter fails only when the report is malformed or
/// when no frame could be resolved because every binary was unusable.
#[derive(Debug)]
pub struct Symbolicate {
    resolver: Box<dyn SymbolResolver>,
}

impl Default for Symbolicate {
    fn default() -> Self {
        Self::new(BlazesymResolver)
    }
}

#[derive(Debug, Clone)]
struct Image {
    start: u64,
    end: u64,
    offset: u64,
    path: String,
}

fn images_of(report: &ParsedReport) -> anyhow::Result<Vec<Image>> {
    let Some(images) = report.get("binary_images") else {
        return Ok(vec![]);
    };
    let images = images
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("binary_images is not an array"))?;
    images
        .iter()
        .map(|image| {
            let field = |key: &str| {
                image
                    .get(key)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("Binary image without {key}"))
            };
            Ok(Image {
                start: parse_address(field("start")?)?,
                end: parse_address(field("end")?)?,
                offset: parse_address(field("offset")?)?,
                path: field("path")?.to_string(),
            })
        })
        .collect()
}

/// Where a frame sits: thread index, frame index.
type FrameRef = (usize, usize);

impl Symbolicate {
    pub fn new(resolver: impl SymbolResolver + 'static) -> Self {
        Self {
            resolver: Box::new(resolver),
        }
    }
}

impl Filter for Symbolicate {
    fn name(&self) -> &str {
        "symbolicate"
    }

    fn apply(&self, report: &mut ParsedReport) -> anyhow::Result<FilterAction> {
        let images = images_of(report)?;
        let Some(threads) = report.get_path_mut(&["threads"]) else {
            return Ok(FilterAction::Continue);
        };
        let threads = threads
            .as_array_mut()
            .ok_or_else(|| anyhow::anyhow!("threads is not an array"))?;

        // Lookups grouped by image so each binary is opened once.
        let mut lookups: BTreeMap<usize, Vec<(FrameRef, u64)>> = BTreeMap::new();
        for (t, thread) in threads.iter_mut().enumerate() {
            let Some(frames) = thread.get_mut("frames").and_then(Value::as_array_mut) else {
                continue;
            };
            for (f, frame) in frames.iter_mut().enumerate() {
                let ip = frame
                    .get("ip")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("Frame {f} of thread {t} has no ip"))?;
                let ip = parse_address(ip)?;
                // Past the first frame the ip is a return address; look up the
                // call instruction instead.
                let lookup = if f == 0 { ip } else { ip.saturating_sub(1) };
                let Some(index) = images
                    .iter()
                    .position(|image| (image.start..image.end).contains(&lookup))
                else {
                    push_comment(frame, format!("No binary image contains {}", format_address(ip)));
                    continue;
                };
                let image = &images[index];
                let file_offset = lookup - image.start + image.offset;
                frame["image"] = json!(image.path);
                frame["image_offset"] = json!(format_address(file_offset));
                lookups.entry(index).or_default().push(((t, f), file_offset));
            }
        }

        let mut resolved = 0usize;
        let mut failures = vec![];
        for (index, frames) in lookups {
            let image = &images[index];
            let offsets: Vec<u64> = frames.iter().map(|(_, offset)| *offset).collect();
            match self.resolver.resolve(&image.path, &offsets) {
                Ok(symbols) => {
                    for (((t, f), _), symbol) in frames.iter().zip(symbols) {
                        let frame = &mut threads[*t]["frames"][*f];
                        match symbol {
                            Some(symbol) => {
                                resolved += 1;
                                set_symbol(frame, symbol);
                            }
                            None => push_comment(frame, "No symbol found".to_string()),
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(path = %image.path, "Could not symbolicate image: {e:#}");
                    for ((t, f), _) in &frames {
                        push_comment(
                            &mut threads[*t]["frames"][*f],
                            format!("resolve failed with {e:#}"),
                        );
                    }
                    failures.push(format!("{}: {e:#}", image.path));
                }
            }
        }
        anyhow::ensure!(
            resolved > 0 || failures.is_empty(),
            "No frame could be symbolicated: {}",
            failures.join("; ")
        );
        Ok(FilterAction::Continue)
    }
}

fn set_symbol(frame: &mut Value, symbol: ResolvedSymbol) {
    frame["symbol"] = json!(symbol.name);
    if let Some(file) = symbol.file {
        frame["file"] = json!(file);
    }
    if let Some(line) = symbol.line {
        frame["line"] = json!(line);
    }
    if let Some(column) = symbol.column {
        frame["column"] = json!(column);
    }
}

fn push_comment(frame: &mut Value, comment: String) {
    if !frame["comments"].is_array() {
        frame["comments"] = json!([]);
    }
    if let Some(comments) = frame["comments"].as_array_mut() {
        comments.push(Value::String(comment));
    }
}
