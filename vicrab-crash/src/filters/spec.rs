// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{
    Demangle, DiscardWhen, Enrich, EventConversion, FilterChain, MergePreviousSession, Metadata,
    Passthrough, Redact, Sanitize, Subset, Symbolicate,
};
use crate::store::ReportStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A serializable description of one chain entry, e.g.
/// `{"filter": "redact", "keys": ["(?i)password"], "fatal": false}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(flatten)]
    pub kind: FilterKind,
    /// A failure of a fatal entry stops the chain.
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum FilterKind {
    Passthrough,
    Sanitize {
        #[serde(default)]
        max_string_len: Option<usize>,
    },
    Symbolicate,
    Demangle,
    Enrich {
        metadata: Metadata,
    },
    Redact {
        #[serde(default)]
        keys: Vec<String>,
        #[serde(default)]
        values: Vec<String>,
        #[serde(default)]
        replacement: Option<String>,
    },
    MergePreviousSession {
        report_dir: PathBuf,
        app_name: String,
    },
    Subset {
        paths: Vec<String>,
    },
    DiscardWhen {
        path: String,
        #[serde(default)]
        equals: Option<Value>,
        reason: String,
    },
    EventConversion,
    Chain {
        filters: Vec<FilterSpec>,
    },
}

impl FilterSpec {
    pub fn new(kind: FilterKind) -> Self {
        Self { kind, fatal: false }
    }

    pub fn fatal(kind: FilterKind) -> Self {
        Self { kind, fatal: true }
    }
}

fn push_spec(chain: &mut FilterChain, spec: &FilterSpec) -> anyhow::Result<()> {
    let fatal = spec.fatal;
    match &spec.kind {
        FilterKind::Passthrough => chain.push(Passthrough, fatal),
        FilterKind::Sanitize { max_string_len } => {
            let sanitize = match max_string_len {
                Some(len) => Sanitize::new(*len)?,
                None => Sanitize::default(),
            };
            chain.push(sanitize, fatal)
        }
        FilterKind::Symbolicate => chain.push(Symbolicate::default(), fatal),
        FilterKind::Demangle => chain.push(Demangle, fatal),
        FilterKind::Enrich { metadata } => {
            chain.push(Enrich::this_machine(metadata.clone()), fatal)
        }
        FilterKind::Redact {
            keys,
            values,
            replacement,
        } => {
            let mut redact = Redact::new(keys, values)?;
            if let Some(replacement) = replacement {
                redact = redact.with_replacement(replacement);
            }
            chain.push(redact, fatal)
        }
        FilterKind::MergePreviousSession {
            report_dir,
            app_name,
        } => {
            let store = ReportStore::new(report_dir, app_name)?;
            chain.push(MergePreviousSession::new(store), fatal)
        }
        FilterKind::Subset { paths } => chain.push(Subset::new(paths)?, fatal),
        FilterKind::DiscardWhen {
            path,
            equals,
            reason,
        } => chain.push(
            DiscardWhen::path_matches(reason.clone(), path, equals.clone())?,
            fatal,
        ),
        FilterKind::EventConversion => chain.push(EventConversion, fatal),
        FilterKind::Chain { filters } => {
            let mut nested = FilterChain::new();
            for spec in filters {
                push_spec(&mut nested, spec)?;
            }
            chain.push(nested, fatal)
        }
    }
    Ok(())
}

/// Builds the chain the specs describe, in order. Fails on the first spec
/// that cannot be built.
pub fn build_chain(specs: &[FilterSpec]) -> anyhow::Result<FilterChain> {
    let mut chain = FilterChain::new();
    for (i, spec) in specs.iter().enumerate() {
        push_spec(&mut chain, spec)
            .map_err(|e| e.context(format!("Invalid filter spec #{i}")))?;
    }
    tracing::debug!(filters = ?chain.filter_names(), "Built filter chain");
    Ok(chain)
}
