// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{ChainOutcome, FilterChain};
use crate::store::{ReportId, ReportStore, StoreError};
use std::num::NonZeroUsize;

/// The result of processing one stored report.
#[derive(Debug)]
pub struct ProcessedReport {
    pub id: ReportId,
    /// `Err` when the report could not be read or decoded. It stays in the
    /// store either way; deleting it is up to the caller.
    pub result: Result<ChainOutcome, StoreError>,
}

impl ProcessedReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.result, Ok(ChainOutcome::Completed { .. }))
    }
}

fn process_one(store: &ReportStore, chain: &FilterChain, id: ReportId) -> ProcessedReport {
    let result = store
        .read_report(id)
        .map(|report| chain.run(report.to_tree()));
    match &result {
        Ok(ChainOutcome::Completed { errors, .. }) if !errors.is_empty() => {
            tracing::info!(%id, errors = errors.len(), "Report processed with errors")
        }
        Ok(ChainOutcome::Completed { .. }) => tracing::debug!(%id, "Report processed"),
        Ok(ChainOutcome::Discarded { filter, reason, .. }) => {
            tracing::info!(%id, %filter, %reason, "Report discarded")
        }
        Ok(ChainOutcome::Failed { error, .. }) => {
            tracing::warn!(%id, %error, "Report processing failed")
        }
        Err(e) => tracing::warn!(%id, "Could not read report: {e}"),
    }
    ProcessedReport { id, result }
}

/// Runs `chain` over every complete report in `store`, oldest first.
///
/// Reports are spread over scoped worker threads; each works on its own
/// decoded copy so the chain needs no synchronization. Results come back in
/// store order.
pub fn process_reports(
    store: &ReportStore,
    chain: &FilterChain,
) -> Result<Vec<ProcessedReport>, StoreError> {
    let ids = store.list()?;
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let workers = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .min(ids.len());
    let chunk_size = ids.len().div_ceil(workers);
    tracing::debug!(reports = ids.len(), workers, "Processing stored reports");

    let processed: Vec<ProcessedReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = ids
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|&id| process_one(store, chain, id))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{EventConversion, Sanitize};
    use crate::raw_report::RawReport;
    use crate::shared::constants::VICRAB_CRASH_DONE;
    use crate::test_utils::TestInstance;
    use std::fs;

    fn write_report(store: &ReportStore, seed: u64, complete: bool) -> ReportId {
        let mut report = RawReport::test_instance(seed);
        report.complete = complete;
        let id = ReportId(report.header.report_id);
        fs::write(store.report_path(id), report.to_bytes().unwrap()).unwrap();
        id
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_process_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path(), "demo").unwrap();
        let ids: Vec<_> = (1..=5).map(|seed| write_report(&store, seed, true)).collect();
        write_report(&store, 6, false);
        // Terminated but not a report.
        let corrupt = ReportId((1_700_000_000 << 23) | 7);
        fs::write(
            store.report_path(corrupt),
            format!("garbage\n{VICRAB_CRASH_DONE}\n"),
        )
        .unwrap();

        let chain = FilterChain::new().with(Sanitize::default()).with(EventConversion);
        let processed = process_reports(&store, &chain).unwrap();

        let processed_ids: Vec<_> = processed.iter().map(|p| p.id).collect();
        let mut expected = ids.clone();
        expected.push(corrupt);
        assert_eq!(processed_ids, expected);
        for report in &processed[..5] {
            assert!(report.is_completed(), "{report:?}");
            let event = report.result.as_ref().unwrap().report().unwrap();
            assert_eq!(event.get("platform").unwrap(), "native");
        }
        assert!(matches!(
            processed[5].result,
            Err(StoreError::Decode { .. })
        ));
        // Nothing is deleted by processing.
        assert_eq!(store.list().unwrap().len(), 6);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path(), "demo").unwrap();
        assert!(process_reports(&store, &FilterChain::new())
            .unwrap()
            .is_empty());
    }
}
