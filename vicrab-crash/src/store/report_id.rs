// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;

const COUNTER_BITS: u32 = 23;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// The last id handed out by this process.
static LAST: AtomicU64 = AtomicU64::new(0);

/// Identifies a report: `(unix_seconds << 23) | counter`.
///
/// Ids sort in creation order, and are strictly increasing within one
/// process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub u64);

impl ReportId {
    /// A new id, greater than any handed out before by this process.
    pub fn next() -> Self {
        Self::next_after(ReportId(0))
    }

    /// A new id, greater than `floor` and than any handed out before by this
    /// process. Another process writing to the same directory starts its
    /// counter from scratch, so callers pass the newest id found on disk.
    pub fn next_after(floor: ReportId) -> Self {
        let seconds = chrono::Utc::now().timestamp().max(0) as u64;
        let candidate = (seconds << COUNTER_BITS).max(floor.0.saturating_add(1));
        let previous = LAST
            .fetch_update(SeqCst, SeqCst, |last| Some(candidate.max(last + 1)))
            .unwrap_or_else(|last| last);
        ReportId(candidate.max(previous + 1))
    }

    pub fn unix_seconds(self) -> u64 {
        self.0 >> COUNTER_BITS
    }

    pub fn counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }

    /// Parses the 16 hex digits used in file names.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(ReportId)
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let ids: Vec<_> = (0..1000).map(|_| ReportId::next()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        let now = chrono::Utc::now().timestamp() as u64;
        assert!(ids[0].unix_seconds() <= now);
        assert!(ids[0].unix_seconds() + 5 >= now);
    }

    #[test]
    fn test_next_after_skips_ids_on_disk() {
        let now = chrono::Utc::now().timestamp() as u64;
        let taken = ReportId(((now + 60) << COUNTER_BITS) | 5);
        let id = ReportId::next_after(taken);
        assert!(id > taken);
        assert!(ReportId::next() > id);
        // An old floor does not move ids back.
        assert!(ReportId::next_after(ReportId(1)) > id);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = ReportId((1_700_000_000 << 23) | 7);
        assert_eq!(ReportId::from_hex(&id.to_string()), Some(id));
        assert_eq!(id.counter(), 7);
        assert_eq!(ReportId::from_hex("abc"), None);
        assert_eq!(ReportId::from_hex("zzzzzzzzzzzzzzzz"), None);
    }
}
