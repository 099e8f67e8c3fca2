// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, SecondsFormat, Utc};

/// Microseconds since the epoch as an RFC 3339 / ISO-8601 UTC timestamp,
/// e.g. `2023-11-14T22:13:20.000123Z`.
pub fn micros_to_iso8601(micros: u64) -> Option<String> {
    let micros = i64::try_from(micros).ok()?;
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Micros, true))
}

pub fn iso8601_to_micros(timestamp: &str) -> anyhow::Result<u64> {
    let time = DateTime::parse_from_rfc3339(timestamp)?;
    Ok(u64::try_from(time.timestamp_micros())?)
}

/// Seconds since the epoch, the resolution of report ids.
pub fn seconds_to_iso8601(seconds: u64) -> Option<String> {
    let seconds = i64::try_from(seconds).ok()?;
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        assert_eq!(
            micros_to_iso8601(1_700_000_000_000_123).as_deref(),
            Some("2023-11-14T22:13:20.000123Z")
        );
        assert_eq!(
            seconds_to_iso8601(1_568_898_000).as_deref(),
            Some("2019-09-19T13:00:00Z")
        );
        assert_eq!(micros_to_iso8601(u64::MAX), None);
    }

    #[test]
    fn test_parse_back() {
        let micros = 1_700_000_000_000_123;
        let formatted = micros_to_iso8601(micros).unwrap();
        assert_eq!(iso8601_to_micros(&formatted).unwrap(), micros);
        assert_eq!(
            iso8601_to_micros("2023-11-14T23:13:20.000123+01:00").unwrap(),
            micros
        );
        assert!(iso8601_to_micros("yesterday").is_err());
    }
}
