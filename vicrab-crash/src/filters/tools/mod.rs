// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the filters.

pub mod date;
pub mod encoding;
pub mod merge;
pub mod paths;

pub use date::{iso8601_to_micros, micros_to_iso8601, seconds_to_iso8601};
pub use encoding::{format_address, from_base64, hex_to_base64, parse_address, parse_hex_bytes, to_base64, to_hex};
pub use merge::deep_merge;
pub use paths::{KeyPath, Segment};
