// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn parse_hex_bytes(hex: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(hex.len() % 2 == 0, "Odd number of hex digits: {}", hex.len());
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| anyhow::anyhow!("Bad hex at offset {i}: {e}"))
        })
        .collect()
}

/// Lowercase, no separators.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut s, "{byte:02x}");
    }
    s
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(encoded: &str) -> anyhow::Result<Vec<u8>> {
    Ok(STANDARD.decode(encoded)?)
}

pub fn hex_to_base64(hex: &str) -> anyhow::Result<String> {
    Ok(to_base64(&parse_hex_bytes(hex)?))
}

/// Parses the `"0x..."` addresses used throughout the report tree.
pub fn parse_address(s: &str) -> anyhow::Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    Ok(u64::from_str_radix(digits, 16)?)
}

pub fn format_address(address: u64) -> String {
    format!("{address:#018x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(parse_hex_bytes("00ff10").unwrap(), vec![0, 255, 16]);
        assert_eq!(to_hex(&[0, 255, 16]), "00ff10");
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn test_base64() {
        assert_eq!(hex_to_base64("deadbeef").unwrap(), "3q2+7w==");
        assert_eq!(from_base64("3q2+7w==").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_addresses() {
        assert_eq!(parse_address("0x0000000000401000").unwrap(), 0x401000);
        assert_eq!(parse_address("401000").unwrap(), 0x401000);
        assert_eq!(format_address(0x401000), "0x0000000000401000");
        assert!(parse_address("0xnope").is_err());
    }
}
