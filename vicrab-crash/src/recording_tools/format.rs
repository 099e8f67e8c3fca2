// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, allocation-free text formatting.
//!
//! `core::fmt` itself never allocates; only the sinks do. [`FixedBuf`] is a
//! sink backed by an inline array that silently truncates once full, so any
//! `format_args!` can be rendered inside a signal handler.

use std::fmt;

/// A fixed capacity text buffer. Writes past the end are dropped, never
/// reallocated. Truncation always happens on a UTF-8 character boundary.
#[derive(Clone, Copy)]
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    /// Copies `s` in, keeping as many whole characters as fit.
    pub fn push_str(&mut self, s: &str) {
        let room = N - self.len;
        let take = if s.len() <= room {
            s.len()
        } else {
            self.truncated = true;
            floor_char_boundary(s, room)
        };
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
    }

    /// Copies raw bytes in, replacing the content. Invalid UTF-8 is cut at the
    /// first bad byte.
    pub fn set_lossy(&mut self, bytes: &[u8]) {
        self.clear();
        let valid = match std::str::from_utf8(bytes) {
            Ok(s) => s,
            // Safety: `valid_up_to` is a UTF-8 boundary.
            Err(e) => unsafe { std::str::from_utf8_unchecked(&bytes[..e.valid_up_to()]) },
        };
        self.push_str(valid);
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Renders `args` into `out`, truncating at `out.len()`. Returns the number
/// of bytes written.
pub fn format_into(out: &mut [u8], args: fmt::Arguments<'_>) -> usize {
    struct SliceSink<'a> {
        out: &'a mut [u8],
        len: usize,
    }
    impl fmt::Write for SliceSink<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let room = self.out.len() - self.len;
            let take = floor_char_boundary(s, room);
            self.out[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
            self.len += take;
            Ok(())
        }
    }
    let mut sink = SliceSink { out, len: 0 };
    let _ = fmt::write(&mut sink, args);
    sink.len
}

/// Writes the decimal representation of `val` at the start of `buf`.
/// Returns `None` if it does not fit.
pub fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

/// Displays a string as a JSON string literal, quotes included, escaping
/// without allocating. The escaping is canonical: re-encoding a decoded
/// string yields the same bytes.
pub struct JsonStr<'a>(pub &'a str);

impl fmt::Display for JsonStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        let bytes = self.0.as_bytes();
        let mut start = 0;
        for (i, &b) in bytes.iter().enumerate() {
            let escape: Option<&str> = match b {
                b'"' => Some("\\\""),
                b'\\' => Some("\\\\"),
                b'\n' => Some("\\n"),
                b'\r' => Some("\\r"),
                b'\t' => Some("\\t"),
                0x00..=0x1f | 0x7f => None,
                _ => continue,
            };
            f.write_str(&self.0[start..i])?;
            match escape {
                Some(e) => f.write_str(e)?,
                None => write!(f, "\\u{:04x}", b)?,
            }
            start = i + 1;
        }
        f.write_str(&self.0[start..])?;
        f.write_str("\"")
    }
}

/// Displays an address the way every address in a raw report is written.
#[derive(Copy, Clone)]
pub struct Addr(pub u64);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{:#018x}\"", self.0)
    }
}

/// Parses an address written by [`Addr`] (quotes already stripped).
pub fn parse_addr(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// Displays bytes as lowercase hex.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_fixed_buf_truncates() {
        let mut buf = FixedBuf::<8>::new();
        write!(buf, "{}-{}", 1234, 56789).unwrap();
        assert_eq!(buf.as_str(), "1234-567");
        assert!(buf.is_truncated());
    }

    #[test]
    fn test_fixed_buf_respects_char_boundaries() {
        let mut buf = FixedBuf::<5>::new();
        buf.push_str("ab🦀");
        assert_eq!(buf.as_str(), "ab");
        assert!(buf.is_truncated());
    }

    #[test]
    fn test_set_lossy_cuts_invalid_utf8() {
        let mut buf = FixedBuf::<16>::new();
        buf.set_lossy(b"main\xffthread");
        assert_eq!(buf.as_str(), "main");
    }

    #[test]
    fn test_format_into() {
        let mut out = [0u8; 10];
        let n = format_into(&mut out, format_args!("signal {} at {:#x}", 11, 0xdead));
        assert_eq!(n, 10);
        assert_eq!(&out[..n], b"signal 11 ");
    }

    #[test]
    fn test_write_decimal() {
        let mut buf = [0u8; 4];
        assert_eq!(write_decimal(&mut buf, 0), Some(1));
        assert_eq!(&buf[..1], b"0");
        assert_eq!(write_decimal(&mut buf, 4096), Some(4));
        assert_eq!(&buf, b"4096");
        assert_eq!(write_decimal(&mut buf, 40960), None);
    }

    #[test]
    fn test_json_str_escaping_matches_serde() {
        for s in ["plain", "quote\"d", "back\\slash", "new\nline", "bell\u{7}", "del\u{7f}", "ünï"] {
            let ours = JsonStr(s).to_string();
            let parsed: String = serde_json::from_str(&ours).unwrap();
            assert_eq!(parsed, s);
        }
        assert_eq!(JsonStr("a\u{1}b").to_string(), "\"a\\u0001b\"");
    }

    #[test]
    fn test_addr_round_trip() {
        let rendered = Addr(0x7fff_1234).to_string();
        assert_eq!(rendered, "\"0x000000007fff1234\"");
        assert_eq!(parse_addr(rendered.trim_matches('"')), Some(0x7fff_1234));
        assert_eq!(parse_addr("zz"), None);
    }
}
