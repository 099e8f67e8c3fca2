// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enumerates the executable images mapped into the process, for later
//! symbolication. Runs inside the capture window: no allocation.

use crate::raw_report::emit::BinaryImageLine;

fn split_field(line: &[u8]) -> (&[u8], &[u8]) {
    let start = line
        .iter()
        .position(|b| *b != b' ')
        .unwrap_or(line.len());
    let line = &line[start..];
    let end = line.iter().position(|b| *b == b' ').unwrap_or(line.len());
    (&line[..end], &line[end..])
}

fn parse_hex(field: &[u8]) -> Option<u64> {
    if field.is_empty() || field.len() > 16 {
        return None;
    }
    field.iter().try_fold(0u64, |value, b| {
        let digit = (*b as char).to_digit(16)?;
        Some(value << 4 | digit as u64)
    })
}

/// Parses one line of `/proc/<pid>/maps`, keeping executable file-backed
/// mappings only.
///
/// `start-end perms offset dev inode path`
pub fn parse_maps_line(line: &[u8]) -> Option<BinaryImageLine<'_>> {
    let (range, rest) = split_field(line);
    let (perms, rest) = split_field(rest);
    let (offset, rest) = split_field(rest);
    let (_dev, rest) = split_field(rest);
    let (_inode, rest) = split_field(rest);
    let path_start = rest.iter().position(|b| *b != b' ')?;
    let path = std::str::from_utf8(&rest[path_start..]).ok()?;
    if perms.get(2) != Some(&b'x') || !path.starts_with('/') {
        return None;
    }
    let dash = range.iter().position(|b| *b == b'-')?;
    Some(BinaryImageLine {
        start: parse_hex(&range[..dash])?,
        end: parse_hex(&range[dash + 1..])?,
        offset: parse_hex(offset)?,
        path,
    })
}

#[cfg(target_os = "linux")]
pub fn for_each_image(mut f: impl FnMut(&BinaryImageLine<'_>)) {
    use crate::recording_tools::{CPath, LineReader};

    let Some(path) = CPath::from_fmt(format_args!("/proc/self/maps")) else {
        return;
    };
    let fd = path.open(libc::O_RDONLY);
    if fd < 0 {
        return;
    }
    let mut reader = LineReader::<512>::new(fd);
    reader.for_each_line(|line| {
        if let Some(image) = parse_maps_line(line) {
            f(&image);
        }
    });
    // SAFETY: we opened it.
    unsafe { libc::close(fd) };
}

#[cfg(target_os = "macos")]
pub fn for_each_image(mut f: impl FnMut(&BinaryImageLine<'_>)) {
    use std::ffi::CStr;

    extern "C" {
        fn _dyld_image_count() -> u32;
        fn _dyld_get_image_header(image_index: u32) -> *const u8;
        fn _dyld_get_image_name(image_index: u32) -> *const libc::c_char;
    }

    const MH_MAGIC_64: u32 = 0xfeed_facf;
    const LC_SEGMENT_64: u32 = 0x19;
    const MACH_HEADER_64_SIZE: usize = 32;

    /// Size of the `__TEXT` segment, from the image's load commands.
    unsafe fn text_size(header: *const u8) -> u64 {
        let read_u32 = |at: *const u8| (at as *const u32).read_unaligned();
        if read_u32(header) != MH_MAGIC_64 {
            return 0;
        }
        let command_count = read_u32(header.add(16));
        let mut command = header.add(MACH_HEADER_64_SIZE);
        for _ in 0..command_count {
            let cmd = read_u32(command);
            let size = read_u32(command.add(4));
            if cmd == LC_SEGMENT_64 {
                let name = std::slice::from_raw_parts(command.add(8), 16);
                if name.starts_with(b"__TEXT\0") {
                    return (command.add(32) as *const u64).read_unaligned();
                }
            }
            if size == 0 {
                break;
            }
            command = command.add(size as usize);
        }
        0
    }

    // SAFETY: dyld keeps the headers and names of loaded images alive, and
    // the capture window does not load or unload images.
    unsafe {
        for index in 0.._dyld_image_count() {
            let header = _dyld_get_image_header(index);
            let name = _dyld_get_image_name(index);
            if header.is_null() || name.is_null() {
                continue;
            }
            let Ok(path) = CStr::from_ptr(name).to_str() else {
                continue;
            };
            let start = header as u64;
            f(&BinaryImageLine {
                start,
                end: start + text_size(header),
                offset: 0,
                path,
            });
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn for_each_image(_f: impl FnMut(&BinaryImageLine<'_>)) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_line() {
        let line =
            b"55d0c5a00000-55d0c5a2e000 r-xp 00001000 08:01 1234                       /usr/bin/demo";
        let image = parse_maps_line(line).unwrap();
        assert_eq!(image.start, 0x55d0_c5a0_0000);
        assert_eq!(image.end, 0x55d0_c5a2_e000);
        assert_eq!(image.offset, 0x1000);
        assert_eq!(image.path, "/usr/bin/demo");

        let with_space = b"7f0000000000-7f0000001000 r-xp 00000000 08:01 99 /opt/my app/lib.so";
        assert_eq!(parse_maps_line(with_space).unwrap().path, "/opt/my app/lib.so");
    }

    #[test]
    fn test_parse_maps_line_skips_non_images() {
        // Not executable.
        assert!(parse_maps_line(b"1000-2000 r--p 00000000 08:01 1 /usr/lib/libc.so.6").is_none());
        // Anonymous and pseudo mappings.
        assert!(parse_maps_line(b"1000-2000 r-xp 00000000 00:00 0").is_none());
        assert!(parse_maps_line(b"1000-2000 r-xp 00000000 00:00 0 [vdso]").is_none());
        assert!(parse_maps_line(b"garbage").is_none());
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)]
    fn test_own_images_include_test_binary() {
        let exe = std::env::current_exe().unwrap();
        let exe = exe.to_str().unwrap().to_string();
        let mut found = false;
        let own_ip = test_own_images_include_test_binary as usize as u64;
        for_each_image(|image| {
            if image.path == exe && (image.start..image.end).contains(&own_ip) {
                found = true;
            }
        });
        assert!(found);
    }
}
