// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::raw_report::emit::SystemLine;
use std::ffi::CStr;
use std::time::Instant;

/// The part of the system block that is computed at install time, where
/// allocating and calling into `os_info` is fine.
#[derive(Debug, Clone)]
pub(crate) struct PreparedSystemInfo {
    pub process_name: String,
    pub os_version: String,
    pub page_size: u64,
    pub cpu_count: u64,
    pub started: Instant,
}

impl PreparedSystemInfo {
    pub fn gather() -> Self {
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let info = os_info::get();
        let cpu_count = std::thread::available_parallelism()
            .map(|count| count.get() as u64)
            .unwrap_or(1);
        Self {
            process_name,
            os_version: format!("{} {}", info.os_type(), info.version()),
            page_size: page_size::get() as u64,
            cpu_count,
            started: Instant::now(),
        }
    }
}

/// `uname` and process ids, read at crash time.
pub(crate) struct CapturedSystemInfo {
    pid: u32,
    ppid: u32,
    uname: libc::utsname,
}

fn c_field(field: &[libc::c_char]) -> &str {
    // SAFETY: c_char and u8 have the same layout.
    let bytes = unsafe { std::slice::from_raw_parts(field.as_ptr() as *const u8, field.len()) };
    CStr::from_bytes_until_nul(bytes)
        .ok()
        .and_then(|name| name.to_str().ok())
        .unwrap_or_default()
}

impl CapturedSystemInfo {
    /// SIGNAL SAFETY: `getpid`, `getppid` and `uname` are plain system calls.
    pub fn capture() -> Self {
        // SAFETY: an all zero utsname is valid, and uname fills it in.
        let mut uname: libc::utsname = unsafe { std::mem::zeroed() };
        unsafe { libc::uname(&mut uname) };
        Self {
            // SAFETY: no preconditions.
            pid: unsafe { libc::getpid() } as u32,
            ppid: unsafe { libc::getppid() } as u32,
            uname,
        }
    }

    pub fn as_line<'a>(&'a self, prepared: &'a PreparedSystemInfo) -> SystemLine<'a> {
        SystemLine {
            pid: self.pid,
            ppid: self.ppid,
            process_name: &prepared.process_name,
            uptime_ms: prepared.started.elapsed().as_millis() as u64,
            os_name: c_field(&self.uname.sysname),
            os_release: c_field(&self.uname.release),
            os_version: &prepared.os_version,
            machine: c_field(&self.uname.machine),
            page_size: prepared.page_size,
            cpu_count: prepared.cpu_count,
        }
    }
}
