// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Emitters for every line of a raw report.
//!
//! SIGNAL SAFETY:
//!     These functions are called from the crash handler. They only format
//!     into the given writer with `write!`, which does not allocate; strings
//!     and addresses go through [`JsonStr`] and [`Addr`]. Each block is
//!     flushed when it ends, so a crash in the middle of the capture loses at
//!     most the block being written.

use super::ReportType;
use crate::recording_tools::{Addr, HexBytes, JsonStr};
use crate::shared::constants::*;
use std::fmt;
use std::io::{self, Write};

/// `,"name":value` when the value is present, nothing otherwise.
struct OptField<'a, T>(&'a str, Option<T>);

impl<T: fmt::Display> fmt::Display for OptField<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.1 {
            Some(value) => write!(f, ",\"{}\":{}", self.0, value),
            None => Ok(()),
        }
    }
}

fn opt_str<'a>(name: &'a str, value: Option<&'a str>) -> OptField<'a, JsonStr<'a>> {
    OptField(name, value.map(JsonStr))
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderLine<'a> {
    pub report_id: u64,
    pub event_id: &'a str,
    pub timestamp_micros: u64,
    pub report_type: ReportType,
    pub process_name: &'a str,
    pub app_name: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct CrashLine<'a> {
    pub kind: &'a str,
    pub monitor: &'a str,
    pub fatal: bool,
    pub tid: u64,
    pub thread_name: &'a str,
    pub stack_overflow: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalLine<'a> {
    pub number: i32,
    pub code: i32,
    pub name: &'a str,
    pub code_name: &'a str,
    pub address: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct MachLine {
    pub exception: i32,
    pub code: i64,
    pub subcode: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionLine<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct CppExceptionLine<'a> {
    pub type_name: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct UserLine<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    pub stack_json: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct ZombieLine {
    pub address: u64,
    pub size: u64,
}

/// The crash context block. `extra` carries lines this build does not
/// understand, kept from a decoded report.
#[derive(Debug, Clone, Copy)]
pub struct ContextLines<'a> {
    pub crash: CrashLine<'a>,
    pub signal: Option<SignalLine<'a>>,
    pub mach: Option<MachLine>,
    pub exception: Option<ExceptionLine<'a>>,
    pub cpp_exception: Option<CppExceptionLine<'a>>,
    pub user: Option<UserLine<'a>>,
    pub zombie: Option<ZombieLine>,
    pub extra: &'a [String],
}

#[derive(Debug, Clone, Copy)]
pub struct SystemLine<'a> {
    pub pid: u32,
    pub ppid: u32,
    pub process_name: &'a str,
    pub uptime_ms: u64,
    pub os_name: &'a str,
    pub os_release: &'a str,
    pub os_version: &'a str,
    pub machine: &'a str,
    pub page_size: u64,
    pub cpu_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadLine<'a> {
    pub index: u32,
    pub tid: u64,
    pub name: &'a str,
    pub crashed: bool,
    pub current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLine {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StackChunkLine<'a> {
    pub address: u64,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryImageLine<'a> {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: &'a str,
}

pub fn emit_magic(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_MAGIC} {VICRAB_CRASH_FORMAT_VERSION}")
}

pub fn emit_header(w: &mut impl Write, header: &HeaderLine<'_>) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_HEADER}")?;
    writeln!(
        w,
        "{{\"report_id\":{},\"event_id\":{},\"timestamp_micros\":{},\"report_type\":{},\"process_name\":{},\"app_name\":{}}}",
        Addr(header.report_id),
        JsonStr(header.event_id),
        header.timestamp_micros,
        JsonStr(header.report_type.name()),
        JsonStr(header.process_name),
        JsonStr(header.app_name),
    )?;
    writeln!(w, "{VICRAB_CRASH_END_HEADER}")?;
    w.flush()
}

pub fn emit_context(w: &mut impl Write, context: &ContextLines<'_>) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_CONTEXT}")?;
    let crash = &context.crash;
    writeln!(
        w,
        "{{\"crash\":{{\"kind\":{},\"monitor\":{},\"fatal\":{},\"tid\":{},\"thread_name\":{},\"stack_overflow\":{}}}}}",
        JsonStr(crash.kind),
        JsonStr(crash.monitor),
        crash.fatal,
        crash.tid,
        JsonStr(crash.thread_name),
        crash.stack_overflow,
    )?;
    if let Some(signal) = &context.signal {
        writeln!(
            w,
            "{{\"signal\":{{\"number\":{},\"code\":{},\"name\":{},\"code_name\":{}{}}}}}",
            signal.number,
            signal.code,
            JsonStr(signal.name),
            JsonStr(signal.code_name),
            OptField("address", signal.address.map(Addr)),
        )?;
    }
    if let Some(mach) = &context.mach {
        writeln!(
            w,
            "{{\"mach\":{{\"exception\":{},\"code\":{},\"subcode\":{}}}}}",
            mach.exception,
            mach.code,
            Addr(mach.subcode),
        )?;
    }
    if let Some(exception) = &context.exception {
        writeln!(
            w,
            "{{\"exception\":{{\"name\":{}{}}}}}",
            JsonStr(exception.name),
            opt_str("reason", exception.reason),
        )?;
    }
    if let Some(cpp) = &context.cpp_exception {
        writeln!(
            w,
            "{{\"cpp_exception\":{{\"type_name\":{}}}}}",
            JsonStr(cpp.type_name)
        )?;
    }
    if let Some(user) = &context.user {
        writeln!(
            w,
            "{{\"user\":{{\"name\":{}{}{}{}{}}}}}",
            JsonStr(user.name),
            opt_str("reason", user.reason),
            opt_str("language", user.language),
            opt_str("line_of_code", user.line_of_code),
            opt_str("stack_json", user.stack_json),
        )?;
    }
    if let Some(zombie) = &context.zombie {
        writeln!(
            w,
            "{{\"zombie\":{{\"address\":{},\"size\":{}}}}}",
            Addr(zombie.address),
            zombie.size,
        )?;
    }
    for line in context.extra {
        writeln!(w, "{line}")?;
    }
    writeln!(w, "{VICRAB_CRASH_END_CONTEXT}")?;
    w.flush()
}

pub fn emit_system(w: &mut impl Write, system: &SystemLine<'_>) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_SYSTEM}")?;
    writeln!(
        w,
        "{{\"pid\":{},\"ppid\":{},\"process_name\":{},\"uptime_ms\":{},\"os_name\":{},\"os_release\":{},\"os_version\":{},\"machine\":{},\"page_size\":{},\"cpu_count\":{}}}",
        system.pid,
        system.ppid,
        JsonStr(system.process_name),
        system.uptime_ms,
        JsonStr(system.os_name),
        JsonStr(system.os_release),
        JsonStr(system.os_version),
        JsonStr(system.machine),
        system.page_size,
        system.cpu_count,
    )?;
    writeln!(w, "{VICRAB_CRASH_END_SYSTEM}")?;
    w.flush()
}

/// `context_json` is a serialized JSON object on a single line.
pub fn emit_user_context(w: &mut impl Write, context_json: &str) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_USER_CONTEXT}")?;
    writeln!(w, "{context_json}")?;
    writeln!(w, "{VICRAB_CRASH_END_USER_CONTEXT}")?;
    w.flush()
}

/// Each breadcrumb is a serialized JSON object on a single line.
pub fn emit_breadcrumbs<'a>(
    w: &mut impl Write,
    breadcrumbs: impl IntoIterator<Item = &'a str>,
) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_BREADCRUMBS}")?;
    for breadcrumb in breadcrumbs {
        writeln!(w, "{breadcrumb}")?;
    }
    writeln!(w, "{VICRAB_CRASH_END_BREADCRUMBS}")?;
    w.flush()
}

pub fn emit_thread_begin(w: &mut impl Write, thread: &ThreadLine<'_>) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_THREAD}")?;
    writeln!(
        w,
        "{{\"index\":{},\"tid\":{},\"name\":{},\"crashed\":{},\"current\":{}}}",
        thread.index,
        thread.tid,
        JsonStr(thread.name),
        thread.crashed,
        thread.current,
    )
}

pub fn emit_registers<'a>(
    w: &mut impl Write,
    registers: impl IntoIterator<Item = (&'a str, u64)>,
) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_REGISTERS}")?;
    for (name, value) in registers {
        writeln!(w, "{{{}:{}}}", JsonStr(name), Addr(value))?;
    }
    writeln!(w, "{VICRAB_CRASH_END_REGISTERS}")?;
    w.flush()
}

pub fn emit_frames_begin(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_FRAMES}")
}

/// Flushes eagerly so every frame found before a crash in the unwinder
/// reaches the file.
pub fn emit_frame(w: &mut impl Write, frame: &FrameLine) -> io::Result<()> {
    writeln!(
        w,
        "{{\"ip\":{},\"sp\":{},\"fp\":{}}}",
        Addr(frame.ip),
        Addr(frame.sp),
        Addr(frame.fp),
    )?;
    w.flush()
}

pub fn emit_frames_end(w: &mut impl Write, truncated: bool) -> io::Result<()> {
    if truncated {
        writeln!(w, "{VICRAB_CRASH_FRAMES_TRUNCATED}")?;
    }
    writeln!(w, "{VICRAB_CRASH_END_FRAMES}")?;
    w.flush()
}

pub fn emit_stack_dump_begin(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_STACK_DUMP}")
}

pub fn emit_stack_chunk(w: &mut impl Write, chunk: &StackChunkLine<'_>) -> io::Result<()> {
    writeln!(
        w,
        "{{\"address\":{},\"bytes\":\"{}\"}}",
        Addr(chunk.address),
        HexBytes(chunk.bytes),
    )
}

pub fn emit_stack_dump_end(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_END_STACK_DUMP}")?;
    w.flush()
}

pub fn emit_thread_end(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_END_THREAD}")?;
    w.flush()
}

pub fn emit_binary_images_begin(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_BINARY_IMAGES}")
}

pub fn emit_binary_image(w: &mut impl Write, image: &BinaryImageLine<'_>) -> io::Result<()> {
    writeln!(
        w,
        "{{\"start\":{},\"end\":{},\"offset\":{},\"path\":{}}}",
        Addr(image.start),
        Addr(image.end),
        Addr(image.offset),
        JsonStr(image.path),
    )
}

pub fn emit_binary_images_end(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_END_BINARY_IMAGES}")?;
    w.flush()
}

/// Writes a block this build does not know back out, unchanged.
pub fn emit_unknown_block(w: &mut impl Write, name: &str, lines: &[String]) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_BEGIN_PREFIX}{name}")?;
    for line in lines {
        writeln!(w, "{line}")?;
    }
    writeln!(w, "{VICRAB_CRASH_END_PREFIX}{name}")?;
    w.flush()
}

/// Marks the report complete. Nothing may be written after it.
pub fn emit_done(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "{VICRAB_CRASH_DONE}")?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut out = vec![];
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_signal_line_skips_missing_address() {
        let mut context = ContextLines {
            crash: CrashLine {
                kind: "signal",
                monitor: "signal",
                fatal: true,
                tid: 7,
                thread_name: "main",
                stack_overflow: false,
            },
            signal: Some(SignalLine {
                number: 6,
                code: -6,
                name: "SIGABRT",
                code_name: "SI_TKILL",
                address: None,
            }),
            mach: None,
            exception: None,
            cpp_exception: None,
            user: None,
            zombie: None,
            extra: &[],
        };
        let text = render(|w| emit_context(w, &context));
        assert!(text.contains(
            "{\"signal\":{\"number\":6,\"code\":-6,\"name\":\"SIGABRT\",\"code_name\":\"SI_TKILL\"}}"
        ));

        context.signal = context.signal.map(|signal| SignalLine {
            address: Some(0x10),
            ..signal
        });
        let text = render(|w| emit_context(w, &context));
        assert!(text.contains("\"address\":\"0x0000000000000010\"}}"));
        assert!(text.starts_with(VICRAB_CRASH_BEGIN_CONTEXT));
        assert!(text.ends_with(&format!("{VICRAB_CRASH_END_CONTEXT}\n")));
    }

    #[test]
    fn test_every_line_is_json() {
        let text = render(|w| {
            emit_registers(w, [("rip", 0x1000u64), ("rsp", 0x7fff_0000)])?;
            emit_frames_begin(w)?;
            emit_frame(
                w,
                &FrameLine {
                    ip: 1,
                    sp: 2,
                    fp: 3,
                },
            )?;
            emit_frames_end(w, true)?;
            emit_stack_dump_begin(w)?;
            emit_stack_chunk(
                w,
                &StackChunkLine {
                    address: 0x7fff_0000,
                    bytes: &[0xde, 0xad],
                },
            )?;
            emit_stack_dump_end(w)
        });
        for line in text.lines() {
            if line.starts_with("VICRAB_CRASH_") {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.is_object(), "{line}");
        }
        assert!(text.contains("\"bytes\":\"dead\""));
        assert!(text.contains(VICRAB_CRASH_FRAMES_TRUNCATED));
    }

    #[test]
    fn test_user_line_escapes() {
        let context = ContextLines {
            crash: CrashLine {
                kind: "user_reported",
                monitor: "user_reported",
                fatal: false,
                tid: 1,
                thread_name: "",
                stack_overflow: false,
            },
            signal: None,
            mach: None,
            exception: None,
            cpp_exception: None,
            user: Some(UserLine {
                name: "ValueError",
                reason: Some("bad \"input\""),
                language: Some("python"),
                line_of_code: None,
                stack_json: Some("[{\"file\":\"a.py\"}]"),
            }),
            zombie: None,
            extra: &[],
        };
        let text = render(|w| emit_context(w, &context));
        let user_line = text.lines().nth(2).unwrap();
        let value: serde_json::Value = serde_json::from_str(user_line).unwrap();
        assert_eq!(value["user"]["reason"], "bad \"input\"");
        assert_eq!(value["user"]["stack_json"], "[{\"file\":\"a.py\"}]");
        assert!(value["user"].get("line_of_code").is_none());
    }
}
