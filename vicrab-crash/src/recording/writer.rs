// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streams a capture into a raw report, block by block.
//!
//! SAFETY:
//!     Crash-tracking functions are not reentrant.
//!     No other crash-handler functions should be called concurrently.
//! ATOMICITY:
//!     Nothing here is atomic. Every block is flushed as soon as it is
//!     complete, so a crash in the middle of the capture leaves a report that
//!     ends at the last finished block and has no terminating line.
//! SIGNAL SAFETY:
//!     No allocation. Frames go from the unwinder to the writer one at a
//!     time.

use super::binary_images::for_each_image;
use super::crash_context::CrashContext;
use super::user_context::TakenUserData;
use crate::monitors::{code_name, signal_name};
use crate::raw_report::emit::*;
use crate::recording_tools::{read_memory_safely, FixedBuf};
use crate::unwind::{
    thread_name, walk_current_thread, FramePointerCursor, LiveMemory, MachineContext, RawFrame,
    ThreadTable,
};
use std::io::{self, Write};

/// Bytes dumped below and above the stack pointer when memory
/// introspection is on.
const STACK_DUMP_BELOW: usize = 64;
const STACK_DUMP_ABOVE: usize = 448;
const STACK_DUMP_CHUNK: usize = 32;

/// Everything about the capture that is not per thread.
pub(crate) struct Capture<'a> {
    pub header: HeaderLine<'a>,
    pub context: &'a CrashContext<'a>,
    /// Name of the crashed thread.
    pub thread_name: &'a str,
    pub system: SystemLine<'a>,
    pub user: &'a TakenUserData,
    /// Threads frozen by the suspender, possibly none.
    pub threads: &'a ThreadTable,
    /// The thread running the capture.
    pub current_tid: u64,
    pub max_depth: usize,
    pub introspect_memory: bool,
}

/// Maps the in-memory context to the lines of the context block.
pub(crate) fn context_lines<'a>(
    context: &'a CrashContext<'a>,
    thread_name: &'a str,
) -> ContextLines<'a> {
    ContextLines {
        crash: CrashLine {
            kind: context.kind.name(),
            monitor: context.monitor.name(),
            fatal: context.fatal,
            tid: context.tid,
            thread_name,
            stack_overflow: context.stack_overflow || context.looks_like_stack_overflow(),
        },
        signal: context.signal.map(|signal| SignalLine {
            number: signal.number,
            code: signal.code,
            name: signal_name(signal.number),
            code_name: code_name(signal.number, signal.code),
            address: signal.address.map(|address| address as u64),
        }),
        mach: context.mach.map(|mach| MachLine {
            exception: mach.exception,
            code: mach.code,
            subcode: mach.subcode as u64,
        }),
        exception: context.exception_name.map(|name| ExceptionLine {
            name,
            reason: context.reason,
        }),
        cpp_exception: context
            .cpp_type
            .map(|type_name| CppExceptionLine { type_name }),
        user: context.user.map(|user| UserLine {
            name: user.name,
            reason: user.reason,
            language: user.language,
            line_of_code: user.line_of_code,
            stack_json: user.stack_json,
        }),
        zombie: context.zombie.map(|zombie| ZombieLine {
            address: zombie.address as u64,
            size: zombie.size as u64,
        }),
        extra: &[],
    }
}

/// Writes a complete report. The order matters: the cheap, always useful
/// blocks come first so that a crash in the unwinder still leaves them on
/// disk.
pub(crate) fn emit_crash_report(w: &mut impl Write, capture: &Capture<'_>) -> io::Result<()> {
    emit_magic(w)?;
    emit_header(w, &capture.header)?;
    emit_context(w, &context_lines(capture.context, capture.thread_name))?;
    emit_system(w, &capture.system)?;
    if let Some(user_context) = capture.user.context() {
        emit_user_context(w, user_context)?;
    }
    if capture.user.has_breadcrumbs() {
        emit_breadcrumbs(w, capture.user.breadcrumbs())?;
    }
    emit_binary_images(w)?;
    emit_threads(w, capture)?;
    emit_done(w)
}

fn emit_binary_images(w: &mut impl Write) -> io::Result<()> {
    emit_binary_images_begin(w)?;
    let mut result = Ok(());
    for_each_image(|image| {
        if result.is_ok() {
            result = emit_binary_image(w, image);
        }
    });
    result?;
    emit_binary_images_end(w)
}

/// How the frames of one thread are obtained.
enum Walk<'a> {
    /// The thread running this code, through the platform unwinder.
    /// Frames above `start_ip` are skipped.
    Current { start_ip: usize },
    /// Any thread whose registers are known, through the frame chain.
    Registers(&'a MachineContext),
    /// Nothing to start from.
    None,
}

fn emit_threads(w: &mut impl Write, capture: &Capture<'_>) -> io::Result<()> {
    let context = capture.context;
    let crashed_is_current = context.tid == capture.current_tid;
    let mut index = 0;

    // The crashed thread first, whoever is running the capture.
    let snapshot = capture.threads.find(context.tid);
    let crashed_registers = context
        .machine
        .as_ref()
        .or(snapshot.map(|snapshot| &snapshot.context))
        .filter(|machine| !machine.is_empty());
    let walk = if crashed_is_current {
        Walk::Current {
            start_ip: context.machine.map_or(0, |machine| machine.ip),
        }
    } else {
        crashed_registers.map_or(Walk::None, Walk::Registers)
    };
    emit_thread(
        w,
        capture,
        &ThreadLine {
            index,
            tid: context.tid,
            name: capture.thread_name,
            crashed: true,
            current: crashed_is_current,
        },
        crashed_registers,
        walk,
    )?;
    index += 1;

    for snapshot in capture.threads.iter() {
        if snapshot.tid == context.tid || snapshot.tid == capture.current_tid {
            continue;
        }
        let mut name = FixedBuf::<64>::new();
        if snapshot.name.is_empty() {
            thread_name(snapshot.tid, &mut name);
        } else {
            name.push_str(snapshot.name.as_str());
        }
        let registers = Some(&snapshot.context).filter(|machine| !machine.is_empty());
        emit_thread(
            w,
            capture,
            &ThreadLine {
                index,
                tid: snapshot.tid,
                name: name.as_str(),
                crashed: false,
                current: false,
            },
            registers,
            registers.map_or(Walk::None, Walk::Registers),
        )?;
        index += 1;
    }

    // A watchdog or exception port thread capturing on behalf of another.
    if !crashed_is_current {
        let mut name = FixedBuf::<64>::new();
        thread_name(capture.current_tid, &mut name);
        emit_thread(
            w,
            capture,
            &ThreadLine {
                index,
                tid: capture.current_tid,
                name: name.as_str(),
                crashed: false,
                current: true,
            },
            None,
            Walk::Current { start_ip: 0 },
        )?;
    }
    Ok(())
}

fn emit_thread(
    w: &mut impl Write,
    capture: &Capture<'_>,
    line: &ThreadLine<'_>,
    registers: Option<&MachineContext>,
    walk: Walk<'_>,
) -> io::Result<()> {
    emit_thread_begin(w, line)?;
    emit_registers(w, registers.into_iter().flat_map(MachineContext::registers))?;

    emit_frames_begin(w)?;
    let mut result = Ok(());
    let mut first_sp = None;
    let mut on_frame = |frame: RawFrame| {
        first_sp.get_or_insert(frame.sp);
        if result.is_ok() {
            result = emit_frame(
                w,
                &FrameLine {
                    ip: frame.ip as u64,
                    sp: frame.sp as u64,
                    fp: frame.bp as u64,
                },
            );
        }
    };
    let truncated = match walk {
        Walk::Current { start_ip } => walk_current_thread(start_ip, capture.max_depth, &mut on_frame).1,
        Walk::Registers(machine) => {
            let mut cursor = FramePointerCursor::new(
                LiveMemory,
                machine.ip,
                machine.sp,
                machine.fp,
                capture.max_depth,
            );
            for frame in cursor.by_ref() {
                on_frame(frame);
            }
            cursor.is_truncated()
        }
        Walk::None => false,
    };
    result?;
    emit_frames_end(w, truncated)?;

    let sp = registers
        .map(|machine| machine.sp)
        .filter(|sp| *sp != 0)
        .or(first_sp);
    if let (true, Some(sp)) = (capture.introspect_memory, sp) {
        emit_stack_dump(w, sp)?;
    }
    emit_thread_end(w)
}

/// Dumps the memory around `sp` in fixed chunks. Unreadable chunks are
/// left out.
fn emit_stack_dump(w: &mut impl Write, sp: usize) -> io::Result<()> {
    emit_stack_dump_begin(w)?;
    let start = sp.saturating_sub(STACK_DUMP_BELOW) & !(STACK_DUMP_CHUNK - 1);
    let end = sp.saturating_add(STACK_DUMP_ABOVE);
    let mut chunk = [0u8; STACK_DUMP_CHUNK];
    let mut address = start;
    while address < end {
        let n = read_memory_safely(address, &mut chunk);
        if n > 0 {
            emit_stack_chunk(
                w,
                &StackChunkLine {
                    address: address as u64,
                    bytes: &chunk[..n],
                },
            )?;
        }
        address += STACK_DUMP_CHUNK;
    }
    emit_stack_dump_end(w)
}

/// The marker left behind when a second crash hits while a report is being
/// written. It points at the primary report through the shared report id
/// and describes the second crash.
pub(crate) fn emit_recrash_marker(
    w: &mut impl Write,
    header: &HeaderLine<'_>,
    context: &CrashContext<'_>,
    thread_name: &str,
) -> io::Result<()> {
    emit_magic(w)?;
    emit_header(w, header)?;
    emit_context(w, &context_lines(context, thread_name))?;
    emit_done(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::{siginfo_code, MonitorKind};
    use crate::raw_report::{decode, ReportType};
    use crate::recording::crash_context::{CrashKind, SignalInfo, UserReportInfo};
    use crate::test_utils::lock_process_state;
    use crate::unwind::current_tid;

    fn header(report_type: ReportType) -> HeaderLine<'static> {
        HeaderLine {
            report_id: 0x42,
            event_id: "6f1c2b8e-0d4b-4d7e-9a55-1b2f7b8c9d10",
            timestamp_micros: 1_700_000_000_000_000,
            report_type,
            process_name: "writer-test",
            app_name: "writer",
        }
    }

    fn system() -> SystemLine<'static> {
        SystemLine {
            pid: 1,
            ppid: 0,
            process_name: "writer-test",
            uptime_ms: 10,
            os_name: "Linux",
            os_release: "6.1.0",
            os_version: "Debian 12",
            machine: "x86_64",
            page_size: 4096,
            cpu_count: 4,
        }
    }

    #[test]
    fn test_context_lines_from_signal() {
        let mut context = CrashContext::new(CrashKind::Signal, MonitorKind::Signal, 7);
        context.signal = Some(SignalInfo {
            number: libc::SIGSEGV,
            code: siginfo_code::segv::MAPERR,
            address: Some(0xdead),
        });
        let lines = context_lines(&context, "main");
        assert_eq!(lines.crash.kind, "signal");
        assert_eq!(lines.crash.thread_name, "main");
        let signal = lines.signal.unwrap();
        assert_eq!(signal.name, "SIGSEGV");
        assert_eq!(signal.code_name, "SEGV_MAPERR");
        assert_eq!(signal.address, Some(0xdead));
        assert!(lines.user.is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_user_report_of_current_thread() {
        let _guard = lock_process_state();
        let mut context =
            CrashContext::new(CrashKind::UserReported, MonitorKind::UserReported, current_tid());
        context.exception_name = Some("ScriptError");
        context.user = Some(UserReportInfo {
            name: "ScriptError",
            reason: Some("undefined is not a function"),
            language: Some("js"),
            line_of_code: Some("main.js:12"),
            stack_json: None,
        });
        let user = TakenUserData::take();
        let threads = ThreadTable::new();
        let capture = Capture {
            header: header(ReportType::User),
            context: &context,
            thread_name: "tester",
            system: system(),
            user: &user,
            threads: &threads,
            current_tid: current_tid(),
            max_depth: 32,
            introspect_memory: true,
        };
        let mut out = vec![];
        emit_crash_report(&mut out, &capture).unwrap();
        user.restore();

        let report = decode(&out).unwrap();
        assert!(report.complete);
        assert_eq!(report.header.report_type, ReportType::User);
        assert_eq!(report.threads.len(), 1);
        let thread = &report.threads[0];
        assert!(thread.crashed && thread.current);
        assert!(!thread.frames.is_empty());
        assert!(thread.frames.len() <= 32);
        assert!(thread.stack_dump.as_ref().is_some_and(|dump| !dump.is_empty()));
        let user = report.context.unwrap().user.unwrap();
        assert_eq!(user.language.as_deref(), Some("js"));
        assert!(report.binary_images.is_some());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_decoded_capture_reencodes_identically() {
        use crate::raw_report::Breadcrumb;
        use crate::recording::{add_breadcrumb, clear_breadcrumbs, update_user_context};

        let _guard = lock_process_state();
        let mut user_context = serde_json::Map::new();
        user_context.insert("build".to_string(), 7.into());
        update_user_context(user_context).unwrap();
        add_breadcrumb(&Breadcrumb::new("ui", "tapped").with_data("screen", "home")).unwrap();

        let mut context = CrashContext::new(CrashKind::Signal, MonitorKind::Signal, current_tid());
        context.signal = Some(SignalInfo {
            number: libc::SIGSEGV,
            code: siginfo_code::segv::MAPERR,
            address: Some(0x10),
        });
        let user = TakenUserData::take();
        let threads = ThreadTable::new();
        let capture = Capture {
            header: header(ReportType::Standard),
            context: &context,
            thread_name: "main",
            system: system(),
            user: &user,
            threads: &threads,
            current_tid: current_tid(),
            max_depth: 32,
            introspect_memory: true,
        };
        let mut out = vec![];
        emit_crash_report(&mut out, &capture).unwrap();
        user.restore();
        update_user_context(serde_json::Map::new()).unwrap();
        clear_breadcrumbs();

        let report = decode(&out).unwrap();
        assert!(report.complete);
        assert!(report.binary_images.is_some());
        assert!(report.threads[0].stack_dump.is_some());
        assert_eq!(report.breadcrumbs.len(), 1);
        let again = report.to_bytes().unwrap();
        assert_eq!(
            String::from_utf8_lossy(&out),
            String::from_utf8_lossy(&again)
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_on_behalf_of_another_thread() {
        let _guard = lock_process_state();
        let mut context = CrashContext::new(CrashKind::Deadlock, MonitorKind::Watchdog, 1);
        context.exception_name = Some("deadlock");
        let user = TakenUserData::take();
        let threads = ThreadTable::new();
        let capture = Capture {
            header: header(ReportType::Standard),
            context: &context,
            thread_name: "",
            system: system(),
            user: &user,
            threads: &threads,
            current_tid: current_tid(),
            max_depth: 16,
            introspect_memory: false,
        };
        let mut out = vec![];
        emit_crash_report(&mut out, &capture).unwrap();
        user.restore();

        let report = decode(&out).unwrap();
        assert_eq!(report.threads.len(), 2);
        // No registers for the watched thread: nothing to walk.
        assert!(report.threads[0].crashed);
        assert!(report.threads[0].frames.is_empty());
        assert!(report.threads[1].current);
        assert!(!report.threads[1].frames.is_empty());
        assert!(report.threads[1].stack_dump.is_none());
    }

    #[test]
    fn test_recrash_marker() {
        let mut context = CrashContext::new(CrashKind::Signal, MonitorKind::Signal, 3);
        context.signal = Some(SignalInfo {
            number: libc::SIGBUS,
            code: 0,
            address: None,
        });
        let mut out = vec![];
        emit_recrash_marker(&mut out, &header(ReportType::Recrash), &context, "worker").unwrap();
        let marker = decode(&out).unwrap();
        assert_eq!(marker.header.report_type, ReportType::Recrash);
        assert_eq!(marker.header.report_id, 0x42);
        assert!(marker.threads.is_empty());
        assert_eq!(marker.context.unwrap().crash.thread_name, "worker");
    }
}
