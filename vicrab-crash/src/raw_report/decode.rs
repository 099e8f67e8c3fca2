// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::records::{
    Breadcrumb, ContextEntry, ContextRecord, CrashRecord, FrameRecord, HeaderRecord, RawReport,
    StackChunkRecord, SystemRecord, ThreadHead, ThreadRecord, UnknownBlock,
};
use super::DecodeError;
use crate::shared::constants::*;
use serde::de::DeserializeOwned;

/// Context lines collected until the end of the block.
#[derive(Debug, Default)]
struct PendingContext {
    crash: Option<CrashRecord>,
    extra: Vec<String>,
    rest: Vec<ContextEntry>,
}

/// A thread block being read.
#[derive(Debug, Default)]
struct PendingThread {
    head: Option<ThreadHead>,
    registers: Vec<(String, u64)>,
    frames: Vec<FrameRecord>,
    frames_truncated: bool,
    stack_dump: Option<Vec<StackChunkRecord>>,
}

/// Reports are written in blocks. This tracks which block the decoder is
/// in, and carries the partial data of the multi-line ones until the block
/// is closed and can be added to the report.
#[derive(Debug)]
enum BlockState {
    Waiting,
    Header,
    Context(PendingContext),
    System,
    UserContext,
    Breadcrumbs,
    Thread(PendingThread),
    Registers(PendingThread),
    Frames(PendingThread),
    StackDump(PendingThread),
    BinaryImages,
    Unknown(UnknownBlock),
    Done,
}

/// Everything decoded so far. The header is required; the rest is
/// whatever the capture managed to write.
#[derive(Debug, Default)]
struct ReportParts {
    version: u32,
    header: Option<HeaderRecord>,
    context: Option<ContextRecord>,
    system: Option<SystemRecord>,
    user_context: Option<String>,
    breadcrumbs: Vec<Breadcrumb>,
    threads: Vec<ThreadRecord>,
    binary_images: Option<Vec<super::BinaryImageRecord>>,
    unknown_blocks: Vec<UnknownBlock>,
    complete: bool,
}

fn parse<T: DeserializeOwned>(line_no: usize, line: &str) -> Result<T, DecodeError> {
    serde_json::from_str(line).map_err(|source| DecodeError::Json { line_no, source })
}

fn unexpected(line_no: usize, line: &str) -> DecodeError {
    DecodeError::UnexpectedLine {
        line_no,
        line: line.to_string(),
    }
}

fn finish_context(line_no: usize, pending: PendingContext) -> Result<ContextRecord, DecodeError> {
    let crash = pending.crash.ok_or_else(|| DecodeError::InvalidValue {
        line_no,
        reason: "context block without a crash line".to_string(),
    })?;
    let mut record = ContextRecord {
        crash,
        signal: None,
        mach: None,
        exception: None,
        cpp_exception: None,
        user: None,
        zombie: None,
        extra: pending.extra,
    };
    for entry in pending.rest {
        match entry {
            ContextEntry::Crash(_) => {}
            ContextEntry::Signal(signal) => record.signal = Some(signal),
            ContextEntry::Mach(mach) => record.mach = Some(mach),
            ContextEntry::Exception(exception) => record.exception = Some(exception),
            ContextEntry::CppException(cpp) => record.cpp_exception = Some(cpp),
            ContextEntry::User(user) => record.user = Some(user),
            ContextEntry::Zombie(zombie) => record.zombie = Some(zombie),
        }
    }
    Ok(record)
}

fn finish_thread(line_no: usize, pending: PendingThread) -> Result<ThreadRecord, DecodeError> {
    let head = pending.head.ok_or_else(|| DecodeError::InvalidValue {
        line_no,
        reason: "thread block without a thread line".to_string(),
    })?;
    Ok(ThreadRecord {
        index: head.index,
        tid: head.tid,
        name: head.name,
        crashed: head.crashed,
        current: head.current,
        registers: pending.registers,
        frames: pending.frames,
        frames_truncated: pending.frames_truncated,
        stack_dump: pending.stack_dump,
    })
}

/// Processes one line in the given state and returns the next state.
fn process_line(
    parts: &mut ReportParts,
    line_no: usize,
    line: &str,
    state: BlockState,
) -> Result<BlockState, DecodeError> {
    let next = match state {
        BlockState::Waiting => match line {
            VICRAB_CRASH_BEGIN_HEADER => BlockState::Header,
            VICRAB_CRASH_BEGIN_CONTEXT => BlockState::Context(PendingContext::default()),
            VICRAB_CRASH_BEGIN_SYSTEM => BlockState::System,
            VICRAB_CRASH_BEGIN_USER_CONTEXT => BlockState::UserContext,
            VICRAB_CRASH_BEGIN_BREADCRUMBS => BlockState::Breadcrumbs,
            VICRAB_CRASH_BEGIN_THREAD => BlockState::Thread(PendingThread::default()),
            VICRAB_CRASH_BEGIN_BINARY_IMAGES => {
                parts.binary_images = Some(vec![]);
                BlockState::BinaryImages
            }
            VICRAB_CRASH_DONE => {
                parts.complete = true;
                BlockState::Done
            }
            _ => match line.strip_prefix(VICRAB_CRASH_BEGIN_PREFIX) {
                Some(name) if !name.is_empty() => BlockState::Unknown(UnknownBlock {
                    name: name.to_string(),
                    lines: vec![],
                }),
                _ => return Err(unexpected(line_no, line)),
            },
        },

        BlockState::Header if line == VICRAB_CRASH_END_HEADER => BlockState::Waiting,
        BlockState::Header => {
            if parts.header.is_some() {
                return Err(unexpected(line_no, line));
            }
            parts.header = Some(parse(line_no, line)?);
            BlockState::Header
        }

        BlockState::Context(pending) if line == VICRAB_CRASH_END_CONTEXT => {
            parts.context = Some(finish_context(line_no, pending)?);
            BlockState::Waiting
        }
        BlockState::Context(mut pending) => {
            match serde_json::from_str::<ContextEntry>(line) {
                Ok(ContextEntry::Crash(crash)) => pending.crash = Some(crash),
                Ok(entry) => pending.rest.push(entry),
                // A group added by a newer writer: keep it as long as it is
                // a well formed JSON object.
                Err(source) => match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(value) if value.is_object() => pending.extra.push(line.to_string()),
                    _ => return Err(DecodeError::Json { line_no, source }),
                },
            }
            BlockState::Context(pending)
        }

        BlockState::System if line == VICRAB_CRASH_END_SYSTEM => BlockState::Waiting,
        BlockState::System => {
            parts.system = Some(parse(line_no, line)?);
            BlockState::System
        }

        BlockState::UserContext if line == VICRAB_CRASH_END_USER_CONTEXT => BlockState::Waiting,
        BlockState::UserContext => {
            let value: serde_json::Value = parse(line_no, line)?;
            if !value.is_object() {
                return Err(DecodeError::InvalidValue {
                    line_no,
                    reason: "user context is not an object".to_string(),
                });
            }
            parts.user_context = Some(line.to_string());
            BlockState::UserContext
        }

        BlockState::Breadcrumbs if line == VICRAB_CRASH_END_BREADCRUMBS => BlockState::Waiting,
        BlockState::Breadcrumbs => {
            parts.breadcrumbs.push(parse(line_no, line)?);
            BlockState::Breadcrumbs
        }

        BlockState::Thread(pending) if line == VICRAB_CRASH_END_THREAD => {
            parts.threads.push(finish_thread(line_no, pending)?);
            BlockState::Waiting
        }
        BlockState::Thread(pending) if line == VICRAB_CRASH_BEGIN_REGISTERS => {
            BlockState::Registers(pending)
        }
        BlockState::Thread(pending) if line == VICRAB_CRASH_BEGIN_FRAMES => {
            BlockState::Frames(pending)
        }
        BlockState::Thread(mut pending) if line == VICRAB_CRASH_BEGIN_STACK_DUMP => {
            pending.stack_dump.get_or_insert_with(Vec::new);
            BlockState::StackDump(pending)
        }
        BlockState::Thread(mut pending) => {
            if pending.head.is_some() {
                return Err(unexpected(line_no, line));
            }
            pending.head = Some(parse(line_no, line)?);
            BlockState::Thread(pending)
        }

        BlockState::Registers(pending) if line == VICRAB_CRASH_END_REGISTERS => {
            BlockState::Thread(pending)
        }
        BlockState::Registers(mut pending) => {
            let register: serde_json::Map<String, serde_json::Value> = parse(line_no, line)?;
            let mut entries = register.into_iter();
            let (Some((name, value)), None) = (entries.next(), entries.next()) else {
                return Err(DecodeError::InvalidValue {
                    line_no,
                    reason: "expected exactly one register per line".to_string(),
                });
            };
            let value = value
                .as_str()
                .and_then(crate::recording_tools::parse_addr)
                .ok_or_else(|| DecodeError::InvalidValue {
                    line_no,
                    reason: format!("invalid value for register {name}"),
                })?;
            pending.registers.push((name, value));
            BlockState::Registers(pending)
        }

        BlockState::Frames(pending) if line == VICRAB_CRASH_END_FRAMES => {
            BlockState::Thread(pending)
        }
        BlockState::Frames(mut pending) if line == VICRAB_CRASH_FRAMES_TRUNCATED => {
            pending.frames_truncated = true;
            BlockState::Frames(pending)
        }
        BlockState::Frames(mut pending) => {
            pending.frames.push(parse(line_no, line)?);
            BlockState::Frames(pending)
        }

        BlockState::StackDump(pending) if line == VICRAB_CRASH_END_STACK_DUMP => {
            BlockState::Thread(pending)
        }
        BlockState::StackDump(mut pending) => {
            pending
                .stack_dump
                .get_or_insert_with(Vec::new)
                .push(parse(line_no, line)?);
            BlockState::StackDump(pending)
        }

        BlockState::BinaryImages if line == VICRAB_CRASH_END_BINARY_IMAGES => BlockState::Waiting,
        BlockState::BinaryImages => {
            let image = parse(line_no, line)?;
            parts.binary_images.get_or_insert_with(Vec::new).push(image);
            BlockState::BinaryImages
        }

        BlockState::Unknown(block)
            if line.strip_prefix(VICRAB_CRASH_END_PREFIX) == Some(block.name.as_str()) =>
        {
            parts.unknown_blocks.push(block);
            BlockState::Waiting
        }
        BlockState::Unknown(mut block) => {
            block.lines.push(line.to_string());
            BlockState::Unknown(block)
        }

        BlockState::Done => return Err(unexpected(line_no, line)),
    };
    Ok(next)
}

fn parse_magic(line: &str) -> Result<u32, DecodeError> {
    let version = line
        .strip_prefix(VICRAB_CRASH_MAGIC)
        .and_then(|rest| rest.strip_prefix(' '))
        .and_then(|version| version.parse::<u32>().ok())
        .ok_or(DecodeError::MissingMagic)?;
    if !(VICRAB_CRASH_MIN_FORMAT_VERSION..=VICRAB_CRASH_FORMAT_VERSION).contains(&version) {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    Ok(version)
}

fn run(bytes: &[u8], lenient: bool) -> Result<RawReport, DecodeError> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        // A torn write can cut a character in half; keep what is whole.
        Err(e) if lenient => {
            std::str::from_utf8(&bytes[..e.valid_up_to()]).map_err(|_| DecodeError::NotUtf8)?
        }
        Err(_) => return Err(DecodeError::NotUtf8),
    };
    let mut lines = text.split('\n').enumerate();
    let first = lines.next().map(|(_, line)| line).unwrap_or_default();
    let mut parts = ReportParts {
        version: parse_magic(first)?,
        ..Default::default()
    };

    let mut state = BlockState::Waiting;
    for (index, line) in lines {
        // The final newline leaves an empty trailing piece.
        if line.is_empty() {
            continue;
        }
        match process_line(&mut parts, index + 1, line, state) {
            Ok(next) => state = next,
            Err(e) if lenient => {
                tracing::debug!("Stopped decoding partial report: {e}");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let header = parts.header.ok_or(DecodeError::MissingHeader)?;
    Ok(RawReport {
        version: parts.version,
        header,
        context: parts.context,
        system: parts.system,
        user_context: parts.user_context,
        breadcrumbs: parts.breadcrumbs,
        threads: parts.threads,
        binary_images: parts.binary_images,
        unknown_blocks: parts.unknown_blocks,
        complete: parts.complete,
    })
}

/// Decodes a report, failing on the first malformed line. A well formed
/// report without its terminating line decodes with `complete == false`.
pub fn decode(bytes: &[u8]) -> Result<RawReport, DecodeError> {
    run(bytes, false)
}

/// Decodes what can be decoded of a report that was cut short: everything
/// up to the first malformed line is kept. Blocks still open at that point
/// are dropped. Only the magic line and the header are required.
pub fn decode_partial(bytes: &[u8]) -> Result<RawReport, DecodeError> {
    run(bytes, true)
}
