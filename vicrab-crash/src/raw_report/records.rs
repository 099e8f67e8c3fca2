// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emit::*;
use super::ReportType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Addresses are written as `"0x%016x"` strings.
pub(crate) mod hex_addr {
    use crate::recording_tools::parse_addr;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("{value:#018x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_addr(&s).ok_or_else(|| D::Error::custom(format!("invalid address {s:?}")))
    }
}

pub(crate) mod opt_hex_addr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::hex_addr::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::hex_addr")] u64);
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(value)| value))
    }
}

mod hex_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&crate::recording_tools::HexBytes(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(D::Error::custom("odd length hex string"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(D::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    #[serde(with = "hex_addr")]
    pub report_id: u64,
    pub event_id: String,
    pub timestamp_micros: u64,
    pub report_type: ReportType,
    pub process_name: String,
    pub app_name: String,
}

impl HeaderRecord {
    pub fn as_line(&self) -> HeaderLine<'_> {
        HeaderLine {
            report_id: self.report_id,
            event_id: &self.event_id,
            timestamp_micros: self.timestamp_micros,
            report_type: self.report_type,
            process_name: &self.process_name,
            app_name: &self.app_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub kind: String,
    pub monitor: String,
    pub fatal: bool,
    pub tid: u64,
    pub thread_name: String,
    pub stack_overflow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub number: i32,
    pub code: i32,
    pub name: String,
    pub code_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex_addr")]
    pub address: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachRecord {
    pub exception: i32,
    pub code: i64,
    #[serde(with = "hex_addr")]
    pub subcode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CppExceptionRecord {
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_of_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZombieRecord {
    #[serde(with = "hex_addr")]
    pub address: u64,
    pub size: u64,
}

/// One line of the context block, keyed by its group name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ContextEntry {
    Crash(CrashRecord),
    Signal(SignalRecord),
    Mach(MachRecord),
    Exception(ExceptionRecord),
    CppException(CppExceptionRecord),
    User(UserRecord),
    Zombie(ZombieRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    pub crash: CrashRecord,
    pub signal: Option<SignalRecord>,
    pub mach: Option<MachRecord>,
    pub exception: Option<ExceptionRecord>,
    pub cpp_exception: Option<CppExceptionRecord>,
    pub user: Option<UserRecord>,
    pub zombie: Option<ZombieRecord>,
    /// Context lines written by a newer build, kept verbatim.
    pub extra: Vec<String>,
}

impl ContextRecord {
    pub fn as_lines(&self) -> ContextLines<'_> {
        ContextLines {
            crash: CrashLine {
                kind: &self.crash.kind,
                monitor: &self.crash.monitor,
                fatal: self.crash.fatal,
                tid: self.crash.tid,
                thread_name: &self.crash.thread_name,
                stack_overflow: self.crash.stack_overflow,
            },
            signal: self.signal.as_ref().map(|signal| SignalLine {
                number: signal.number,
                code: signal.code,
                name: &signal.name,
                code_name: &signal.code_name,
                address: signal.address,
            }),
            mach: self.mach.as_ref().map(|mach| MachLine {
                exception: mach.exception,
                code: mach.code,
                subcode: mach.subcode,
            }),
            exception: self.exception.as_ref().map(|exception| ExceptionLine {
                name: &exception.name,
                reason: exception.reason.as_deref(),
            }),
            cpp_exception: self
                .cpp_exception
                .as_ref()
                .map(|cpp| CppExceptionLine {
                    type_name: &cpp.type_name,
                }),
            user: self.user.as_ref().map(|user| UserLine {
                name: &user.name,
                reason: user.reason.as_deref(),
                language: user.language.as_deref(),
                line_of_code: user.line_of_code.as_deref(),
                stack_json: user.stack_json.as_deref(),
            }),
            zombie: self.zombie.as_ref().map(|zombie| ZombieLine {
                address: zombie.address,
                size: zombie.size,
            }),
            extra: &self.extra,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub pid: u32,
    pub ppid: u32,
    pub process_name: String,
    pub uptime_ms: u64,
    pub os_name: String,
    pub os_release: String,
    pub os_version: String,
    pub machine: String,
    pub page_size: u64,
    pub cpu_count: u64,
}

impl SystemRecord {
    pub fn as_line(&self) -> SystemLine<'_> {
        SystemLine {
            pid: self.pid,
            ppid: self.ppid,
            process_name: &self.process_name,
            uptime_ms: self.uptime_ms,
            os_name: &self.os_name,
            os_release: &self.os_release,
            os_version: &self.os_version,
            machine: &self.machine,
            page_size: self.page_size,
            cpu_count: self.cpu_count,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

/// Something the application did shortly before the crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub timestamp_micros: u64,
    pub level: BreadcrumbLevel,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Breadcrumb {
    /// A breadcrumb stamped with the current time.
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp_micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self {
            timestamp_micros,
            level: BreadcrumbLevel::default(),
            category: category.into(),
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn with_level(mut self, level: BreadcrumbLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The single line stored in the breadcrumbs block.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The fixed part of a thread block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ThreadHead {
    pub index: u32,
    pub tid: u64,
    pub name: String,
    pub crashed: bool,
    pub current: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(with = "hex_addr")]
    pub ip: u64,
    #[serde(with = "hex_addr")]
    pub sp: u64,
    #[serde(with = "hex_addr")]
    pub fp: u64,
}

impl FrameRecord {
    pub fn as_line(&self) -> FrameLine {
        FrameLine {
            ip: self.ip,
            sp: self.sp,
            fp: self.fp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackChunkRecord {
    #[serde(with = "hex_addr")]
    pub address: u64,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub index: u32,
    pub tid: u64,
    pub name: String,
    pub crashed: bool,
    pub current: bool,
    /// In the order the registers were written.
    pub registers: Vec<(String, u64)>,
    pub frames: Vec<FrameRecord>,
    pub frames_truncated: bool,
    /// `None` when no dump block was written. A dump block can be present
    /// and empty when none of the stack was readable.
    pub stack_dump: Option<Vec<StackChunkRecord>>,
}

impl ThreadRecord {
    pub fn as_line(&self) -> ThreadLine<'_> {
        ThreadLine {
            index: self.index,
            tid: self.tid,
            name: &self.name,
            crashed: self.crashed,
            current: self.current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryImageRecord {
    #[serde(with = "hex_addr")]
    pub start: u64,
    #[serde(with = "hex_addr")]
    pub end: u64,
    #[serde(with = "hex_addr")]
    pub offset: u64,
    pub path: String,
}

impl BinaryImageRecord {
    pub fn as_line(&self) -> BinaryImageLine<'_> {
        BinaryImageLine {
            start: self.start,
            end: self.end,
            offset: self.offset,
            path: &self.path,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }
}

/// A block this build does not know, kept so re-encoding preserves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBlock {
    pub name: String,
    pub lines: Vec<String>,
}

/// A decoded raw report.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReport {
    /// Format version the file was written with.
    pub version: u32,
    pub header: HeaderRecord,
    pub context: Option<ContextRecord>,
    pub system: Option<SystemRecord>,
    /// The serialized user context object, as written.
    pub user_context: Option<String>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub threads: Vec<ThreadRecord>,
    /// `None` when the capture never reached the binary image block.
    pub binary_images: Option<Vec<BinaryImageRecord>>,
    pub unknown_blocks: Vec<UnknownBlock>,
    /// Whether the terminating line was found.
    pub complete: bool,
}

impl RawReport {
    pub fn crashed_thread(&self) -> Option<&ThreadRecord> {
        self.threads.iter().find(|thread| thread.crashed)
    }

    /// The image an address falls in.
    pub fn image_for(&self, address: u64) -> Option<&BinaryImageRecord> {
        self.binary_images
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|image| image.contains(address))
    }
}

#[cfg(test)]
impl crate::test_utils::TestInstance for RawReport {
    /// A complete report of a segfault on the main thread of a two thread
    /// process. `seed` varies the ids and addresses.
    fn test_instance(seed: u64) -> Self {
        let base = 0x5555_0000_0000 + seed * 0x1000;
        let frames = |count: u64, offset: u64| {
            (0..count)
                .map(|i| FrameRecord {
                    ip: base + offset + i * 0x40,
                    sp: 0x7ffc_0000_0000 + i * 0x30,
                    fp: 0x7ffc_0000_0010 + i * 0x30,
                })
                .collect::<Vec<_>>()
        };
        RawReport {
            version: crate::shared::constants::VICRAB_CRASH_FORMAT_VERSION,
            header: HeaderRecord {
                report_id: (1_700_000_000 << 23) | seed,
                event_id: format!("00000000-0000-4000-8000-{seed:012x}"),
                timestamp_micros: 1_700_000_000_000_000 + seed,
                report_type: ReportType::Standard,
                process_name: "crashing_app".to_string(),
                app_name: "demo".to_string(),
            },
            context: Some(ContextRecord {
                crash: CrashRecord {
                    kind: "signal".to_string(),
                    monitor: "signal".to_string(),
                    fatal: true,
                    tid: 4242,
                    thread_name: "main".to_string(),
                    stack_overflow: false,
                },
                signal: Some(SignalRecord {
                    number: libc::SIGSEGV,
                    code: 1,
                    name: "SIGSEGV".to_string(),
                    code_name: "SEGV_MAPERR".to_string(),
                    address: Some(0x10),
                }),
                mach: None,
                exception: None,
                cpp_exception: None,
                user: None,
                zombie: Some(ZombieRecord {
                    address: 0x10,
                    size: 32,
                }),
                extra: vec![],
            }),
            system: Some(SystemRecord {
                pid: 4242,
                ppid: 1,
                process_name: "crashing_app".to_string(),
                uptime_ms: 1234 + seed,
                os_name: "Linux".to_string(),
                os_release: "6.1.0".to_string(),
                os_version: "Debian 12".to_string(),
                machine: "x86_64".to_string(),
                page_size: 4096,
                cpu_count: 8,
            }),
            user_context: Some(format!("{{\"seed\":{seed},\"user\":\"alice@example.com\"}}")),
            breadcrumbs: vec![Breadcrumb {
                timestamp_micros: 1_699_999_999_000_000,
                level: BreadcrumbLevel::Info,
                category: "navigation".to_string(),
                message: "opened settings".to_string(),
                data: Map::new(),
            }],
            threads: vec![
                ThreadRecord {
                    index: 0,
                    tid: 4242,
                    name: "main".to_string(),
                    crashed: true,
                    current: true,
                    registers: vec![
                        ("rip".to_string(), base + 0x100),
                        ("rsp".to_string(), 0x7ffc_0000_0000),
                    ],
                    frames: frames(3, 0x100),
                    frames_truncated: false,
                    stack_dump: Some(vec![StackChunkRecord {
                        address: 0x7ffc_0000_0000,
                        bytes: vec![0xde, 0xad, 0xbe, 0xef],
                    }]),
                },
                ThreadRecord {
                    index: 1,
                    tid: 4243,
                    name: "worker".to_string(),
                    crashed: false,
                    current: false,
                    registers: vec![("rip".to_string(), base + 0x800)],
                    frames: frames(2, 0x800),
                    frames_truncated: true,
                    stack_dump: None,
                },
            ],
            binary_images: Some(vec![BinaryImageRecord {
                start: base,
                end: base + 0x10_0000,
                offset: 0,
                path: "/usr/bin/crashing_app".to_string(),
            }]),
            unknown_blocks: vec![],
            complete: true,
        }
    }
}
