// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::monitors::{MonitorKind, MonitorSet};
use crate::shared::constants;
use crate::unwind::MAX_BACKTRACE_FRAMES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling on the configurable stack depth. Anything deeper is almost
/// certainly a corrupted frame chain.
pub const MAX_STACK_DEPTH_LIMIT: usize = 1024;

/// What happens to the process once a fatal crash has been written to disk.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PostCaptureAction {
    /// Restore the previous handlers and let the original fault take its
    /// default course (core dump, debugger, previous handler).
    #[default]
    Reraise,
    /// `_exit` immediately with a non-zero status.
    Exit,
}

/// Sampling policy applied to deallocations by the zombie monitor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZombiePolicyKind {
    /// Track one deallocation out of `n`.
    EveryNth(u32),
    /// Track every deallocation of at most this many bytes.
    SizeAtMost(usize),
}

impl Default for ZombiePolicyKind {
    fn default() -> Self {
        ZombiePolicyKind::EveryNth(16)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashMonitorConfiguration {
    app_name: String,
    create_alt_stack: bool,
    introspect_memory: bool,
    max_report_count: usize,
    max_stack_depth: usize,
    monitors: MonitorSet,
    post_capture: PostCaptureAction,
    report_dir: PathBuf,
    signals: Vec<i32>,
    suspend_threads: bool,
    use_alt_stack: bool,
    watchdog_interval: Duration,
    zombie_policy: ZombiePolicyKind,
}

/// Fatal signals watched by default, sorted like an explicit list.
pub fn default_signals() -> Vec<i32> {
    let mut signals = vec![
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGSEGV,
        libc::SIGSYS,
        libc::SIGTRAP,
    ];
    // Signal numbers differ between platforms.
    signals.sort_unstable();
    signals
}

impl CrashMonitorConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        report_dir: impl Into<PathBuf>,
        app_name: impl Into<String>,
        monitors: MonitorSet,
        max_report_count: usize,
        suspend_threads: bool,
        post_capture: PostCaptureAction,
        mut signals: Vec<i32>,
    ) -> anyhow::Result<Self> {
        let report_dir = report_dir.into();
        let app_name = app_name.into();
        anyhow::ensure!(
            !report_dir.as_os_str().is_empty(),
            "A report directory is required"
        );
        // The directory is baked into a fixed size path buffer at install time.
        anyhow::ensure!(
            report_dir.as_os_str().len() < crate::recording_tools::MAX_PATH_LEN / 2,
            "Report directory path is too long: {}",
            report_dir.display()
        );
        validate_app_name(&app_name)?;
        anyhow::ensure!(max_report_count > 0, "max_report_count must be positive");
        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            signals
                .iter()
                .try_for_each(|x| crate::monitors::signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            app_name,
            create_alt_stack: true,
            introspect_memory: false,
            max_report_count,
            max_stack_depth: MAX_BACKTRACE_FRAMES,
            monitors: MonitorSet::from_bits_truncate(monitors.bits()),
            post_capture,
            report_dir,
            signals,
            suspend_threads,
            use_alt_stack: true,
            watchdog_interval: constants::DEFAULT_WATCHDOG_INTERVAL,
            zombie_policy: ZombiePolicyKind::default(),
        })
    }

    /// Reasonable defaults for a report directory: production safe monitors,
    /// thread suspension on, re-raise after capture.
    pub fn with_defaults(report_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::new(
            report_dir,
            "app",
            MonitorSet::PRODUCTION_SAFE,
            constants::DEFAULT_MAX_REPORT_COUNT,
            true,
            PostCaptureAction::Reraise,
            vec![],
        )
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn introspect_memory(&self) -> bool {
        self.introspect_memory
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    pub fn monitors(&self) -> MonitorSet {
        self.monitors
    }

    pub fn is_enabled(&self, kind: MonitorKind) -> bool {
        self.monitors.contains(kind)
    }

    pub fn post_capture(&self) -> PostCaptureAction {
        self.post_capture
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn suspend_threads(&self) -> bool {
        self.suspend_threads
    }

    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }

    pub fn zombie_policy(&self) -> ZombiePolicyKind {
        self.zombie_policy
    }

    pub fn set_monitors(&mut self, monitors: MonitorSet) {
        self.monitors = MonitorSet::from_bits_truncate(monitors.bits());
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_introspect_memory(&mut self, introspect_memory: bool) {
        self.introspect_memory = introspect_memory;
    }

    pub fn set_max_stack_depth(&mut self, depth: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            depth > 0 && depth <= MAX_STACK_DEPTH_LIMIT,
            "max_stack_depth must be in 1..={MAX_STACK_DEPTH_LIMIT}, got {depth}"
        );
        self.max_stack_depth = depth;
        Ok(())
    }

    pub fn set_watchdog_interval(&mut self, interval: Duration) -> anyhow::Result<()> {
        anyhow::ensure!(
            interval >= Duration::from_millis(10),
            "Watchdog interval {interval:?} is too short"
        );
        self.watchdog_interval = interval;
        Ok(())
    }

    pub fn set_zombie_policy(&mut self, policy: ZombiePolicyKind) -> anyhow::Result<()> {
        match policy {
            ZombiePolicyKind::EveryNth(n) => {
                anyhow::ensure!(n > 0, "EveryNth sampling needs a positive period")
            }
            ZombiePolicyKind::SizeAtMost(size) => {
                anyhow::ensure!(size > 0, "SizeAtMost sampling needs a positive size")
            }
        }
        self.zombie_policy = policy;
        Ok(())
    }

    /// Parses a configuration from its JSON form, re-running validation.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: Self = serde_json::from_str(json)?;
        let mut config = Self::new(
            raw.report_dir,
            raw.app_name,
            raw.monitors,
            raw.max_report_count,
            raw.suspend_threads,
            raw.post_capture,
            raw.signals,
        )?;
        config.set_use_alt_stack(raw.use_alt_stack)?;
        config.set_create_alt_stack(raw.create_alt_stack)?;
        config.set_introspect_memory(raw.introspect_memory);
        config.set_max_stack_depth(raw.max_stack_depth)?;
        config.set_watchdog_interval(raw.watchdog_interval)?;
        config.set_zombie_policy(raw.zombie_policy)?;
        Ok(config)
    }
}

fn validate_app_name(app_name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!app_name.is_empty(), "app_name must not be empty");
    anyhow::ensure!(
        app_name.len() <= 64,
        "app_name must be at most 64 bytes, got {}",
        app_name.len()
    );
    // It becomes a file name prefix.
    anyhow::ensure!(
        app_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'),
        "app_name may only contain [A-Za-z0-9._-], got {app_name:?}"
    );
    Ok(())
}
