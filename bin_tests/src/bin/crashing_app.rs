// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installs crash monitoring into a report directory, then triggers a fault.
//!
//! Usage: `crashing_app <report_dir> <fault> [reraise|exit]`

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use bin_tests::test_types::UNMAPPED_ADDRESS;
    use bin_tests::FaultType;
    use std::env;

    use vicrab_crash::raw_report::{Breadcrumb, BreadcrumbLevel};
    use vicrab_crash::recording::{self, HandleOutcome};
    use vicrab_crash::shared::log::{init_logging, LogConfig, LogEventLevel, LogTarget};
    use vicrab_crash::{CrashMonitorConfiguration, MonitorSet, PostCaptureAction};

    pub const APP_NAME: &str = "crashing_app";

    #[inline(never)]
    unsafe fn write_unmapped(p: *mut u64) {
        std::ptr::write_volatile(std::hint::black_box(p), std::hint::black_box(1));
    }

    #[inline(never)]
    fn fault_inner(fault: FaultType) -> anyhow::Result<()> {
        match fault {
            FaultType::NullDeref => unsafe { write_unmapped(UNMAPPED_ADDRESS as usize as *mut u64) },
            FaultType::Abort => std::process::abort(),
            FaultType::RaiseSigBus => {
                // SAFETY: no preconditions.
                unsafe { libc::raise(libc::SIGBUS) };
            }
            FaultType::Panic => {
                let values: Vec<u32> = std::hint::black_box(vec![]);
                std::hint::black_box(values[3]);
            }
            FaultType::UserReport => {
                let outcome = recording::report_user_exception(
                    "ScriptError",
                    Some("attempt to call a nil value"),
                    Some("lua"),
                    Some("main.lua:3"),
                    Some(r#"[{"function":"main","file":"main.lua","line":3}]"#),
                    false,
                    false,
                );
                anyhow::ensure!(
                    outcome == HandleOutcome::Resumed,
                    "Unexpected outcome {outcome:?}"
                );
            }
        }
        Ok(())
    }

    #[inline(never)]
    fn fault_outer(fault: FaultType) -> anyhow::Result<()> {
        fault_inner(std::hint::black_box(fault))
    }

    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let report_dir = args.next().context("Unexpected number of arguments 1")?;
        let fault: FaultType = args
            .next()
            .context("Unexpected number of arguments 2")?
            .parse()
            .map_err(anyhow::Error::msg)?;
        let post_capture = match args.next().as_deref() {
            None | Some("reraise") => PostCaptureAction::Reraise,
            Some("exit") => PostCaptureAction::Exit,
            Some(other) => anyhow::bail!("Unknown post capture action {other}"),
        };
        anyhow::ensure!(args.next().is_none(), "unexpected extra arguments");

        let _log_guard = init_logging(LogConfig {
            level: LogEventLevel::Warn,
            target: LogTarget::Stderr,
        })?;

        let config = CrashMonitorConfiguration::new(
            report_dir,
            APP_NAME,
            MonitorSet::PRODUCTION_SAFE,
            5,    // max_report_count
            true, // suspend_threads
            post_capture,
            vec![], // default signals
        )?;
        let installed = recording::install(config)?;
        anyhow::ensure!(
            installed.declined.iter().all(|(_, e)| e.is_unsupported()),
            "Monitors declined: {:?}",
            installed.declined
        );

        let mut user = serde_json::Map::new();
        user.insert("email".to_string(), "alice@example.com".into());
        user.insert("build".to_string(), 42.into());
        recording::update_user_context(user)?;
        recording::add_breadcrumb(
            &Breadcrumb::new("navigation", "opened settings").with_level(BreadcrumbLevel::Info),
        )?;
        recording::add_breadcrumb(
            &Breadcrumb::new("ui", "clicked crash button").with_data("fault", fault.as_str()),
        )?;

        // Keep a second thread alive so the report has more than one.
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::Builder::new()
            .name("worker".to_string())
            .spawn(move || rx.recv())?;

        fault_outer(fault)?;

        drop(tx);
        let _ = worker.join();
        recording::uninstall_all()?;
        Ok(())
    }
}
