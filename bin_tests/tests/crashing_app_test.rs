// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process;

use bin_tests::{build_artifacts, ArtifactsBuild, BuildProfile, FaultType};
use vicrab_crash::filters::{
    process_reports, ChainOutcome, Demangle, EventConversion, FilterChain, Redact, Sanitize,
    Symbolicate,
};
use vicrab_crash::{ReportStore, ReportType};

const APP_NAME: &str = "crashing_app";

#[test]
#[cfg_attr(miri, ignore)]
fn test_null_deref_debug() {
    test_crashing_app(BuildProfile::Debug, FaultType::NullDeref);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_abort_debug() {
    test_crashing_app(BuildProfile::Debug, FaultType::Abort);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_sigbus_debug() {
    test_crashing_app(BuildProfile::Debug, FaultType::RaiseSigBus);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_panic_debug() {
    test_crashing_app(BuildProfile::Debug, FaultType::Panic);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_user_report_debug() {
    test_crashing_app(BuildProfile::Debug, FaultType::UserReport);
}

#[test]
#[ignore] // This test is slow, only run it if explicitly opted in
fn test_null_deref_release() {
    test_crashing_app(BuildProfile::Release, FaultType::NullDeref);
}

fn run_app(profile: BuildProfile, report_dir: &Path, fault: FaultType, post: &str) -> process::ExitStatus {
    let app = ArtifactsBuild::crashing_app(profile);
    let artifacts = build_artifacts(&[&app]).unwrap();
    let mut p = process::Command::new(&artifacts[&app])
        .arg(report_dir)
        .arg(fault.as_str())
        .arg(post)
        .spawn()
        .unwrap();
    bin_tests::timeit!("exit after fault", {
        eprintln!("Waiting for exit");
        p.wait().unwrap()
    })
}

fn test_crashing_app(profile: BuildProfile, fault: FaultType) {
    let dir = tempfile::tempdir().unwrap();
    let status = run_app(profile, dir.path(), fault, "reraise");
    match fault.terminating_signal() {
        Some(signal) => assert_eq!(status.signal(), Some(signal), "{status:?}"),
        None => assert!(status.success(), "{status:?}"),
    }

    let store = ReportStore::new(dir.path(), APP_NAME).unwrap();
    let ids = store.list().unwrap();
    assert_eq!(ids.len(), 1, "{ids:?}");
    assert!(store.list_partial().unwrap().is_empty());
    let report = store.read_report(ids[0]).unwrap();

    assert!(report.complete);
    assert_eq!(report.header.app_name, APP_NAME);
    assert_eq!(report.header.report_type.name(), fault.report_type());
    let context = report.context.as_ref().unwrap();
    assert_eq!(context.crash.monitor, fault.monitor());
    assert_eq!(context.crash.fatal, fault.terminating_signal().is_some());
    if fault.monitor() == "signal" {
        let signal = context.signal.as_ref().unwrap();
        assert_eq!(Some(signal.number), fault.terminating_signal());
    }
    if let Some(address) = fault.fault_address() {
        assert_eq!(context.signal.as_ref().unwrap().address, Some(address));
    }
    if fault == FaultType::UserReport {
        assert_eq!(report.header.report_type, ReportType::User);
        let user = context.user.as_ref().unwrap();
        assert_eq!(user.name, "ScriptError");
        assert_eq!(user.language.as_deref(), Some("lua"));
    }

    let crashed = report.crashed_thread().unwrap();
    assert!(!crashed.frames.is_empty());
    // Only fatal captures walk every thread by default.
    if context.crash.fatal {
        assert!(report.threads.len() >= 2, "{:?}", report.threads);
    }
    let images = report.binary_images.as_ref().unwrap();
    assert!(images.iter().any(|image| image.path.ends_with(APP_NAME)));
    assert!(report
        .user_context
        .as_deref()
        .unwrap()
        .contains("alice@example.com"));
    assert_eq!(report.breadcrumbs.len(), 2);
    assert_eq!(report.breadcrumbs[1].message, "clicked crash button");

    // The next launch: process what the crash left behind.
    let chain = FilterChain::new()
        .with(Symbolicate::default())
        .with(Demangle)
        .with(Redact::new(["^email$"], std::iter::empty::<&str>()).unwrap())
        .with(Sanitize::default())
        .with_fatal(EventConversion);
    let processed = process_reports(&store, &chain).unwrap();
    assert_eq!(processed.len(), 1);
    let outcome = processed[0].result.as_ref().unwrap();
    let ChainOutcome::Completed { report: event, .. } = outcome else {
        panic!("Unexpected outcome {outcome:?}");
    };
    assert_eq!(event.get("platform").unwrap(), "native");
    assert_eq!(event.get_path(&["user", "email"]).unwrap(), "[redacted]");
    assert_eq!(
        event.get_path(&["exception", "mechanism", "monitor"]).unwrap(),
        fault.monitor()
    );
    if fault == FaultType::UserReport {
        assert_eq!(event.get_path(&["exception", "type"]).unwrap(), "ScriptError");
        assert_eq!(event.get("level").unwrap(), "error");
    } else {
        assert_eq!(event.get("level").unwrap(), "fatal");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exit_after_capture() {
    let dir = tempfile::tempdir().unwrap();
    let status = run_app(BuildProfile::Debug, dir.path(), FaultType::NullDeref, "exit");
    assert_eq!(status.code(), Some(1), "{status:?}");
    let store = ReportStore::new(dir.path(), APP_NAME).unwrap();
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_reports_accumulate_and_prune() {
    let dir = tempfile::tempdir().unwrap();
    // Install prunes down to the configured five before every run.
    for _ in 0..7 {
        run_app(BuildProfile::Debug, dir.path(), FaultType::Abort, "reraise");
    }
    let store = ReportStore::new(dir.path(), APP_NAME).unwrap();
    let ids = store.list().unwrap();
    assert_eq!(ids.len(), 6, "{ids:?}");
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(store.delete_all().unwrap(), 6);
    assert!(store.list().unwrap().is_empty());
}
