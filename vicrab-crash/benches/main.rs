// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::Throughput::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::Map;
use std::hint::black_box;
use std::time::Duration;
use vicrab_crash::filters::{
    Demangle, EventConversion, FilterChain, Redact, Sanitize, Subset,
};
use vicrab_crash::raw_report::{
    decode, BinaryImageRecord, Breadcrumb, BreadcrumbLevel, ContextRecord, CrashRecord,
    FrameRecord, HeaderRecord, RawReport, SignalRecord, StackChunkRecord, ThreadRecord,
};
use vicrab_crash::shared::constants::VICRAB_CRASH_FORMAT_VERSION;
use vicrab_crash::ReportType;

/// A segfault report of a process with `threads` threads of `depth` frames.
fn report(threads: u64, depth: u64) -> RawReport {
    let base = 0x5555_0000_0000u64;
    RawReport {
        version: VICRAB_CRASH_FORMAT_VERSION,
        header: HeaderRecord {
            report_id: 1_700_000_000 << 23,
            event_id: "00000000-0000-4000-8000-000000000001".to_string(),
            timestamp_micros: 1_700_000_000_000_000,
            report_type: ReportType::Standard,
            process_name: "bench_app".to_string(),
            app_name: "bench".to_string(),
        },
        context: Some(ContextRecord {
            crash: CrashRecord {
                kind: "signal".to_string(),
                monitor: "signal".to_string(),
                fatal: true,
                tid: 1,
                thread_name: "main".to_string(),
                stack_overflow: false,
            },
            signal: Some(SignalRecord {
                number: libc::SIGSEGV,
                code: 1,
                name: "SIGSEGV".to_string(),
                code_name: "SEGV_MAPERR".to_string(),
                address: Some(0),
            }),
            mach: None,
            exception: None,
            cpp_exception: None,
            user: None,
            zombie: None,
            extra: vec![],
        }),
        system: None,
        user_context: Some(r#"{"user":"bob","password":"hunter2"}"#.to_string()),
        breadcrumbs: (0..50)
            .map(|i| Breadcrumb {
                timestamp_micros: 1_699_999_999_000_000 + i,
                level: BreadcrumbLevel::Info,
                category: "ui".to_string(),
                message: format!("clicked button {i}"),
                data: Map::new(),
            })
            .collect(),
        threads: (0..threads)
            .map(|t| ThreadRecord {
                index: t as u32,
                tid: t + 1,
                name: format!("thread-{t}"),
                crashed: t == 0,
                current: t == 0,
                registers: vec![("rip".to_string(), base), ("rsp".to_string(), 0x7ffc_0000_0000)],
                frames: (0..depth)
                    .map(|i| FrameRecord {
                        ip: base + i * 0x40,
                        sp: 0x7ffc_0000_0000 + i * 0x30,
                        fp: 0x7ffc_0000_0010 + i * 0x30,
                    })
                    .collect(),
                frames_truncated: false,
                stack_dump: Some(vec![StackChunkRecord {
                    address: 0x7ffc_0000_0000,
                    bytes: vec![0xab; 256],
                }]),
            })
            .collect(),
        binary_images: Some(
            (0..20)
                .map(|i| BinaryImageRecord {
                    start: base + i * 0x10_0000,
                    end: base + (i + 1) * 0x10_0000,
                    offset: 0,
                    path: format!("/usr/lib/libbench{i}.so"),
                })
                .collect(),
        ),
        unknown_blocks: vec![],
        complete: true,
    }
}

fn decode_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("raw_report/decode");
    group.warm_up_time(Duration::from_secs(1));
    for (threads, depth) in [(1, 16), (16, 64), (64, 128)] {
        let bytes = report(threads, depth).to_bytes().unwrap();
        group.throughput(Bytes(bytes.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{threads}x{depth}")),
            &bytes,
            |b, bytes| b.iter(|| decode(black_box(bytes)).unwrap()),
        );
    }
    group.finish();
}

fn chain_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("filters/chain");
    let chain = FilterChain::new()
        .with(Sanitize::default())
        .with(Demangle)
        .with(Redact::new(["(?i)password"], std::iter::empty::<&str>()).unwrap())
        .with(EventConversion);
    let subset = FilterChain::new().with(
        Subset::new(["report", "crash", "threads"]).unwrap(),
    );
    for (threads, depth) in [(1, 16), (16, 64)] {
        let tree = report(threads, depth).to_tree();
        group.bench_with_input(
            BenchmarkId::new("sanitize_demangle_redact_event", format!("{threads}x{depth}")),
            &tree,
            |b, tree| {
                b.iter_batched(
                    || tree.clone(),
                    |tree| black_box(chain.run(tree)),
                    BatchSize::SmallInput,
                )
            },
        );
        group.bench_with_input(
            BenchmarkId::new("subset", format!("{threads}x{depth}")),
            &tree,
            |b, tree| {
                b.iter_batched(
                    || tree.clone(),
                    |tree| black_box(subset.run(tree)),
                    BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

criterion_group!(benches, decode_bench, chain_bench);
criterion_main!(benches);
