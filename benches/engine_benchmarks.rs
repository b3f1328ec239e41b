//! Benchmarks for the request path that does not touch a substrate.
//!
//! Run with: cargo bench

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use code_sandbox_engine::{
    EventDispatcher, ExecutionRequest, Language, OutputStream, ProfileRegistry, RequestEvents,
    RequestId, RequestValidator, SessionId,
};

fn python_source(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("value_{i} = sum(range({i}))\nprint(value_{i})\n"))
        .collect()
}

/// Benchmark validation cost as the source grows.
fn bench_validation(c: &mut Criterion) {
    let validator = RequestValidator::new(512 * 1024, &ProfileRegistry::with_defaults());
    let mut group = c.benchmark_group("validation");

    for lines in [10usize, 100, 1_000] {
        let request = ExecutionRequest::new(
            Language::Python,
            python_source(lines),
            SessionId::new("bench"),
        );
        group.throughput(Throughput::Bytes(request.source().len() as u64));
        group.bench_with_input(BenchmarkId::new("python", lines), &request, |b, request| {
            b.iter(|| black_box(validator.validate(black_box(request))))
        });
    }

    let rejected = ExecutionRequest::new(
        Language::Cpp,
        "#include <cstdlib>\nint main() { system(\"ls\"); fork(); }",
        SessionId::new("bench"),
    );
    group.bench_function("cpp_rejected", |b| {
        b.iter(|| black_box(validator.validate(black_box(&rejected))))
    });

    group.bench_function("construct", |b| {
        let profiles = ProfileRegistry::with_defaults();
        b.iter(|| black_box(RequestValidator::new(50 * 1024, &profiles)))
    });

    group.finish();
}

/// Benchmark event publication with a varying number of subscribers.
fn bench_dispatch(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");
    let chunk = Bytes::from_static(b"some guest output line\n");

    for subscribers in [0usize, 1, 8] {
        group.bench_with_input(
            BenchmarkId::new("output_chunk", subscribers),
            &subscribers,
            |b, &subscribers| {
                let dispatcher = EventDispatcher::new(1024);
                let subs: Vec<_> = (0..subscribers).map(|_| dispatcher.subscribe(None)).collect();
                let mut events =
                    RequestEvents::new(dispatcher.clone(), RequestId::new(), SessionId::new("bench"));
                b.iter(|| events.output(OutputStream::Stdout, chunk.clone()));
                drop(subs);
            },
        );
    }

    group.bench_function("request_lifecycle_with_reader", |b| {
        b.to_async(&runtime).iter(|| async {
            let dispatcher = EventDispatcher::new(64);
            let id = RequestId::new();
            let mut sub = dispatcher.subscribe(Some(id));

            let mut events = RequestEvents::new(dispatcher.clone(), id, SessionId::new("bench"));
            events.started(Language::Python);
            for _ in 0..16 {
                events.output(OutputStream::Stdout, Bytes::from_static(b"x\n"));
            }
            events.fail(&code_sandbox_engine::SandboxError::runtime("bench"));

            black_box(sub.collect_until_terminal().await.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_validation, bench_dispatch);
criterion_main!(benches);
