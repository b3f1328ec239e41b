//! Example of many sessions sharing one engine under admission control.
//!
//! Run with: cargo run --example concurrent_execution
//!
//! Note: Requires a Docker daemon and the sandbox-* images.

use std::sync::Arc;
use std::time::{Duration, Instant};

use code_sandbox_engine::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::builder()
        .max_concurrent(3)
        .max_per_session(2)
        .queue_timeout(Duration::from_secs(20))
        .build();
    let engine = Arc::new(ExecutionEngine::new(
        config,
        Arc::new(DockerAdapter::connect()?),
    )?);

    let tasks = vec![
        ("alice", Language::Python, "print(sum(i * i for i in range(100)))"),
        ("alice", Language::JavaScript, "console.log([...Array(10).keys()].join(','))"),
        ("bob", Language::Python, "print(len([x for x in range(1000) if x % 3 == 0]))"),
        ("bob", Language::Cpp, "#include <cstdio>\nint main() { printf(\"%d\\n\", 6 * 7); }"),
        ("carol", Language::Java, "public class Main { public static void main(String[] a) { System.out.println(\"hi\"); } }"),
    ];

    println!("Submitting {} requests...\n", tasks.len());
    let start = Instant::now();

    let mut pending = Vec::new();
    for (session, language, source) in tasks {
        let request = ExecutionRequest::new(language, source, SessionId::new(session));
        match engine.submit(request) {
            Ok(p) => pending.push((session, language, p)),
            Err(e) => println!("[{session}] {language}: refused: {e}"),
        }
    }

    // A third request from alice exceeds her per-session ceiling.
    let extra = ExecutionRequest::new(Language::Python, "print(3)", SessionId::new("alice"));
    if let Err(e) = engine.submit(extra) {
        println!("[alice] extra request refused: {e}");
    }

    let stats = engine.stats();
    println!("running={} queued={}\n", stats.running, stats.queued);

    for (session, language, p) in pending {
        match p.outcome().await {
            Ok(outcome) => println!(
                "[{session}] {language}: {} ({}ms)",
                outcome.stdout.trim(),
                outcome.duration_ms
            ),
            Err(e) => println!("[{session}] {language}: failed: {e}"),
        }
    }

    println!("\nAll requests finished in {:?}", start.elapsed());
    engine.shutdown().await?;
    Ok(())
}
