//! Basic example of running code in Docker-backed sandboxes.
//!
//! Run with: cargo run --example basic_execution
//!
//! Note: Requires a Docker daemon and the sandbox-* images.

use std::sync::Arc;

use code_sandbox_engine::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let adapter = DockerAdapter::connect()?;
    if let Err(e) = adapter.ping().await {
        eprintln!("Docker is not reachable: {}", e);
        return Err(e);
    }
    let reaped = adapter.reap_orphans().await?;
    if reaped > 0 {
        println!("Removed {} leftover sandboxes", reaped);
    }

    let config = EngineConfig::from_env()?;
    let engine = ExecutionEngine::new(config, Arc::new(adapter))?;
    let session = SessionId::new("demo");

    println!("\n=== Test 1: Python ===");
    let request = ExecutionRequest::new(Language::Python, "print(1 + 1)", session.clone());
    print_outcome(engine.execute(request).await);

    println!("\n=== Test 2: stdin ===");
    let request = ExecutionRequest::new(
        Language::JavaScript,
        "process.stdin.on('data', d => console.log(`got ${d.toString().trim()}`))",
        session.clone(),
    )
    .with_stdin("hello\n");
    print_outcome(engine.execute(request).await);

    println!("\n=== Test 3: guest error ===");
    let request = ExecutionRequest::new(Language::Python, "x = 1 / 0", session.clone());
    print_outcome(engine.execute(request).await);

    println!("\n=== Test 4: timeout ===");
    let request = ExecutionRequest::new(Language::Python, "while True: pass", session.clone())
        .with_timeout_ms(1_000);
    print_outcome(engine.execute(request).await);

    println!("\n=== Test 5: rejected ===");
    let request = ExecutionRequest::new(Language::Python, "import os\nos.system('id')", session);
    print_outcome(engine.execute(request).await);

    engine.shutdown().await?;
    Ok(())
}

fn print_outcome(result: Result<ExecutionOutcome>) {
    match result {
        Ok(outcome) => {
            println!("stdout: {}", outcome.stdout.trim_end());
            println!("stderr: {}", outcome.stderr.trim_end());
            println!("exit_code: {}", outcome.exit_code);
            println!("duration: {}ms", outcome.duration_ms);
            if outcome.timed_out {
                println!("killed at deadline");
            }
            if let Some(diagnostic) = outcome.diagnostic {
                println!(
                    "diagnostic: {} at line {:?}: {}",
                    diagnostic.kind, diagnostic.line, diagnostic.message
                );
            }
        }
        Err(e) => println!("error ({:?}): {}", e.kind(), e),
    }
}
