//! Example of consuming lifecycle events while a guest runs.
//!
//! Run with: cargo run --example event_stream
//!
//! Note: Requires rustpython.wasm to be present in assets/

use std::sync::Arc;

use code_sandbox_engine::prelude::*;
use code_sandbox_engine::spawn_audit_logger;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox::audit=info".into()),
        )
        .init();

    let adapter = WasmAdapter::new()?
        .with_module(Language::Python, WasmModule::rustpython("assets/rustpython.wasm"));
    let engine = ExecutionEngine::new(EngineConfig::default(), Arc::new(adapter))?;
    let _audit = spawn_audit_logger(engine.dispatcher());

    let code = r#"
for i in range(3):
    print(f"step {i}")
raise ValueError("done counting")
"#;
    let request = ExecutionRequest::new(Language::Python, code, SessionId::new("demo"));
    let mut pending = engine.submit(request)?;
    println!("request {}", pending.id());

    // Events are serializable so they can be forwarded as JSON.
    while let Some(delivery) = pending.events.recv().await {
        match delivery {
            Delivery::Event(envelope) => {
                let terminal = envelope.event.is_terminal();
                println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
                if terminal {
                    break;
                }
            }
            Delivery::SubscriberLagged { missed } => println!("missed {missed} events"),
        }
    }

    let outcome = pending.outcome().await?;
    println!("\nexit_code: {}", outcome.exit_code);
    if let Some(diagnostic) = outcome.diagnostic {
        println!("{}: {}", diagnostic.kind, diagnostic.message);
    }
    Ok(())
}
