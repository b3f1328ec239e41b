//! Security tests to verify sandbox isolation.
//!
//! These tests run real guests and attempt escape techniques that the
//! deny-list does not catch, so the isolation layer itself is what stops them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use code_sandbox_engine::prelude::*;

fn request(language: Language, source: &str) -> ExecutionRequest {
    ExecutionRequest::new(language, source, SessionId::new("security-tests"))
        .with_timeout_ms(10_000)
}

#[cfg(feature = "docker")]
mod docker {
    use super::*;
    use code_sandbox_engine::TIMEOUT_EXIT_CODE;

    async fn engine() -> ExecutionEngine {
        let adapter = DockerAdapter::connect().unwrap();
        adapter.ping().await.unwrap();
        let config = EngineConfig::builder().max_per_session(4).build();
        ExecutionEngine::new(config, Arc::new(adapter)).unwrap()
    }

    /// Test that a trivial program round-trips through a real container.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_python_hello() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(Language::Python, "print('hi')"))
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "hi\n");
        assert_eq!(outcome.exit_code, 0);
        assert!(engine.active_sandboxes().is_empty());
    }

    /// Test that stdin reaches the guest after the source line.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_stdin_delivered() {
        let engine = engine().await;
        let outcome = engine
            .execute(
                request(Language::Python, "n = int(input())\nprint(n * 2)").with_stdin("21\n"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "42");
    }

    /// Test that every supported language compiles and runs.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_all_languages_run() {
        let engine = engine().await;
        let programs = [
            (Language::JavaScript, "console.log('hi')"),
            (
                Language::Java,
                "public class Main { public static void main(String[] a) { System.out.println(\"hi\"); } }",
            ),
            (
                Language::Cpp,
                "#include <iostream>\nint main() { std::cout << \"hi\" << std::endl; return 0; }",
            ),
        ];
        for (language, source) in programs {
            let outcome = engine.execute(request(language, source)).await.unwrap();
            assert_eq!(outcome.stdout, "hi\n", "{language}: {}", outcome.stderr);
        }
    }

    /// Test that infinite loops are killed at the deadline.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_infinite_loop_timeout() {
        let engine = engine().await;
        let grace = engine.config().teardown_grace;

        let started = Instant::now();
        let outcome = engine
            .execute(request(Language::Python, "while True: pass").with_timeout_ms(1_000))
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(1) + grace + Duration::from_secs(2));
        assert!(engine.active_sandboxes().is_empty());
    }

    /// Test that the root filesystem is read-only.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_rootfs_read_only() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(
                Language::Python,
                r#"
try:
    with open('/usr/breach.txt', 'w') as f:
        f.write('x')
    print('SECURITY_BREACH: rootfs writable')
except OSError as e:
    print(f'BLOCKED: {type(e).__name__}')
"#,
            ))
            .await
            .unwrap();

        assert!(!outcome.stdout.contains("SECURITY_BREACH"));
        assert!(outcome.stdout.contains("BLOCKED"));
    }

    /// Test that the scratch area refuses to execute files.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_tmp_is_noexec() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(
                Language::Python,
                r#"
import os, shutil
shutil.copy('/bin/true', '/tmp/t')
os.chmod('/tmp/t', 0o755)
try:
    os.execv('/tmp/t', ['/tmp/t'])
except OSError as e:
    print(f'BLOCKED: {type(e).__name__}')
"#,
            ))
            .await
            .unwrap();
        assert!(outcome.stdout.contains("BLOCKED"), "{}", outcome.stderr);
    }

    /// Test that network access is blocked.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_network_access_blocked() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(
                Language::Python,
                r#"
import urllib.request
try:
    urllib.request.urlopen('http://1.1.1.1', timeout=2)
    print('SECURITY_BREACH: network access succeeded')
except Exception as e:
    print(f'BLOCKED: {type(e).__name__}')
"#,
            ))
            .await
            .unwrap();

        assert!(!outcome.stdout.contains("SECURITY_BREACH"));
    }

    /// Test that the guest does not run as root.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_runs_unprivileged() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(Language::Python, "import os\nprint(os.getuid())"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "65534");
    }

    /// Test memory exhaustion protection.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_memory_exhaustion_protection() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(
                Language::Python,
                "data = bytearray(1024 * 1024 * 1024)\nprint('SECURITY_BREACH: allocated 1GB')",
            ))
            .await
            .unwrap();

        assert!(!outcome.stdout.contains("SECURITY_BREACH"));
        assert_ne!(outcome.exit_code, 0);
    }

    /// Test that process creation is bounded by the pids limit.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_fork_bomb_contained() {
        let engine = engine().await;
        let outcome = engine
            .execute(
                request(
                    Language::Python,
                    r#"
import os, time
children = 0
try:
    for _ in range(500):
        if os.fork() == 0:
            time.sleep(5)
            os._exit(0)
        children += 1
    print('SECURITY_BREACH: spawned 500 processes')
except OSError as e:
    print(f'BLOCKED after {children}: {type(e).__name__}')
"#,
                )
                .with_timeout_ms(3_000),
            )
            .await
            .unwrap();

        assert!(!outcome.stdout.contains("SECURITY_BREACH"));
        assert!(engine.active_sandboxes().is_empty());
    }

    /// Test that output beyond the cap is dropped without killing the guest.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_output_flood_truncated() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(
                Language::Python,
                "import sys\nfor _ in range(20000): sys.stdout.write('x' * 100)\nprint('done', file=sys.stderr)",
            ))
            .await
            .unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.stdout.len(), engine.config().stdout_cap_bytes);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stderr.trim(), "done");
    }

    /// Test that orphan reaping finds nothing once the engine is idle.
    #[tokio::test]
    #[ignore = "requires docker and sandbox images"]
    async fn test_no_orphans_after_runs() {
        let engine = engine().await;
        engine
            .execute(request(Language::Python, "print(1)"))
            .await
            .unwrap();

        let adapter = DockerAdapter::connect().unwrap();
        assert_eq!(adapter.reap_orphans().await.unwrap(), 0);
    }
}

#[cfg(feature = "wasm")]
mod wasm {
    use super::*;

    async fn engine() -> ExecutionEngine {
        let adapter = WasmAdapter::new()
            .unwrap()
            .with_module(Language::Python, WasmModule::rustpython("assets/rustpython.wasm"));
        let mut profiles = code_sandbox_engine::ProfileRegistry::empty();
        let mut python = code_sandbox_engine::LanguageProfile::default_for(Language::Python);
        python.limits.memory_bytes = 64 * 1024 * 1024;
        profiles.insert(python);

        let config = EngineConfig::builder().profiles(profiles).build();
        ExecutionEngine::new(config, Arc::new(adapter)).unwrap()
    }

    /// Test that a trivial program round-trips through the interpreter.
    #[tokio::test]
    #[ignore = "requires rustpython.wasm"]
    async fn test_python_hello() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(Language::Python, "print('hi')"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hi\n");
        assert_eq!(outcome.exit_code, 0);
    }

    /// Test that infinite loops are interrupted.
    #[tokio::test]
    #[ignore = "requires rustpython.wasm"]
    async fn test_infinite_loop_timeout() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(Language::Python, "while True: pass").with_timeout_ms(500))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(engine.active_sandboxes().is_empty());
    }

    /// Test that filesystem access is blocked.
    #[tokio::test]
    #[ignore = "requires rustpython.wasm"]
    async fn test_filesystem_access_blocked() {
        let engine = engine().await;
        let outcome = engine
            .execute(request(
                Language::Python,
                r#"
try:
    with open('/etc/passwd', 'r') as f:
        print(f.read())
    print('SECURITY_BREACH: file read succeeded')
except Exception as e:
    print(f'BLOCKED: {type(e).__name__}')
"#,
            ))
            .await
            .unwrap();

        assert!(!outcome.stdout.contains("SECURITY_BREACH"));
        assert!(outcome.stdout.contains("BLOCKED"));
    }

    /// Test that unsupported languages are rejected before any store exists.
    #[tokio::test]
    #[ignore = "requires rustpython.wasm"]
    async fn test_only_python_enabled() {
        let engine = engine().await;
        let err = engine
            .execute(request(Language::JavaScript, "console.log(1)"))
            .await
            .unwrap_err();
        assert!(err.is_rejection());
    }
}
