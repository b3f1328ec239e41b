//! Request and outcome types shared across the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::sandbox::diagnostics::GuestDiagnostic;

/// Exit code reported when the guest was killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit code reported when the guest was killed for any other reason: a
/// memory ceiling, an explicit destroy or engine shutdown.
pub const KILLED_EXIT_CODE: i64 = 137;

/// Languages the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
}

impl Language {
    /// Every language variant, in declaration order.
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
    ];

    /// Lowercase identifier used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            other => Err(SandboxError::Config(format!("unknown language: {other}"))),
        }
    }
}

/// Opaque correlation key for the session a request came from.
///
/// This is not an identity and carries no authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the engine assigns to each submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to run untrusted source code.
///
/// Requests are immutable once built and are consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    language: Language,
    source: String,
    stdin: Option<String>,
    session_id: SessionId,
    timeout_ms: u64,
}

impl ExecutionRequest {
    /// Default per-request timeout when the caller does not set one.
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    /// Create a request with the default timeout and no stdin.
    pub fn new(language: Language, source: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            language,
            source: source.into(),
            stdin: None,
            session_id,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
        }
    }

    /// Provide data for the guest's standard input.
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Set the wall-clock budget in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }
}

/// Which guest output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Final, immutable result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Captured stdout, at most the configured cap.
    pub stdout: String,
    /// Captured stderr, at most the configured cap.
    pub stderr: String,
    /// Guest exit code, or [`TIMEOUT_EXIT_CODE`] when killed at the deadline.
    pub exit_code: i64,
    /// Wall-clock duration from sandbox start to teardown decision.
    pub duration_ms: u64,
    /// Whether any output bytes were discarded at the cap.
    pub truncated: bool,
    /// Whether the guest was killed at its deadline.
    pub timed_out: bool,
    /// Parsed guest error for failed runs, if one was recognised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<GuestDiagnostic>,
}

impl ExecutionOutcome {
    /// Check if the guest exited cleanly within its budget.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}
