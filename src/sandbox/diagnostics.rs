//! Best-effort parsing of guest error output into a structured diagnostic.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sandbox::types::Language;

/// A compile or runtime error recognised in the guest's stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDiagnostic {
    /// Error class, e.g. `ValueError`, `java.lang.ArithmeticException`, `CompileError`.
    pub kind: String,
    /// The error message without the class prefix.
    pub message: String,
    /// 1-based source line, when the toolchain reported one.
    pub line: Option<u32>,
    /// Full traceback or stack, when present.
    pub traceback: Option<String>,
}

static PY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "[^"]*", line (\d+)"#).expect("valid regex"));
static JS_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w*Error): (.*)$").expect("valid regex"));
static JS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"main\.js:(\d+)").expect("valid regex"));
static JAVAC_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S*\.java:(\d+): error: (.*)$").expect("valid regex"));
static JAVA_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^Exception in thread "[^"]*" ([\w.$]+)(?::\s*(.*))?$"#).expect("valid regex")
});
static JAVA_FRAME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\w+\.java:(\d+)\)").expect("valid regex"));
static GCC_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S*\.cpp:(\d+):\d+: error: (.*)$").expect("valid regex"));

/// Parse `stderr` produced by a guest written in `language`.
pub fn parse_guest_diagnostic(language: Language, stderr: &str) -> Option<GuestDiagnostic> {
    if stderr.trim().is_empty() {
        return None;
    }
    match language {
        Language::Python => parse_python(stderr),
        Language::JavaScript => parse_javascript(stderr),
        Language::Java => parse_java(stderr),
        Language::Cpp => parse_cpp(stderr),
    }
}

fn parse_python(stderr: &str) -> Option<GuestDiagnostic> {
    let lines: Vec<&str> = stderr.lines().collect();

    let mut exception_line = None;
    let mut traceback_start = None;
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Traceback (most recent call last):") {
            traceback_start = Some(i);
        } else if !line.starts_with(' ') && looks_like_exception(line) {
            exception_line = Some((i, *line));
        }
    }

    let (line_idx, exception_str) = exception_line?;
    let (kind, message) = split_class_and_message(exception_str);

    // The innermost frame is the last "File ..., line N" before the exception.
    let line = lines[..line_idx]
        .iter()
        .rev()
        .find_map(|l| PY_LINE.captures(l))
        .and_then(|c| c[1].parse().ok());

    let traceback = traceback_start.map(|start| lines[start..=line_idx].join("\n"));

    Some(GuestDiagnostic {
        kind,
        message,
        line,
        traceback,
    })
}

fn parse_javascript(stderr: &str) -> Option<GuestDiagnostic> {
    let (idx, caps) = stderr
        .lines()
        .enumerate()
        .find_map(|(i, l)| JS_ERROR.captures(l).map(|c| (i, c)))?;

    let line = JS_LINE
        .captures(stderr)
        .and_then(|c| c[1].parse().ok());

    let stack: Vec<&str> = stderr
        .lines()
        .skip(idx + 1)
        .take_while(|l| l.trim_start().starts_with("at "))
        .collect();

    Some(GuestDiagnostic {
        kind: caps[1].to_string(),
        message: caps[2].trim().to_string(),
        line,
        traceback: (!stack.is_empty()).then(|| stack.join("\n")),
    })
}

fn parse_java(stderr: &str) -> Option<GuestDiagnostic> {
    if let Some(caps) = stderr.lines().find_map(|l| JAVAC_ERROR.captures(l)) {
        return Some(GuestDiagnostic {
            kind: "CompileError".to_string(),
            message: caps[2].trim().to_string(),
            line: caps[1].parse().ok(),
            traceback: None,
        });
    }

    let (idx, caps) = stderr
        .lines()
        .enumerate()
        .find_map(|(i, l)| JAVA_EXCEPTION.captures(l).map(|c| (i, c)))?;
    let frames: Vec<&str> = stderr
        .lines()
        .skip(idx + 1)
        .take_while(|l| l.trim_start().starts_with("at "))
        .collect();
    let line = frames
        .first()
        .and_then(|f| JAVA_FRAME_LINE.captures(f))
        .and_then(|c| c[1].parse().ok());

    Some(GuestDiagnostic {
        kind: caps[1].to_string(),
        message: caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        line,
        traceback: (!frames.is_empty()).then(|| frames.join("\n")),
    })
}

fn parse_cpp(stderr: &str) -> Option<GuestDiagnostic> {
    let caps = stderr.lines().find_map(|l| GCC_ERROR.captures(l))?;
    Some(GuestDiagnostic {
        kind: "CompileError".to_string(),
        message: caps[2].trim().to_string(),
        line: caps[1].parse().ok(),
        traceback: None,
    })
}

fn split_class_and_message(line: &str) -> (String, String) {
    match line.find(':') {
        Some(pos) => (
            line[..pos].trim().to_string(),
            line[pos + 1..].trim().to_string(),
        ),
        None => (line.trim().to_string(), String::new()),
    }
}

/// Check if a line looks like a Python exception.
fn looks_like_exception(line: &str) -> bool {
    let exception_suffixes = ["Error", "Exception", "Warning"];
    let standalone_exceptions = [
        "KeyboardInterrupt",
        "SystemExit",
        "StopIteration",
        "GeneratorExit",
    ];

    if !line
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
    {
        return false;
    }

    let ends_token = |after: usize| {
        after >= line.len() || matches!(line.as_bytes()[after], b':' | b' ' | b'\n')
    };

    exception_suffixes
        .iter()
        .any(|suffix| line.find(suffix).is_some_and(|idx| ends_token(idx + suffix.len())))
        || standalone_exceptions
            .iter()
            .any(|exc| line.starts_with(exc) && ends_token(exc.len()))
}
