//! Static, language-aware validation of submitted source.
//!
//! The deny-list here is a cheap filter that spares the host from starting
//! sandboxes for obviously hostile programs. It is trivially bypassable by
//! obfuscation; the isolation substrate is the security boundary.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sandbox::profile::ProfileRegistry;
use crate::sandbox::types::{ExecutionRequest, Language};

/// Why a request was refused before any sandbox was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Source is longer than the configured maximum (bytes).
    TooLarge { size: usize, limit: usize },
    /// Language is not enabled on this engine.
    UnsupportedLanguage { language: Language },
    /// Source is empty or whitespace only.
    EmptySource,
    /// A zero timeout can never complete.
    InvalidTimeout,
    /// Source matched a deny-list rule.
    ForbiddenConstruct { pattern: String, message: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::TooLarge { size, limit } => {
                write!(f, "source is {size} bytes, limit is {limit}")
            }
            RejectionReason::UnsupportedLanguage { language } => {
                write!(f, "language {language} is not supported")
            }
            RejectionReason::EmptySource => f.write_str("source is empty"),
            RejectionReason::InvalidTimeout => f.write_str("timeout must be positive"),
            RejectionReason::ForbiddenConstruct { message, .. } => f.write_str(message),
        }
    }
}

/// A non-empty list of rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    reasons: Vec<RejectionReason>,
}

impl Rejection {
    pub fn new(reasons: Vec<RejectionReason>) -> Self {
        debug_assert!(!reasons.is_empty());
        Self { reasons }
    }

    pub fn reasons(&self) -> &[RejectionReason] {
        &self.reasons
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reason) in self.reasons.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{reason}")?;
        }
        Ok(())
    }
}

/// Whether a deny rule blocks the request or only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single deny-list rule.
#[derive(Debug, Clone)]
pub struct DenyRule {
    pattern: Regex,
    message: String,
    severity: Severity,
}

impl DenyRule {
    /// Compile a rule. Patterns are matched case-insensitively.
    pub fn new(
        pattern: &str,
        message: impl Into<String>,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("(?i){pattern}"))?,
            message: message.into(),
            severity,
        })
    }

    /// The pattern as written, without the case-insensitivity flag.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str().trim_start_matches("(?i)")
    }
}

/// A non-blocking finding from a `Warning` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub pattern: String,
    pub message: String,
}

const PYTHON_RULES: &[(&str, &str, Severity)] = &[
    (r"\bimport\s+ctypes\b|\bfrom\s+ctypes\s+import\b", "import of 'ctypes' is not allowed", Severity::Error),
    (r"\bimport\s+imp\b|\bfrom\s+imp\s+import\b", "import of 'imp' is not allowed", Severity::Error),
    (r"\bimportlib\.__import__", "use of 'importlib.__import__' is not allowed", Severity::Error),
    (r"\b__import__\s*\(", "use of '__import__' is not allowed", Severity::Error),
    (r"\bexec\s*\(", "use of 'exec' is not allowed", Severity::Error),
    (r"\beval\s*\(", "use of 'eval' is not allowed", Severity::Error),
    (r"\bcompile\s*\(", "use of 'compile' is not allowed", Severity::Error),
    (r"\bos\.system\s*\(", "use of 'os.system' is not allowed", Severity::Error),
    (r"\bimport\s+subprocess\b|\bfrom\s+subprocess\s+import\b", "process spawning is not allowed", Severity::Error),
    (r"\bimport\s+socket\b|\bfrom\s+socket\s+import\b", "raw sockets are not allowed", Severity::Error),
];

const JAVASCRIPT_RULES: &[(&str, &str, Severity)] = &[
    (r"\beval\s*\(", "use of 'eval' is not allowed", Severity::Error),
    (r"\bnew\s+Function\s*\(", "dynamic function construction is not allowed", Severity::Error),
    (r"child_process", "process spawning is not allowed", Severity::Error),
    (r#"require\s*\(\s*['"](net|dgram)['"]\s*\)"#, "raw sockets are not allowed", Severity::Error),
];

const JAVA_RULES: &[(&str, &str, Severity)] = &[
    (r"\bjava\.lang\.Runtime\b|\bRuntime\.getRuntime\s*\(", "runtime operations are not allowed", Severity::Error),
    (r"\bProcessBuilder\b", "process operations are not allowed", Severity::Error),
    (r"\bjava\.net\.(Server)?Socket\b", "raw sockets are not allowed", Severity::Error),
    (r"\bimport\s+java\.io\.File\b", "file I/O is restricted in the sandbox", Severity::Warning),
    (r"\bSystem\.exit\s*\(", "System.exit() is not recommended here", Severity::Warning),
];

const CPP_RULES: &[(&str, &str, Severity)] = &[
    (r"\bsystem\s*\(", "system calls are not allowed", Severity::Error),
    (r"\bexec[vl][pe]*\s*\(", "the exec family is not allowed", Severity::Error),
    (r"\bfork\s*\(", "process forking is not allowed", Severity::Error),
    (r"\bpopen\s*\(", "process pipes are not allowed", Severity::Error),
    (r"\bsocket\s*\(", "raw sockets are not allowed", Severity::Error),
    (r"\bexit\s*\(", "exit() is not recommended here", Severity::Warning),
];

/// Checks requests against size limits, enabled languages and deny-lists.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_source_bytes: usize,
    supported: Vec<Language>,
    rules: HashMap<Language, Vec<DenyRule>>,
}

impl RequestValidator {
    /// Build a validator with the built-in deny-lists.
    pub fn new(max_source_bytes: usize, profiles: &ProfileRegistry) -> Self {
        let mut rules = HashMap::new();
        for language in Language::ALL {
            let table = match language {
                Language::Python => PYTHON_RULES,
                Language::JavaScript => JAVASCRIPT_RULES,
                Language::Java => JAVA_RULES,
                Language::Cpp => CPP_RULES,
            };
            let compiled = table
                .iter()
                .filter_map(|(pattern, message, severity)| {
                    DenyRule::new(pattern, *message, *severity).ok()
                })
                .collect();
            rules.insert(language, compiled);
        }

        Self {
            max_source_bytes,
            supported: profiles.languages().collect(),
            rules,
        }
    }

    /// Add a deny rule for `language`.
    pub fn with_rule(mut self, language: Language, rule: DenyRule) -> Self {
        self.rules.entry(language).or_default().push(rule);
        self
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Validate `request`, collecting every applicable reason.
    ///
    /// Size and language failures short-circuit: an oversized source is never
    /// scanned, and an unsupported language has no deny-list to apply.
    pub fn validate(&self, request: &ExecutionRequest) -> Result<(), Rejection> {
        let size = request.source().len();
        if size > self.max_source_bytes {
            return Err(Rejection::new(vec![RejectionReason::TooLarge {
                size,
                limit: self.max_source_bytes,
            }]));
        }

        let language = request.language();
        if !self.supported.contains(&language) {
            return Err(Rejection::new(vec![
                RejectionReason::UnsupportedLanguage { language },
            ]));
        }

        let mut reasons = Vec::new();
        if request.source().trim().is_empty() {
            reasons.push(RejectionReason::EmptySource);
        }
        if request.timeout_ms() == 0 {
            reasons.push(RejectionReason::InvalidTimeout);
        }
        reasons.extend(
            self.matching(language, request.source(), Severity::Error)
                .map(|rule| RejectionReason::ForbiddenConstruct {
                    pattern: rule.pattern().to_string(),
                    message: rule.message.clone(),
                }),
        );

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Rejection::new(reasons))
        }
    }

    /// Findings from `Warning` rules; these never block a request.
    pub fn warnings(&self, request: &ExecutionRequest) -> Vec<ValidationWarning> {
        self.matching(request.language(), request.source(), Severity::Warning)
            .map(|rule| ValidationWarning {
                pattern: rule.pattern().to_string(),
                message: rule.message.clone(),
            })
            .collect()
    }

    fn matching<'a>(
        &'a self,
        language: Language,
        source: &'a str,
        severity: Severity,
    ) -> impl Iterator<Item = &'a DenyRule> + 'a {
        self.rules
            .get(&language)
            .into_iter()
            .flatten()
            .filter(move |rule| rule.severity == severity && rule.pattern.is_match(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::SessionId;

    fn validator(max: usize) -> RequestValidator {
        RequestValidator::new(max, &ProfileRegistry::with_defaults())
    }

    fn request(language: Language, source: &str) -> ExecutionRequest {
        ExecutionRequest::new(language, source, SessionId::new("test"))
    }

    #[test]
    fn test_accepts_plain_program() {
        let v = validator(1024);
        assert!(v.validate(&request(Language::Python, "print('hi')")).is_ok());
    }

    #[test]
    fn test_size_boundary() {
        let v = validator(16);
        let at_cap = "x".repeat(16);
        let over_cap = "x".repeat(17);

        assert!(v.validate(&request(Language::JavaScript, &at_cap)).is_ok());

        let rejection = v
            .validate(&request(Language::JavaScript, &over_cap))
            .unwrap_err();
        assert_eq!(
            rejection.reasons(),
            &[RejectionReason::TooLarge { size: 17, limit: 16 }]
        );
    }

    #[test]
    fn test_size_counts_bytes_not_chars() {
        let v = validator(4);
        // Three characters, six bytes.
        let rejection = v.validate(&request(Language::Python, "ééé")).unwrap_err();
        assert!(matches!(
            rejection.reasons()[0],
            RejectionReason::TooLarge { size: 6, .. }
        ));
    }

    #[test]
    fn test_unsupported_language() {
        let mut profiles = ProfileRegistry::with_defaults();
        profiles.remove(Language::Cpp);
        let v = RequestValidator::new(1024, &profiles);

        let rejection = v
            .validate(&request(Language::Cpp, "int main() {}"))
            .unwrap_err();
        assert_eq!(
            rejection.reasons(),
            &[RejectionReason::UnsupportedLanguage {
                language: Language::Cpp
            }]
        );
    }

    #[test]
    fn test_forbidden_constructs_are_all_reported() {
        let v = validator(1024);
        let source = "import ctypes\nimport subprocess\nprint(eval('1+1'))";
        let rejection = v.validate(&request(Language::Python, source)).unwrap_err();

        let forbidden = rejection
            .reasons()
            .iter()
            .filter(|r| matches!(r, RejectionReason::ForbiddenConstruct { .. }))
            .count();
        assert_eq!(forbidden, 3);
    }

    #[test]
    fn test_rules_are_language_specific() {
        let v = validator(1024);
        // `system(` is only denied for C++.
        assert!(v.validate(&request(Language::Python, "system ( )")).is_ok());
        assert!(v
            .validate(&request(Language::Cpp, "int main() { system(\"ls\"); }"))
            .is_err());
    }

    #[test]
    fn test_word_boundaries() {
        let v = validator(1024);
        // `evaluate(` must not trip the `eval(` rule.
        assert!(v
            .validate(&request(Language::Python, "def evaluate(x):\n    return x"))
            .is_ok());
    }

    #[test]
    fn test_warnings_do_not_block() {
        let v = validator(4096);
        let source = "import java.io.File;\npublic class Main { public static void main(String[] a) { System.exit(0); } }";
        let req = request(Language::Java, source);

        assert!(v.validate(&req).is_ok());
        assert_eq!(v.warnings(&req).len(), 2);
    }

    #[test]
    fn test_empty_source_and_zero_timeout() {
        let v = validator(1024);
        let req = request(Language::Python, "   \n").with_timeout_ms(0);
        let rejection = v.validate(&req).unwrap_err();
        assert_eq!(
            rejection.reasons(),
            &[RejectionReason::EmptySource, RejectionReason::InvalidTimeout]
        );
        assert_eq!(rejection.to_string(), "source is empty; timeout must be positive");
    }

    #[test]
    fn test_custom_rule() {
        let v = validator(1024).with_rule(
            Language::JavaScript,
            DenyRule::new(r"\bprocess\.env\b", "environment access is not allowed", Severity::Error)
                .unwrap(),
        );
        let rejection = v
            .validate(&request(Language::JavaScript, "console.log(process.env)"))
            .unwrap_err();
        assert!(matches!(
            &rejection.reasons()[0],
            RejectionReason::ForbiddenConstruct { pattern, .. } if pattern == r"\bprocess\.env\b"
        ));
    }
}
