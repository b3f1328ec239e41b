//! Per-language execution profiles.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::sandbox::limits::SandboxLimits;
use crate::sandbox::types::Language;

/// How one language is compiled and run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: Language,
    /// Pre-built execution image. For the container substrate this is an image
    /// reference; for the Wasm substrate, the path of the interpreter module.
    pub image: String,
    /// File name the source is written to inside the scratch area.
    pub source_file: String,
    /// Shell command that compiles (if needed) and runs `source_file`.
    /// The guest inherits standard input from this command.
    pub command: String,
    /// Upper bound on wall-clock time for this language.
    pub timeout: Duration,
    /// Resource ceilings every sandbox for this language gets.
    pub limits: SandboxLimits,
    /// Whether the scratch area must allow executing files (compiled binaries).
    pub exec_scratch: bool,
}

impl LanguageProfile {
    /// Built-in profile for `language`.
    pub fn default_for(language: Language) -> Self {
        match language {
            Language::Python => Self {
                language,
                image: "sandbox-python".to_string(),
                source_file: "main.py".to_string(),
                command: "exec python3 -u /tmp/main.py".to_string(),
                timeout: Duration::from_secs(30),
                limits: SandboxLimits::default(),
                exec_scratch: false,
            },
            Language::JavaScript => Self {
                language,
                image: "sandbox-javascript".to_string(),
                source_file: "main.js".to_string(),
                command: "exec node /tmp/main.js".to_string(),
                timeout: Duration::from_secs(30),
                limits: SandboxLimits::default(),
                exec_scratch: false,
            },
            Language::Java => Self {
                language,
                image: "sandbox-java".to_string(),
                source_file: "Main.java".to_string(),
                command: "mkdir -p /tmp/classes && javac -d /tmp/classes /tmp/Main.java && exec java -cp /tmp/classes Main".to_string(),
                timeout: Duration::from_secs(45),
                limits: SandboxLimits::compiled(),
                exec_scratch: false,
            },
            Language::Cpp => Self {
                language,
                image: "sandbox-cpp".to_string(),
                source_file: "main.cpp".to_string(),
                command: "g++ -std=c++17 -O2 -o /tmp/program /tmp/main.cpp && exec /tmp/program".to_string(),
                timeout: Duration::from_secs(45),
                limits: SandboxLimits::compiled(),
                exec_scratch: true,
            },
        }
    }
}

/// The set of languages this engine instance accepts, with their profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileRegistry {
    profiles: BTreeMap<Language, LanguageProfile>,
}

impl ProfileRegistry {
    /// A registry with no languages enabled.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the built-in profile of every language.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for language in Language::ALL {
            registry.insert(LanguageProfile::default_for(language));
        }
        registry
    }

    /// Add or replace the profile for its language.
    pub fn insert(&mut self, profile: LanguageProfile) -> Option<LanguageProfile> {
        self.profiles.insert(profile.language, profile)
    }

    /// Disable a language.
    pub fn remove(&mut self, language: Language) -> Option<LanguageProfile> {
        self.profiles.remove(&language)
    }

    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    pub fn get_mut(&mut self, language: Language) -> Option<&mut LanguageProfile> {
        self.profiles.get_mut(&language)
    }

    pub fn contains(&self, language: Language) -> bool {
        self.profiles.contains_key(&language)
    }

    /// Enabled languages in a stable order.
    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.profiles.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }
}
