//! Engine configuration with builder pattern and environment loading.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::sandbox::governor::GovernorLimits;
use crate::sandbox::profile::ProfileRegistry;
use crate::sandbox::types::Language;

/// Configuration for the execution engine. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum source size in bytes.
    pub max_source_bytes: usize,
    /// Upper bound on any request's wall-clock budget.
    pub max_timeout: Duration,
    /// Extra time allowed for teardown after the deadline.
    pub teardown_grace: Duration,
    /// Maximum sandboxes running at once.
    pub max_concurrent: usize,
    /// Maximum queued plus running requests per session.
    pub max_per_session: usize,
    /// How long a request may wait for admission.
    pub queue_timeout: Duration,
    /// Maximum requests waiting for admission.
    pub max_queue_depth: usize,
    pub stdout_cap_bytes: usize,
    pub stderr_cap_bytes: usize,
    /// Events each subscriber may lag before dropping the oldest.
    pub event_buffer: usize,
    /// Consecutive runtime failures before the substrate is marked unhealthy.
    pub failure_threshold: u32,
    /// Wait between retry requests while the substrate is unhealthy.
    pub health_retry_interval: Duration,
    /// Enabled languages and their profiles.
    pub profiles: ProfileRegistry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 50 * 1024,
            max_timeout: Duration::from_secs(30),
            teardown_grace: Duration::from_secs(2),
            max_concurrent: 10,
            max_per_session: 2,
            queue_timeout: Duration::from_secs(10),
            max_queue_depth: 64,
            stdout_cap_bytes: 64 * 1024,
            stderr_cap_bytes: 64 * 1024,
            event_buffer: 256,
            failure_threshold: 3,
            health_retry_interval: Duration::from_secs(5),
            profiles: ProfileRegistry::with_defaults(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load from `SANDBOX_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Env(&lookup);

        if let Some(v) = env.parse("SANDBOX_MAX_SOURCE_BYTES")? {
            config.max_source_bytes = v;
        }
        if let Some(v) = env.millis("SANDBOX_MAX_TIMEOUT_MS")? {
            config.max_timeout = v;
        }
        if let Some(v) = env.millis("SANDBOX_TEARDOWN_GRACE_MS")? {
            config.teardown_grace = v;
        }
        if let Some(v) = env.parse("SANDBOX_MAX_CONCURRENT")? {
            config.max_concurrent = v;
        }
        if let Some(v) = env.parse("SANDBOX_MAX_PER_SESSION")? {
            config.max_per_session = v;
        }
        if let Some(v) = env.millis("SANDBOX_QUEUE_TIMEOUT_MS")? {
            config.queue_timeout = v;
        }
        if let Some(v) = env.parse("SANDBOX_MAX_QUEUE_DEPTH")? {
            config.max_queue_depth = v;
        }
        if let Some(v) = env.parse("SANDBOX_STDOUT_CAP_BYTES")? {
            config.stdout_cap_bytes = v;
        }
        if let Some(v) = env.parse("SANDBOX_STDERR_CAP_BYTES")? {
            config.stderr_cap_bytes = v;
        }
        if let Some(v) = env.parse("SANDBOX_EVENT_BUFFER")? {
            config.event_buffer = v;
        }
        if let Some(v) = env.parse("SANDBOX_FAILURE_THRESHOLD")? {
            config.failure_threshold = v;
        }
        if let Some(v) = env.millis("SANDBOX_HEALTH_RETRY_MS")? {
            config.health_retry_interval = v;
        }

        for language in Language::ALL {
            let Some(profile) = config.profiles.get_mut(language) else {
                continue;
            };
            let prefix = format!("SANDBOX_{}", language.as_str().to_ascii_uppercase());
            if let Some(v) = env.parse(&format!("{prefix}_MEMORY_BYTES"))? {
                profile.limits.memory_bytes = v;
            }
            if let Some(v) = env.parse(&format!("{prefix}_NANO_CPUS"))? {
                profile.limits.nano_cpus = v;
            }
            if let Some(v) = env.parse(&format!("{prefix}_PIDS"))? {
                profile.limits.max_processes = v;
            }
            if let Some(image) = lookup(&format!("{prefix}_IMAGE")) {
                profile.image = image;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("max_source_bytes", self.max_source_bytes),
            ("max_concurrent", self.max_concurrent),
            ("max_per_session", self.max_per_session),
            ("stdout_cap_bytes", self.stdout_cap_bytes),
            ("stderr_cap_bytes", self.stderr_cap_bytes),
            ("event_buffer", self.event_buffer),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(SandboxError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.max_timeout.is_zero() {
            return Err(SandboxError::Config("max_timeout must be non-zero".into()));
        }
        if self.failure_threshold == 0 {
            return Err(SandboxError::Config(
                "failure_threshold must be non-zero".into(),
            ));
        }
        if self.max_per_session > self.max_concurrent {
            return Err(SandboxError::Config(format!(
                "max_per_session ({}) exceeds max_concurrent ({})",
                self.max_per_session, self.max_concurrent
            )));
        }
        for profile in self.profiles.iter() {
            if !profile.limits.is_bounded() {
                return Err(SandboxError::Config(format!(
                    "{} profile has an unbounded limit",
                    profile.language
                )));
            }
        }
        Ok(())
    }

    pub fn governor_limits(&self) -> GovernorLimits {
        GovernorLimits {
            max_concurrent: self.max_concurrent,
            max_per_session: self.max_per_session,
            queue_timeout: self.queue_timeout,
            max_queue_depth: self.max_queue_depth,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| SandboxError::Config(format!("invalid value for {key}: {raw:?}"))),
        }
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

/// Builder for creating EngineConfig instances.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    max_source_bytes: Option<usize>,
    max_timeout: Option<Duration>,
    teardown_grace: Option<Duration>,
    max_concurrent: Option<usize>,
    max_per_session: Option<usize>,
    queue_timeout: Option<Duration>,
    max_queue_depth: Option<usize>,
    stdout_cap_bytes: Option<usize>,
    stderr_cap_bytes: Option<usize>,
    event_buffer: Option<usize>,
    failure_threshold: Option<u32>,
    health_retry_interval: Option<Duration>,
    profiles: Option<ProfileRegistry>,
}

impl EngineConfigBuilder {
    pub fn max_source_bytes(mut self, bytes: usize) -> Self {
        self.max_source_bytes = Some(bytes);
        self
    }

    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = Some(timeout);
        self
    }

    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = Some(grace);
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    pub fn max_per_session(mut self, n: usize) -> Self {
        self.max_per_session = Some(n);
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    pub fn stdout_cap_bytes(mut self, bytes: usize) -> Self {
        self.stdout_cap_bytes = Some(bytes);
        self
    }

    pub fn stderr_cap_bytes(mut self, bytes: usize) -> Self {
        self.stderr_cap_bytes = Some(bytes);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(capacity);
        self
    }

    pub fn failure_threshold(mut self, failures: u32) -> Self {
        self.failure_threshold = Some(failures);
        self
    }

    pub fn health_retry_interval(mut self, interval: Duration) -> Self {
        self.health_retry_interval = Some(interval);
        self
    }

    /// Replace the set of enabled languages.
    pub fn profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            max_source_bytes: self.max_source_bytes.unwrap_or(default.max_source_bytes),
            max_timeout: self.max_timeout.unwrap_or(default.max_timeout),
            teardown_grace: self.teardown_grace.unwrap_or(default.teardown_grace),
            max_concurrent: self.max_concurrent.unwrap_or(default.max_concurrent),
            max_per_session: self.max_per_session.unwrap_or(default.max_per_session),
            queue_timeout: self.queue_timeout.unwrap_or(default.queue_timeout),
            max_queue_depth: self.max_queue_depth.unwrap_or(default.max_queue_depth),
            stdout_cap_bytes: self.stdout_cap_bytes.unwrap_or(default.stdout_cap_bytes),
            stderr_cap_bytes: self.stderr_cap_bytes.unwrap_or(default.stderr_cap_bytes),
            event_buffer: self.event_buffer.unwrap_or(default.event_buffer),
            failure_threshold: self.failure_threshold.unwrap_or(default.failure_threshold),
            health_retry_interval: self
                .health_retry_interval
                .unwrap_or(default.health_retry_interval),
            profiles: self.profiles.unwrap_or(default.profiles),
        }
    }
}
