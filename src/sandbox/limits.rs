//! Resource ceilings applied to every sandbox.

use serde::{Deserialize, Serialize};

/// Mandatory resource ceilings for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Memory ceiling in bytes (swap included).
    pub memory_bytes: u64,
    /// CPU share in units of 10^-9 CPUs.
    pub nano_cpus: u64,
    /// Maximum number of processes and threads.
    pub max_processes: u32,
    /// Maximum number of open file descriptors.
    pub max_open_files: u32,
    /// Size of the writable temporary filesystem in bytes.
    pub tmpfs_bytes: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024, // 128MB
            nano_cpus: 500_000_000,          // half a CPU
            max_processes: 50,
            max_open_files: 100,
            tmpfs_bytes: 50 * 1024 * 1024,
        }
    }
}

impl SandboxLimits {
    /// Limits for compiled languages, which need headroom for the toolchain.
    pub fn compiled() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 750_000_000,
            ..Self::default()
        }
    }

    /// Whether every ceiling is non-zero.
    pub fn is_bounded(&self) -> bool {
        self.memory_bytes > 0
            && self.nano_cpus > 0
            && self.max_processes > 0
            && self.max_open_files > 0
            && self.tmpfs_bytes > 0
    }
}

/// Resource limiter that enforces memory and table size limits on a Wasm store.
#[cfg(feature = "wasm")]
pub struct StoreLimiter {
    max_memory: u64,
    peak_memory: u64,
    max_table_elements: u64,
    limit_exceeded: bool,
}

#[cfg(feature = "wasm")]
impl StoreLimiter {
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            peak_memory: 0,
            max_table_elements: 10_000,
            limit_exceeded: false,
        }
    }

    /// Check if any limit has been hit.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    /// Highest linear-memory size granted so far.
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }
}

#[cfg(feature = "wasm")]
impl wasmtime::ResourceLimiter for StoreLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired_bytes = desired as u64;
        if desired_bytes > self.max_memory {
            self.limit_exceeded = true;
            return Ok(false);
        }
        self.peak_memory = self.peak_memory.max(desired_bytes);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired as u64 > self.max_table_elements {
            self.limit_exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_bounded() {
        let limits = SandboxLimits::default();
        assert!(limits.is_bounded());
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.max_processes, 50);
    }

    #[test]
    fn test_zero_ceiling_is_unbounded() {
        let limits = SandboxLimits {
            max_open_files: 0,
            ..SandboxLimits::default()
        };
        assert!(!limits.is_bounded());
    }

    #[cfg(feature = "wasm")]
    #[test]
    fn test_limiter_denies_over_limit() {
        use wasmtime::ResourceLimiter;

        let mut limiter = StoreLimiter::new(1024 * 1024);
        assert!(limiter.memory_growing(0, 512 * 1024, None).unwrap());
        assert!(!limiter.limit_exceeded());
        assert_eq!(limiter.peak_memory(), 512 * 1024);

        assert!(!limiter.memory_growing(0, 2 * 1024 * 1024, None).unwrap());
        assert!(limiter.limit_exceeded());
    }
}
