//! Compiled Wasm module caching.
//!
//! Compiling an interpreter module takes far longer than running a short
//! guest, so modules are compiled once per path and shared across sandboxes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use wasmtime::{Engine, Module};

use crate::error::{Result, SandboxError};

/// A thread-safe cache of compiled modules keyed by canonical path.
///
/// # Example
///
/// ```rust,ignore
/// use code_sandbox_engine::sandbox::cache::{ModuleCache, SharedEngine};
///
/// let engine = SharedEngine::new()?;
/// let cache = ModuleCache::new();
///
/// let first = cache.get_or_compile(&engine, "assets/rustpython.wasm")?;
/// let second = cache.get_or_compile(&engine, "./assets/../assets/rustpython.wasm")?;
/// assert!(Arc::ptr_eq(&first, &second));
/// ```
#[derive(Debug, Default)]
pub struct ModuleCache {
    cache: RwLock<HashMap<PathBuf, Arc<Module>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached module or compile it if not present.
    ///
    /// The path is canonicalized first so relative paths and symlinks share
    /// one entry.
    ///
    /// # Arguments
    ///
    /// * `engine` - Engine the module is compiled for; it must be the engine
    ///   the module is later instantiated on
    /// * `path` - Path to the `.wasm` file
    ///
    /// # Returns
    ///
    /// The shared compiled module, [`SandboxError::Config`] when the file does
    /// not exist, or a runtime failure when it does not compile.
    pub fn get_or_compile(&self, engine: &Engine, path: impl AsRef<Path>) -> Result<Arc<Module>> {
        let path = path.as_ref();
        let canonical_path = std::fs::canonicalize(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::Config(format!("wasm module not found: {}", path.display()))
            } else {
                SandboxError::Io(e)
            }
        })?;

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(module) = cache.get(&canonical_path) {
                return Ok(Arc::clone(module));
            }
        }

        // Compile outside any lock.
        let wasm_bytes = std::fs::read(&canonical_path)?;
        let module = Module::new(engine, &wasm_bytes).map_err(|e| {
            SandboxError::RuntimeFailure(e.context(format!(
                "failed to compile {}",
                canonical_path.display()
            )))
        })?;
        let module = Arc::new(module);

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        // Another thread may have compiled it meanwhile.
        if let Some(existing) = cache.get(&canonical_path) {
            return Ok(Arc::clone(existing));
        }
        cache.insert(canonical_path, Arc::clone(&module));
        tracing::debug!(path = %path.display(), "wasm module compiled and cached");
        Ok(module)
    }

    /// Check if a module is cached.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        match std::fs::canonicalize(path.as_ref()) {
            Ok(canonical) => self
                .cache
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&canonical),
            Err(_) => false,
        }
    }

    /// Drop every cached module.
    pub fn clear(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An epoch-interruptible engine shared by every Wasm sandbox.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEngine")
            .field("engine", &"<wasmtime::Engine>")
            .finish()
    }
}

impl SharedEngine {
    /// Create an engine with epoch interruption enabled.
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        Self::from_config(&config)
    }

    /// Create an engine from a custom configuration.
    ///
    /// The configuration must enable epoch interruption, otherwise sandboxes
    /// cannot be killed.
    pub fn from_config(config: &wasmtime::Config) -> Result<Self> {
        let engine = Engine::new(config).map_err(SandboxError::RuntimeFailure)?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn arc(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }
}

impl std::ops::Deref for SharedEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_cache_new() {
        let cache = ModuleCache::new();
        assert!(cache.is_empty());
        assert!(!cache.contains("does/not/exist.wasm"));
    }

    #[test]
    fn test_missing_module_is_config_error() {
        let engine = SharedEngine::new().unwrap();
        let err = ModuleCache::new()
            .get_or_compile(&engine, "does/not/exist.wasm")
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn test_compiles_once() {
        let engine = SharedEngine::new().unwrap();
        let dir = std::env::temp_dir().join(format!("module-cache-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.wasm");
        // Smallest valid module: magic number and version.
        std::fs::write(&path, b"\0asm\x01\0\0\0").unwrap();

        let cache = ModuleCache::new();
        let first = cache.get_or_compile(&engine, &path).unwrap();
        let second = cache.get_or_compile(&engine, &path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_shared_engine_clone() {
        let engine1 = SharedEngine::new().unwrap();
        let engine2 = engine1.clone();
        assert!(Arc::ptr_eq(&engine1.arc(), &engine2.arc()));
        engine1.increment_epoch();
    }
}
