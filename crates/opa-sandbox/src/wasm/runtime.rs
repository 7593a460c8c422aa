//! Engine and module loading.
//!
//! Compilation is separated from instantiation so one compiled module can
//! back many independent [`crate::OpaPolicy`] instances.

use super::config::OpaConfig;
use crate::error::{OpaError, Result};

use std::path::Path;

use wasmtime::*;

/// A policy sandbox: one configured engine, shared by every policy
/// instantiated through it.
pub struct OpaSandbox {
    engine: Engine,
    config: OpaConfig,
}

/// A compiled policy module.
///
/// Cheap to share; instantiating it repeatedly does not repeat compilation.
#[derive(Debug)]
pub struct OpaModule {
    pub(crate) module: Module,
    name: String,
}

impl OpaSandbox {
    /// Create a new policy sandbox with the given configuration.
    pub fn new(config: OpaConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        if config.epoch_interruption {
            engine_config.epoch_interruption(true);
        }

        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| OpaError::Wasm(format!("engine creation failed: {}", e)))?;

        Ok(Self { engine, config })
    }

    /// Load a policy module from a `.wasm` file on disk.
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<OpaModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("policy")
            .to_string();

        let module = Module::from_file(&self.engine, path)
            .map_err(|e| OpaError::Compilation(format!("{}", e)))?;

        Ok(OpaModule { module, name })
    }

    /// Load a policy module from an in-memory byte buffer (e.g. a cache or
    /// bundle, rather than disk).
    pub fn load_module_bytes(&self, name: &str, bytes: impl AsRef<[u8]>) -> Result<OpaModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| OpaError::Compilation(format!("{}", e)))?;

        Ok(OpaModule {
            module,
            name: name.to_string(),
        })
    }

    /// Get the engine handle.
    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the configuration.
    pub fn config(&self) -> &OpaConfig {
        &self.config
    }
}

impl OpaModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }
}
