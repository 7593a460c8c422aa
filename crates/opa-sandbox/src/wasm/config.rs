//! Configuration for the policy sandbox engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the policy sandbox runtime.
///
/// Tunes the underlying engine; per-policy state (data documents, heap
/// checkpoints) lives on [`crate::OpaPolicy`], not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaConfig {
    /// Maximum linear memory in bytes a single policy instance may grow to
    pub max_memory: usize,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Enable epoch-based interruption
    pub epoch_interruption: bool,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Cache compiled modules to disk
    pub cache_path: Option<PathBuf>,
}

impl Default for OpaConfig {
    fn default() -> Self {
        Self {
            max_memory: 256 * 1024 * 1024, // 256 MB
            fuel_limit: None,
            epoch_interruption: false,
            optimization_level: 2,
            cache_path: None,
        }
    }
}

impl OpaConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable epoch interruption
    pub fn epoch_interruption(mut self, enable: bool) -> Self {
        self.epoch_interruption = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }
}
