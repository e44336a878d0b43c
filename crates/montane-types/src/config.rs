//! Process-wide engine configuration, read once at initialization.

use crate::fuel::{DEFAULT_FUEL, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};

/// Engine configuration with per-call override points.
///
/// `default_fuel` and `default_timeout_ms` apply when the caller omits the
/// matching call option; `runtime` selects the adapter bound at engine
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Runtime adapter identifier (see `runtime_for`).
    pub runtime: String,
    /// Fuel budget used when the caller omits `fuel`.
    pub default_fuel: u64,
    /// Wall-clock deadline used when the caller omits `timeout_ms`.
    pub default_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: "wasmtime".to_string(),
            default_fuel: DEFAULT_FUEL,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}
