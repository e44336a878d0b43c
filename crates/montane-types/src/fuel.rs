//! Fuel policy: defaults, complexity tiers, and budget validation.
//!
//! Fuel is a synthetic currency charged per guest instruction. Every call
//! runs under a finite budget; exhaustion halts the guest deterministically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest fuel budget a caller may request.
pub const MAX_FUEL: u64 = 100_000_000;

/// Budget used when the caller omits `fuel`.
pub const DEFAULT_FUEL: u64 = 100_000;

/// Wall-clock deadline used when the caller omits `timeout_ms`.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Rough complexity classification used to pick a fuel budget without
/// measuring the workload first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Heavy,
}

impl ComplexityTier {
    /// Fuel budget associated with the tier.
    pub fn fuel(&self) -> u64 {
        match self {
            ComplexityTier::Trivial => 1_000,
            ComplexityTier::Simple => 10_000,
            ComplexityTier::Moderate => 100_000,
            ComplexityTier::Complex => 1_000_000,
            ComplexityTier::Heavy => 10_000_000,
        }
    }
}

/// Fuel budget for a complexity tier.
pub fn fuel_for(tier: ComplexityTier) -> u64 {
    tier.fuel()
}

/// Rejected fuel budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FuelError {
    /// Zero fuel would reject every call before the first instruction.
    #[error("fuel budget must be positive")]
    NotPositive,
    #[error("fuel budget {0} exceeds maximum {MAX_FUEL}")]
    ExceedsMaximum(u64),
}

/// Validate a caller-supplied fuel budget.
pub fn validate_fuel(fuel: u64) -> Result<(), FuelError> {
    if fuel == 0 {
        return Err(FuelError::NotPositive);
    }
    if fuel > MAX_FUEL {
        return Err(FuelError::ExceedsMaximum(fuel));
    }
    Ok(())
}
