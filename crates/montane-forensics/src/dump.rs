//! The forensic dump value object.

use chrono::{DateTime, Utc};
use montane_types::runtime::{StackFrame, TrapKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// WASM linear memory page size. A dump's memory is always a whole number of
/// pages, or empty.
pub const PAGE_SIZE: usize = 65_536;

/// Why an execution did not return a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FailureReason {
    /// The fuel budget ran out before the guest returned.
    FuelExhausted,
    /// The guest hit an in-engine fatal condition.
    Trap { kind: TrapKind, detail: String },
    /// The module binary did not compile.
    CompilationFailed(String),
    /// The module compiled but could not be instantiated.
    InstantiationFailed(String),
    /// The wall-clock deadline elapsed and the engine was interrupted.
    Timeout,
    /// A call parameter was rejected before the engine was involved.
    InvalidArgument(String),
    /// The bound runtime does not support a required operation.
    NotImplemented(String),
    /// Adapter-specific failure, passed through verbatim.
    Other(String),
}

impl FailureReason {
    /// Stable reason atom callers may switch on.
    pub fn atom(&self) -> &'static str {
        match self {
            FailureReason::FuelExhausted => "fuel_exhausted",
            FailureReason::Trap { .. } => "trap",
            FailureReason::CompilationFailed(_) => "compilation_failed",
            FailureReason::InstantiationFailed(_) => "instantiation_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::InvalidArgument(_) => "invalid_argument",
            FailureReason::NotImplemented(_) => "not_implemented",
            FailureReason::Other(_) => "other",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::FuelExhausted => write!(f, "fuel_exhausted"),
            FailureReason::Trap { kind, detail } => write!(f, "trap({kind}): {detail}"),
            FailureReason::CompilationFailed(detail) => {
                write!(f, "compilation_failed: {detail}")
            }
            FailureReason::InstantiationFailed(detail) => {
                write!(f, "instantiation_failed: {detail}")
            }
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::InvalidArgument(detail) => write!(f, "invalid_argument: {detail}"),
            FailureReason::NotImplemented(detail) => write!(f, "not_implemented: {detail}"),
            FailureReason::Other(detail) => write!(f, "other: {detail}"),
        }
    }
}

/// Post-mortem record of a failed execution.
///
/// Immutable after construction: dumps are built only by the capture path or
/// the codec, and every analyser operation is read-only. `memory` is the
/// final linear memory (whole pages or empty); arguments are retained only as
/// a SHA-256 hash so secrets never land in a dump file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForensicDump {
    /// 16 random bytes, hex-encoded.
    pub id: String,
    /// UTC wall clock at capture.
    pub timestamp: DateTime<Utc>,
    pub reason: FailureReason,
    /// Snapshot of linear memory at failure; may be empty.
    #[serde(skip)]
    pub memory: Vec<u8>,
    pub fuel_remaining: u64,
    pub fuel_allocated: u64,
    pub function_called: String,
    /// SHA-256 over the canonical encoding of the argument list.
    pub args_hash: [u8; 32],
    pub execution_time_us: u64,
    pub stack_trace: Option<Vec<StackFrame>>,
}

impl ForensicDump {
    /// Number of whole 64 KiB pages in the memory snapshot.
    pub fn memory_pages(&self) -> usize {
        self.memory.len() / PAGE_SIZE
    }

    /// Single-line rendering suitable for logs.
    pub fn summary(&self) -> String {
        let fuel_pct = if self.fuel_allocated > 0 {
            self.fuel_remaining as f64 / self.fuel_allocated as f64 * 100.0
        } else {
            0.0
        };
        format!(
            "dump {} function={} reason={} time={}us fuel_remaining={:.1}% memory={}KiB",
            self.id,
            self.function_called,
            self.reason,
            self.execution_time_us,
            fuel_pct,
            self.memory.len() / 1024,
        )
    }
}
