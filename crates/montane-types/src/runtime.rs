//! The contract a pluggable WASM engine must honor.
//!
//! The execution manager never talks to a concrete engine directly; it drives
//! these traits. An adapter is suitable only if it can meter fuel, report
//! traps, and expose linear memory *after* a trap. Engines that invalidate
//! memory on trap must buffer a snapshot to comply.

use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Classification of an in-engine fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    Unreachable,
    OutOfBounds,
    DivisionByZero,
    Generic,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapKind::Unreachable => write!(f, "unreachable"),
            TrapKind::OutOfBounds => write!(f, "out_of_bounds"),
            TrapKind::DivisionByZero => write!(f, "division_by_zero"),
            TrapKind::Generic => write!(f, "generic"),
        }
    }
}

/// One frame of a guest stack trace, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function_index: u32,
    pub function_name: Option<String>,
    pub module_offset: Option<usize>,
}

/// Terminal outcomes an adapter may report.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("trap ({kind}): {detail}")]
    Trap {
        kind: TrapKind,
        detail: String,
        trace: Option<Vec<StackFrame>>,
    },
    #[error("wall-clock deadline exceeded")]
    Timeout,
    #[error("compilation failed: {0}")]
    CompilationFailed(String),
    #[error("instantiation failed: {0}")]
    InstantiationFailed(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("{0}")]
    Other(String),
}

/// Error raised by a host function body. The adapter reports it to the guest
/// as a generic trap rather than letting it escape the call.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HostCallError(pub String);

/// Host-side view of the calling guest, passed to host function bodies.
pub trait GuestContext {
    /// Bounds-checked read of `len` bytes at `ptr` in the guest's linear
    /// memory.
    fn read_guest_memory(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, HostCallError>;
}

/// Implementation of a single host function.
pub type HostFn =
    Arc<dyn Fn(&mut dyn GuestContext, &[Value]) -> Result<Vec<Value>, HostCallError> + Send + Sync>;

/// A host function offered to the guest: signature plus implementation.
#[derive(Clone)]
pub struct HostFunction {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
    pub body: HostFn,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// The exact import namespace offered to a guest:
/// `module name → function name → host function`.
///
/// Built fresh per call from the caller's capability grants; never shared.
#[derive(Clone, Default)]
pub struct ImportTable {
    modules: BTreeMap<String, BTreeMap<String, HostFunction>>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Re-inserting the same `(module, name)` pair
    /// replaces the previous binding, so duplicate grants yield one export.
    pub fn insert(&mut self, module: &str, name: &str, function: HostFunction) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), function);
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&HostFunction> {
        self.modules.get(module)?.get(name)
    }

    /// Iterate all `(module, name, function)` bindings in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &HostFunction)> {
        self.modules.iter().flat_map(|(module, functions)| {
            functions
                .iter()
                .map(move |(name, f)| (module.as_str(), name.as_str(), f))
        })
    }

    /// Total number of function bindings.
    pub fn len(&self) -> usize {
        self.modules.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .iter()
            .map(|(module, name, _)| format!("{module}.{name}"))
            .collect();
        f.debug_tuple("ImportTable").field(&names).finish()
    }
}

/// An export declared by a compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDecl {
    pub name: String,
}

/// An import required by a compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    pub module: String,
    pub name: String,
}

/// Per-call resource quota bound at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallQuota {
    /// Fuel budget charged per guest instruction.
    pub fuel: u64,
    /// Wall-clock deadline; the adapter must interrupt the engine when it
    /// elapses.
    pub timeout: Duration,
}

/// A pluggable WASM engine.
pub trait Runtime: Send + Sync {
    /// Adapter identifier, as used in the `runtime` configuration key.
    fn name(&self) -> &'static str;

    /// Compile and validate a module binary, binding the per-call quota.
    fn compile(&self, bytes: &[u8], quota: CallQuota) -> Result<Box<dyn GuestModule>, RuntimeError>;
}

/// A compiled module, re-instantiable until dropped.
pub trait GuestModule: Send {
    /// Create one execution's instance/store pair. Linear memory is
    /// zero-initialized and the fuel ledger is primed to the quota.
    fn instantiate(&self, imports: &ImportTable) -> Result<Box<dyn GuestInstance>, RuntimeError>;

    /// Exports declared by the module.
    fn exports(&self) -> Vec<ExportDecl>;

    /// Imports required by the module.
    fn imports(&self) -> Vec<ImportDecl>;
}

/// One execution's instance/store pair.
///
/// `fuel_remaining` and `capture_memory` must work at any point after
/// instantiation, including after a trap. `dispose` is idempotent.
pub trait GuestInstance: Send {
    /// Invoke an exported function. Execution is fuel-bounded and subject to
    /// the quota's wall-clock deadline.
    fn call(&mut self, function: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError>;

    /// Current fuel ledger balance; zero once disposed.
    fn fuel_remaining(&self) -> u64;

    /// Snapshot of the complete linear memory. Empty (never an error) when
    /// the module exports no memory or the instance has been disposed.
    fn capture_memory(&self) -> Vec<u8>;

    /// Release engine resources. Safe to call more than once.
    fn dispose(&mut self);
}
