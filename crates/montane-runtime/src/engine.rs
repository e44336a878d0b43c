//! Execution manager: the compile → instantiate → invoke → capture → dispose
//! lifecycle.
//!
//! Every call runs in a fresh instance and ends in exactly one of two shapes:
//! a result with accounting metadata, or a crash carrying a forensic dump.
//! Nothing escapes as a panic or an opaque error, and the instance is
//! disposed exactly once on every exit path.

use crate::host_functions::build_import_table;
use crate::meter::FuelMeter;
use crate::wasmtime_runtime::WasmtimeRuntime;
use montane_forensics::capture::{capture, capture_minimal, DumpContext};
use montane_forensics::dump::{FailureReason, ForensicDump};
use montane_types::capability::CapabilitySet;
use montane_types::config::EngineConfig;
use montane_types::error::EngineError;
use montane_types::fuel::validate_fuel;
use montane_types::runtime::{CallQuota, GuestInstance, Runtime, RuntimeError, StackFrame};
use montane_types::value::{hash_args, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Resolve a runtime adapter by its configuration identifier.
pub fn runtime_for(name: &str) -> Result<Arc<dyn Runtime>, EngineError> {
    match name {
        "wasmtime" => Ok(Arc::new(WasmtimeRuntime::new())),
        other => Err(EngineError::UnknownRuntime(other.to_string())),
    }
}

/// Per-call overrides. Omitted fields fall back to the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub fuel: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub capabilities: CapabilitySet,
}

/// Accounting metadata for a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMetadata {
    pub fuel_remaining: u64,
    pub execution_time_us: u64,
    pub memory_high_water_bytes: usize,
}

/// A successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub results: Vec<Value>,
    pub metadata: CallMetadata,
}

/// A failed call: the stable reason plus the post-mortem.
#[derive(Debug, Clone, PartialEq)]
pub struct Crash {
    pub reason: FailureReason,
    pub dump: ForensicDump,
}

impl Crash {
    /// Stable reason atom callers may switch on.
    pub fn atom(&self) -> &'static str {
        self.reason.atom()
    }
}

/// Static requirements checked by [`SandboxEngine::validate`].
#[derive(Debug, Clone, Default)]
pub struct ModuleRequirements {
    /// Export names that must be present.
    pub required_exports: Vec<String>,
    /// When set, every import's `module.name` must appear here.
    pub allowed_imports: Option<Vec<String>>,
}

/// Validation failures. Reported without attempting execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    #[error("compilation failed: {0}")]
    CompilationFailed(String),
    #[error("missing required export: {0}")]
    MissingExport(String),
    #[error("import not allowed: {0}")]
    DisallowedImport(String),
}

/// The sandbox engine. Create one per process and share it freely; calls are
/// independent and may run concurrently.
pub struct SandboxEngine {
    runtime: Arc<dyn Runtime>,
    config: EngineConfig,
    meter: Option<Arc<FuelMeter>>,
}

impl SandboxEngine {
    /// Bind the adapter named by `config.runtime`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let runtime = runtime_for(&config.runtime)?;
        Ok(Self {
            runtime,
            config,
            meter: None,
        })
    }

    /// Bind an explicit adapter (used by tests to inject a double).
    pub fn with_runtime(runtime: Arc<dyn Runtime>, config: EngineConfig) -> Self {
        Self {
            runtime,
            config,
            meter: None,
        }
    }

    /// Attach an opt-in fuel accounting sidecar.
    pub fn with_meter(mut self, meter: Arc<FuelMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `function` from `bytes` in a fresh, fully attenuated instance.
    ///
    /// The CPU-bound engine work runs on a blocking thread; the future
    /// resolves when the guest returns, traps, exhausts its fuel, or is
    /// interrupted at the deadline.
    pub async fn fire(
        &self,
        bytes: &[u8],
        function: &str,
        args: &[Value],
        opts: CallOptions,
    ) -> Result<Execution, Crash> {
        let fuel = opts.fuel.unwrap_or(self.config.default_fuel);
        let args_hash = hash_args(args);
        let function_name = function.to_string();

        let runtime = Arc::clone(&self.runtime);
        let meter = self.meter.clone();
        let config = self.config.clone();
        let bytes = bytes.to_vec();
        let args = args.to_vec();
        let task_function = function_name.clone();

        let joined = tokio::task::spawn_blocking(move || {
            fire_guarded(
                runtime.as_ref(),
                meter.as_deref(),
                &config,
                &bytes,
                &task_function,
                &args,
                &opts,
            )
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => {
                let reason = FailureReason::Other(format!("host task failed: {e}"));
                let dump = capture_minimal(DumpContext {
                    reason: reason.clone(),
                    fuel_allocated: fuel,
                    function_called: function_name,
                    args_hash,
                    execution_time_us: 0,
                    stack_trace: None,
                });
                Err(Crash { reason, dump })
            }
        }
    }

    /// Synchronous variant of [`SandboxEngine::fire`].
    pub fn fire_blocking(
        &self,
        bytes: &[u8],
        function: &str,
        args: &[Value],
        opts: CallOptions,
    ) -> Result<Execution, Crash> {
        fire_guarded(
            self.runtime.as_ref(),
            self.meter.as_deref(),
            &self.config,
            bytes,
            function,
            args,
            &opts,
        )
    }

    /// Compile `bytes` and check it against static requirements, without
    /// executing anything.
    pub fn validate(
        &self,
        bytes: &[u8],
        requirements: &ModuleRequirements,
    ) -> Result<(), ValidateError> {
        let quota = CallQuota {
            fuel: self.config.default_fuel,
            timeout: Duration::from_millis(self.config.default_timeout_ms),
        };
        let module = self
            .runtime
            .compile(bytes, quota)
            .map_err(|e| ValidateError::CompilationFailed(e.to_string()))?;

        let exports = module.exports();
        for required in &requirements.required_exports {
            if !exports.iter().any(|export| &export.name == required) {
                return Err(ValidateError::MissingExport(required.clone()));
            }
        }

        if let Some(allowed) = &requirements.allowed_imports {
            for import in module.imports() {
                let qualified = format!("{}.{}", import.module, import.name);
                if !allowed.contains(&qualified) {
                    return Err(ValidateError::DisallowedImport(qualified));
                }
            }
        }

        Ok(())
    }
}

/// Disposes the wrapped instance exactly once, on every exit path, normal
/// return or unwind alike.
struct InstanceGuard {
    instance: Box<dyn GuestInstance>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.instance.dispose();
    }
}

/// Last-resort panic shield around the whole lifecycle. A panic that unwinds
/// past the per-call handling still becomes a crash, never an escape.
fn fire_guarded(
    runtime: &dyn Runtime,
    meter: Option<&FuelMeter>,
    config: &EngineConfig,
    bytes: &[u8],
    function: &str,
    args: &[Value],
    opts: &CallOptions,
) -> Result<Execution, Crash> {
    match catch_unwind(AssertUnwindSafe(|| {
        fire_inner(runtime, meter, config, bytes, function, args, opts)
    })) {
        Ok(result) => result,
        Err(panic) => {
            let reason = FailureReason::Other(format!("host panic: {}", panic_detail(&*panic)));
            let dump = capture_minimal(DumpContext {
                reason: reason.clone(),
                fuel_allocated: opts.fuel.unwrap_or(config.default_fuel),
                function_called: function.to_string(),
                args_hash: hash_args(args),
                execution_time_us: 0,
                stack_trace: None,
            });
            warn!(function, reason = %reason, "Call aborted by host panic");
            Err(Crash { reason, dump })
        }
    }
}

fn fire_inner(
    runtime: &dyn Runtime,
    meter: Option<&FuelMeter>,
    config: &EngineConfig,
    bytes: &[u8],
    function: &str,
    args: &[Value],
    opts: &CallOptions,
) -> Result<Execution, Crash> {
    let args_hash = hash_args(args);
    let fuel = opts.fuel.unwrap_or(config.default_fuel);
    let timeout_ms = opts.timeout_ms.unwrap_or(config.default_timeout_ms);

    if let Err(e) = validate_fuel(fuel) {
        let reason = FailureReason::InvalidArgument(e.to_string());
        let dump = capture_minimal(DumpContext {
            reason: reason.clone(),
            fuel_allocated: fuel,
            function_called: function.to_string(),
            args_hash,
            execution_time_us: 0,
            stack_trace: None,
        });
        return Err(Crash { reason, dump });
    }

    let quota = CallQuota {
        fuel,
        timeout: Duration::from_millis(timeout_ms),
    };
    let started = Instant::now();
    debug!(function, fuel, timeout_ms, "Starting guest call");

    let module = match runtime.compile(bytes, quota) {
        Ok(module) => module,
        Err(error) => {
            let (reason, _) = reason_for(error);
            let dump = capture_minimal(DumpContext {
                reason: reason.clone(),
                fuel_allocated: fuel,
                function_called: function.to_string(),
                args_hash,
                execution_time_us: elapsed_us(started),
                stack_trace: None,
            });
            warn!(function, reason = %reason, "Guest compilation failed");
            return Err(Crash { reason, dump });
        }
    };

    let imports = build_import_table(&opts.capabilities);

    let instance = match module.instantiate(&imports) {
        Ok(instance) => instance,
        Err(error) => {
            let (reason, _) = reason_for(error);
            let dump = capture_minimal(DumpContext {
                reason: reason.clone(),
                fuel_allocated: fuel,
                function_called: function.to_string(),
                args_hash,
                execution_time_us: elapsed_us(started),
                stack_trace: None,
            });
            warn!(function, reason = %reason, "Guest instantiation failed");
            return Err(Crash { reason, dump });
        }
    };
    let mut guard = InstanceGuard { instance };

    let outcome = catch_unwind(AssertUnwindSafe(|| guard.instance.call(function, args)));
    let execution_time_us = elapsed_us(started);

    match outcome {
        Ok(Ok(results)) => {
            let memory_high_water_bytes = guard.instance.capture_memory().len();
            let fuel_remaining = guard.instance.fuel_remaining();
            if let Some(meter) = meter {
                meter.record(function, fuel.saturating_sub(fuel_remaining));
            }
            debug!(function, fuel_remaining, execution_time_us, "Guest call succeeded");
            Ok(Execution {
                results,
                metadata: CallMetadata {
                    fuel_remaining,
                    execution_time_us,
                    memory_high_water_bytes,
                },
            })
        }
        Ok(Err(error)) => {
            let (reason, stack_trace) = reason_for(error);
            let dump = capture(
                guard.instance.as_ref(),
                DumpContext {
                    reason: reason.clone(),
                    fuel_allocated: fuel,
                    function_called: function.to_string(),
                    args_hash,
                    execution_time_us,
                    stack_trace,
                },
            );
            if let Some(meter) = meter {
                meter.record(function, fuel.saturating_sub(dump.fuel_remaining));
            }
            warn!(function, reason = %reason, dump = %dump.id, "Guest call failed");
            Err(Crash { reason, dump })
        }
        Err(panic) => {
            let reason = FailureReason::Other(format!("host panic: {}", panic_detail(&*panic)));
            let dump = capture(
                guard.instance.as_ref(),
                DumpContext {
                    reason: reason.clone(),
                    fuel_allocated: fuel,
                    function_called: function.to_string(),
                    args_hash,
                    execution_time_us,
                    stack_trace: None,
                },
            );
            warn!(function, reason = %reason, dump = %dump.id, "Guest call panicked on the host side");
            Err(Crash { reason, dump })
        }
    }
}

fn reason_for(error: RuntimeError) -> (FailureReason, Option<Vec<StackFrame>>) {
    match error {
        RuntimeError::FuelExhausted => (FailureReason::FuelExhausted, None),
        RuntimeError::Trap {
            kind,
            detail,
            trace,
        } => (FailureReason::Trap { kind, detail }, trace),
        RuntimeError::Timeout => (FailureReason::Timeout, None),
        RuntimeError::CompilationFailed(detail) => (FailureReason::CompilationFailed(detail), None),
        RuntimeError::InstantiationFailed(detail) => {
            (FailureReason::InstantiationFailed(detail), None)
        }
        RuntimeError::NotImplemented(detail) => (FailureReason::NotImplemented(detail), None),
        RuntimeError::Other(detail) => (FailureReason::Other(detail), None),
    }
}

fn elapsed_us(started: Instant) -> u64 {
    started.elapsed().as_micros() as u64
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use montane_types::runtime::{ExportDecl, GuestModule, ImportDecl, ImportTable, TrapKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAGE: usize = 65_536;

    #[derive(Clone)]
    enum Script {
        CompileFails,
        InstantiateFails,
        CallOk(Vec<Value>),
        CallErr(RuntimeError),
        CallPanics,
    }

    struct StubRuntime {
        script: Script,
        disposals: Arc<AtomicUsize>,
    }

    impl StubRuntime {
        fn new(script: Script) -> (Arc<Self>, Arc<AtomicUsize>) {
            let disposals = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    script,
                    disposals: Arc::clone(&disposals),
                }),
                disposals,
            )
        }
    }

    impl Runtime for StubRuntime {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn compile(
            &self,
            _bytes: &[u8],
            _quota: CallQuota,
        ) -> Result<Box<dyn GuestModule>, RuntimeError> {
            match &self.script {
                Script::CompileFails => Err(RuntimeError::CompilationFailed(
                    "magic header mismatch".to_string(),
                )),
                script => Ok(Box::new(StubModule {
                    script: script.clone(),
                    disposals: Arc::clone(&self.disposals),
                })),
            }
        }
    }

    struct StubModule {
        script: Script,
        disposals: Arc<AtomicUsize>,
    }

    impl GuestModule for StubModule {
        fn instantiate(
            &self,
            _imports: &ImportTable,
        ) -> Result<Box<dyn GuestInstance>, RuntimeError> {
            match &self.script {
                Script::InstantiateFails => Err(RuntimeError::InstantiationFailed(
                    "missing import env.get_time_ms".to_string(),
                )),
                script => Ok(Box::new(StubInstance {
                    script: script.clone(),
                    disposals: Arc::clone(&self.disposals),
                })),
            }
        }

        fn exports(&self) -> Vec<ExportDecl> {
            vec![ExportDecl {
                name: "run".to_string(),
            }]
        }

        fn imports(&self) -> Vec<ImportDecl> {
            Vec::new()
        }
    }

    struct StubInstance {
        script: Script,
        disposals: Arc<AtomicUsize>,
    }

    impl GuestInstance for StubInstance {
        fn call(&mut self, _function: &str, _args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
            match &self.script {
                Script::CallOk(results) => Ok(results.clone()),
                Script::CallErr(error) => Err(error.clone()),
                Script::CallPanics => panic!("adapter exploded"),
                _ => unreachable!("compile/instantiate scripts never reach call"),
            }
        }

        fn fuel_remaining(&self) -> u64 {
            400
        }

        fn capture_memory(&self) -> Vec<u8> {
            vec![0xCD; PAGE]
        }

        fn dispose(&mut self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine_with(script: Script) -> (SandboxEngine, Arc<AtomicUsize>) {
        let (runtime, disposals) = StubRuntime::new(script);
        (
            SandboxEngine::with_runtime(runtime, EngineConfig::default()),
            disposals,
        )
    }

    #[test]
    fn test_success_metadata_and_single_disposal() {
        let (engine, disposals) = engine_with(Script::CallOk(vec![Value::I32(42)]));
        let execution = engine
            .fire_blocking(b"wasm", "run", &[Value::I32(1)], CallOptions::default())
            .unwrap();
        assert_eq!(execution.results, vec![Value::I32(42)]);
        assert_eq!(execution.metadata.fuel_remaining, 400);
        assert_eq!(execution.metadata.memory_high_water_bytes, PAGE);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fuel_exhaustion_produces_drained_dump() {
        let (engine, disposals) = engine_with(Script::CallErr(RuntimeError::FuelExhausted));
        let crash = engine
            .fire_blocking(b"wasm", "spin", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.atom(), "fuel_exhausted");
        assert_eq!(crash.dump.fuel_remaining, 0);
        assert_eq!(crash.dump.memory.len(), PAGE);
        assert_eq!(crash.dump.function_called, "spin");
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trap_reason_carries_kind_and_trace() {
        let trace = vec![StackFrame {
            function_index: 2,
            function_name: Some("boom".to_string()),
            module_offset: Some(0x40),
        }];
        let (engine, _) = engine_with(Script::CallErr(RuntimeError::Trap {
            kind: TrapKind::Unreachable,
            detail: "wasm trap: unreachable".to_string(),
            trace: Some(trace.clone()),
        }));
        let crash = engine
            .fire_blocking(b"wasm", "boom", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.atom(), "trap");
        assert!(matches!(
            crash.reason,
            FailureReason::Trap {
                kind: TrapKind::Unreachable,
                ..
            }
        ));
        assert_eq!(crash.dump.stack_trace, Some(trace));
    }

    #[test]
    fn test_timeout_reason() {
        let (engine, _) = engine_with(Script::CallErr(RuntimeError::Timeout));
        let crash = engine
            .fire_blocking(b"wasm", "slow", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.atom(), "timeout");
    }

    #[test]
    fn test_compile_failure_yields_minimal_dump() {
        let (engine, disposals) = engine_with(Script::CompileFails);
        let crash = engine
            .fire_blocking(b"junk", "run", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.atom(), "compilation_failed");
        assert!(crash.dump.memory.is_empty());
        assert_eq!(crash.dump.fuel_remaining, 0);
        // No instance was ever created.
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_instantiation_failure_yields_minimal_dump() {
        let (engine, disposals) = engine_with(Script::InstantiateFails);
        let crash = engine
            .fire_blocking(b"wasm", "run", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.atom(), "instantiation_failed");
        assert!(crash.dump.memory.is_empty());
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_host_panic_becomes_crash_and_disposes_once() {
        let (engine, disposals) = engine_with(Script::CallPanics);
        let crash = engine
            .fire_blocking(b"wasm", "run", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.atom(), "other");
        assert!(crash.dump.summary().contains("host panic"));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_fuel_rejected_before_engine() {
        let (engine, disposals) = engine_with(Script::CallOk(vec![]));
        for fuel in [0u64, 100_000_001] {
            let crash = engine
                .fire_blocking(
                    b"wasm",
                    "run",
                    &[],
                    CallOptions {
                        fuel: Some(fuel),
                        ..Default::default()
                    },
                )
                .unwrap_err();
            assert_eq!(crash.atom(), "invalid_argument");
            assert!(crash.dump.memory.is_empty());
        }
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_defaults_come_from_config() {
        let (runtime, _) = StubRuntime::new(Script::CallErr(RuntimeError::Timeout));
        let config = EngineConfig {
            default_fuel: 77_000,
            ..Default::default()
        };
        let engine = SandboxEngine::with_runtime(runtime, config);
        let crash = engine
            .fire_blocking(b"wasm", "run", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.dump.fuel_allocated, 77_000);
    }

    #[test]
    fn test_args_hash_lands_in_dump() {
        let (engine, _) = engine_with(Script::CallErr(RuntimeError::FuelExhausted));
        let args = [Value::I32(42)];
        let crash = engine
            .fire_blocking(b"wasm", "run", &args, CallOptions::default())
            .unwrap_err();
        assert_eq!(crash.dump.args_hash, hash_args(&args));
    }

    #[test]
    fn test_meter_records_success_and_failure() {
        let meter = Arc::new(FuelMeter::new());
        let (runtime, _) = StubRuntime::new(Script::CallOk(vec![]));
        let engine = SandboxEngine::with_runtime(runtime, EngineConfig::default())
            .with_meter(Arc::clone(&meter));
        engine
            .fire_blocking(b"wasm", "run", &[], CallOptions::default())
            .unwrap();
        // Stub leaves 400 of the default 100_000.
        assert_eq!(meter.stats_for("run").unwrap().last, 99_600);

        let (runtime, _) = StubRuntime::new(Script::CallErr(RuntimeError::FuelExhausted));
        let engine = SandboxEngine::with_runtime(runtime, EngineConfig::default())
            .with_meter(Arc::clone(&meter));
        engine
            .fire_blocking(b"wasm", "spin", &[], CallOptions::default())
            .unwrap_err();
        assert_eq!(meter.stats_for("spin").unwrap().last, 100_000);
    }

    #[test]
    fn test_validate_checks_exports_and_imports() {
        let (engine, _) = engine_with(Script::CallOk(vec![]));
        assert!(engine
            .validate(
                b"wasm",
                &ModuleRequirements {
                    required_exports: vec!["run".to_string()],
                    allowed_imports: None,
                }
            )
            .is_ok());
        assert_eq!(
            engine.validate(
                b"wasm",
                &ModuleRequirements {
                    required_exports: vec!["missing".to_string()],
                    allowed_imports: None,
                }
            ),
            Err(ValidateError::MissingExport("missing".to_string()))
        );
    }

    #[test]
    fn test_unknown_runtime_rejected_at_init() {
        let config = EngineConfig {
            runtime: "wamr".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SandboxEngine::new(config),
            Err(EngineError::UnknownRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_async_fire_matches_blocking() {
        let (engine, _) = engine_with(Script::CallOk(vec![Value::I64(7)]));
        let execution = engine
            .fire(b"wasm", "run", &[], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(execution.results, vec![Value::I64(7)]);
    }
}
