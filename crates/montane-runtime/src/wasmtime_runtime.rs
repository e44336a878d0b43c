//! Wasmtime binding for the runtime contract.
//!
//! Every call gets its own `Engine`: fuel metering and epoch interruption are
//! per-call concerns, and a private engine guarantees that a watchdog epoch
//! bump can never interrupt a neighbouring call. Raw engine errors are
//! classified into the contract's terminal outcomes: structured trap codes
//! first, the priority-ordered string classifier as fallback.

use montane_types::runtime::{
    CallQuota, ExportDecl, GuestContext, GuestInstance, GuestModule, HostCallError, ImportDecl,
    ImportTable, Runtime, RuntimeError, StackFrame, TrapKind,
};
use montane_types::value::{Value, ValueType};
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use wasmtime::{
    Caller, Config, Engine, FuncType, Instance, Linker, Memory, Module, OptLevel, Store, Trap, Val,
    ValType, WasmBacktrace,
};

/// The statically bound default adapter.
pub struct WasmtimeRuntime;

impl WasmtimeRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WasmtimeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for WasmtimeRuntime {
    fn name(&self) -> &'static str {
        "wasmtime"
    }

    fn compile(
        &self,
        bytes: &[u8],
        quota: CallQuota,
    ) -> Result<Box<dyn GuestModule>, RuntimeError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.cranelift_opt_level(OptLevel::Speed);
        let engine =
            Engine::new(&config).map_err(|e| RuntimeError::Other(e.to_string()))?;
        let module = Module::new(&engine, bytes)
            .map_err(|e| RuntimeError::CompilationFailed(e.to_string()))?;
        debug!(size = bytes.len(), fuel = quota.fuel, "Compiled guest module");
        Ok(Box::new(WasmtimeModule {
            engine,
            module,
            quota,
        }))
    }
}

struct WasmtimeModule {
    engine: Engine,
    module: Module,
    quota: CallQuota,
}

impl GuestModule for WasmtimeModule {
    fn instantiate(&self, imports: &ImportTable) -> Result<Box<dyn GuestInstance>, RuntimeError> {
        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(self.quota.fuel)
            .map_err(|e| RuntimeError::InstantiationFailed(e.to_string()))?;
        store.set_epoch_deadline(1);

        let mut linker: Linker<()> = Linker::new(&self.engine);
        for (module_name, function_name, host) in imports.iter() {
            let ty = FuncType::new(
                &self.engine,
                host.params.iter().map(val_type),
                host.results.iter().map(val_type),
            );
            let body = host.body.clone();
            let shim = move |mut caller: Caller<'_, ()>,
                             params: &[Val],
                             results: &mut [Val]|
                  -> anyhow::Result<()> {
                let args = params
                    .iter()
                    .map(value_from_val)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow::Error::new(HostTrap(e)))?;
                let mut memory = CallerMemory {
                    caller: &mut caller,
                };
                let out = body(&mut memory, &args)
                    .map_err(|HostCallError(detail)| anyhow::Error::new(HostTrap(detail)))?;
                if out.len() != results.len() {
                    return Err(anyhow::Error::new(HostTrap(format!(
                        "host function returned {} values, expected {}",
                        out.len(),
                        results.len()
                    ))));
                }
                for (slot, value) in results.iter_mut().zip(out) {
                    *slot = val_from_value(value);
                }
                Ok(())
            };
            linker
                .func_new(module_name, function_name, ty, shim)
                .map_err(|e| RuntimeError::InstantiationFailed(e.to_string()))?;
        }

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| RuntimeError::InstantiationFailed(e.to_string()))?;
        let memory = instance.get_memory(&mut store, "memory");

        Ok(Box::new(WasmtimeInstance {
            engine: self.engine.clone(),
            timeout: self.quota.timeout,
            inner: Some(InstanceInner {
                store,
                instance,
                memory,
            }),
        }))
    }

    fn exports(&self) -> Vec<ExportDecl> {
        self.module
            .exports()
            .map(|export| ExportDecl {
                name: export.name().to_string(),
            })
            .collect()
    }

    fn imports(&self) -> Vec<ImportDecl> {
        self.module
            .imports()
            .map(|import| ImportDecl {
                module: import.module().to_string(),
                name: import.name().to_string(),
            })
            .collect()
    }
}

struct InstanceInner {
    store: Store<()>,
    instance: Instance,
    memory: Option<Memory>,
}

struct WasmtimeInstance {
    engine: Engine,
    timeout: Duration,
    /// Dropped on dispose; the instance is then inert.
    inner: Option<InstanceInner>,
}

impl GuestInstance for WasmtimeInstance {
    fn call(&mut self, function: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| RuntimeError::Other("instance disposed".to_string()))?;

        let func = inner
            .instance
            .get_func(&mut inner.store, function)
            .ok_or_else(|| {
                RuntimeError::Other(format!("module exports no function '{function}'"))
            })?;
        let result_count = func.ty(&inner.store).results().len();

        let params: Vec<Val> = args.iter().map(val_from_value_ref).collect();
        let mut results = vec![Val::I32(0); result_count];

        // Watchdog: one epoch bump on this call's private engine once the
        // wall-clock deadline elapses. The channel wakes it early on return.
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let engine = self.engine.clone();
        let timeout = self.timeout;
        let watchdog = std::thread::spawn(move || {
            if done_rx.recv_timeout(timeout).is_err() {
                engine.increment_epoch();
            }
        });

        let outcome = func.call(&mut inner.store, &params, &mut results);
        let _ = done_tx.send(());
        let _ = watchdog.join();

        match outcome {
            Ok(()) => results
                .iter()
                .map(value_from_val)
                .collect::<Result<Vec<_>, _>>()
                .map_err(RuntimeError::Other),
            Err(error) => Err(classify_engine_error(error)),
        }
    }

    fn fuel_remaining(&self) -> u64 {
        match &self.inner {
            Some(inner) => inner.store.get_fuel().unwrap_or(0),
            None => 0,
        }
    }

    fn capture_memory(&self) -> Vec<u8> {
        match &self.inner {
            Some(inner) => match inner.memory {
                Some(memory) => memory.data(&inner.store).to_vec(),
                None => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    fn dispose(&mut self) {
        self.inner = None;
    }
}

/// Marker for a host callback failure crossing the engine boundary.
#[derive(Debug, Error)]
#[error("{0}")]
struct HostTrap(String);

struct CallerMemory<'a, 'b> {
    caller: &'a mut Caller<'b, ()>,
}

impl GuestContext for CallerMemory<'_, '_> {
    fn read_guest_memory(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, HostCallError> {
        let memory = self
            .caller
            .get_export("memory")
            .and_then(|e| e.into_memory())
            .ok_or_else(|| HostCallError("guest exports no memory".to_string()))?;
        let data = memory.data(&*self.caller);
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                HostCallError(format!(
                    "guest memory read out of bounds: {len} bytes at {ptr}"
                ))
            })?;
        Ok(data[start..end].to_vec())
    }
}

fn val_type(ty: &ValueType) -> ValType {
    match ty {
        ValueType::I32 => ValType::I32,
        ValueType::I64 => ValType::I64,
        ValueType::F32 => ValType::F32,
        ValueType::F64 => ValType::F64,
    }
}

fn val_from_value(value: Value) -> Val {
    match value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}

fn val_from_value_ref(value: &Value) -> Val {
    val_from_value(*value)
}

fn value_from_val(val: &Val) -> Result<Value, String> {
    match val {
        Val::I32(v) => Ok(Value::I32(*v)),
        Val::I64(v) => Ok(Value::I64(*v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
        other => Err(format!("unsupported value type: {other:?}")),
    }
}

/// Classify a raw engine error into a contract outcome.
///
/// Structured trap codes take precedence; the string classifier below is the
/// fallback for errors that carry no code.
fn classify_engine_error(error: anyhow::Error) -> RuntimeError {
    if let Some(trap) = error.downcast_ref::<Trap>() {
        let kind = match trap {
            Trap::OutOfFuel => return RuntimeError::FuelExhausted,
            Trap::Interrupt => return RuntimeError::Timeout,
            Trap::UnreachableCodeReached => TrapKind::Unreachable,
            Trap::MemoryOutOfBounds | Trap::TableOutOfBounds => TrapKind::OutOfBounds,
            Trap::IntegerDivisionByZero => TrapKind::DivisionByZero,
            _ => TrapKind::Generic,
        };
        return RuntimeError::Trap {
            kind,
            detail: trap.to_string(),
            trace: backtrace_of(&error),
        };
    }
    if let Some(HostTrap(detail)) = error.downcast_ref::<HostTrap>() {
        return RuntimeError::Trap {
            kind: TrapKind::Generic,
            detail: format!("host callback failed: {detail}"),
            trace: backtrace_of(&error),
        };
    }
    classify_error_text(&error.to_string())
}

/// Priority-ordered classifier for engines that only report error strings:
/// fuel, then "unreachable", then "out of bounds", then "trap", else other.
pub(crate) fn classify_error_text(detail: &str) -> RuntimeError {
    let lowered = detail.to_lowercase();
    if lowered.contains("fuel") {
        RuntimeError::FuelExhausted
    } else if lowered.contains("unreachable") {
        RuntimeError::Trap {
            kind: TrapKind::Unreachable,
            detail: detail.to_string(),
            trace: None,
        }
    } else if lowered.contains("out of bounds") {
        RuntimeError::Trap {
            kind: TrapKind::OutOfBounds,
            detail: detail.to_string(),
            trace: None,
        }
    } else if lowered.contains("trap") {
        RuntimeError::Trap {
            kind: TrapKind::Generic,
            detail: detail.to_string(),
            trace: None,
        }
    } else {
        RuntimeError::Other(detail.to_string())
    }
}

fn backtrace_of(error: &anyhow::Error) -> Option<Vec<StackFrame>> {
    error.downcast_ref::<WasmBacktrace>().map(|backtrace| {
        backtrace
            .frames()
            .iter()
            .map(|frame| StackFrame {
                function_index: frame.func_index(),
                function_name: frame.func_name().map(str::to_string),
                module_offset: frame.module_offset(),
            })
            .collect()
    })
}
