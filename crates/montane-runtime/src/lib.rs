//! Capability-attenuated WASM sandbox engine.
//!
//! Callers submit a module binary, a function name, arguments, a fuel budget,
//! a wall-clock deadline, and a set of capability grants. The engine compiles
//! the module, instantiates it fresh (zeroed memory, primed fuel ledger, an
//! import table holding exactly the granted host functions), invokes the
//! function, and disposes the instance. A call either succeeds with
//! accounting metadata or crashes with a forensic dump, never anything else.
//!
//! ```no_run
//! use montane_runtime::{CallOptions, SandboxEngine};
//! use montane_types::config::EngineConfig;
//! use montane_types::value::Value;
//!
//! # async fn demo(wasm: &[u8]) {
//! let engine = SandboxEngine::new(EngineConfig::default()).unwrap();
//! match engine
//!     .fire(wasm, "add", &[Value::I32(20), Value::I32(22)], CallOptions::default())
//!     .await
//! {
//!     Ok(execution) => println!("result: {:?}", execution.results),
//!     Err(crash) => eprintln!("{}", crash.dump.summary()),
//! }
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod host_functions;
pub mod meter;
pub mod wasmtime_runtime;

pub use config::load_config;
pub use engine::{
    runtime_for, CallMetadata, CallOptions, Crash, Execution, ModuleRequirements, SandboxEngine,
    ValidateError,
};
pub use host_functions::build_import_table;
pub use meter::{FuelMeter, FuelStats};
pub use wasmtime_runtime::WasmtimeRuntime;
