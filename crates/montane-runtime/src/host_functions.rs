//! Host function table construction.
//!
//! Translates a caller's capability grants into the exact import namespace
//! offered to the guest. Everything lands under the `env` module. A
//! capability that is granted but carries no imports in this core
//! (`filesystem_*`, `network`, `host_function`) attenuates to nothing: the
//! guest has no way to reach the host for it.

use chrono::Utc;
use montane_types::capability::{Capability, CapabilitySet};
use montane_types::runtime::{HostCallError, HostFunction, ImportTable};
use montane_types::value::{Value, ValueType};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Import module name all host functions live under.
pub const ENV_MODULE: &str = "env";

/// Build the guest import table for a set of granted capabilities.
///
/// The table is assembled fresh per call and never shared. Duplicate grants
/// collapse to one binding; the capability implication
/// `filesystem_write → filesystem_read` is applied before assembly.
pub fn build_import_table(granted: &CapabilitySet) -> ImportTable {
    let mut table = ImportTable::new();
    for capability in granted.expand().iter() {
        match capability {
            Capability::Time => {
                table.insert(ENV_MODULE, "get_time_ms", get_time_ms());
            }
            Capability::Random => {
                table.insert(ENV_MODULE, "get_random_u32", get_random_u32());
                table.insert(ENV_MODULE, "get_random_u64", get_random_u64());
            }
            Capability::Log => {
                table.insert(ENV_MODULE, "log_debug", log_at(LogLevel::Debug));
                table.insert(ENV_MODULE, "log_info", log_at(LogLevel::Info));
                table.insert(ENV_MODULE, "log_warn", log_at(LogLevel::Warn));
                table.insert(ENV_MODULE, "log_error", log_at(LogLevel::Error));
            }
            // Declared capabilities with no host surface in this core.
            Capability::FilesystemRead
            | Capability::FilesystemWrite
            | Capability::Network
            | Capability::HostFunction(_) => {}
        }
    }
    table
}

fn get_time_ms() -> HostFunction {
    HostFunction {
        params: vec![],
        results: vec![ValueType::I64],
        body: Arc::new(|_ctx, _args| Ok(vec![Value::I64(Utc::now().timestamp_millis())])),
    }
}

fn get_random_u32() -> HostFunction {
    HostFunction {
        params: vec![],
        results: vec![ValueType::I32],
        body: Arc::new(|_ctx, _args| Ok(vec![Value::I32(rand::random::<u32>() as i32)])),
    }
}

fn get_random_u64() -> HostFunction {
    HostFunction {
        params: vec![],
        results: vec![ValueType::I64],
        body: Arc::new(|_ctx, _args| Ok(vec![Value::I64(rand::random::<u64>() as i64)])),
    }
}

#[derive(Clone, Copy)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// `(i32 ptr, i32 len) -> ()`. Reads the message out of guest linear
/// memory, bounds-checked, and forwards it to the host logger.
fn log_at(level: LogLevel) -> HostFunction {
    HostFunction {
        params: vec![ValueType::I32, ValueType::I32],
        results: vec![],
        body: Arc::new(move |ctx, args| {
            let (ptr, len) = match args {
                [Value::I32(ptr), Value::I32(len)] => (*ptr as u32, *len as u32),
                _ => {
                    return Err(HostCallError(
                        "log: expected (i32 ptr, i32 len)".to_string(),
                    ))
                }
            };
            let bytes = ctx.read_guest_memory(ptr, len)?;
            let message = String::from_utf8_lossy(&bytes);
            match level {
                LogLevel::Debug => debug!(target: "montane::guest", "{message}"),
                LogLevel::Info => info!(target: "montane::guest", "{message}"),
                LogLevel::Warn => warn!(target: "montane::guest", "{message}"),
                LogLevel::Error => error!(target: "montane::guest", "{message}"),
            }
            Ok(Vec::new())
        }),
    }
}
