//! Dump capture from a live (possibly trapped) instance.

use crate::dump::{FailureReason, ForensicDump};
use chrono::Utc;
use montane_types::runtime::{GuestInstance, StackFrame};
use rand::Rng;
use tracing::debug;

/// Failure context assembled by the execution manager.
#[derive(Debug, Clone)]
pub struct DumpContext {
    pub reason: FailureReason,
    pub fuel_allocated: u64,
    pub function_called: String,
    pub args_hash: [u8; 32],
    pub execution_time_us: u64,
    pub stack_trace: Option<Vec<StackFrame>>,
}

/// Capture a full dump from a live instance.
///
/// Memory is read strictly before fuel: nothing on this path may deallocate
/// or mutate the instance, and the reads themselves are non-mutating.
pub fn capture(instance: &dyn GuestInstance, ctx: DumpContext) -> ForensicDump {
    let memory = instance.capture_memory();
    let fuel_remaining = instance.fuel_remaining();
    finish(memory, fuel_remaining, ctx)
}

/// Synthesize a dump when no instance exists (compilation or instantiation
/// failure): empty memory, zero fuel remaining.
pub fn capture_minimal(ctx: DumpContext) -> ForensicDump {
    finish(Vec::new(), 0, ctx)
}

fn finish(memory: Vec<u8>, fuel_remaining: u64, ctx: DumpContext) -> ForensicDump {
    // Fuel exhaustion reports a drained ledger even if the engine kept a
    // residual balance smaller than one metering block.
    let fuel_remaining = if ctx.reason == FailureReason::FuelExhausted {
        0
    } else {
        fuel_remaining.min(ctx.fuel_allocated)
    };
    let dump = ForensicDump {
        id: new_dump_id(),
        timestamp: Utc::now(),
        reason: ctx.reason,
        memory,
        fuel_remaining,
        fuel_allocated: ctx.fuel_allocated,
        function_called: ctx.function_called,
        args_hash: ctx.args_hash,
        execution_time_us: ctx.execution_time_us,
        stack_trace: ctx.stack_trace,
    };
    debug!(id = %dump.id, reason = %dump.reason, memory_bytes = dump.memory.len(), "Captured forensic dump");
    dump
}

fn new_dump_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill(&mut id[..]);
    hex::encode(id)
}
