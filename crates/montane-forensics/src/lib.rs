//! Forensic subsystem: post-mortem dumps of failed sandbox executions.
//!
//! When a guest traps, runs out of fuel, or times out, the execution manager
//! captures the instance's final linear memory and accounting state into a
//! [`ForensicDump`]. Dumps are immutable, serializable to a compact binary
//! file format, and inspectable offline with the [`analyzer`].

pub mod analyzer;
pub mod capture;
pub mod codec;
pub mod dump;

pub use analyzer::{FoundString, MemoryAnalyzer, MemoryStats, OutOfBounds, StringScan};
pub use capture::{capture, capture_minimal, DumpContext};
pub use codec::{decode, encode, CodecError, DUMP_MAGIC, DUMP_VERSION};
pub use dump::{FailureReason, ForensicDump, PAGE_SIZE};
