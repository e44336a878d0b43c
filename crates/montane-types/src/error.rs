//! Shared error types for engine setup.

use thiserror::Error;

/// Errors raised while constructing or configuring an engine.
///
/// Call-time failures never use this type; they surface as a crash carrying
/// a forensic dump.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configured runtime adapter is not bound into this build.
    #[error("unknown runtime adapter: {0}")]
    UnknownRuntime(String),

    /// A configuration value is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}
