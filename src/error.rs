//! Single typed error boundary for every fatal condition in this harness's design.
//!
//! `init` and the pre-first-entry path of `run_iteration` return `Result<_, EngineError>`.
//! Once the engine has observed the fuzz method once, per-iteration faults are reported
//! through `FaultCode` (see `crate::engine`), not through this type — that split mirrors
//! the distinction between conditions that abort the process and
//! conditions the fuzzer driver is expected to recover from by relaunching.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to launch target process: {0}")]
    Launch(String),

    #[error("target and harness bitness do not match (use a 64-bit harness for a 64-bit target and vice versa)")]
    BitnessMismatch,

    #[error("could not resolve address of target method {method:?} in module {module}")]
    SymbolResolution { module: String, method: String },

    #[error("cross-process memory access failed: {0}")]
    Memory(String),

    #[error("IPT tracing is unavailable on this system")]
    IptUnavailable,

    #[error("process crashed, hanged, or exited before reaching the target method")]
    PreEntryTermination,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
