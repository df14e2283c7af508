//! Persistent-mode coverage harness for Windows fuzzing over Intel Processor Trace.
//!
//! A fuzzer driver launches one process, steers it to a chosen entry function, and
//! replays that function in place for every subsequent input instead of relaunching.
//! What follows is the external surface; everything underneath lives in its own
//! module, one per capability (`process`, `mem`, `thread`, `module`, `breakpoint`,
//! `trace`) plus the `engine` that wires them together.

pub mod breakpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mem;
pub mod module;
pub mod pe;
pub mod process;
pub mod registers;
pub mod thread;
pub mod trace;

use log::error;
use serde::Serialize;

pub use config::Config;
pub use engine::{Engine, FaultCode};
pub use error::{EngineError, Result};

/// Parses the harness's own flags out of `argv` (stopping at the first `--`) and, if
/// `-debug` was given, turns on file logging before anything else runs. Returns the validated config plus the traced program's own
/// argv (the slice after `--`), which the caller forwards to `Engine::run_iteration`.
pub fn init(argv: &[String]) -> Result<(Config, Vec<String>)> {
    let (config, separator) = config::parse_argv(argv)?;

    if config.debug_mode {
        if let Err(e) = logging::init_debug_log() {
            // Logging failing to initialize is not itself fatal to fuzzing; fall
            // back to stderr so the operator still sees *something*.
            eprintln!("warning: could not start debug logging: {e}");
        }
    }

    let child_argv = argv.get(separator.saturating_add(1)..).unwrap_or(&[]).to_vec();
    Ok((config, child_argv))
}

/// Joins the traced program's own argv back into a single Win32 command line, quoting
/// arguments that contain whitespace. `CreateProcessA` takes one string, not an argv
/// array.
pub fn build_command_line(child_argv: &[String]) -> String {
    child_argv
        .iter()
        .map(|a| if a.contains(' ') { format!("\"{a}\"") } else { a.clone() })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A JSON-serializable summary of one completed iteration, logged at debug level
/// rather than shown to the fuzzer driver (which only gets the `FaultCode` and the
/// raw bitmap). Structured logging here follows the same `log`/`log4rs`
/// pairing the rest of the crate uses, with `serde_json` providing the machine-
/// readable shape for whatever downstream tooling tails `debug.log`.
#[derive(Serialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub fault: String,
    pub coverage_hits: usize,
}

impl IterationSummary {
    pub fn new(iteration: u32, fault: FaultCode, coverage_hits: usize) -> Self {
        let fault = match fault {
            FaultCode::None => "none",
            FaultCode::Timeout => "timeout",
            FaultCode::Crash => "crash",
            FaultCode::Error => "error",
            FaultCode::NoInst => "no_inst",
            FaultCode::NoBits => "no_bits",
        }
        .to_string();
        IterationSummary { iteration, fault, coverage_hits }
    }

    /// Renders as a single JSON line, the shape `debug_target`'s diagnostic dump and
    /// any future telemetry consumer would parse.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Logs a fatal `EngineError` together with a captured backtrace, the harness's
/// equivalent of an unhandled-exception crash dump. Call this anywhere a fatal
/// `EngineError` would otherwise just propagate out of `main`.
pub fn log_fatal(context: &str, err: &EngineError) {
    let backtrace = backtrace::Backtrace::new();
    error!("{context}: {err}\n{backtrace:?}");
}

/// Dumps the engine's current coverage bitmap as a hex string to the debug log.
pub fn dump_coverage_hex(engine: &Engine) -> String {
    engine.coverage().bits().iter().map(|b| format!("{b:02x}")).collect()
}

/// Drives `config.fuzz_iterations` runs of an already-constructed `Engine` end to
/// end, logging a JSON summary of each and finally dumping the coverage bitmap in
/// hex. Unlike `run_iteration`, a single `Crash`/`Timeout`/
/// `Error` here is reported and then immediately retried rather than returned to a
/// caller that might want to fuzz around it — `debug_target` is meant to answer
/// "does this target/method/offset combination even run", not to fuzz.
pub fn debug_target(engine: &mut Engine, config: &Config, child_argv: &str, timeout_ms: u32) -> Result<()> {
    for i in 0..config.fuzz_iterations {
        let fault = engine.run_iteration(child_argv, timeout_ms)?;
        let summary = IterationSummary::new(i, fault, engine.coverage().hit_count());
        log::debug!("{}", summary.to_json());
    }
    log::debug!("final coverage bitmap: {}", dump_coverage_hex(engine));
    Ok(())
}

/// Converts a raw `argv` (as `OsString`s from `std::env::args_os`, or any other
/// source) into the `String` slice the rest of this crate's argv handling expects.
/// Non-UTF-8 arguments are rejected outright rather than lossily reinterpreted,
/// since they would otherwise silently corrupt a module or method name.
pub fn argv_to_strings(argv: &[std::ffi::OsString]) -> Result<Vec<String>> {
    argv.iter()
        .map(|a| {
            a.clone()
                .into_string()
                .map_err(|bad| EngineError::Config(format!("argv entry {bad:?} is not valid UTF-8")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_splits_config_from_child_argv() {
        let argv = vec![
            "-target_module".to_string(),
            "target.dll".to_string(),
            "-target_method".to_string(),
            "FuzzMe".to_string(),
            "--".to_string(),
            "target.exe".to_string(),
            "-seed".to_string(),
            "a".to_string(),
        ];
        let (config, child_argv) = init(&argv).unwrap();
        assert_eq!(config.target_module.as_deref(), Some("target.dll"));
        assert_eq!(child_argv, vec!["target.exe", "-seed", "a"]);
    }

    #[test]
    fn build_command_line_quotes_args_with_spaces() {
        let argv = vec!["target.exe".to_string(), "hello world".to_string(), "plain".to_string()];
        assert_eq!(build_command_line(&argv), "target.exe \"hello world\" plain");
    }

    #[test]
    fn iteration_summary_round_trips_through_json() {
        let summary = IterationSummary::new(3, FaultCode::Crash, 42);
        let json = summary.to_json();
        assert!(json.contains("\"iteration\":3"));
        assert!(json.contains("\"fault\":\"crash\""));
        assert!(json.contains("\"coverage_hits\":42"));
    }
}
