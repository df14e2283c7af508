//! `-debug` support: a `log4rs`-backed file appender writing to `debug.log`, in the
//! same style this lineage's fuzzing-adjacent crates use for their own file loggers.
//!
//! When `-debug` is not set, `init_debug_log` is simply not called and `log`'s macros
//! compile away to nothing costing more than a level check.

use std::path::Path;

use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

use crate::error::{EngineError, Result};

/// Initializes the global logger to append to `debug.log` in the current directory.
/// Returns a `Handle` the caller can drop to flush/stop logging at teardown.
pub fn init_debug_log() -> Result<Handle> {
    init_debug_log_at(Path::new("debug.log"))
}

/// Same as `init_debug_log`, but to an arbitrary path; split out so tests can point
/// the appender at a scratch directory instead of littering the crate root.
pub fn init_debug_log_at(path: &Path) -> Result<Handle> {
    let appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "[{h({l}):5.5}] {d(%Y-%m-%d %H:%M:%S%.3f)} - {m}{n}",
        )))
        .build(path)
        .map_err(|e| EngineError::Config(format!("could not open {}: {e}", path.display())))?;

    let config = Config::builder()
        .appender(Appender::builder().build("debug_log", Box::new(appender)))
        .build(Root::builder().appender("debug_log").build(LevelFilter::Debug))
        .map_err(|e| EngineError::Config(format!("invalid logging config: {e}")))?;

    log4rs::init_config(config).map_err(|e| EngineError::Config(format!("logger already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_the_requested_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness-debug.log");

        // `log4rs::init_config` sets the global logger exactly once per process;
        // a second call in another test would error, so this only checks that the
        // appender itself opens the file rather than asserting on the global state.
        let appender = FileAppender::builder().build(&path);
        assert!(appender.is_ok());
        assert!(!path.exists() || std::fs::metadata(&path).is_ok());
    }
}
