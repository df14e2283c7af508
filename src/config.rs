//! Harness configuration: a single process-scoped record, fixed after `init`.
//!
//! Parsing is split in two: `RawConfig` is what `structopt` can derive directly from
//! the `argv` slice before the `--` separator, and `Config::try_from(RawConfig)` applies
//! the cross-field validation (module/method-or-offset, positive iteration count) that
//! `structopt` itself can't express, folding any failure into the single
//! `EngineError::Config` variant used everywhere else.

use std::convert::TryFrom;
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

use crate::error::{EngineError, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CoverageKind {
    Block,
    Edge,
}

impl Default for CoverageKind {
    fn default() -> Self {
        CoverageKind::Block
    }
}

impl FromStr for CoverageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bb" => Ok(CoverageKind::Block),
            "edge" => Ok(CoverageKind::Edge),
            other => Err(format!("invalid coverage type {other:?} (expected bb or edge)")),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CallConv {
    MsX64,
    Cdecl,
    Fastcall,
    Thiscall,
}

impl Default for CallConv {
    fn default() -> Self {
        CallConv::MsX64
    }
}

impl FromStr for CallConv {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ms64" => Ok(CallConv::MsX64),
            "stdcall" => Ok(CallConv::Cdecl),
            "fastcall" => Ok(CallConv::Fastcall),
            "thiscall" => Ok(CallConv::Thiscall),
            other => Err(format!("unknown calling convention {other:?}")),
        }
    }
}

/// A module-relative offset, accepting the `0x`-prefixed hex a C `strtoul(..., 0)`
/// call would also parse.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Offset(pub u64);

impl FromStr for Offset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else {
            trimmed.parse::<u64>()
        };
        value.map(Offset).map_err(|e| format!("invalid offset {s:?}: {e}"))
    }
}

#[derive(StructOpt, Debug, Default)]
#[structopt(name = "winpt-harness", about = "Intel PT persistent-mode coverage harness")]
pub struct RawConfig {
    #[structopt(long)]
    pub debug: bool,

    #[structopt(long = "covtype", default_value = "bb")]
    pub coverage_kind: CoverageKind,

    #[structopt(long = "coverage_module")]
    pub coverage_modules: Vec<PathBuf>,

    #[structopt(long = "target_module")]
    pub target_module: Option<String>,

    #[structopt(long = "target_method")]
    pub target_method: Option<String>,

    #[structopt(long = "target_offset")]
    pub target_offset: Option<Offset>,

    #[structopt(long = "fuzz_iterations", default_value = "1000")]
    pub fuzz_iterations: u32,

    #[structopt(long = "nargs", default_value = "0")]
    pub num_args: u32,

    #[structopt(long = "call_convention", default_value = "ms64")]
    pub callconv: CallConv,

    #[structopt(long = "thread_coverage")]
    pub thread_coverage: bool,

    #[structopt(long = "mem_limit")]
    pub mem_limit_mb: Option<u64>,

    #[structopt(long = "cpu_aff")]
    pub cpu_affinity_mask: Option<u64>,

    #[structopt(long = "sinkhole_stdio")]
    pub sinkhole_stdio: bool,
}

/// The validated, immutable configuration record.
#[derive(Clone, Debug)]
pub struct Config {
    pub debug_mode: bool,
    pub coverage_kind: CoverageKind,
    pub coverage_modules: Vec<PathBuf>,
    pub target_module: Option<String>,
    pub target_method: Option<String>,
    pub target_offset: Option<u64>,
    pub fuzz_iterations: u32,
    pub num_args: u32,
    pub callconv: CallConv,
    pub thread_coverage: bool,
    pub mem_limit_mb: Option<u64>,
    pub cpu_affinity_mask: Option<u64>,
    pub sinkhole_stdio: bool,
}

impl TryFrom<RawConfig> for Config {
    type Error = EngineError;

    fn try_from(raw: RawConfig) -> Result<Self> {
        if raw.fuzz_iterations == 0 {
            return Err(EngineError::Config("-fuzz_iterations must be positive".into()));
        }

        if raw.target_module.is_some() {
            let have_method = raw.target_method.is_some();
            let have_offset = raw.target_offset.map(|o| o.0 != 0).unwrap_or(false);
            if have_method == have_offset {
                return Err(EngineError::Config(
                    "exactly one of -target_method or -target_offset must be set when -target_module is given"
                        .into(),
                ));
            }
        }

        Ok(Config {
            debug_mode: raw.debug,
            coverage_kind: raw.coverage_kind,
            coverage_modules: raw.coverage_modules,
            target_module: raw.target_module,
            target_method: raw.target_method,
            target_offset: raw.target_offset.map(|o| o.0),
            fuzz_iterations: raw.fuzz_iterations,
            num_args: raw.num_args,
            callconv: raw.callconv,
            thread_coverage: raw.thread_coverage,
            mem_limit_mb: raw.mem_limit_mb,
            cpu_affinity_mask: raw.cpu_affinity_mask,
            sinkhole_stdio: raw.sinkhole_stdio,
        })
    }
}

/// Parses the harness's own flags out of `argv`, stopping at the first `--`.
///
/// Returns the validated `Config` plus the index of the `--` separator (or `argv.len()`
/// if none is present), so the caller knows where the traced program's own argv begins.
pub fn parse_argv(argv: &[String]) -> Result<(Config, usize)> {
    let separator = argv.iter().position(|a| a == "--").unwrap_or(argv.len());
    let own_args = &argv[..separator];

    // StructOpt wants argv[0] to be a program name.
    let mut with_prog_name = Vec::with_capacity(own_args.len() + 1);
    with_prog_name.push("winpt-harness".to_string());
    with_prog_name.extend(own_args.iter().map(|a| single_dash_to_long(a)));

    let raw = RawConfig::from_iter_safe(with_prog_name)
        .map_err(|e| EngineError::Config(e.to_string()))?;
    let config = Config::try_from(raw)?;
    Ok((config, separator))
}

/// Flags here are single-dashed (`-target_module`, `-nargs`, ...) rather than
/// double-dashed. clap's long options
/// always need a `--` prefix, so every multi-letter single-dash token is widened to
/// double-dash before it reaches `structopt`; anything already double-dashed, or that
/// looks like a negative number, passes through untouched.
fn single_dash_to_long(arg: &str) -> String {
    let is_single_dash_word = arg.starts_with('-')
        && !arg.starts_with("--")
        && arg.len() > 1
        && !arg.as_bytes()[1].is_ascii_digit();
    if is_single_dash_word {
        format!("-{arg}")
    } else {
        arg.to_string()
    }
}
