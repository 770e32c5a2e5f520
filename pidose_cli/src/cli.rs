//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

/// Config path tried when `--config` is not given. A missing file here means
/// "use the built-in defaults"; a missing explicit path is an error.
pub const DEFAULT_CONFIG: &str = "etc/pidose.toml";

#[inline]
pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "pidose", version, about = "Relay-gated coffee dosing driven by a BLE scale")]
pub struct Cli {
    /// Path to config TOML (typed) [default: etc/pidose.toml]
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log and report as JSON lines instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging].level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wait for button presses and dose on each one until Ctrl-C
    Run,
    /// Run a single dose now, as if the button had been pressed
    Dose {
        /// Target grams (overrides dose.target_g)
        #[arg(long)]
        grams: Option<f32>,
        /// Abort the dose after this many ms with the relay on (0 disables)
        #[arg(long, value_name = "MS")]
        max_run_ms: Option<u64>,
    },
    /// Print the scale's weight a few times without touching the relay
    Watch {
        /// Number of readings to print
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Delay between readings
        #[arg(long = "interval-ms", value_name = "MS", default_value_t = 500)]
        interval_ms: u64,
    },
    /// List nearby scale addresses
    Scan {
        /// How long to listen (overrides scale.discover_ms)
        #[arg(long = "timeout-ms", value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Quick health check: relay off and scale reachable
    SelfCheck,
}
