#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod dose;
mod error_fmt;
mod logging;
mod probe;
mod rig;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use pidose_config::Config;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands, DEFAULT_CONFIG, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    let json = cli.json;

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            debug!(error = ?err, "command failed");
            if json {
                eprintln!("{}", format_error_json(&err));
            } else {
                eprintln!("{}", humanize(&err));
            }
            ExitCode::from(exit_code_for_error(&err))
        }
    }
}

fn run(cli: Cli) -> eyre::Result<()> {
    color_eyre::install()?;

    let (cfg, source) = load_config(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .or_else(|| cfg.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    logging::init(cli.json, &level, &cfg.logging)?;
    info!(config = %source, "configuration loaded");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
            warn!(error = %e, "could not install Ctrl-C handler");
        }
    }

    match cli.cmd {
        Commands::Run => dose::run_controller(&cfg, &shutdown),
        Commands::Dose { grams, max_run_ms } => dose::run_dose(&cfg, grams, max_run_ms, &shutdown),
        Commands::Watch { count, interval_ms } => {
            probe::watch(&cfg, count, Duration::from_millis(interval_ms), &shutdown)
        }
        Commands::Scan { timeout_ms } => {
            let ms = timeout_ms.unwrap_or(cfg.scale.discover_ms);
            probe::scan(&cfg, Duration::from_millis(ms))
        }
        Commands::SelfCheck => probe::self_check(&cfg),
    }
}

/// Typed config plus a description of where it came from.
fn load_config(explicit: Option<&Path>) -> eyre::Result<(Config, String)> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.exists() {
                return Ok((Config::default(), "built-in defaults".to_string()));
            }
            default
        }
    };
    let text = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    let cfg = pidose_config::load_toml(&text)
        .wrap_err_with(|| format!("parsing config {}", path.display()))?;
    cfg.validate().wrap_err("invalid configuration")?;
    Ok((cfg, path.display().to_string()))
}
