//! Subscriber setup: console on stderr, optional JSON file sink.

use std::path::Path;

use eyre::WrapErr;
use pidose_config::Logging;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::cli::FILE_GUARD;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` wins over `level`; stdout is left to command output.
pub fn init(json: bool, level: &str, cfg: &Logging) -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    layers.push(if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    });

    if let Some(path) = cfg.file.as_deref() {
        let path = Path::new(path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file has no file name: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("creating log directory {}", dir.display()))?;
        let appender = match cfg.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, file_name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, file_name),
            _ => tracing_appender::rolling::never(dir, file_name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // first init wins; a second guard would drop and flush immediately
        let _ = FILE_GUARD.set(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .wrap_err("installing log subscriber")
}
