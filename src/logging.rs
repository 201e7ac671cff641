//! Structured logging setup: four level-filtered, daily-rolling file sinks
//! layered under one subscriber, plus an optional stderr mirror for the CLI.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Handles that must be kept alive for the lifetime of the process; dropping
/// one stops flushing its non-blocking writer.
pub struct LogHandles {
    _debug: WorkerGuard,
    _info: WorkerGuard,
    _warn: WorkerGuard,
    _error: WorkerGuard,
}

fn level_layer<S>(log_dir: &Path, name: &str, level: Level) -> (impl tracing_subscriber::Layer<S> + Send + Sync, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let appender = rolling::daily(log_dir, format!("{name}.log"));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::filter_fn(move |meta| *meta.level() == level));
    (layer, guard)
}

/// Installs the global subscriber writing to
/// `<working_dir>/.internal/logs/{debug,info,warn,error}/*.log`, each file
/// receiving only events at exactly that level. Returns guards that must be
/// held for the process's lifetime.
pub fn init(working_dir: &Path) -> std::io::Result<LogHandles> {
    let base = working_dir.join(".internal").join("logs");
    for level_dir in ["debug", "info", "warn", "error"] {
        std::fs::create_dir_all(base.join(level_dir))?;
    }

    let (debug_layer, debug_guard) = level_layer(&base.join("debug"), "debug", Level::DEBUG);
    let (info_layer, info_guard) = level_layer(&base.join("info"), "info", Level::INFO);
    let (warn_layer, warn_guard) = level_layer(&base.join("warn"), "warn", Level::WARN);
    let (error_layer, error_guard) = level_layer(&base.join("error"), "error", Level::ERROR);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(env_filter)
        .with(debug_layer)
        .with(info_layer)
        .with(warn_layer)
        .with(error_layer)
        .try_init()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    Ok(LogHandles {
        _debug: debug_guard,
        _info: info_guard,
        _warn: warn_guard,
        _error: error_guard,
    })
}

/// A lightweight subscriber for tests and the CLI's `--quiet` path: stderr
/// only, no file sinks.
pub fn init_stderr_only() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(env_filter).with_ansi(true).try_init();
}
