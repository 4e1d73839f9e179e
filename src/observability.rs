//! Logging setup for the binaries and the structured run events they share.
//!
//! Every event carries a `component` field and a dotted `event` name so JSON
//! output can be filtered without parsing messages.

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env_trimmed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `pv_gapfill=debug,warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// `PVGF_LOG_LEVEL`, `PVGF_LOG_FORMAT` and `PVGF_LOG_TARGET`; anything
/// unparseable keeps the default.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_trimmed("PVGF_LOG_LEVEL").unwrap_or(defaults.level),
        format: env_trimmed("PVGF_LOG_FORMAT")
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(defaults.format),
        include_target: env_trimmed("PVGF_LOG_TARGET")
            .and_then(|raw| parse_flag(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }
    Ok(())
}

pub fn log_app_start(binary: &str, config: &LoggingConfig) {
    info!(
        component = binary,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = ?config.format
    );
}

pub fn log_run_start(date: &str, station_count: usize, models: &[String]) {
    info!(
        component = "pipeline",
        event = "run.start",
        date,
        station_count,
        models = %models.join(",")
    );
}

/// Logged at warn when any station failed.
pub fn log_run_finish(date: &str, succeeded: usize, failed: usize, cohorts_skipped: usize) {
    if failed == 0 {
        info!(component = "pipeline", event = "run.finish", date, succeeded, failed, cohorts_skipped);
    } else {
        warn!(component = "pipeline", event = "run.finish", date, succeeded, failed, cohorts_skipped);
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
