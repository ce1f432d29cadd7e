//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Tracing setup for the daemon and launch worker spans."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_FLEET_LOG";

/// Filter used when neither the environment nor the config names one.
/// Launch internals log per node transition at debug; the store and lock
/// chatter stays at info.
pub const DEFAULT_DIRECTIVES: &str =
    "info,r_fleet_launch=debug,r_fleet_supervisor=debug,r_fleet_progress=info,r_fleet_coord=info";

static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Where the effective filter came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    /// `R_FLEET_LOG`.
    FleetEnv,
    /// `RUST_LOG`.
    RustLog,
    /// `logging.filter` in the config file.
    Config,
    /// [`DEFAULT_DIRECTIVES`].
    Default,
}

/// Pick the filter directive: `R_FLEET_LOG`, then `RUST_LOG`, then the
/// configured filter, then [`DEFAULT_DIRECTIVES`]. Blank values are skipped.
pub fn select_directives(
    fleet_env: Option<String>,
    rust_log: Option<String>,
    configured: Option<&str>,
) -> (String, FilterSource) {
    let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
    if present(&fleet_env) {
        return (fleet_env.unwrap_or_default(), FilterSource::FleetEnv);
    }
    if present(&rust_log) {
        return (rust_log.unwrap_or_default(), FilterSource::RustLog);
    }
    match configured.filter(|value| !value.trim().is_empty()) {
        Some(value) => (value.to_owned(), FilterSource::Config),
        None => (DEFAULT_DIRECTIVES.to_owned(), FilterSource::Default),
    }
}

fn build_filter(config: &LoggingConfig) -> (EnvFilter, FilterSource, Option<String>) {
    let (directives, source) = select_directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        config.filter.as_deref(),
    );
    match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, source, None),
        Err(err) => (
            EnvFilter::new(DEFAULT_DIRECTIVES),
            FilterSource::Default,
            Some(format!("invalid filter {directives:?} from {source:?}: {err}")),
        ),
    }
}

/// Install the global subscriber: stdout in the configured format plus a
/// daily JSON file `<prefix>.log` under `config.directory`. Thread names
/// are kept because launch workers run on `launch-<host>` threads.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set((file_guard, stdout_guard));

    let (filter, source, rejected) = build_filter(config);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if let Some(reason) = rejected {
        warn!(%reason, "falling back to default log filter");
    }
    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        filter = ?source,
        "tracing initialised"
    );
    Ok(())
}

/// Span entered by a launch worker for its whole life, so every event it
/// logs carries the network, launch id and host.
pub fn launch_span(network: &str, launch: &str, host: &str) -> Span {
    info_span!("launch", network = %network, launch = %launch, host = %host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_variable_wins_over_everything() {
        let (directives, source) = select_directives(
            Some("r_fleet_launch=trace".into()),
            Some("warn".into()),
            Some("error"),
        );
        assert_eq!(directives, "r_fleet_launch=trace");
        assert_eq!(source, FilterSource::FleetEnv);
    }

    #[test]
    fn blank_variables_fall_through_to_config_then_defaults() {
        let (directives, source) =
            select_directives(Some("  ".into()), None, Some("info,r_fleet_coord=debug"));
        assert_eq!(directives, "info,r_fleet_coord=debug");
        assert_eq!(source, FilterSource::Config);

        let (directives, source) = select_directives(None, Some(String::new()), None);
        assert_eq!(directives, DEFAULT_DIRECTIVES);
        assert_eq!(source, FilterSource::Default);
    }

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
    }
}
