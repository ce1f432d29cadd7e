//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the launch engine."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(21 * 60)
}

fn default_deadlock_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_lock_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_authorized_launcher() -> bool {
    true
}

fn default_supervisor_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_activity_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_terminate_grace() -> Duration {
    Duration::from_secs(6 * 60)
}

fn default_tick_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_touch_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_meter_close_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_launch_attempts() -> usize {
    5
}

fn default_relaunch_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_allocate_attempts() -> usize {
    3
}

fn default_allocate_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_max_install_attempts() -> usize {
    3
}

fn default_install_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_node_start_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_dns_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_install_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_plan_enable_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_plan_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_ssh_user() -> String {
    "root".to_owned()
}

fn default_roles() -> Vec<String> {
    ["common", "firewall", "nginx", "postgresql", "app", "finalizer"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Primary configuration object for the R-Fleet runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_FLEET_CONFIG";

    /// Load configuration from disk, respecting the `R_FLEET_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.lock.validate()?;
        self.supervisor.validate()?;
        self.meter.validate()?;
        self.launch.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// `tracing` filter directive used when neither `R_FLEET_LOG` nor
    /// `RUST_LOG` is set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

/// Timing for the per-network distributed lock.
///
/// `deadlock_timeout` is the lease stored alongside the token; a holder that
/// never releases loses the lock once it elapses. `lock_timeout` bounds how
/// long a caller waits to acquire.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lock_timeout: Duration,
    #[serde(default = "default_deadlock_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub deadlock_timeout: Duration,
    #[serde(rename = "poll_interval_ms", default = "default_lock_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            deadlock_timeout: default_deadlock_timeout(),
            poll_interval: default_lock_poll_interval(),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.deadlock_timeout.is_zero() {
            return Err(anyhow!("lock.deadlock_timeout must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("lock.poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Whether this process may launch nodes at all. The supervisor refuses
    /// to start otherwise.
    #[serde(default = "default_authorized_launcher")]
    pub authorized_launcher: bool,
    #[serde(default = "default_supervisor_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_activity_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub activity_timeout: Duration,
    #[serde(default = "default_terminate_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub terminate_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            authorized_launcher: default_authorized_launcher(),
            poll_interval: default_supervisor_poll_interval(),
            activity_timeout: default_activity_timeout(),
            terminate_grace: default_terminate_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("supervisor.poll_interval must be greater than zero"));
        }
        if self.activity_timeout < self.poll_interval {
            return Err(anyhow!(
                "supervisor.activity_timeout ({:?}) must not be shorter than poll_interval ({:?})",
                self.activity_timeout,
                self.poll_interval
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_tick_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_ttl: Duration,
    #[serde(default = "default_touch_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub touch_interval: Duration,
    #[serde(default = "default_meter_close_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub close_timeout: Duration,
    /// Optional JSON file replacing the embedded install tick table.
    #[serde(default)]
    pub install_ticks: Option<PathBuf>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            tick_ttl: default_tick_ttl(),
            touch_interval: default_touch_interval(),
            close_timeout: default_meter_close_timeout(),
            install_ticks: None,
        }
    }
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_ttl.is_zero() {
            return Err(anyhow!("meter.tick_ttl must be greater than zero"));
        }
        if let Some(path) = &self.install_ticks {
            if !path.is_file() {
                return Err(anyhow!(
                    "meter.install_ticks {} does not exist or is not a file",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default = "default_max_launch_attempts")]
    pub max_launch_attempts: usize,
    #[serde(default = "default_relaunch_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub relaunch_backoff: Duration,
    #[serde(default = "default_max_allocate_attempts")]
    pub max_allocate_attempts: usize,
    #[serde(default = "default_allocate_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub allocate_backoff: Duration,
    #[serde(default = "default_max_install_attempts")]
    pub max_install_attempts: usize,
    #[serde(default = "default_install_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub install_backoff: Duration,
    #[serde(rename = "heartbeat_interval_ms", default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_node_start_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_start_timeout: Duration,
    #[serde(default = "default_dns_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dns_timeout: Duration,
    #[serde(default = "default_install_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub install_timeout: Duration,
    #[serde(default = "default_plan_enable_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub plan_enable_timeout: Duration,
    #[serde(rename = "plan_poll_interval_ms", default = "default_plan_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub plan_poll_interval: Duration,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_identity: Option<PathBuf>,
    /// Parent directory for per-launch staging directories. Defaults to the
    /// system temporary directory.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            max_launch_attempts: default_max_launch_attempts(),
            relaunch_backoff: default_relaunch_backoff(),
            max_allocate_attempts: default_max_allocate_attempts(),
            allocate_backoff: default_allocate_backoff(),
            max_install_attempts: default_max_install_attempts(),
            install_backoff: default_install_backoff(),
            heartbeat_interval: default_heartbeat_interval(),
            node_start_timeout: default_node_start_timeout(),
            dns_timeout: default_dns_timeout(),
            install_timeout: default_install_timeout(),
            plan_enable_timeout: default_plan_enable_timeout(),
            plan_poll_interval: default_plan_poll_interval(),
            ssh_user: default_ssh_user(),
            ssh_identity: None,
            staging_root: None,
            roles: default_roles(),
        }
    }
}

impl LaunchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_launch_attempts == 0 {
            return Err(anyhow!("launch.max_launch_attempts must be at least 1"));
        }
        if self.max_allocate_attempts == 0 {
            return Err(anyhow!("launch.max_allocate_attempts must be at least 1"));
        }
        if self.max_install_attempts == 0 {
            return Err(anyhow!("launch.max_install_attempts must be at least 1"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("launch.heartbeat_interval_ms must be greater than zero"));
        }
        if self.roles.is_empty() {
            return Err(anyhow!("launch.roles must name at least one role"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().expect("empty config is valid");
        assert_eq!(config.lock.lock_timeout, Duration::from_secs(21 * 60));
        assert_eq!(config.lock.deadlock_timeout, Duration::from_secs(20 * 60));
        assert_eq!(config.supervisor.activity_timeout, Duration::from_secs(180));
        assert_eq!(config.meter.tick_ttl, Duration::from_secs(86_400));
        assert_eq!(config.launch.max_install_attempts, 3);
        assert_eq!(config.launch.max_launch_attempts, 5);
    }

    #[test]
    fn durations_parse_from_seconds_and_millis() {
        let config: AppConfig = r#"
            [lock]
            lock_timeout = 30
            deadlock_timeout = 10
            poll_interval_ms = 25

            [supervisor]
            poll_interval = 1
            activity_timeout = 4
        "#
        .parse()
        .expect("valid config");
        assert_eq!(config.lock.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.lock.poll_interval, Duration::from_millis(25));
        assert_eq!(config.supervisor.activity_timeout, Duration::from_secs(4));
    }

    #[test]
    fn millisecond_fields_keep_their_unit_in_the_file() {
        let mut config = AppConfig::default();
        config.launch.heartbeat_interval = Duration::from_millis(750);
        let rendered = toml::to_string_pretty(&config).expect("render");
        assert!(rendered.contains("heartbeat_interval_ms = 750"));
        assert!(rendered.contains("plan_poll_interval_ms = 2000"));

        let parsed: AppConfig = rendered.parse().expect("parse rendered config");
        assert_eq!(parsed.launch.heartbeat_interval, Duration::from_millis(750));
        assert_eq!(parsed.lock.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn activity_timeout_shorter_than_poll_is_rejected() {
        let result: Result<AppConfig> = r#"
            [supervisor]
            poll_interval = 30
            activity_timeout = 10
        "#
        .parse();
        assert!(result.is_err());
    }

    #[test]
    fn load_with_source_reports_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("fleet.toml");
        fs::write(&present, "[launch]\nmax_install_attempts = 4\n").expect("write config");

        let loaded = AppConfig::load_with_source(&[missing, present.clone()]).expect("loads");
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.launch.max_install_attempts, 4);
    }
}
