use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::TimestampMode;
use crate::pid::DEFAULT_IDENTITY_VAR;
use crate::sink::aggregated::ManifestFormat;

/// Environment variable overriding `output.dir`.
pub const OUT_DIR_ENV: &str = "OUT_DIR";

/// Top-level configuration for the codeint agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Manifest output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// How often every known application's manifest is rewritten. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Process identity lookup configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Raw record source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// How record timestamps are rendered. Default: raw.
    #[serde(default)]
    pub timestamps: TimestampMode,

    /// Interval of the event statistics log line. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Manifest output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving one manifest per application. Default: "/out".
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Manifest serialization format. Default: yaml.
    #[serde(default)]
    pub format: ManifestFormat,

    /// Sort manifest entries by their key. Default: true.
    #[serde(default = "default_true")]
    pub sort_entries: bool,
}

/// Process identity lookup configuration.
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    /// Environment variable naming the application. Default: "CODEINT_SERVICE".
    #[serde(default = "default_identity_var")]
    pub env_var: String,

    /// procfs mount point. Default: "/proc".
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

/// Raw record source configuration.
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    /// FIFO or file carrying fixed-width records; "-" reads stdin. Default: "-".
    #[serde(default = "default_source_path")]
    pub path: String,

    /// Bounded queue depth between the reader and the ingestion loop. Default: 4096.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/out")
}

fn default_true() -> bool {
    true
}

fn default_identity_var() -> String {
    DEFAULT_IDENTITY_VAR.to_string()
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_source_path() -> String {
    "-".to_string()
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            output: OutputConfig::default(),
            flush_interval: default_flush_interval(),
            identity: IdentityConfig::default(),
            source: SourceConfig::default(),
            timestamps: TimestampMode::default(),
            stats_interval: default_stats_interval(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            format: ManifestFormat::default(),
            sort_entries: default_true(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            env_var: default_identity_var(),
            proc_root: default_proc_root(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, apply environment overrides and
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Load from `path` when given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(OUT_DIR_ENV) {
            if !dir.is_empty() {
                self.output.dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.output.dir.as_os_str().is_empty() {
            bail!("output.dir is required");
        }

        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.identity.env_var.is_empty() {
            bail!("identity.env_var is required");
        }

        if self.identity.env_var.contains('=') || self.identity.env_var.contains('\0') {
            bail!(
                "identity.env_var {:?} must not contain '=' or NUL",
                self.identity.env_var
            );
        }

        if self.source.path.is_empty() {
            bail!("source.path is required");
        }

        if self.source.channel_capacity == 0 {
            bail!("source.channel_capacity must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled is true");
        }

        Ok(())
    }
}
