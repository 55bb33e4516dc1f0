//! Configuration using Figment.
//!
//! Loaded from, in increasing precedence:
//! 1. `config/graphitizer.toml`
//! 2. Environment variables prefixed with `GRAPHITIZER_`, nested keys split on `__`
//!    (e.g. `GRAPHITIZER_API__LISTEN=127.0.0.1:8080`)
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration that locates the controller by USB serial number.
//!
//! # Example
//! ```no_run
//! use graphitizer::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("listening on {}", settings.api.listen);
//! # Ok::<(), graphitizer::error::ConfigError>(())
//! ```

use crate::confirmation::ConfirmationSchedule;
use crate::error::ConfigError;
use crate::hardware::gate::DEFAULT_READ_TIMEOUT;
use crate::hardware::serial::{normalize_serials, PortLocator, DEFAULT_BAUD_RATE};
use crate::logging::{LoggingConfig, OutputFormat};
use crate::protocol::codec::FrameLimits;
use crate::telemetry::DEFAULT_MEASUREMENT;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/graphitizer.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GRAPHITIZER_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Serial channel.
    #[serde(default)]
    pub device: DeviceSettings,
    /// Background telemetry loop.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    /// Write confirmation delays and budget.
    #[serde(default)]
    pub confirmation: ConfirmationSchedule,
    /// Time-series store.
    #[serde(default)]
    pub sink: SinkSettings,
    /// HTTP front end.
    #[serde(default)]
    pub api: ApiSettings,
    /// Log level and format.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How to find and talk to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Fixed port path. Takes precedence over serial-number discovery.
    #[serde(default)]
    pub port: Option<String>,
    /// USB serial numbers accepted as the controller.
    #[serde(default)]
    pub serial_numbers: Vec<String>,
    /// File with one accepted serial number per line, merged with `serial_numbers`.
    #[serde(default = "default_serial_numbers_file")]
    pub serial_numbers_file: Option<PathBuf>,
    /// Line speed; the controller runs at 115200.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Time allowed for a reply line.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Pause between discovery scans.
    #[serde(default = "default_locate_interval", with = "humantime_serde")]
    pub locate_interval: Duration,
    /// Discovery scans before giving up; `None` waits forever.
    #[serde(default)]
    pub locate_attempts: Option<u32>,
    /// Accepted reply lengths.
    #[serde(default)]
    pub frame: FrameLimits,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_serial_numbers_file() -> Option<PathBuf> {
    Some(PathBuf::from("serial_numbers.txt"))
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_locate_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: None,
            serial_numbers: Vec::new(),
            serial_numbers_file: default_serial_numbers_file(),
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            locate_interval: default_locate_interval(),
            locate_attempts: None,
            frame: FrameLimits::default(),
        }
    }
}

impl DeviceSettings {
    /// Build the locator, reading `serial_numbers_file` if set.
    pub fn locator(&self) -> Result<PortLocator, ConfigError> {
        if let Some(port) = &self.port {
            return Ok(PortLocator::Fixed(port.clone()));
        }

        let mut serials = self.serial_numbers.clone();
        if let Some(path) = &self.serial_numbers_file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::Invalid(format!(
                    "cannot read serial numbers from {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serials.extend(contents.lines().map(str::to_string));
        }

        let allowed = normalize_serials(serials);
        if allowed.is_empty() {
            return Err(ConfigError::Invalid(
                "device.port is unset and no serial numbers are configured".to_string(),
            ));
        }
        tracing::info!(serials = ?allowed, "Accepted controller serial numbers");
        Ok(PortLocator::UsbSerial {
            allowed,
            interval: self.locate_interval,
            attempts: self.locate_attempts,
        })
    }
}

/// Telemetry loop timing and point naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Period between snapshots.
    #[serde(default = "default_telemetry_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Measurement name for stored points.
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_telemetry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_measurement() -> String {
    DEFAULT_MEASUREMENT.to_string()
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            interval: default_telemetry_interval(),
            measurement: default_measurement(),
        }
    }
}

/// InfluxDB target. With `enabled = false` points are only logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Write to InfluxDB when true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the InfluxDB HTTP API.
    #[serde(default = "default_sink_url")]
    pub url: String,
    /// Target database. Must exist.
    #[serde(default = "default_database")]
    pub database: String,
    /// Retention policy; empty or unset uses the database default.
    #[serde(default = "default_retention_policy")]
    pub retention_policy: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_sink_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_database() -> String {
    "data".to_string()
}

fn default_retention_policy() -> Option<String> {
    Some("autogen".to_string())
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            url: default_sink_url(),
            database: default_database(),
            retention_policy: default_retention_policy(),
            timeout: default_sink_timeout(),
        }
    }
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9999))
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Logging as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// trace, debug, info, warn, error. `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingSettings {
    /// Parse into a [`LoggingConfig`].
    pub fn to_logging_config(&self) -> Result<LoggingConfig, ConfigError> {
        let level = crate::logging::parse_log_level(&self.level).map_err(ConfigError::Invalid)?;
        let format: OutputFormat = self.format.parse().map_err(ConfigError::Invalid)?;
        Ok(LoggingConfig::new(level).with_format(format))
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment. A missing file is allowed.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.to_logging_config()?;

        if self.device.baud_rate == 0 {
            return Err(ConfigError::Invalid("device.baud_rate must be positive".into()));
        }
        if self.device.read_timeout.is_zero() {
            return Err(ConfigError::Invalid("device.read_timeout must be positive".into()));
        }
        if let Some(max) = self.device.frame.max_len {
            if max < self.device.frame.min_len {
                return Err(ConfigError::Invalid(format!(
                    "device.frame.max_len ({}) is below min_len ({})",
                    max, self.device.frame.min_len
                )));
            }
        }
        if self.telemetry.interval.is_zero() {
            return Err(ConfigError::Invalid("telemetry.interval must be positive".into()));
        }
        if self.telemetry.measurement.trim().is_empty() {
            return Err(ConfigError::Invalid("telemetry.measurement must not be empty".into()));
        }
        if self.confirmation.budget.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "confirmation.budget.max_attempts must be at least 1".into(),
            ));
        }
        if self.sink.enabled {
            if !(self.sink.url.starts_with("http://") || self.sink.url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "sink.url '{}' must start with http:// or https://",
                    self.sink.url
                )));
            }
            if self.sink.database.trim().is_empty() {
                return Err(ConfigError::Invalid("sink.database must not be empty".into()));
            }
        }
        Ok(())
    }
}
