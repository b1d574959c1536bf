//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/hv_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `HVDAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! HVDAQ_APPLICATION__LOG_LEVEL=debug
//! HVDAQ_SERVER__BIND=0.0.0.0:8000
//! HVDAQ_BRIDGE__COMMAND_TIMEOUT=2s
//! ```
//!
//! Durations use humantime syntax ("500ms", "5s", "1m").

pub mod store;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentSlot;
use crate::logging::{self, LogFormat};
use crate::params::{StabilizationParameters, TestParameters};

pub use store::{ConfigStore, SettingsStore};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/hv_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Command bridge queue and timeouts
    pub bridge: BridgeConfig,
    /// Telemetry hub, poller and journal
    pub telemetry: TelemetryConfig,
    /// HTTP control surface
    pub server: ServerConfig,
    /// Safety limits
    pub safety: SafetyConfig,
    /// Port bindings, keyed by slot name
    pub instruments: BTreeMap<InstrumentSlot, PortBinding>,
    /// Ramp test parameters
    pub test: TestParameters,
    /// Current stabilization parameters
    pub stabilization: StabilizationParameters,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "HV Test Bench".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Command bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Capacity of the bounded command queue
    pub queue_capacity: usize,
    /// Upper bound on a caller's wait for its reply
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Upper bound on a single instrument call inside the owner task
    #[serde(with = "humantime_serde")]
    pub device_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            command_timeout: Duration::from_secs(5),
            device_timeout: Duration::from_secs(3),
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Snapshot period
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Plot samples retained
    pub history_capacity: usize,
    /// Most recent samples attached to each published frame
    pub frame_history: usize,
    /// Frames buffered per subscriber before frames are dropped for it
    pub subscriber_capacity: usize,
    /// Instrument poll period; zero disables the poller
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Optional JSON-lines snapshot journal
    pub journal: Option<JournalConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
            history_capacity: 3000,
            frame_history: 600,
            subscriber_capacity: 16,
            poll_interval: Duration::from_millis(500),
            journal: None,
        }
    }
}

/// Snapshot journal configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// File snapshots are appended to
    pub path: PathBuf,
    /// Snapshots per write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Longest time a partial batch waits
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the HTTP control surface
    pub enabled: bool,
    /// Listen address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

/// Safety limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Voltage applied by `reset_voltage`
    pub safe_voltage: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            safe_voltage: 100.0,
        }
    }
}

/// Port binding for one instrument slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Serial port or VISA resource string (e.g. "COM3", "GPIB0::14::INSTR")
    pub port: String,
    /// Scaling coefficient applied to readings
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
    /// Baud rate for serial transports
    #[serde(default)]
    pub baud_rate: Option<u32>,
}

fn default_coefficient() -> f64 {
    1.0
}

impl PortBinding {
    /// A binding with unit coefficient and no baud rate.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            coefficient: 1.0,
            baud_rate: None,
        }
    }

    /// Checks that the port is set and the coefficient is usable.
    pub fn validate(&self) -> AppResult<()> {
        if self.port.trim().is_empty() {
            return Err(DaqError::ConfigInvalid("port cannot be empty".to_string()));
        }
        validate_coefficient(self.coefficient)
    }
}

/// Coefficients must be finite and non-zero.
pub fn validate_coefficient(coefficient: f64) -> AppResult<()> {
    if coefficient.is_finite() && coefficient != 0.0 {
        Ok(())
    } else {
        Err(DaqError::ConfigInvalid(format!(
            "Invalid coefficient {}. Must be finite and non-zero",
            coefficient
        )))
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `path` (or the default path) and the environment
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// After loading, configuration is validated.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Self::figment(path).extract::<Self>()?.validated()
    }

    /// The provider stack used by [`Settings::load`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HVDAQ_").split("__"))
    }

    fn validated(self) -> AppResult<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration after loading
    ///
    /// Checks log level, queue and history sizes, timeouts, the safe voltage, every
    /// port binding and both parameter sets.
    pub fn validate(&self) -> AppResult<()> {
        logging::parse_log_level(&self.application.log_level)?;

        if self.bridge.queue_capacity == 0 {
            return Err(DaqError::ConfigInvalid(
                "bridge.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.bridge.command_timeout.is_zero() || self.bridge.device_timeout.is_zero() {
            return Err(DaqError::ConfigInvalid(
                "bridge timeouts must be > 0".to_string(),
            ));
        }
        if self.telemetry.period.is_zero() {
            return Err(DaqError::ConfigInvalid(
                "telemetry.period must be > 0".to_string(),
            ));
        }
        if self.telemetry.history_capacity == 0 || self.telemetry.subscriber_capacity == 0 {
            return Err(DaqError::ConfigInvalid(
                "telemetry capacities must be > 0".to_string(),
            ));
        }
        if let Some(journal) = &self.telemetry.journal {
            if journal.batch_size == 0 || journal.flush_interval.is_zero() {
                return Err(DaqError::ConfigInvalid(
                    "telemetry.journal batch_size and flush_interval must be > 0".to_string(),
                ));
            }
        }
        if !self.safety.safe_voltage.is_finite() {
            return Err(DaqError::ConfigInvalid(
                "safety.safe_voltage must be finite".to_string(),
            ));
        }

        for (slot, binding) in &self.instruments {
            binding
                .validate()
                .map_err(|e| DaqError::ConfigInvalid(format!("instruments.{}: {}", slot, e)))?;
        }

        self.test.validate()?;
        self.stabilization.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::CurrentSource;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.bridge, BridgeConfig::default());
        assert_eq!(settings.safety.safe_voltage, 100.0);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[bridge]
command_timeout = "250ms"

[instruments.cathode]
port = "COM4"
coefficient = 2.5

[stabilization]
current_source = "anode"
target_current = 12.0

[stabilization.algorithm]
kind = "approach"
step = 2.0
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.bridge.command_timeout, Duration::from_millis(250));
        assert_eq!(settings.bridge.queue_capacity, 64);
        let cathode = &settings.instruments[&InstrumentSlot::Cathode];
        assert_eq!(cathode.port, "COM4");
        assert_eq!(cathode.coefficient, 2.5);
        assert_eq!(settings.stabilization.current_source, CurrentSource::Anode);
        assert_eq!(settings.stabilization.algorithm.name(), "approach");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[test]\nvoltage_step = 0.0\n").unwrap();
        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(DaqError::ConfigInvalid(_))
        ));

        let mut settings = Settings::default();
        settings
            .instruments
            .insert(InstrumentSlot::Gate, PortBinding::new(""));
        assert!(settings.validate().is_err());
    }
}
