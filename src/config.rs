// Defaults for discovery, retries, watchdog and voltage compensation
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::board::dispatcher::RetryPolicy;

// Candidate buses in probe order: rev 2 boards sit on bus 1, rev 1 boards on bus 0
pub const DEFAULT_BUSES: [u8; 2] = [1, 0];

// Factory I2C address of the board
pub const DEFAULT_ADDRESS: u8 = 0x15;

// Dispatcher retry policy
pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(10);

// Watchdog: motors are halted if no command is seen for this long
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(250);

// Watchdog tick frequency
pub const WATCHDOG_HZ: u64 = 50;

// Voltage compensation
pub const NOMINAL_VOLTAGE: f32 = 12.0 * 0.95; // 12V motors, 95% of rating
pub const MIN_SAFE_VOLTAGE: f32 = 6.0; // board's bare minimum supply

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Driver settings, loadable from JSON. Missing fields take the defaults above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub buses: Vec<u8>,
    pub address: u8,
    pub allow_scan: bool,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub watchdog_tick_ms: u64,
    pub board_failsafe: bool,
    pub nominal_voltage: f32,
    pub min_voltage: f32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            buses: DEFAULT_BUSES.to_vec(),
            address: DEFAULT_ADDRESS,
            allow_scan: false,
            retry_attempts: RETRY_ATTEMPTS,
            retry_backoff_ms: RETRY_BACKOFF.as_millis() as u64,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT.as_millis() as u64,
            watchdog_tick_ms: 1000 / WATCHDOG_HZ,
            board_failsafe: false,
            nominal_voltage: NOMINAL_VOLTAGE,
            min_voltage: MIN_SAFE_VOLTAGE,
        }
    }
}

impl DriverConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buses.is_empty() {
            return Err(ConfigError::Invalid("no candidate buses".into()));
        }
        if self.address > 0x7F {
            return Err(ConfigError::Invalid(format!(
                "address 0x{:02X} is not a 7-bit address",
                self.address
            )));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(ConfigError::Invalid("watchdog_timeout_ms must be non-zero".into()));
        }
        if self.watchdog_tick_ms == 0 || self.watchdog_tick_ms >= self.watchdog_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "watchdog_tick_ms ({}) must be between 1 and watchdog_timeout_ms ({})",
                self.watchdog_tick_ms, self.watchdog_timeout_ms
            )));
        }
        for (name, volts) in [
            ("nominal_voltage", self.nominal_voltage),
            ("min_voltage", self.min_voltage),
        ] {
            if !volts.is_finite() || volts <= 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be positive, got {}", name, volts)));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms)
    }
}
