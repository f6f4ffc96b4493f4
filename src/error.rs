use crate::board::compensation::CompensationError;
use crate::board::discovery::DiscoveryError;
use crate::board::dispatcher::DispatchError;
use crate::config::ConfigError;

/// Errors returned by the public driver API
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Compensation(#[from] CompensationError),

    #[error("{what} {value} is outside {min}..={max}")]
    InvalidRange {
        what: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("Invalid I2C address 0x{0:02X} (must be 0x03..=0x77)")]
    InvalidAddress(u8),

    #[error("Failed to start the watchdog thread: {0}")]
    WatchdogStart(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
