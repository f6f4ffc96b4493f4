// Driver for the PiBorg ThunderBorg dual motor controller

pub mod board;
pub mod config;
pub mod error;
pub mod messages;
pub mod transport;
pub mod watchdog;

pub use board::{BoardHandle, ThunderBorg};
pub use config::DriverConfig;
pub use error::{DriverError, Result};
pub use messages::{BatteryLimits, BoardStatus, Led, LedColor, MotorChannel};
pub use transport::{BusAddress, Transport, TransportError};
pub use watchdog::WatchdogPhase;
