// Transport adapters for the board's I2C link
//
// The driver core never opens the bus itself. Everything it needs from the
// hardware goes through the `Transport` trait:
// - read: write the register (command) byte, then read `len` bytes back
// - write: write the register byte followed by the data bytes

#[cfg(target_os = "linux")]
mod linux;
pub mod sim;

use std::fmt;

use serde::{Deserialize, Serialize};

#[cfg(target_os = "linux")]
pub use linux::LinuxI2c;
pub use sim::SimulatedBoard;

/// One candidate board location: bus number and 7-bit device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    pub bus: u8,
    pub address: u8,
}

impl BusAddress {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} @ 0x{:02X}", self.bus, self.address)
    }
}

/// Bus-level failures. All of them are treated as transient by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I2C bus {bus} is not available")]
    NoBus { bus: u8 },

    #[error("No acknowledgment from device 0x{address:02X} on bus {bus}")]
    Nack { bus: u8, address: u8 },

    #[error("I2C bus {bus} is busy")]
    Busy { bus: u8 },

    #[error("Timeout on I2C bus {bus}")]
    Timeout { bus: u8 },

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw register access to a device on a numbered bus
pub trait Transport: Send + 'static {
    fn read(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, TransportError>;

    fn write(&mut self, bus: u8, address: u8, register: u8, data: &[u8])
    -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).read(bus, address, register, len)
    }

    fn write(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        (**self).write(bus, address, register, data)
    }
}
