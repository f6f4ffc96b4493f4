// Linux i2c-dev adapter
//
// Each bus is the character device /dev/i2c-N. The target device is selected
// with the I2C_SLAVE ioctl, after which plain read/write calls talk to it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;

use tracing::debug;

use super::{Transport, TransportError};

/// Device path prefix for numbered I2C buses
pub const DEVICE_PREFIX: &str = "/dev/i2c-";

/// ioctl request selecting the slave address on an i2c-dev file
const I2C_SLAVE: libc::c_ulong = 0x0703;

struct BusDevice {
    file: File,
    selected: Option<u8>,
}

/// Transport backed by the kernel's i2c-dev interface
#[derive(Default)]
pub struct LinuxI2c {
    buses: HashMap<u8, BusDevice>,
}

impl LinuxI2c {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (once) the bus device and point it at `address`
    fn device(&mut self, bus: u8, address: u8) -> Result<&mut File, TransportError> {
        if !self.buses.contains_key(&bus) {
            let path = format!("{}{}", DEVICE_PREFIX, bus);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => TransportError::NoBus { bus },
                    _ => TransportError::Io(e),
                })?;
            debug!(bus, path = %path, "Opened I2C bus");
            self.buses.insert(bus, BusDevice { file, selected: None });
        }

        let device = self
            .buses
            .get_mut(&bus)
            .ok_or(TransportError::NoBus { bus })?;

        if device.selected != Some(address) {
            // SAFETY: the fd is owned by `device.file` and stays open for the
            // duration of the call; I2C_SLAVE takes the address by value.
            let rc = unsafe {
                libc::ioctl(
                    device.file.as_raw_fd(),
                    I2C_SLAVE as _,
                    libc::c_ulong::from(address),
                )
            };
            if rc < 0 {
                device.selected = None;
                return Err(map_io_error(io::Error::last_os_error(), bus, address));
            }
            device.selected = Some(address);
        }

        Ok(&mut device.file)
    }
}

fn map_io_error(e: io::Error, bus: u8, address: u8) -> TransportError {
    match e.raw_os_error() {
        Some(libc::ENXIO) | Some(libc::EREMOTEIO) => TransportError::Nack { bus, address },
        Some(libc::EBUSY) => TransportError::Busy { bus },
        _ if e.kind() == ErrorKind::TimedOut => TransportError::Timeout { bus },
        _ => TransportError::Io(e),
    }
}

impl Transport for LinuxI2c {
    fn read(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let file = self.device(bus, address)?;
        file.write_all(&[register])
            .map_err(|e| map_io_error(e, bus, address))?;

        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).map_err(|e| map_io_error(e, bus, address))?;
        if n != len {
            return Err(TransportError::ShortRead {
                expected: len,
                actual: n,
            });
        }
        Ok(buf)
    }

    fn write(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let file = self.device(bus, address)?;
        let mut packet = Vec::with_capacity(1 + data.len());
        packet.push(register);
        packet.extend_from_slice(data);
        file.write_all(&packet)
            .map_err(|e| map_io_error(e, bus, address))
    }
}
