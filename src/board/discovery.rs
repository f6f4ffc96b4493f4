// Board discovery
//
// Probes candidate buses in the caller's order at the given address and takes
// the first location whose GET_ID answer carries the ThunderBorg signature.
// A failed or foreign probe never aborts the scan. If every candidate fails and
// scanning is allowed, the whole address range of each bus is swept.

use std::fmt;

use tracing::{debug, info, warn};

use super::dispatcher::BoardHandle;
use super::protocol::{self, BOARD_ID, Command, MAX_ADDRESS, MIN_ADDRESS, ProtocolError, READ_LEN};
use crate::transport::{BusAddress, Transport, TransportError};

/// Why one candidate location was rejected
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("device reports ID 0x{found:02X} instead of 0x{expected:02X}", expected = BOARD_ID)]
    WrongBoard { found: u8 },
}

/// One rejected candidate, kept for diagnostics
#[derive(Debug)]
pub struct ProbeAttempt {
    pub location: BusAddress,
    pub failure: ProbeFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid I2C address 0x{0:02X}")]
    InvalidAddress(u8),

    #[error("Device at {location} is not a ThunderBorg (ID 0x{found:02X})")]
    WrongBoard { location: BusAddress, found: u8 },

    #[error("Board at {location} did not answer: {source}")]
    Unreachable {
        location: BusAddress,
        source: ProbeFailure,
    },

    #[error("ThunderBorg not found; tried {}", AttemptList(.attempts))]
    BoardNotFound { attempts: Vec<ProbeAttempt> },
}

struct AttemptList<'a>(&'a [ProbeAttempt]);

impl fmt::Display for AttemptList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "nothing");
        }
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({})", attempt.location, attempt.failure)?;
        }
        Ok(())
    }
}

/// Read GET_ID at one location and check the signature
pub fn probe<T: Transport>(transport: &mut T, location: BusAddress) -> Result<BoardHandle, ProbeFailure> {
    let raw = transport.read(location.bus, location.address, Command::GetId.code(), READ_LEN)?;
    let response = protocol::decode(&raw, Command::GetId)?;
    let found = response.byte(0);
    if found != BOARD_ID {
        return Err(ProbeFailure::WrongBoard { found });
    }
    Ok(BoardHandle {
        location,
        board_id: found,
    })
}

/// Probe a single known location
pub fn verify<T: Transport>(transport: &mut T, location: BusAddress) -> Result<BoardHandle, DiscoveryError> {
    match probe(transport, location) {
        Ok(handle) => Ok(handle),
        Err(ProbeFailure::WrongBoard { found }) => Err(DiscoveryError::WrongBoard { location, found }),
        Err(source) => Err(DiscoveryError::Unreachable { location, source }),
    }
}

/// Find the board: explicit candidates first, then an optional address sweep
pub fn discover<T: Transport>(
    transport: &mut T,
    candidate_buses: &[u8],
    address: u8,
    allow_scan: bool,
) -> Result<BoardHandle, DiscoveryError> {
    if address > 0x7F {
        return Err(DiscoveryError::InvalidAddress(address));
    }

    let mut attempts = Vec::new();

    for &bus in candidate_buses {
        let location = BusAddress::new(bus, address);
        debug!(%location, "Probing for ThunderBorg");
        match probe(transport, location) {
            Ok(handle) => {
                info!(%location, "Found ThunderBorg");
                return Ok(handle);
            }
            Err(failure) => {
                warn!(%location, "ThunderBorg not found: {}", failure);
                attempts.push(ProbeAttempt { location, failure });
            }
        }
    }

    if allow_scan {
        for &bus in candidate_buses {
            info!(bus, "Scanning I2C bus for ThunderBorg");
            for candidate in MIN_ADDRESS..MAX_ADDRESS {
                if candidate == address {
                    continue;
                }
                let location = BusAddress::new(bus, candidate);
                match probe(transport, location) {
                    Ok(handle) => {
                        info!(%location, "Found ThunderBorg during scan");
                        return Ok(handle);
                    }
                    Err(failure) => {
                        debug!(%location, "Scan miss: {}", failure);
                        attempts.push(ProbeAttempt { location, failure });
                    }
                }
            }
        }
    }

    Err(DiscoveryError::BoardNotFound { attempts })
}

/// Sweep one bus and list every address answering with the board signature
pub fn find_boards<T: Transport>(transport: &mut T, bus: u8) -> Vec<u8> {
    info!(bus, "Scanning I2C bus");
    let found: Vec<u8> = (MIN_ADDRESS..MAX_ADDRESS)
        .filter(|&address| probe(transport, BusAddress::new(bus, address)).is_ok())
        .collect();

    if found.is_empty() {
        warn!(bus, "No ThunderBorg boards found; is the bus number correct? (0 for rev 1, 1 for rev 2)");
    } else {
        info!(bus, count = found.len(), "Found ThunderBorg boards: {:02X?}", found);
    }
    found
}
