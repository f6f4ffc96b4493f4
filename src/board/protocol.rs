// ThunderBorg command protocol
//
// Requests are a command byte followed by a fixed-length payload:
//   [Command, Params...]
// Reads answer with a fixed 6-byte frame:
//   [Command echo, Payload..., zero padding]
//
// Request/response lengths and value ranges live in COMMAND_TABLE so the
// codec can be checked generically across every command.

use std::fmt;

/// Length of every read frame (echo byte + 5 payload bytes)
pub const READ_LEN: usize = 6;

/// Identity byte reported by GET_ID
pub const BOARD_ID: u8 = 0x15;

/// Full-scale PWM value
pub const PWM_MAX: u8 = 255;

/// Full-scale analog reading (10-bit ADC)
pub const ANALOG_MAX: u16 = 0x3FF;

/// Full-scale voltage of the battery monitoring pin, and its calibration offset
pub const VOLTAGE_PIN_MAX: f32 = 36.3;
pub const VOLTAGE_PIN_CORRECTION: f32 = 0.0;

/// Byte values for flags and drive direction
pub const VALUE_OFF: u8 = 0;
pub const VALUE_ON: u8 = 1;
pub const VALUE_FWD: u8 = 1;
pub const VALUE_REV: u8 = 2;

/// Assignable I2C addresses
pub const MIN_ADDRESS: u8 = 0x03;
pub const MAX_ADDRESS: u8 = 0x77;

/// Command set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SetLed1 = 1,
    GetLed1 = 2,
    SetLed2 = 3,
    GetLed2 = 4,
    SetLeds = 5,
    SetLedBatteryMonitor = 6,
    GetLedBatteryMonitor = 7,
    SetMotorAForward = 8,
    SetMotorAReverse = 9,
    GetMotorA = 10,
    SetMotorBForward = 11,
    SetMotorBReverse = 12,
    GetMotorB = 13,
    AllOff = 14,
    GetDriveFaultA = 15,
    GetDriveFaultB = 16,
    SetAllForward = 17,
    SetAllReverse = 18,
    SetFailsafe = 19,
    GetFailsafe = 20,
    GetBatteryVoltage = 21,
    SetBatteryLimits = 22,
    GetBatteryLimits = 23,
    WriteExternalLed = 24,
    GetId = 0x99,
    SetI2cAddress = 0xAA,
}

impl Command {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Static metadata for this command
    pub fn spec(self) -> &'static CommandSpec {
        &COMMAND_TABLE[self.index()]
    }

    /// True if the board answers this command with a read frame
    pub fn is_read(self) -> bool {
        self.spec().response.len > 0
    }

    const fn index(self) -> usize {
        match self {
            Command::SetLed1 => 0,
            Command::GetLed1 => 1,
            Command::SetLed2 => 2,
            Command::GetLed2 => 3,
            Command::SetLeds => 4,
            Command::SetLedBatteryMonitor => 5,
            Command::GetLedBatteryMonitor => 6,
            Command::SetMotorAForward => 7,
            Command::SetMotorAReverse => 8,
            Command::GetMotorA => 9,
            Command::SetMotorBForward => 10,
            Command::SetMotorBReverse => 11,
            Command::GetMotorB => 12,
            Command::AllOff => 13,
            Command::GetDriveFaultA => 14,
            Command::GetDriveFaultB => 15,
            Command::SetAllForward => 16,
            Command::SetAllReverse => 17,
            Command::SetFailsafe => 18,
            Command::GetFailsafe => 19,
            Command::GetBatteryVoltage => 20,
            Command::SetBatteryLimits => 21,
            Command::GetBatteryLimits => 22,
            Command::WriteExternalLed => 23,
            Command::GetId => 24,
            Command::SetI2cAddress => 25,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        COMMAND_TABLE
            .iter()
            .map(|spec| spec.command)
            .find(|command| command.code() == code)
            .ok_or(code)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.code())
    }
}

/// Value constraint on one field of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCheck {
    /// Single byte within `min..=max`
    Byte { offset: usize, min: u8, max: u8 },
    /// Big-endian 16-bit word not above `max`
    Word { offset: usize, max: u16 },
}

impl ValueCheck {
    /// Returns the offending value if the check fails
    fn violation(&self, payload: &[u8]) -> Option<(usize, u16)> {
        match *self {
            ValueCheck::Byte { offset, min, max } => {
                let value = *payload.get(offset)?;
                (value < min || value > max).then_some((offset, u16::from(value)))
            }
            ValueCheck::Word { offset, max } => {
                let hi = *payload.get(offset)?;
                let lo = *payload.get(offset + 1)?;
                let value = u16::from_be_bytes([hi, lo]);
                (value > max).then_some((offset, value))
            }
        }
    }
}

/// Expected length and value ranges of one direction of a command
#[derive(Debug, Clone, Copy)]
pub struct FrameShape {
    pub len: usize,
    pub checks: &'static [ValueCheck],
}

impl FrameShape {
    const fn empty() -> Self {
        Self { len: 0, checks: &[] }
    }

    const fn bytes(len: usize) -> Self {
        Self { len, checks: &[] }
    }

    const fn checked(len: usize, checks: &'static [ValueCheck]) -> Self {
        Self { len, checks }
    }

    fn violation(&self, payload: &[u8]) -> Option<(usize, u16)> {
        self.checks.iter().find_map(|check| check.violation(payload))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub command: Command,
    pub request: FrameShape,
    pub response: FrameShape,
}

const FLAG: &[ValueCheck] = &[ValueCheck::Byte { offset: 0, min: VALUE_OFF, max: VALUE_ON }];
const DIRECTION: &[ValueCheck] = &[ValueCheck::Byte { offset: 0, min: VALUE_OFF, max: VALUE_REV }];
const ANALOG: &[ValueCheck] = &[ValueCheck::Word { offset: 0, max: ANALOG_MAX }];
const ADDRESS: &[ValueCheck] = &[ValueCheck::Byte { offset: 0, min: MIN_ADDRESS, max: MAX_ADDRESS }];

const fn setter(command: Command, request: FrameShape) -> CommandSpec {
    CommandSpec { command, request, response: FrameShape::empty() }
}

const fn getter(command: Command, response: FrameShape) -> CommandSpec {
    CommandSpec { command, request: FrameShape::empty(), response }
}

/// Every command the board understands, in `Command::index` order
pub static COMMAND_TABLE: [CommandSpec; 26] = [
    setter(Command::SetLed1, FrameShape::bytes(3)),
    getter(Command::GetLed1, FrameShape::bytes(3)),
    setter(Command::SetLed2, FrameShape::bytes(3)),
    getter(Command::GetLed2, FrameShape::bytes(3)),
    setter(Command::SetLeds, FrameShape::bytes(3)),
    setter(Command::SetLedBatteryMonitor, FrameShape::checked(1, FLAG)),
    getter(Command::GetLedBatteryMonitor, FrameShape::checked(1, FLAG)),
    setter(Command::SetMotorAForward, FrameShape::bytes(1)),
    setter(Command::SetMotorAReverse, FrameShape::bytes(1)),
    getter(Command::GetMotorA, FrameShape::checked(2, DIRECTION)),
    setter(Command::SetMotorBForward, FrameShape::bytes(1)),
    setter(Command::SetMotorBReverse, FrameShape::bytes(1)),
    getter(Command::GetMotorB, FrameShape::checked(2, DIRECTION)),
    setter(Command::AllOff, FrameShape::bytes(1)),
    getter(Command::GetDriveFaultA, FrameShape::checked(1, FLAG)),
    getter(Command::GetDriveFaultB, FrameShape::checked(1, FLAG)),
    setter(Command::SetAllForward, FrameShape::bytes(1)),
    setter(Command::SetAllReverse, FrameShape::bytes(1)),
    setter(Command::SetFailsafe, FrameShape::checked(1, FLAG)),
    getter(Command::GetFailsafe, FrameShape::checked(1, FLAG)),
    getter(Command::GetBatteryVoltage, FrameShape::checked(2, ANALOG)),
    setter(Command::SetBatteryLimits, FrameShape::bytes(2)),
    getter(Command::GetBatteryLimits, FrameShape::bytes(2)),
    setter(Command::WriteExternalLed, FrameShape::bytes(4)),
    getter(Command::GetId, FrameShape::bytes(1)),
    setter(Command::SetI2cAddress, FrameShape::checked(1, ADDRESS)),
];

/// One encoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Wire bytes: command byte followed by the payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.command.code());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// One validated response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    /// Payload byte at `index`, zero when absent
    pub fn byte(&self, index: usize) -> u8 {
        self.payload.get(index).copied().unwrap_or(0)
    }

    /// Big-endian word starting at `index`
    pub fn word(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.byte(index), self.byte(index + 1)])
    }
}

/// Caller-supplied payload does not fit the command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPayloadError {
    #[error("{command} expects {expected} payload bytes, got {actual}")]
    Length {
        command: Command,
        expected: usize,
        actual: usize,
    },

    #[error("{command} payload byte {offset} out of range: {value}")]
    Value {
        command: Command,
        offset: usize,
        value: u16,
    },
}

/// Which decode check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Echo byte names a different command (stale or misaligned frame)
    CommandMismatch { received: u8 },
    /// Frame is not the expected length
    Length { expected: usize, actual: usize },
    /// A payload field is outside its documented range
    OutOfRange { offset: usize, value: u16 },
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorKind::CommandMismatch { received } => {
                write!(f, "echoed command 0x{:02X}", received)
            }
            ProtocolErrorKind::Length { expected, actual } => {
                write!(f, "expected {} bytes, got {}", expected, actual)
            }
            ProtocolErrorKind::OutOfRange { offset, value } => {
                write!(f, "payload byte {} out of range: {}", offset, value)
            }
        }
    }
}

/// Response failed validation; the raw frame is kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid response to {command}: {kind} (raw {raw:02X?})")]
pub struct ProtocolError {
    pub command: Command,
    pub kind: ProtocolErrorKind,
    pub raw: Vec<u8>,
}

/// Build a request frame, checking the payload against the command table
pub fn encode(command: Command, payload: &[u8]) -> Result<CommandFrame, InvalidPayloadError> {
    let shape = &command.spec().request;
    if payload.len() != shape.len {
        return Err(InvalidPayloadError::Length {
            command,
            expected: shape.len,
            actual: payload.len(),
        });
    }
    if let Some((offset, value)) = shape.violation(payload) {
        return Err(InvalidPayloadError::Value {
            command,
            offset,
            value,
        });
    }

    Ok(CommandFrame {
        command,
        payload: payload.to_vec(),
    })
}

/// Validate a read frame against the command that was sent
pub fn decode(raw: &[u8], expected: Command) -> Result<ResponseFrame, ProtocolError> {
    let fail = |kind| ProtocolError {
        command: expected,
        kind,
        raw: raw.to_vec(),
    };

    if raw.len() != READ_LEN {
        return Err(fail(ProtocolErrorKind::Length {
            expected: READ_LEN,
            actual: raw.len(),
        }));
    }
    if raw[0] != expected.code() {
        return Err(fail(ProtocolErrorKind::CommandMismatch { received: raw[0] }));
    }

    let shape = &expected.spec().response;
    let payload = &raw[1..1 + shape.len];
    if let Some((offset, value)) = shape.violation(payload) {
        return Err(fail(ProtocolErrorKind::OutOfRange { offset, value }));
    }

    Ok(ResponseFrame {
        command: expected,
        payload: payload.to_vec(),
    })
}

/// Build the read frame a board sends back for `command`
pub fn encode_response(command: Command, payload: &[u8]) -> Result<Vec<u8>, InvalidPayloadError> {
    let shape = &command.spec().response;
    if payload.len() != shape.len {
        return Err(InvalidPayloadError::Length {
            command,
            expected: shape.len,
            actual: payload.len(),
        });
    }

    let mut frame = vec![0u8; READ_LEN];
    frame[0] = command.code();
    frame[1..1 + payload.len()].copy_from_slice(payload);
    Ok(frame)
}
