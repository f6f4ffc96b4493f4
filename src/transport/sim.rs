// In-memory ThunderBorg model
//
// Answers the full command set through the protocol codec, so the driver can
// run without hardware. Clones share state: keep one clone to inspect the
// call log and inject faults after handing another to the driver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;

use super::{BusAddress, Transport, TransportError};
use crate::board::protocol::{
    self, ANALOG_MAX, BOARD_ID, Command, VALUE_FWD, VALUE_OFF, VALUE_ON, VALUE_REV, VOLTAGE_PIN_MAX,
};
use crate::messages::MotorChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Read,
    Write,
}

/// One transport call as seen by the simulated bus
#[derive(Debug, Clone)]
pub struct TransportCall {
    pub kind: CallKind,
    pub location: BusAddress,
    pub register: u8,
    pub data: Vec<u8>,
    pub at: Instant,
}

/// Register state of one simulated device
#[derive(Debug, Clone)]
struct DeviceModel {
    id: u8,
    leds: [[u8; 3]; 2],
    battery_monitor: bool,
    failsafe: bool,
    motors: [(u8, u8); 2],
    faults: [bool; 2],
    voltage_raw: u16,
    limits: [u8; 2],
    external_words: Vec<[u8; 4]>,
}

impl DeviceModel {
    fn new(id: u8) -> Self {
        Self {
            id,
            leds: [[0; 3]; 2],
            battery_monitor: false,
            failsafe: false,
            motors: [(VALUE_OFF, 0); 2],
            faults: [false; 2],
            voltage_raw: volts_to_raw(12.0),
            // 7V and 35V, as shipped
            limits: [49, 245],
            external_words: Vec::new(),
        }
    }

    fn respond(&self, command: Command) -> Vec<u8> {
        let flag = |on: bool| if on { VALUE_ON } else { VALUE_OFF };
        match command {
            Command::GetLed1 => self.leds[0].to_vec(),
            Command::GetLed2 => self.leds[1].to_vec(),
            Command::GetLedBatteryMonitor => vec![flag(self.battery_monitor)],
            Command::GetMotorA => vec![self.motors[0].0, self.motors[0].1],
            Command::GetMotorB => vec![self.motors[1].0, self.motors[1].1],
            Command::GetDriveFaultA => vec![flag(self.faults[0])],
            Command::GetDriveFaultB => vec![flag(self.faults[1])],
            Command::GetFailsafe => vec![flag(self.failsafe)],
            Command::GetBatteryVoltage => self.voltage_raw.to_be_bytes().to_vec(),
            Command::GetBatteryLimits => self.limits.to_vec(),
            Command::GetId => vec![self.id],
            _ => Vec::new(),
        }
    }

    fn apply(&mut self, command: Command, data: &[u8]) {
        let byte = |i: usize| data.get(i).copied().unwrap_or(0);
        let rgb = [byte(0), byte(1), byte(2)];
        match command {
            Command::SetLed1 => self.leds[0] = rgb,
            Command::SetLed2 => self.leds[1] = rgb,
            Command::SetLeds => self.leds = [rgb, rgb],
            Command::SetLedBatteryMonitor => self.battery_monitor = byte(0) == VALUE_ON,
            Command::SetMotorAForward => self.motors[0] = (VALUE_FWD, byte(0)),
            Command::SetMotorAReverse => self.motors[0] = (VALUE_REV, byte(0)),
            Command::SetMotorBForward => self.motors[1] = (VALUE_FWD, byte(0)),
            Command::SetMotorBReverse => self.motors[1] = (VALUE_REV, byte(0)),
            Command::SetAllForward => self.motors = [(VALUE_FWD, byte(0)); 2],
            Command::SetAllReverse => self.motors = [(VALUE_REV, byte(0)); 2],
            Command::AllOff => self.motors = [(VALUE_OFF, 0); 2],
            Command::SetFailsafe => self.failsafe = byte(0) == VALUE_ON,
            Command::SetBatteryLimits => self.limits = [byte(0), byte(1)],
            Command::WriteExternalLed => {
                self.external_words.push([byte(0), byte(1), byte(2), byte(3)])
            }
            _ => {}
        }
    }
}

fn volts_to_raw(volts: f32) -> u16 {
    let raw = (volts / VOLTAGE_PIN_MAX * f32::from(ANALOG_MAX)).round();
    raw.clamp(0.0, f32::from(ANALOG_MAX)) as u16
}

#[derive(Default)]
struct SimState {
    devices: HashMap<BusAddress, DeviceModel>,
    missing_buses: HashSet<u8>,
    fail_next: u32,
    fail_always: bool,
    fail_reads: u32,
    corrupt_next: u32,
    calls: Vec<TransportCall>,
}

impl SimState {
    fn record(&mut self, kind: CallKind, location: BusAddress, register: u8, data: &[u8]) {
        self.calls.push(TransportCall {
            kind,
            location,
            register,
            data: data.to_vec(),
            at: Instant::now(),
        });
    }

    /// Injected failures first, then missing bus / device
    fn check(&mut self, kind: CallKind, location: BusAddress) -> Result<(), TransportError> {
        let BusAddress { bus, address } = location;
        if self.fail_always {
            return Err(TransportError::Nack { bus, address });
        }
        if kind == CallKind::Read && self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(TransportError::Busy { bus });
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(TransportError::Nack { bus, address });
        }
        if self.missing_buses.contains(&bus) {
            return Err(TransportError::NoBus { bus });
        }
        if !self.devices.contains_key(&location) {
            return Err(TransportError::Nack { bus, address });
        }
        Ok(())
    }
}

/// Simulated I2C buses with ThunderBorg boards (and other devices) attached
#[derive(Clone, Default)]
pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    /// Empty buses, no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a ThunderBorg at `location`
    pub fn with_board(self, location: BusAddress) -> Self {
        self.with_device(location, BOARD_ID)
    }

    /// Attach a device reporting `id` to GET_ID
    pub fn with_device(self, location: BusAddress, id: u8) -> Self {
        self.lock().devices.insert(location, DeviceModel::new(id));
        self
    }

    /// Make every access to `bus` fail as if the bus device did not exist
    pub fn without_bus(self, bus: u8) -> Self {
        self.lock().missing_buses.insert(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail the next `n` transport calls with a NACK
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Fail every transport call until cleared
    pub fn fail_always(&self, enabled: bool) {
        self.lock().fail_always = enabled;
    }

    /// Report the bus busy on the next `n` reads; writes are unaffected
    pub fn fail_reads(&self, n: u32) {
        self.lock().fail_reads = n;
    }

    /// Corrupt the echo byte of the next `n` read frames
    pub fn corrupt_next(&self, n: u32) {
        self.lock().corrupt_next = n;
    }

    /// Set the supply voltage reported by every board
    pub fn set_voltage(&self, volts: f32) {
        let raw = volts_to_raw(volts);
        for device in self.lock().devices.values_mut() {
            device.voltage_raw = raw;
        }
    }

    /// Set the drive fault flag reported for a channel
    pub fn set_drive_fault(&self, location: BusAddress, channel: MotorChannel, fault: bool) {
        if let Some(device) = self.lock().devices.get_mut(&location) {
            device.faults[channel.index()] = fault;
        }
    }

    /// (direction, pwm) of both motors at `location`
    pub fn motor_pwm(&self, location: BusAddress) -> [(u8, u8); 2] {
        self.lock()
            .devices
            .get(&location)
            .map(|d| d.motors)
            .unwrap_or_default()
    }

    /// RGB bytes of both LEDs at `location`
    pub fn led_pwm(&self, location: BusAddress) -> [[u8; 3]; 2] {
        self.lock()
            .devices
            .get(&location)
            .map(|d| d.leds)
            .unwrap_or_default()
    }

    /// External LED words written to `location`, oldest first
    pub fn external_words(&self, location: BusAddress) -> Vec<[u8; 4]> {
        self.lock()
            .devices
            .get(&location)
            .map(|d| d.external_words.clone())
            .unwrap_or_default()
    }

    /// Locations with a device attached
    pub fn devices(&self) -> Vec<BusAddress> {
        self.lock().devices.keys().copied().collect()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of successful-or-not writes of `command`
    pub fn count_writes(&self, command: Command) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == CallKind::Write && c.register == command.code())
            .count()
    }
}

impl Transport for SimulatedBoard {
    fn read(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let location = BusAddress::new(bus, address);
        let mut state = self.lock();
        state.record(CallKind::Read, location, register, &[]);
        state.check(CallKind::Read, location)?;

        let command = Command::try_from(register).map_err(|_| TransportError::Nack { bus, address })?;
        let payload = state
            .devices
            .get(&location)
            .map(|d| d.respond(command))
            .unwrap_or_default();
        let mut frame = protocol::encode_response(command, &payload)
            .map_err(|_| TransportError::Nack { bus, address })?;

        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            frame[0] = frame[0].wrapping_add(1);
        }
        frame.resize(len, 0);
        Ok(frame)
    }

    fn write(
        &mut self,
        bus: u8,
        address: u8,
        register: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let location = BusAddress::new(bus, address);
        let mut state = self.lock();
        state.record(CallKind::Write, location, register, data);
        state.check(CallKind::Write, location)?;

        let command = Command::try_from(register).map_err(|_| TransportError::Nack { bus, address })?;
        if command == Command::SetI2cAddress {
            let target = BusAddress::new(bus, data.first().copied().unwrap_or(address));
            if let Some(device) = state.devices.remove(&location) {
                debug!(from = %location, to = %target, "Simulated board changed address");
                state.devices.insert(target, device);
            }
            return Ok(());
        }

        if let Some(device) = state.devices.get_mut(&location) {
            device.apply(command, data);
        }
        Ok(())
    }
}
