// High-level driver for the ThunderBorg board
//
// Ties discovery, dispatch, the failsafe watchdog and voltage compensation
// together behind one handle. All register traffic goes through a single
// mutex-guarded session, so the watchdog's own halt and caller commands never
// interleave on the bus.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::compensation::{self, Direction};
use super::discovery;
use super::dispatcher::{BoardHandle, DispatchError, Dispatcher};
use super::protocol::{
    ANALOG_MAX, Command, MAX_ADDRESS, MIN_ADDRESS, PWM_MAX, ResponseFrame, VALUE_OFF, VALUE_ON,
    VALUE_REV, VOLTAGE_PIN_CORRECTION, VOLTAGE_PIN_MAX,
};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::messages::{BatteryLimits, BoardStatus, Led, LedColor, MotorChannel};
use crate::transport::{BusAddress, Transport};
use crate::watchdog::{Activity, WatchdogPhase, WatchdogState, WatchdogTask};

/// Time for the board to store battery limits in EEPROM
const EEPROM_WRITE_DELAY: Duration = Duration::from_millis(200);

/// Time for the board to come back after an address change
const ADDRESS_CHANGE_DELAY: Duration = Duration::from_millis(100);

/// Everything guarded by the session lock
struct Session<T: Transport> {
    dispatcher: Dispatcher<T>,
    watchdog: WatchdogState,
    power: [f32; 2],
}

impl<T: Transport> Session<T> {
    /// Dispatch and feed the watchdog on success
    fn exchange(&mut self, command: Command, payload: &[u8]) -> std::result::Result<ResponseFrame, DispatchError> {
        let response = self.dispatcher.dispatch(command, payload)?;
        self.watchdog.record(Instant::now(), Activity::of(command, payload));
        if command == Command::AllOff {
            self.power = [0.0; 2];
        }
        Ok(response)
    }

    fn on_watchdog_tick(&mut self, now: Instant) {
        if !self.watchdog.poll(now) {
            return;
        }
        match self.exchange(Command::AllOff, &[0]) {
            Ok(_) => info!(location = %self.dispatcher.handle().location, "Watchdog halted motors"),
            Err(e) => error!("Watchdog failed to halt motors, retrying next tick: {}", e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Session state stays consistent across a panic in another caller
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn check_range(what: &'static str, value: f32, min: f32, max: f32) -> Result<()> {
    // Negated so NaN is rejected
    if !(value >= min && value <= max) {
        return Err(DriverError::InvalidRange {
            what,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_power(power: f32) -> Result<()> {
    check_range("power", power, -1.0, 1.0)
}

fn raw_to_volts(raw: u16) -> f32 {
    f32::from(raw) / f32::from(ANALOG_MAX) * VOLTAGE_PIN_MAX + VOLTAGE_PIN_CORRECTION
}

fn limit_to_byte(volts: f32) -> u8 {
    (volts / VOLTAGE_PIN_MAX * f32::from(PWM_MAX)).clamp(0.0, f32::from(PWM_MAX)) as u8
}

fn byte_to_limit(byte: u8) -> f32 {
    f32::from(byte) / f32::from(PWM_MAX) * VOLTAGE_PIN_MAX
}

/// Connected ThunderBorg board
///
/// Methods take `&self`; concurrent callers queue on the session lock.
/// Dropping the driver stops the watchdog and halts both motors.
pub struct ThunderBorg<T: Transport> {
    session: Arc<Mutex<Session<T>>>,
    watchdog: Option<WatchdogTask>,
    config: DriverConfig,
}

impl<T: Transport> ThunderBorg<T> {
    /// Find the board and start a session
    ///
    /// Starts the watchdog on its own thread; no async runtime is needed.
    pub fn connect(mut transport: T, config: DriverConfig) -> Result<Self> {
        config.validate()?;

        info!(
            buses = ?config.buses,
            scan = config.allow_scan,
            "Connecting to ThunderBorg at address 0x{:02X}",
            config.address
        );
        let handle = discovery::discover(&mut transport, &config.buses, config.address, config.allow_scan)?;

        let mut session = Session {
            dispatcher: Dispatcher::new(transport, handle, config.retry_policy()),
            watchdog: WatchdogState::new(config.watchdog_timeout(), Instant::now()),
            power: [0.0; 2],
        };

        // Board registers start from the same all-stopped state as `power`
        session.exchange(Command::AllOff, &[0])?;
        if config.board_failsafe {
            session.exchange(Command::SetFailsafe, &[VALUE_ON])?;
        }

        let session = Arc::new(Mutex::new(session));
        let ticker_session = Arc::clone(&session);
        let watchdog = WatchdogTask::spawn(config.watchdog_tick(), move |now| {
            lock(&ticker_session).on_watchdog_tick(now);
        })
        .map_err(DriverError::WatchdogStart)?;

        info!(
            location = %handle.location,
            "ThunderBorg connected, {}ms watchdog timeout",
            config.watchdog_timeout_ms
        );
        Ok(Self {
            session,
            watchdog: Some(watchdog),
            config,
        })
    }

    /// Connect with default settings except the discovery parameters
    pub fn connect_to(transport: T, candidate_buses: &[u8], address: u8, allow_scan: bool) -> Result<Self> {
        let config = DriverConfig {
            buses: candidate_buses.to_vec(),
            address,
            allow_scan,
            ..DriverConfig::default()
        };
        Self::connect(transport, config)
    }

    fn session(&self) -> MutexGuard<'_, Session<T>> {
        lock(&self.session)
    }

    fn exchange(&self, command: Command, payload: &[u8]) -> Result<ResponseFrame> {
        Ok(self.session().exchange(command, payload)?)
    }

    pub fn handle(&self) -> BoardHandle {
        self.session().dispatcher.handle()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn watchdog_phase(&self) -> WatchdogPhase {
        self.session().watchdog.phase()
    }

    // === Motors ===

    /// Set the drive level for one motor
    ///
    /// `power` runs from -1.0 (full reverse) through 0.0 (stopped) to 1.0 (full forward).
    pub fn set_motor(&self, channel: MotorChannel, power: f32) -> Result<()> {
        check_power(power)?;
        let (forward, reverse) = channel.drive_commands();
        let (direction, pwm) = compensation::to_pwm(power);
        let command = match direction {
            Direction::Forward => forward,
            Direction::Reverse => reverse,
        };

        let mut session = self.session();
        session.exchange(command, &[pwm])?;
        session.power[channel.index()] = power;
        debug!(?channel, power, pwm, "Motor drive set");
        Ok(())
    }

    /// Set the same drive level on both motors in one command
    pub fn set_both_motors(&self, power: f32) -> Result<()> {
        check_power(power)?;
        let (direction, pwm) = compensation::to_pwm(power);
        let command = match direction {
            Direction::Forward => Command::SetAllForward,
            Direction::Reverse => Command::SetAllReverse,
        };

        let mut session = self.session();
        session.exchange(command, &[pwm])?;
        session.power = [power; 2];
        debug!(power, pwm, "Both motors set");
        Ok(())
    }

    /// Scale `desired` for the current supply voltage, then drive the motor
    ///
    /// The voltage is read fresh on every call. Returns the power actually sent.
    pub fn set_motor_compensated(&self, channel: MotorChannel, desired: f32) -> Result<f32> {
        check_power(desired)?;
        let measured = self.read_voltage()?;
        let power = compensation::compensate_with_minimum(
            desired,
            measured,
            self.config.nominal_voltage,
            self.config.min_voltage,
        )
        .inspect_err(|e| warn!(?channel, "Not driving motor: {}", e))?;

        self.set_motor(channel, power)?;
        Ok(power)
    }

    /// Switch both motors off and disarm the watchdog
    ///
    /// Safe to call repeatedly. If the halt cannot be delivered the watchdog
    /// stays armed and keeps trying.
    pub fn halt_all(&self) -> Result<()> {
        self.exchange(Command::AllOff, &[0])?;
        debug!("Both motors halted");
        Ok(())
    }

    /// Last power fraction this driver commanded for `channel`
    pub fn commanded_power(&self, channel: MotorChannel) -> f32 {
        self.session().power[channel.index()]
    }

    /// Drive level as reported by the board
    pub fn motor_power(&self, channel: MotorChannel) -> Result<f32> {
        let response = self.exchange(channel.read_command(), &[])?;
        let pwm = response.byte(1);
        Ok(match response.byte(0) {
            VALUE_OFF => 0.0,
            VALUE_REV => compensation::from_pwm(Direction::Reverse, pwm),
            _ => compensation::from_pwm(Direction::Forward, pwm),
        })
    }

    /// Drive fault flag (short circuit, under-voltage, ...) for `channel`
    pub fn drive_fault(&self, channel: MotorChannel) -> Result<bool> {
        let response = self.exchange(channel.fault_command(), &[])?;
        Ok(response.byte(0) != VALUE_OFF)
    }

    // === Board failsafe ===

    /// Enable the board's own comms failsafe (motors off after 1/4 s without a drive command)
    pub fn set_board_failsafe(&self, enabled: bool) -> Result<()> {
        let value = if enabled { VALUE_ON } else { VALUE_OFF };
        self.exchange(Command::SetFailsafe, &[value])?;
        Ok(())
    }

    pub fn board_failsafe(&self) -> Result<bool> {
        let response = self.exchange(Command::GetFailsafe, &[])?;
        Ok(response.byte(0) != VALUE_OFF)
    }

    // === Voltage ===

    /// Supply voltage in volts, read from the board on every call
    pub fn read_voltage(&self) -> Result<f32> {
        let response = self.exchange(Command::GetBatteryVoltage, &[])?;
        Ok(raw_to_volts(response.word(0)))
    }

    pub fn battery_limits(&self) -> Result<BatteryLimits> {
        let response = self.exchange(Command::GetBatteryLimits, &[])?;
        Ok(BatteryLimits {
            minimum: byte_to_limit(response.byte(0)),
            maximum: byte_to_limit(response.byte(1)),
        })
    }

    /// Set the range shown by the LED battery display (stored in EEPROM)
    pub fn set_battery_limits(&self, limits: BatteryLimits) -> Result<()> {
        check_range("battery minimum", limits.minimum, 0.0, VOLTAGE_PIN_MAX)?;
        check_range("battery maximum", limits.maximum, 0.0, VOLTAGE_PIN_MAX)?;

        let payload = [limit_to_byte(limits.minimum), limit_to_byte(limits.maximum)];
        self.exchange(Command::SetBatteryLimits, &payload)?;
        thread::sleep(EEPROM_WRITE_DELAY);
        Ok(())
    }

    // === LEDs ===

    /// Set both on-board LEDs
    pub fn set_led(&self, color: LedColor) -> Result<()> {
        self.exchange(Command::SetLeds, &color.to_pwm())?;
        Ok(())
    }

    pub fn set_single_led(&self, led: Led, color: LedColor) -> Result<()> {
        let (set, _) = led.commands();
        self.exchange(set, &color.to_pwm())?;
        Ok(())
    }

    pub fn led_color(&self, led: Led) -> Result<LedColor> {
        let (_, get) = led.commands();
        let response = self.exchange(get, &[])?;
        Ok(LedColor::from_pwm([response.byte(0), response.byte(1), response.byte(2)]))
    }

    /// Switch the LEDs between caller colours and the battery level display
    pub fn set_led_battery_monitor(&self, enabled: bool) -> Result<()> {
        let value = if enabled { VALUE_ON } else { VALUE_OFF };
        self.exchange(Command::SetLedBatteryMonitor, &[value])?;
        Ok(())
    }

    pub fn led_battery_monitor(&self) -> Result<bool> {
        let response = self.exchange(Command::GetLedBatteryMonitor, &[])?;
        Ok(response.byte(0) != VALUE_OFF)
    }

    /// Write one raw 32-bit word to an SK9822 / APA102C chain, MSB first
    pub fn write_external_led_word(&self, word: [u8; 4]) -> Result<()> {
        self.exchange(Command::WriteExternalLed, &word)?;
        Ok(())
    }

    /// Set every LED of an external SK9822 / APA102C chain
    pub fn set_external_led_colors(&self, colors: &[LedColor]) -> Result<()> {
        let mut session = self.session();
        session.exchange(Command::WriteExternalLed, &[0, 0, 0, 0])?;
        for color in colors {
            let [r, g, b] = color.to_pwm();
            session.exchange(Command::WriteExternalLed, &[PWM_MAX, b, g, r])?;
        }
        Ok(())
    }

    // === Board management ===

    /// Move the board to a new I2C address (kept across power cycles)
    pub fn set_i2c_address(&self, new_address: u8) -> Result<BoardHandle> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&new_address) {
            return Err(DriverError::InvalidAddress(new_address));
        }

        let mut session = self.session();
        let old = session.dispatcher.handle().location;
        info!(
            bus = old.bus,
            "Changing I2C address from 0x{:02X} to 0x{:02X}",
            old.address,
            new_address
        );
        session.exchange(Command::SetI2cAddress, &[new_address])?;

        // The board has moved: every later command, halts included, must follow it
        let location = BusAddress::new(old.bus, new_address);
        let board_id = session.dispatcher.handle().board_id;
        session.dispatcher.rebind(BoardHandle { location, board_id });
        thread::sleep(ADDRESS_CHANGE_DELAY);

        let retry = session.dispatcher.retry_policy();
        let mut attempt = 1;
        let handle = loop {
            match discovery::verify(session.dispatcher.transport_mut(), location) {
                Ok(handle) => break handle,
                Err(e) if attempt < retry.attempts => {
                    warn!(%location, attempt, "Board not confirmed at new address, retrying: {}", e);
                    attempt += 1;
                    thread::sleep(retry.backoff);
                }
                Err(e) => {
                    error!(%location, attempt, "Board not confirmed at new address: {}", e);
                    return Err(e.into());
                }
            }
        };
        session.dispatcher.rebind(handle);
        info!(%location, "New I2C address set");
        Ok(handle)
    }

    /// Read a full status snapshot
    pub fn status(&self) -> Result<BoardStatus> {
        let location = self.handle().location;
        Ok(BoardStatus {
            bus: location.bus,
            address: location.address,
            voltage: self.read_voltage()?,
            motor1: self.motor_power(MotorChannel::Motor1)?,
            motor2: self.motor_power(MotorChannel::Motor2)?,
            drive_fault1: self.drive_fault(MotorChannel::Motor1)?,
            drive_fault2: self.drive_fault(MotorChannel::Motor2)?,
            board_failsafe: self.board_failsafe()?,
            watchdog: self.watchdog_phase(),
        })
    }

    /// Halt the motors, stop the watchdog and release the board
    pub fn disconnect(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut watchdog) = self.watchdog.take() else {
            return Ok(());
        };
        info!("Disconnecting from ThunderBorg");

        // Watchdog keeps running until the halt has been attempted
        let halted = self.halt_all();
        watchdog.cancel();
        if let Err(e) = &halted {
            error!("Failed to halt motors while disconnecting, no watchdog left to stop them: {}", e);
        }
        halted
    }
}

impl<T: Transport> Drop for ThunderBorg<T> {
    fn drop(&mut self) {
        // Try to stop motors when driver is dropped (safety measure); failures are logged by shutdown
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::compensation::CompensationError;
    use crate::board::protocol::VALUE_FWD;
    use crate::transport::sim::SimulatedBoard;

    const BOARD: BusAddress = BusAddress::new(1, 0x15);

    fn connect(sim: &SimulatedBoard) -> ThunderBorg<SimulatedBoard> {
        ThunderBorg::connect(sim.clone(), DriverConfig::default()).unwrap()
    }

    #[test]
    fn test_connect_halts_and_starts_disarmed() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        assert_eq!(tb.handle().location, BOARD);
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
        assert_eq!(sim.count_writes(Command::AllOff), 1);
        assert_eq!(tb.commanded_power(MotorChannel::Motor1), 0.0);
    }

    #[test]
    fn test_connect_reports_everything_tried() {
        let sim = SimulatedBoard::new();
        let err = ThunderBorg::connect_to(sim, &[1, 0], 0x15, false).err().unwrap();
        let message = err.to_string();
        assert!(message.contains("bus 1 @ 0x15"), "{message}");
        assert!(message.contains("bus 0 @ 0x15"), "{message}");
    }

    #[test]
    fn test_connect_enables_board_failsafe() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let config = DriverConfig {
            board_failsafe: true,
            ..DriverConfig::default()
        };
        let tb = ThunderBorg::connect(sim.clone(), config).unwrap();
        assert!(tb.board_failsafe().unwrap());
    }

    #[test]
    fn test_set_motor_out_of_range_makes_no_calls() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        sim.clear_calls();

        for bad in [1.5, -1.01, f32::NAN] {
            let err = tb.set_motor(MotorChannel::Motor1, bad).unwrap_err();
            assert!(matches!(err, DriverError::InvalidRange { what: "power", .. }));
        }
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_set_motor_writes_direction_and_pwm() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_motor(MotorChannel::Motor1, 0.75).unwrap();
        tb.set_motor(MotorChannel::Motor2, -0.25).unwrap();
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_FWD, 191), (VALUE_REV, 63)]);
        assert_eq!(tb.commanded_power(MotorChannel::Motor2), -0.25);
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Armed);

        let read_back = tb.motor_power(MotorChannel::Motor2).unwrap();
        assert!((read_back + 63.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_drive_does_not_arm() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_motor(MotorChannel::Motor1, 0.0).unwrap();
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
    }

    #[test]
    fn test_halt_is_idempotent() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_both_motors(0.5).unwrap();
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Armed);
        for _ in 0..3 {
            tb.halt_all().unwrap();
            assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
        }
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
        assert_eq!(tb.commanded_power(MotorChannel::Motor1), 0.0);
    }

    #[test]
    fn test_failed_halt_keeps_watchdog_armed() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.4).unwrap();

        sim.fail_always(true);
        assert!(tb.halt_all().is_err());
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Armed);
        sim.fail_always(false);
    }

    #[test]
    fn test_watchdog_halts_stale_motors() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_motor(MotorChannel::Motor1, 0.6).unwrap();
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Armed);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(sim.count_writes(Command::AllOff), 1);

        thread::sleep(Duration::from_millis(350));
        assert_eq!(sim.count_writes(Command::AllOff), 2);
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
        assert_eq!(tb.commanded_power(MotorChannel::Motor1), 0.0);
    }

    #[test]
    fn test_watchdog_halts_while_caller_blocks_its_runtime() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let tb = runtime.block_on(async {
            let tb = connect(&sim);
            tb.set_motor(MotorChannel::Motor1, 0.6).unwrap();
            // Caller hangs in synchronous code without ever yielding
            thread::sleep(Duration::from_millis(600));
            tb
        });

        assert_eq!(sim.count_writes(Command::AllOff), 2);
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
    }

    #[test]
    fn test_fresh_commands_keep_motors_running() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_motor(MotorChannel::Motor2, -0.3).unwrap();
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(50));
            // Any successful exchange proves liveness
            tb.read_voltage().unwrap();
        }
        assert_eq!(sim.count_writes(Command::AllOff), 1);
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Armed);
    }

    #[test]
    fn test_watchdog_retries_failed_halt() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let config = DriverConfig {
            retry_attempts: 1,
            ..DriverConfig::default()
        };
        let tb = ThunderBorg::connect(sim.clone(), config).unwrap();
        tb.set_motor(MotorChannel::Motor1, 1.0).unwrap();

        sim.fail_always(true);
        thread::sleep(Duration::from_millis(400));
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Tripped);

        sim.fail_always(false);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
    }

    #[test]
    fn test_read_voltage() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        sim.set_voltage(11.1);
        let volts = tb.read_voltage().unwrap();
        assert!((volts - 11.1).abs() < 0.05, "{volts}");
    }

    #[test]
    fn test_compensated_drive_scales_for_low_battery() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        sim.set_voltage(7.6);
        let power = tb.set_motor_compensated(MotorChannel::Motor1, 0.5).unwrap();
        assert!((power - 0.75).abs() < 0.01, "{power}");
        assert_eq!(sim.motor_pwm(BOARD)[0].0, VALUE_FWD);
        assert!(sim.motor_pwm(BOARD)[0].1 >= 190);
    }

    #[test]
    fn test_compensated_drive_refuses_undervoltage() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        sim.set_voltage(5.0);
        let err = tb.set_motor_compensated(MotorChannel::Motor1, 0.5).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Compensation(CompensationError::Undervoltage { .. })
        ));
        assert_eq!(sim.count_writes(Command::SetMotorAForward), 0);
    }

    #[test]
    fn test_leds() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_led(LedColor::new(1.0, 0.5, 0.0)).unwrap();
        assert_eq!(sim.led_pwm(BOARD), [[255, 127, 0]; 2]);

        tb.set_single_led(Led::Two, LedColor::new(0.2, 0.0, 0.2)).unwrap();
        assert_eq!(tb.led_color(Led::One).unwrap(), LedColor::from_pwm([255, 127, 0]));
        assert_eq!(tb.led_color(Led::Two).unwrap(), LedColor::from_pwm([51, 0, 51]));

        tb.set_led_battery_monitor(true).unwrap();
        assert!(tb.led_battery_monitor().unwrap());
    }

    #[test]
    fn test_external_led_chain() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        tb.set_external_led_colors(&[LedColor::new(1.0, 0.0, 0.0), LedColor::OFF])
            .unwrap();
        assert_eq!(
            sim.external_words(BOARD),
            vec![[0, 0, 0, 0], [255, 0, 0, 255], [255, 0, 0, 0]]
        );
    }

    #[test]
    fn test_battery_limits() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        let limits = tb.battery_limits().unwrap();
        assert!((limits.minimum - 7.0).abs() < 0.2);
        assert!((limits.maximum - 35.0).abs() < 0.2);

        tb.set_battery_limits(BatteryLimits { minimum: 9.0, maximum: 12.6 }).unwrap();
        let limits = tb.battery_limits().unwrap();
        assert!((limits.minimum - 9.0).abs() < 0.2);
        assert!((limits.maximum - 12.6).abs() < 0.2);

        let err = tb
            .set_battery_limits(BatteryLimits { minimum: 9.0, maximum: 40.0 })
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidRange { .. }));
    }

    #[test]
    fn test_drive_fault() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        sim.set_drive_fault(BOARD, MotorChannel::Motor2, true);
        assert!(!tb.drive_fault(MotorChannel::Motor1).unwrap());
        assert!(tb.drive_fault(MotorChannel::Motor2).unwrap());
    }

    #[test]
    fn test_set_i2c_address() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);

        assert!(matches!(tb.set_i2c_address(0x02), Err(DriverError::InvalidAddress(0x02))));

        let handle = tb.set_i2c_address(0x20).unwrap();
        assert_eq!(handle.location, BusAddress::new(1, 0x20));
        assert_eq!(tb.handle().location, BusAddress::new(1, 0x20));
        tb.read_voltage().unwrap();
    }

    #[test]
    fn test_set_i2c_address_retries_busy_check() {
        let moved = BusAddress::new(1, 0x20);
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.8).unwrap();

        // First identity read at the new address reports the bus busy
        sim.fail_reads(1);
        let handle = tb.set_i2c_address(0x20).unwrap();
        assert_eq!(handle.location, moved);

        tb.halt_all().unwrap();
        assert_eq!(sim.motor_pwm(moved), [(VALUE_OFF, 0); 2]);
    }

    #[test]
    fn test_set_i2c_address_follows_board_when_check_fails() {
        let moved = BusAddress::new(1, 0x20);
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.8).unwrap();

        sim.fail_reads(10);
        assert!(tb.set_i2c_address(0x20).is_err());
        assert_eq!(tb.handle().location, moved);

        // Halts still reach the board at its new address
        sim.fail_reads(0);
        tb.halt_all().unwrap();
        assert_eq!(sim.motor_pwm(moved), [(VALUE_OFF, 0); 2]);
    }

    #[test]
    fn test_status_snapshot() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 1.0).unwrap();

        let status = tb.status().unwrap();
        assert_eq!(status.address, 0x15);
        assert_eq!(status.motor1, 1.0);
        assert_eq!(status.motor2, 0.0);
        assert_eq!(status.watchdog, WatchdogPhase::Armed);
    }

    #[test]
    fn test_concurrent_callers_never_interleave() {
        const CHAIN: [LedColor; 3] = [LedColor::OFF, LedColor::OFF, LedColor::OFF];
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        sim.clear_calls();

        thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..50 {
                    tb.set_external_led_colors(&CHAIN).unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..50 {
                    tb.set_motor(MotorChannel::Motor1, 0.5).unwrap();
                    tb.read_voltage().unwrap();
                }
                tb.halt_all().unwrap();
            });
        });

        // Each chain write is one transaction: start word then one word per LED, back to back
        let calls = sim.calls();
        let led = Command::WriteExternalLed.code();
        let mut i = 0;
        let mut chains = 0;
        while i < calls.len() {
            if calls[i].register == led {
                assert_eq!(calls[i].data, vec![0, 0, 0, 0], "chain must open with a start word");
                for offset in 1..=CHAIN.len() {
                    let call = &calls[i + offset];
                    assert_eq!(call.register, led, "chain interrupted at call {}", i + offset);
                    assert_eq!(call.data[0], PWM_MAX);
                }
                chains += 1;
                i += CHAIN.len() + 1;
            } else {
                i += 1;
            }
        }
        assert_eq!(chains, 50);

        // The final halt lands after every drive command
        let last_drive = calls
            .iter()
            .rposition(|c| c.register == Command::SetMotorAForward.code())
            .unwrap();
        let last_halt = calls
            .iter()
            .rposition(|c| c.register == Command::AllOff.code())
            .unwrap();
        assert!(last_halt > last_drive);
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
        assert_eq!(tb.watchdog_phase(), WatchdogPhase::Disarmed);
    }

    #[test]
    fn test_disconnect_and_drop_halt() {
        let sim = SimulatedBoard::new().with_board(BOARD);

        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.5).unwrap();
        tb.disconnect().unwrap();
        assert_eq!(sim.count_writes(Command::AllOff), 2);

        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.5).unwrap();
        drop(tb);
        assert_eq!(sim.count_writes(Command::AllOff), 4);
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
    }

    #[test]
    fn test_disconnect_retries_transient_halt_failure() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.5).unwrap();
        sim.clear_calls();

        // Transient failures are retried by the halt itself
        sim.fail_next(2);
        tb.disconnect().unwrap();
        assert_eq!(sim.count_writes(Command::AllOff), 3);
        assert_eq!(sim.motor_pwm(BOARD), [(VALUE_OFF, 0); 2]);
    }

    #[test]
    fn test_disconnect_reports_failed_halt() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let tb = connect(&sim);
        tb.set_motor(MotorChannel::Motor1, 0.5).unwrap();
        sim.clear_calls();

        sim.fail_always(true);
        assert!(tb.disconnect().is_err());
        // One dispatch with the default three attempts, no second try from Drop
        assert_eq!(sim.count_writes(Command::AllOff), 3);
        sim.fail_always(false);
    }
}
