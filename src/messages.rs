// Value types exchanged with the driver's callers

use serde::{Deserialize, Serialize};

use crate::board::protocol::{Command, PWM_MAX};
use crate::watchdog::WatchdogPhase;

/// The board's two motor outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorChannel {
    Motor1,
    Motor2,
}

impl MotorChannel {
    pub(crate) const fn index(self) -> usize {
        match self {
            MotorChannel::Motor1 => 0,
            MotorChannel::Motor2 => 1,
        }
    }

    /// (forward, reverse) drive commands for this channel
    pub(crate) const fn drive_commands(self) -> (Command, Command) {
        match self {
            MotorChannel::Motor1 => (Command::SetMotorAForward, Command::SetMotorAReverse),
            MotorChannel::Motor2 => (Command::SetMotorBForward, Command::SetMotorBReverse),
        }
    }

    pub(crate) const fn read_command(self) -> Command {
        match self {
            MotorChannel::Motor1 => Command::GetMotorA,
            MotorChannel::Motor2 => Command::GetMotorB,
        }
    }

    pub(crate) const fn fault_command(self) -> Command {
        match self {
            MotorChannel::Motor1 => Command::GetDriveFaultA,
            MotorChannel::Motor2 => Command::GetDriveFaultB,
        }
    }
}

/// On-board LEDs (LED one is on the board, LED two on the lid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Led {
    One,
    Two,
}

impl Led {
    pub(crate) const fn commands(self) -> (Command, Command) {
        match self {
            Led::One => (Command::SetLed1, Command::GetLed1),
            Led::Two => (Command::SetLed2, Command::GetLed2),
        }
    }
}

/// RGB colour, each component 0.0 (off) to 1.0 (full)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LedColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl LedColor {
    pub const OFF: LedColor = LedColor::new(0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Components scaled to PWM bytes, out-of-range values clamped
    pub fn to_pwm(&self) -> [u8; 3] {
        [
            unit_to_pwm(self.r),
            unit_to_pwm(self.g),
            unit_to_pwm(self.b),
        ]
    }

    pub fn from_pwm(pwm: [u8; 3]) -> Self {
        let max = f32::from(PWM_MAX);
        Self::new(
            f32::from(pwm[0]) / max,
            f32::from(pwm[1]) / max,
            f32::from(pwm[2]) / max,
        )
    }
}

/// Scale a 0.0..=1.0 value to 0..=255, truncating like the board firmware expects
pub(crate) fn unit_to_pwm(value: f32) -> u8 {
    // NaN saturates to 0 in the float->int cast
    (value * f32::from(PWM_MAX)).clamp(0.0, f32::from(PWM_MAX)) as u8
}

/// Battery monitoring range used for the LED battery display (volts)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryLimits {
    pub minimum: f32,
    pub maximum: f32,
}

/// Snapshot of board state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardStatus {
    pub bus: u8,
    pub address: u8,
    pub voltage: f32,
    pub motor1: f32,
    pub motor2: f32,
    pub drive_fault1: bool,
    pub drive_fault2: bool,
    pub board_failsafe: bool,
    pub watchdog: WatchdogPhase,
}
