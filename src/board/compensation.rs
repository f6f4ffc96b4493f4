// Voltage compensation for motor drive levels
//
// Motor output power follows the supply voltage, so a fixed PWM duty gives
// a weaker drive on a sagging battery. Scaling by nominal/measured keeps the
// effective motor voltage where the caller asked for it.

use crate::board::protocol::PWM_MAX;
use crate::config::MIN_SAFE_VOLTAGE;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum CompensationError {
    /// Supply is too low to drive the motors safely
    #[error("Supply voltage {measured:.2}V is below the {minimum:.2}V minimum")]
    Undervoltage { measured: f32, minimum: f32 },

    #[error("Nominal voltage {0} must be finite and positive")]
    InvalidNominal(f32),
}

/// Drive direction as understood by the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Scale `desired` (-1.0..=1.0) for the measured supply voltage
///
/// Fails with `CompensationError::Undervoltage` when `measured` is below `MIN_SAFE_VOLTAGE`.
pub fn compensate(desired: f32, measured: f32, nominal: f32) -> Result<f32, CompensationError> {
    compensate_with_minimum(desired, measured, nominal, MIN_SAFE_VOLTAGE)
}

/// Same as `compensate` with an explicit undervoltage threshold
pub fn compensate_with_minimum(
    desired: f32,
    measured: f32,
    nominal: f32,
    minimum: f32,
) -> Result<f32, CompensationError> {
    if !nominal.is_finite() || nominal <= 0.0 {
        return Err(CompensationError::InvalidNominal(nominal));
    }
    // Negated so a NaN reading is refused too
    if !(measured >= minimum) {
        return Err(CompensationError::Undervoltage { measured, minimum });
    }

    Ok((desired * (nominal / measured)).clamp(-1.0, 1.0))
}

/// Convert a power fraction into a direction and PWM byte
///
/// Values outside -1.0..=1.0 saturate at full PWM.
pub fn to_pwm(power: f32) -> (Direction, u8) {
    let max = f32::from(PWM_MAX);
    if power < 0.0 {
        (Direction::Reverse, (-power * max).min(max) as u8)
    } else {
        (Direction::Forward, (power * max).min(max) as u8)
    }
}

/// Inverse of `to_pwm`
pub fn from_pwm(direction: Direction, pwm: u8) -> f32 {
    let level = f32::from(pwm) / f32::from(PWM_MAX);
    match direction {
        Direction::Forward => level,
        Direction::Reverse => -level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nominal_supply_is_identity() {
        assert_eq!(compensate(0.5, 11.4, 11.4).unwrap(), 0.5);
    }

    #[test]
    fn test_low_supply_scales_up() {
        // 0.5 at 11.4V nominal on a 7.6V battery needs 0.75
        let pwm = compensate(0.5, 7.6, 11.4).unwrap();
        assert!((pwm - 0.75).abs() < 1e-5);
    }

    #[test]
    fn test_high_supply_scales_down() {
        let pwm = compensate(-1.0, 22.8, 11.4).unwrap();
        assert!((pwm + 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_undervoltage() {
        let err = compensate(0.2, 5.9, 11.4).unwrap_err();
        assert_eq!(
            err,
            CompensationError::Undervoltage {
                measured: 5.9,
                minimum: MIN_SAFE_VOLTAGE
            }
        );
        assert!(compensate(0.2, f32::NAN, 11.4).is_err());
    }

    #[test]
    fn test_rejects_bad_nominal() {
        for nominal in [f32::NAN, f32::INFINITY, 0.0, -12.0] {
            let err = compensate(0.5, 12.0, nominal).unwrap_err();
            assert!(matches!(err, CompensationError::InvalidNominal(_)), "{nominal}");
        }
    }

    #[test]
    fn test_to_pwm() {
        assert_eq!(to_pwm(0.0), (Direction::Forward, 0));
        assert_eq!(to_pwm(1.0), (Direction::Forward, 255));
        assert_eq!(to_pwm(0.75), (Direction::Forward, 191));
        assert_eq!(to_pwm(-0.25), (Direction::Reverse, 63));
        assert_eq!(to_pwm(-3.0), (Direction::Reverse, 255));
    }

    #[test]
    fn test_from_pwm() {
        assert_eq!(from_pwm(Direction::Reverse, 255), -1.0);
        assert_eq!(from_pwm(Direction::Forward, 0), 0.0);
    }

    proptest! {
        #[test]
        fn output_is_clamped(p in -1.0f32..=1.0, v in MIN_SAFE_VOLTAGE..40.0f32, nominal in 1.0f32..40.0) {
            let pwm = compensate(p, v, nominal).unwrap();
            prop_assert!((-1.0..=1.0).contains(&pwm));
        }

        #[test]
        fn monotonic_in_power(a in -1.0f32..=1.0, b in -1.0f32..=1.0, v in MIN_SAFE_VOLTAGE..40.0f32) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let nominal = 11.4;
            prop_assert!(compensate(lo, v, nominal).unwrap() <= compensate(hi, v, nominal).unwrap());
        }

        #[test]
        fn undervoltage_never_returns(p in -1.0f32..=1.0, v in 0.0f32..MIN_SAFE_VOLTAGE) {
            prop_assert!(compensate(p, v, 11.4).is_err());
        }
    }
}
