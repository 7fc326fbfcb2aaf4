// Conversion between raw encoder ticks and normalized motor units
//
// Normalized values outside the calibrated range are clamped before
// conversion, so a bad request can never produce a raw command outside
// [range_min, range_max].

use crate::config::{ControlMode, MotorConfig, NormMode};
use crate::error::RobotError;

use super::calibration::{CalibrationRecord, Direction, MAX_POSITION};

/// Raw ticks spanning one full turn in degree conversions
const MAX_RESOLUTION: f32 = MAX_POSITION as f32;

/// Convert a normalized value to raw ticks
pub fn to_raw(
    motor: &MotorConfig,
    calibration: Option<&CalibrationRecord>,
    value: f32,
) -> Result<i32, RobotError> {
    if !value.is_finite() {
        return Err(RobotError::Validation(format!(
            "motor '{}': target {} is not a number",
            motor.name, value
        )));
    }

    let Some(cal) = calibration else {
        return match motor.control {
            ControlMode::Position => Err(RobotError::CalibrationMissing {
                motor: motor.name.clone(),
            }),
            // Only sign and scale matter for an uncalibrated velocity motor
            ControlMode::Velocity => Ok(value.round() as i32),
        };
    };

    let min = cal.range_min as f32;
    let max = cal.range_max as f32;
    let sign = cal.direction.sign();

    let raw = match motor.norm {
        NormMode::Degrees => {
            let mid = (min + max) / 2.0;
            let lo = (min - mid) * 360.0 / MAX_RESOLUTION;
            let hi = (max - mid) * 360.0 / MAX_RESOLUTION;
            let degrees = (value * sign).clamp(lo, hi);
            degrees * MAX_RESOLUTION / 360.0 + mid
        }
        NormMode::Range0To100 => {
            let percent = value.clamp(0.0, 100.0);
            let percent = match cal.direction {
                Direction::Normal => percent,
                Direction::Inverted => 100.0 - percent,
            };
            percent / 100.0 * (max - min) + min
        }
        NormMode::RangeM100To100 => {
            let percent = (value * sign).clamp(-100.0, 100.0);
            (percent + 100.0) / 200.0 * (max - min) + min
        }
        NormMode::Raw => value,
    };

    Ok((raw.round() as i32).clamp(cal.range_min, cal.range_max))
}

/// Convert raw ticks to a normalized value (inverse of [`to_raw`])
pub fn from_raw(
    motor: &MotorConfig,
    calibration: Option<&CalibrationRecord>,
    raw: i32,
) -> Result<f32, RobotError> {
    let Some(cal) = calibration else {
        return match motor.control {
            ControlMode::Position => Err(RobotError::CalibrationMissing {
                motor: motor.name.clone(),
            }),
            ControlMode::Velocity => Ok(raw as f32),
        };
    };

    let raw = raw.clamp(cal.range_min, cal.range_max) as f32;
    let min = cal.range_min as f32;
    let max = cal.range_max as f32;
    let sign = cal.direction.sign();

    let value = match motor.norm {
        NormMode::Degrees => {
            let mid = (min + max) / 2.0;
            sign * (raw - mid) * 360.0 / MAX_RESOLUTION
        }
        NormMode::Range0To100 => {
            let percent = (raw - min) / (max - min) * 100.0;
            match cal.direction {
                Direction::Normal => percent,
                Direction::Inverted => 100.0 - percent,
            }
        }
        NormMode::RangeM100To100 => sign * ((raw - min) / (max - min) * 200.0 - 100.0),
        NormMode::Raw => raw,
    };

    Ok(value)
}

/// Size of one raw tick in normalized units
pub fn quantization_step(motor: &MotorConfig, calibration: &CalibrationRecord) -> f32 {
    let span = (calibration.range_max - calibration.range_min) as f32;
    match motor.norm {
        NormMode::Degrees => 360.0 / MAX_RESOLUTION,
        NormMode::Range0To100 => 100.0 / span,
        NormMode::RangeM100To100 => 200.0 / span,
        NormMode::Raw => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(norm: NormMode) -> MotorConfig {
        MotorConfig::new("joint", 1, ControlMode::Position, norm)
    }

    fn record(direction: Direction) -> CalibrationRecord {
        CalibrationRecord {
            id: 1,
            direction,
            homing_offset: 0,
            range_min: 1024,
            range_max: 3071,
        }
    }

    fn assert_round_trip(norm: NormMode, direction: Direction, values: &[f32]) {
        let motor = joint(norm);
        let cal = record(direction);
        let step = quantization_step(&motor, &cal);
        for &v in values {
            let raw = to_raw(&motor, Some(&cal), v).unwrap();
            let back = from_raw(&motor, Some(&cal), raw).unwrap();
            assert!(
                (back - v).abs() <= step,
                "{:?}/{:?}: {} -> {} -> {} (step {})",
                norm,
                direction,
                v,
                raw,
                back,
                step
            );
        }
    }

    #[test]
    fn test_round_trip_within_one_step() {
        // Calibrated range 1024..3071 spans roughly ±90°
        let degrees = [-89.0, -45.5, -0.3, 0.0, 12.34, 60.0, 89.9];
        let percent = [0.0, 0.5, 33.3, 50.0, 99.9, 100.0];
        let signed = [-100.0, -73.2, -0.01, 0.0, 42.0, 100.0];

        for direction in [Direction::Normal, Direction::Inverted] {
            assert_round_trip(NormMode::Degrees, direction, &degrees);
            assert_round_trip(NormMode::Range0To100, direction, &percent);
            assert_round_trip(NormMode::RangeM100To100, direction, &signed);
            assert_round_trip(NormMode::Raw, direction, &[1024.0, 2000.0, 3071.0]);
        }
    }

    #[test]
    fn test_range_endpoints() {
        let cal = record(Direction::Normal);
        let gripper = joint(NormMode::Range0To100);
        assert_eq!(to_raw(&gripper, Some(&cal), 0.0).unwrap(), 1024);
        assert_eq!(to_raw(&gripper, Some(&cal), 100.0).unwrap(), 3071);

        let signed = joint(NormMode::RangeM100To100);
        assert_eq!(to_raw(&signed, Some(&cal), -100.0).unwrap(), 1024);
        assert_eq!(to_raw(&signed, Some(&cal), 100.0).unwrap(), 3071);
        assert_eq!(to_raw(&signed, Some(&cal), 0.0).unwrap(), 2048);

        let degrees = joint(NormMode::Degrees);
        assert_eq!(to_raw(&degrees, Some(&cal), 0.0).unwrap(), 2048);
    }

    #[test]
    fn test_inverted_polarity() {
        let cal = record(Direction::Inverted);
        let gripper = joint(NormMode::Range0To100);
        assert_eq!(to_raw(&gripper, Some(&cal), 0.0).unwrap(), 3071);
        assert_eq!(to_raw(&gripper, Some(&cal), 100.0).unwrap(), 1024);

        let signed = joint(NormMode::RangeM100To100);
        assert_eq!(to_raw(&signed, Some(&cal), 100.0).unwrap(), 1024);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let cal = record(Direction::Normal);
        for norm in [
            NormMode::Degrees,
            NormMode::Range0To100,
            NormMode::RangeM100To100,
            NormMode::Raw,
        ] {
            let motor = joint(norm);
            assert_eq!(to_raw(&motor, Some(&cal), 1.0e6).unwrap(), 3071);
            assert_eq!(to_raw(&motor, Some(&cal), -1.0e6).unwrap(), 1024);
        }

        // Raw readings beyond the range read as the nearest endpoint
        let signed = joint(NormMode::RangeM100To100);
        assert_eq!(from_raw(&signed, Some(&cal), 4000).unwrap(), 100.0);
        assert_eq!(from_raw(&signed, Some(&cal), 0).unwrap(), -100.0);
    }

    #[test]
    fn test_position_motor_requires_calibration() {
        let motor = joint(NormMode::RangeM100To100);
        assert!(matches!(
            to_raw(&motor, None, 10.0),
            Err(RobotError::CalibrationMissing { .. })
        ));
        assert!(matches!(
            from_raw(&motor, None, 2048),
            Err(RobotError::CalibrationMissing { .. })
        ));
    }

    #[test]
    fn test_uncalibrated_velocity_motor_is_identity() {
        let wheel = MotorConfig::new("wheel", 7, ControlMode::Velocity, NormMode::RangeM100To100);
        assert_eq!(to_raw(&wheel, None, -250.4).unwrap(), -250);
        assert_eq!(from_raw(&wheel, None, 300).unwrap(), 300.0);
    }

    #[test]
    fn test_non_finite_target_rejected() {
        let cal = record(Direction::Normal);
        let motor = joint(NormMode::Degrees);
        assert!(matches!(
            to_raw(&motor, Some(&cal), f32::NAN),
            Err(RobotError::Validation(_))
        ));
    }
}
