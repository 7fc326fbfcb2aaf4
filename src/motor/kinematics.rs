// Omniwheel kinematics for LeKiwi 3-wheel base
// Converts body-frame velocities (x, y, theta) to individual wheel velocities and back.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::config::BaseConfig;
use crate::error::RobotError;
use crate::messages::BodyVelocity;

/// Wheel configuration for LeKiwi base
pub const WHEEL_RADIUS: f32 = 0.05; // meters
pub const BASE_RADIUS: f32 = 0.125; // meters (distance from center to wheel)

/// Wheel mounting angles (degrees) with -90° offset
/// Left wheel at 240°, Back wheel at 0°, Right wheel at 120° (simple cartesian configuration)
pub const WHEEL_ANGLES_DEG: [f32; 3] = [240.0 - 90.0, 0.0 - 90.0, 120.0 - 90.0];

/// Motor resolution: 4096 steps per revolution
const STEPS_PER_REVOLUTION: f32 = 4096.0;
const STEPS_PER_DEG: f32 = STEPS_PER_REVOLUTION / 360.0;

/// Maximum raw velocity command (safety limit)
pub const MAX_RAW: i16 = 3000;

/// Raw wheel velocity commands for the three motors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelVelocities {
    pub left: i16,
    pub back: i16,
    pub right: i16,
}

impl WheelVelocities {
    pub fn new(left: i16, back: i16, right: i16) -> Self {
        Self { left, back, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns velocities as array [left, back, right]
    pub fn as_array(&self) -> [i16; 3] {
        [self.left, self.back, self.right]
    }
}

/// Convert degrees per second to raw motor ticks
fn degps_to_raw(degps: f32) -> i16 {
    let speed_in_steps = degps * STEPS_PER_DEG;
    let speed_int = speed_in_steps.round() as i32;

    // Clamp to signed 16-bit range
    speed_int.clamp(-0x8000, 0x7FFF) as i16
}

/// Convert raw motor ticks to degrees per second
fn raw_to_degps(raw: i16) -> f32 {
    raw as f32 / STEPS_PER_DEG
}

/// Scale all speeds by one common factor so none exceeds `limit` in magnitude.
/// Ratios between wheels, and so the commanded heading, are unchanged.
pub fn scale_to_limit(speeds: [f32; 3], limit: f32) -> [f32; 3] {
    let peak = speeds.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > limit {
        let scale = limit / peak;
        speeds.map(|s| s * scale)
    } else {
        speeds
    }
}

/// Holonomic drive model for three omniwheels
///
/// Each wheel i at tangential angle φ_i contributes linear speed
/// `s_i = cos(φ_i)·x + sin(φ_i)·y + R·ω`; its angular speed is `s_i / r`.
/// The 3x3 system is exactly determined, so the inverse is fixed per geometry
/// and computed once.
#[derive(Debug, Clone)]
pub struct OmniKinematics {
    wheel_radius: f32,
    forward: [[f32; 3]; 3],
    inverse: [[f32; 3]; 3],
    max_raw: i16,
}

impl OmniKinematics {
    pub fn new(
        wheel_radius: f32,
        base_radius: f32,
        wheel_angles_deg: [f32; 3],
        max_raw: i16,
    ) -> Result<Self, RobotError> {
        if !(wheel_radius > 0.0 && base_radius > 0.0) {
            return Err(RobotError::Validation(format!(
                "wheel radius {} and base radius {} must be positive",
                wheel_radius, base_radius
            )));
        }

        // Each row: [cos(angle), sin(angle), base_radius]
        let forward = wheel_angles_deg.map(|angle_deg| {
            let angle_rad = angle_deg * (PI / 180.0);
            [angle_rad.cos(), angle_rad.sin(), base_radius]
        });
        let inverse = invert(&forward).ok_or_else(|| {
            RobotError::Validation(format!(
                "wheel angles {:?} give a singular drive matrix",
                wheel_angles_deg
            ))
        })?;

        Ok(Self {
            wheel_radius,
            forward,
            inverse,
            max_raw,
        })
    }

    pub fn from_config(base: &BaseConfig) -> Result<Self, RobotError> {
        Self::new(
            base.wheel_radius,
            base.base_radius,
            base.wheel_angles_deg,
            base.max_raw,
        )
    }

    /// Body velocity to wheel angular velocities (rad/s), [left, back, right]
    pub fn body_to_wheel(&self, velocity: BodyVelocity) -> [f32; 3] {
        // Convert rotational velocity from deg/s to rad/s
        let body = [
            velocity.x_vel,
            velocity.y_vel,
            velocity.theta_vel * (PI / 180.0),
        ];

        // Convert linear speeds (m/s) to angular speeds (rad/s)
        self.forward
            .map(|row| dot(&row, &body) / self.wheel_radius)
    }

    /// Wheel angular velocities (rad/s) back to body velocity
    pub fn wheel_to_body(&self, wheels: [f32; 3]) -> BodyVelocity {
        let linear = wheels.map(|w| w * self.wheel_radius);
        let [x, y, theta_rad] = self.inverse.map(|row| dot(&row, &linear));
        BodyVelocity::new(x, y, theta_rad * (180.0 / PI))
    }

    /// Body velocity to raw wheel commands, scaled down uniformly if any
    /// wheel would exceed `max_raw`
    pub fn body_to_wheel_raw(&self, velocity: BodyVelocity) -> WheelVelocities {
        // rad/s -> deg/s -> raw steps
        let raw = self
            .body_to_wheel(velocity)
            .map(|radps| radps * (180.0 / PI) * STEPS_PER_DEG);
        let [left, back, right] = scale_to_limit(raw, self.max_raw as f32)
            .map(|steps| degps_to_raw(steps / STEPS_PER_DEG));

        WheelVelocities {
            left,
            back,
            right,
        }
    }

    /// Raw wheel velocities (as read back from the motors) to body velocity
    pub fn wheel_raw_to_body(&self, wheels: WheelVelocities) -> BodyVelocity {
        let radps = wheels
            .as_array()
            .map(|raw| raw_to_degps(raw) * (PI / 180.0));
        self.wheel_to_body(radps)
    }
}

fn dot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Inverse of a 3x3 matrix by cofactors, None if singular
fn invert(m: &[[f32; 3]; 3]) -> Option<[[f32; 3]; 3]> {
    let cofactor = |r: usize, c: usize| {
        let (r1, r2) = ((r + 1) % 3, (r + 2) % 3);
        let (c1, c2) = ((c + 1) % 3, (c + 2) % 3);
        m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]
    };

    let det = m[0][0] * cofactor(0, 0) + m[0][1] * cofactor(0, 1) + m[0][2] * cofactor(0, 2);
    if det.abs() < 1e-6 {
        return None;
    }

    // Inverse is the transposed cofactor matrix over the determinant
    let mut inverse = [[0.0f32; 3]; 3];
    for (r, row) in inverse.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = cofactor(c, r) / det;
        }
    }
    Some(inverse)
}
