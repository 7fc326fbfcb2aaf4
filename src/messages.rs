// Define message types exchanged with the robot controller

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::motor::WheelVelocities;

/// Body-frame velocity of the base
// derive macro auto-implements print/debug, cloning, and (de)serialization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BodyVelocity {
    /// Forward, m/s
    pub x_vel: f32,
    /// Lateral (positive = left), m/s
    pub y_vel: f32,
    /// Rotational (positive = counter-clockwise), deg/s
    pub theta_vel: f32,
}

impl BodyVelocity {
    pub fn new(x_vel: f32, y_vel: f32, theta_vel: f32) -> Self {
        Self {
            x_vel,
            y_vel,
            theta_vel,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_finite(&self) -> bool {
        self.x_vel.is_finite() && self.y_vel.is_finite() && self.theta_vel.is_finite()
    }
}

/// Command for the robot: arm joint targets and/or a base velocity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Action {
    /// Normalized target per arm motor name
    #[serde(default)]
    pub arm_targets: BTreeMap<String, f32>,
    #[serde(default)]
    pub base_velocity: Option<BodyVelocity>,
}

impl Action {
    pub fn base(velocity: BodyVelocity) -> Self {
        Self {
            arm_targets: BTreeMap::new(),
            base_velocity: Some(velocity),
        }
    }

    pub fn arm<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        Self {
            arm_targets: targets.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            base_velocity: None,
        }
    }
}

/// The action actually sent after safety clamping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppliedAction {
    pub arm_targets: BTreeMap<String, f32>,
    pub base_velocity: Option<BodyVelocity>,
    pub wheel_command: Option<WheelVelocities>,
}

/// Snapshot of the robot's motor state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Observation {
    /// Normalized position per calibrated arm motor
    pub arm_positions: BTreeMap<String, f32>,
    pub base_velocity: BodyVelocity,
    /// Arm motors left out of `arm_positions` for lack of calibration
    pub uncalibrated: Vec<String>,
}

/// Connection/calibration state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotState {
    Disconnected,
    Connecting,
    Connected,
    Calibrating,
    Faulted,
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RobotState::Disconnected => "disconnected",
            RobotState::Connecting => "connecting",
            RobotState::Connected => "connected",
            RobotState::Calibrating => "calibrating",
            RobotState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Health status of the teleop runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}
