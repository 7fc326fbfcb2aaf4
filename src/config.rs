// Robot configuration: serial link, motor layout, safety limits, base geometry
//
// Loaded from a TOML file. Every field has a default matching the stock
// LeKiwi build, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::motor::feetech::{DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS};
use crate::motor::kinematics::{BASE_RADIUS, MAX_RAW, WHEEL_ANGLES_DEG, WHEEL_RADIUS};

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Serial port for Feetech motor controller
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

pub const DEFAULT_CALIBRATION_PATH: &str = "config/calibration.json";

// Sync-read retries before a read fault is surfaced
pub const DEFAULT_READ_RETRIES: usize = 2;

/// Highest servo address on the bus
pub const MAX_MOTOR_ID: u8 = 9;

/// An error that occurs while loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How a motor is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Position,
    Velocity,
}

/// Application-facing unit of a motor's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormMode {
    #[serde(rename = "degrees")]
    Degrees,
    #[serde(rename = "range_0_100")]
    Range0To100,
    #[serde(rename = "range_m100_100")]
    RangeM100To100,
    #[serde(rename = "raw")]
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub name: String,
    pub id: u8,
    pub control: ControlMode,
    pub norm: NormMode,
    /// Continuous joint: calibrated over the whole encoder turn
    #[serde(default)]
    pub full_turn: bool,
}

impl MotorConfig {
    pub fn new(name: &str, id: u8, control: ControlMode, norm: NormMode) -> Self {
        Self {
            name: name.to_string(),
            id,
            control,
            norm,
            full_turn: false,
        }
    }

    pub fn full_turn(mut self) -> Self {
        self.full_turn = true;
        self
    }
}

/// Largest allowed jump between present and commanded arm position,
/// in normalized units. Either one limit for every joint or one per joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxRelativeTarget {
    Uniform(f32),
    PerMotor(BTreeMap<String, f32>),
}

impl MaxRelativeTarget {
    pub fn limit_for(&self, motor: &str) -> Option<f32> {
        match self {
            MaxRelativeTarget::Uniform(limit) => Some(*limit),
            MaxRelativeTarget::PerMotor(limits) => limits.get(motor).copied(),
        }
    }
}

/// Omniwheel base geometry and speed limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    /// meters
    pub wheel_radius: f32,
    /// meters, center to wheel contact
    pub base_radius: f32,
    /// degrees, ordered [left, back, right]
    pub wheel_angles_deg: [f32; 3],
    /// wheel motor names, ordered [left, back, right]
    pub wheels: [String; 3],
    /// largest raw wheel command
    pub max_raw: i16,
    /// m/s, per axis
    pub max_linear_speed: f32,
    /// deg/s
    pub max_angular_speed: f32,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            wheel_radius: WHEEL_RADIUS,
            base_radius: BASE_RADIUS,
            wheel_angles_deg: WHEEL_ANGLES_DEG,
            wheels: [
                "base_left_wheel".to_string(),
                "base_back_wheel".to_string(),
                "base_right_wheel".to_string(),
            ],
            max_raw: MAX_RAW,
            max_linear_speed: 0.5,
            max_angular_speed: 180.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub port: String,
    pub baudrate: u32,
    pub timeout_ms: u64,
    pub read_retries: usize,
    /// Run against the in-process simulated servo chain instead of a serial port
    pub simulate: bool,
    pub disable_torque_on_disconnect: bool,
    pub max_relative_target: Option<MaxRelativeTarget>,
    pub calibration_path: PathBuf,
    /// Arm joints in degrees instead of signed percent
    pub use_degrees: bool,
    /// Empty means the stock LeKiwi layout
    #[serde(default)]
    pub motors: Vec<MotorConfig>,
    pub base: BaseConfig,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            read_retries: DEFAULT_READ_RETRIES,
            simulate: false,
            disable_torque_on_disconnect: true,
            max_relative_target: None,
            calibration_path: PathBuf::from(DEFAULT_CALIBRATION_PATH),
            use_degrees: false,
            motors: lekiwi_motors(false),
            base: BaseConfig::default(),
        }
    }
}

/// Stock LeKiwi motor layout: 6-joint arm on ids 1-6, omniwheels on 7-9
pub fn lekiwi_motors(use_degrees: bool) -> Vec<MotorConfig> {
    use ControlMode::{Position, Velocity};

    let joint = if use_degrees {
        NormMode::Degrees
    } else {
        NormMode::RangeM100To100
    };

    vec![
        // arm
        MotorConfig::new("arm_shoulder_pan", 1, Position, joint),
        MotorConfig::new("arm_shoulder_lift", 2, Position, joint),
        MotorConfig::new("arm_elbow_flex", 3, Position, joint),
        MotorConfig::new("arm_wrist_flex", 4, Position, joint),
        MotorConfig::new("arm_wrist_roll", 5, Position, joint).full_turn(),
        MotorConfig::new("arm_gripper", 6, Position, NormMode::Range0To100),
        // base
        MotorConfig::new("base_left_wheel", 7, Velocity, NormMode::RangeM100To100).full_turn(),
        MotorConfig::new("base_back_wheel", 8, Velocity, NormMode::RangeM100To100).full_turn(),
        MotorConfig::new("base_right_wheel", 9, Velocity, NormMode::RangeM100To100).full_turn(),
    ]
}

impl RobotConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: RobotConfig = toml::from_str(text)?;
        if config.motors.is_empty() {
            config.motors = lekiwi_motors(config.use_degrees);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn motor(&self, name: &str) -> Option<&MotorConfig> {
        self.motors.iter().find(|m| m.name == name)
    }

    /// Position-controlled motors (the arm)
    pub fn arm_motors(&self) -> impl Iterator<Item = &MotorConfig> {
        self.motors
            .iter()
            .filter(|m| m.control == ControlMode::Position)
    }

    pub fn motor_ids(&self) -> Vec<u8> {
        self.motors.iter().map(|m| m.id).collect()
    }

    /// Wheel motors in [left, back, right] order
    pub fn wheel_motors(&self) -> Result<[&MotorConfig; 3], ConfigError> {
        let find = |name: &String| {
            self.motor(name)
                .ok_or_else(|| ConfigError::Invalid(format!("base wheel '{}' is not a configured motor", name)))
        };
        let [left, back, right] = &self.base.wheels;
        Ok([find(left)?, find(back)?, find(right)?])
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for motor in &self.motors {
            if motor.name.is_empty() {
                return invalid(format!("motor {} has an empty name", motor.id));
            }
            if !(1..=MAX_MOTOR_ID).contains(&motor.id) {
                return invalid(format!(
                    "motor '{}' id {} outside 1..={}",
                    motor.name, motor.id, MAX_MOTOR_ID
                ));
            }
            if !ids.insert(motor.id) {
                return invalid(format!("duplicate motor id {}", motor.id));
            }
            if !names.insert(motor.name.as_str()) {
                return invalid(format!("duplicate motor name '{}'", motor.name));
            }
        }

        for wheel in self.wheel_motors()? {
            if wheel.control != ControlMode::Velocity {
                return invalid(format!("base wheel '{}' must be in velocity mode", wheel.name));
            }
        }

        let base = &self.base;
        let positive = [
            ("wheel_radius", base.wheel_radius),
            ("base_radius", base.base_radius),
            ("max_linear_speed", base.max_linear_speed),
            ("max_angular_speed", base.max_angular_speed),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("base.{} must be positive, got {}", field, value));
            }
        }
        if base.max_raw <= 0 {
            return invalid(format!("base.max_raw must be positive, got {}", base.max_raw));
        }

        match &self.max_relative_target {
            Some(MaxRelativeTarget::Uniform(limit)) if !(*limit > 0.0) => {
                return invalid(format!("max_relative_target must be positive, got {}", limit));
            }
            Some(MaxRelativeTarget::PerMotor(limits)) => {
                for (name, limit) in limits {
                    if self.motor(name).is_none() {
                        return invalid(format!("max_relative_target names unknown motor '{}'", name));
                    }
                    if !(*limit > 0.0) {
                        return invalid(format!("max_relative_target for '{}' must be positive", name));
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_stock_lekiwi() {
        let config = RobotConfig::from_toml_str("").unwrap();
        assert_eq!(config, RobotConfig::default());
        assert_eq!(config.motor_ids(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(config.arm_motors().count(), 6);
        assert!(config.disable_torque_on_disconnect);
    }

    #[test]
    fn test_use_degrees_switches_arm_joints() {
        let config = RobotConfig::from_toml_str("use_degrees = true").unwrap();
        assert_eq!(config.motor("arm_elbow_flex").unwrap().norm, NormMode::Degrees);
        // Gripper keeps its percentage scale
        assert_eq!(config.motor("arm_gripper").unwrap().norm, NormMode::Range0To100);
    }

    #[test]
    fn test_max_relative_target_forms() {
        let uniform = RobotConfig::from_toml_str("max_relative_target = 5.0").unwrap();
        assert_eq!(
            uniform.max_relative_target.unwrap().limit_for("arm_gripper"),
            Some(5.0)
        );

        let per_motor = RobotConfig::from_toml_str(
            "[max_relative_target]\narm_gripper = 10.0\narm_elbow_flex = 2.5\n",
        )
        .unwrap();
        let limits = per_motor.max_relative_target.unwrap();
        assert_eq!(limits.limit_for("arm_elbow_flex"), Some(2.5));
        assert_eq!(limits.limit_for("arm_shoulder_pan"), None);
    }

    #[test]
    fn test_custom_motor_table() {
        let text = r#"
            port = "/dev/ttyUSB0"
            [[motors]]
            name = "lift"
            id = 1
            control = "position"
            norm = "range_0_100"

            [[motors]]
            name = "l"
            id = 2
            control = "velocity"
            norm = "raw"
            [[motors]]
            name = "b"
            id = 3
            control = "velocity"
            norm = "raw"
            [[motors]]
            name = "r"
            id = 4
            control = "velocity"
            norm = "raw"

            [base]
            wheels = ["l", "b", "r"]
        "#;
        let config = RobotConfig::from_toml_str(text).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.motors.len(), 4);
        assert_eq!(config.wheel_motors().unwrap()[2].id, 4);
        // Unspecified base fields keep their defaults
        assert_eq!(config.base.max_raw, MAX_RAW);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = RobotConfig::from_toml_str(include_str!("../config/lekiwi.toml")).unwrap();
        assert_eq!(config, RobotConfig::default());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config = RobotConfig::default();
        config.motors[1].id = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_out_of_range_id() {
        let mut config = RobotConfig::default();
        config.motors[0].id = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_position_mode_wheel() {
        let mut config = RobotConfig::default();
        config.motors[7].control = ControlMode::Position;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_wheel_and_bad_geometry() {
        let mut config = RobotConfig::default();
        config.base.wheels[0] = "nope".to_string();
        assert!(config.validate().is_err());

        let mut config = RobotConfig::default();
        config.base.wheel_radius = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_relative_target() {
        assert!(RobotConfig::from_toml_str("max_relative_target = -1.0").is_err());
        assert!(RobotConfig::from_toml_str("[max_relative_target]\nbogus = 1.0\n").is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            RobotConfig::from_toml_str("port = "),
            Err(ConfigError::Parse(_))
        ));
    }
}
