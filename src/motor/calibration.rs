// Per-motor calibration records and their JSON persistence
//
// File format (one entry per motor name):
//   { "arm_gripper": { "id": 6, "drive_mode": 0, "homing_offset": -12,
//                      "range_min": 1990, "range_max": 3400 }, ... }

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::MotorConfig;
use crate::error::RobotError;

/// Largest raw encoder position (12-bit encoder)
pub const MAX_POSITION: i32 = 4095;

/// Homing offset that places the present position at mid-travel
pub const HALF_TURN: i32 = MAX_POSITION / 2;

/// Homing offset register is 11-bit magnitude plus sign
pub const MAX_HOMING_OFFSET: i32 = 2047;

/// Rotation sense of a motor relative to its normalized axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Direction {
    #[default]
    Normal,
    Inverted,
}

impl Direction {
    pub fn sign(self) -> f32 {
        match self {
            Direction::Normal => 1.0,
            Direction::Inverted => -1.0,
        }
    }
}

impl TryFrom<u8> for Direction {
    type Error = String;

    fn try_from(drive_mode: u8) -> Result<Self, Self::Error> {
        match drive_mode {
            0 => Ok(Direction::Normal),
            1 => Ok(Direction::Inverted),
            other => Err(format!("drive_mode must be 0 or 1, got {}", other)),
        }
    }
}

impl From<Direction> for u8 {
    fn from(direction: Direction) -> u8 {
        match direction {
            Direction::Normal => 0,
            Direction::Inverted => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub id: u8,
    #[serde(rename = "drive_mode")]
    pub direction: Direction,
    pub homing_offset: i32,
    pub range_min: i32,
    pub range_max: i32,
}

impl CalibrationRecord {
    /// Record for a continuous joint: no offset, the whole encoder turn
    pub fn full_turn(id: u8) -> Self {
        Self {
            id,
            direction: Direction::Normal,
            homing_offset: 0,
            range_min: 0,
            range_max: MAX_POSITION,
        }
    }

    pub fn validate(&self, motor: &str) -> Result<(), RobotError> {
        if self.range_min >= self.range_max {
            return Err(RobotError::Calibration(format!(
                "motor '{}': range_min {} must be below range_max {}",
                motor, self.range_min, self.range_max
            )));
        }
        if self.range_min < 0 || self.range_max > MAX_POSITION {
            return Err(RobotError::Calibration(format!(
                "motor '{}': range {}..{} outside 0..={}",
                motor, self.range_min, self.range_max, MAX_POSITION
            )));
        }
        if self.homing_offset.abs() > MAX_HOMING_OFFSET {
            return Err(RobotError::Calibration(format!(
                "motor '{}': homing offset {} exceeds ±{}",
                motor, self.homing_offset, MAX_HOMING_OFFSET
            )));
        }
        Ok(())
    }
}

/// Calibration of a whole robot, keyed by motor name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Calibration {
    records: BTreeMap<String, CalibrationRecord>,
}

impl Calibration {
    pub fn insert(&mut self, motor: &str, record: CalibrationRecord) {
        self.records.insert(motor.to_string(), record);
    }

    pub fn get(&self, motor: &str) -> Option<&CalibrationRecord> {
        self.records.get(motor)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when every given motor has a record
    pub fn covers<'a>(&self, mut motors: impl Iterator<Item = &'a MotorConfig>) -> bool {
        motors.all(|m| self.records.contains_key(&m.name))
    }

    /// Check every record, and that records for configured motors carry the configured id
    pub fn validate(&self, motors: &[MotorConfig]) -> Result<(), RobotError> {
        for (name, record) in &self.records {
            record.validate(name)?;
            if let Some(motor) = motors.iter().find(|m| &m.name == name) {
                if motor.id != record.id {
                    return Err(RobotError::Calibration(format!(
                        "motor '{}': calibrated as id {} but configured as id {}",
                        name, record.id, motor.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Load from a JSON file. A missing file means no calibration yet.
    pub fn load(path: &Path) -> Result<Option<Self>, RobotError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Calibration file not found: {}", path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(RobotError::CalibrationFile {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let calibration =
            serde_json::from_str(&text).map_err(|source| RobotError::CalibrationFormat {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Loaded calibration from {}", path.display());
        Ok(Some(calibration))
    }

    /// Save to a JSON file, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<(), RobotError> {
        let io_err = |source| RobotError::CalibrationFile {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| {
            RobotError::CalibrationFormat {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, text).map_err(io_err)?;

        info!("Saved calibration to {}", path.display());
        Ok(())
    }
}
