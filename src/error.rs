// Error taxonomy for the robot controller

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::motor::FeetechError;

/// Errors surfaced by the robot controller entry points
#[derive(Debug, thiserror::Error)]
pub enum RobotError {
    /// The serial channel could not be opened or the motors did not answer
    #[error("Connection failed: {0}")]
    Connection(#[source] FeetechError),

    /// Register I/O fault on an open bus
    #[error("Communication error: {0}")]
    Communication(#[source] FeetechError),

    #[error("Robot not connected")]
    NotConnected,

    #[error("Robot already connected")]
    AlreadyConnected,

    #[error("Motor '{motor}' is not calibrated")]
    CalibrationMissing { motor: String },

    #[error("Calibration failed: {0}")]
    Calibration(String),

    #[error("Cannot access calibration file {path}: {source}")]
    CalibrationFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid calibration file {path}: {source}")]
    CalibrationFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Robot busy: calibration in progress")]
    Busy,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<FeetechError> for RobotError {
    fn from(err: FeetechError) -> Self {
        match err {
            FeetechError::NotConnected => RobotError::NotConnected,
            other => RobotError::Communication(other),
        }
    }
}
