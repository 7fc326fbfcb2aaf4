// LeKiwi hardware control: Feetech motor bus, calibration, omniwheel
// kinematics and the robot controller state machine

pub mod config;
pub mod error;
pub mod messages;
pub mod motor;
pub mod robot;
pub mod runtime;
pub mod terminal;

pub use config::RobotConfig;
pub use error::RobotError;
pub use messages::{Action, AppliedAction, BodyVelocity, Observation, RobotState};
pub use robot::{CalibrationOperator, RobotController};
