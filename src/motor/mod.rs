// Motor control module for LeKiwi (arm + omniwheel base)
//
// Provides:
// - Feetech STS3215 serial protocol implementation
// - Per-motor calibration records and unit normalization
// - Omniwheel kinematics (body velocity <-> wheel velocities)
// - A simulated servo chain speaking the same protocol

pub mod calibration;
pub mod feetech;
pub mod kinematics;
pub mod normalize;
pub mod sim;

pub use calibration::{Calibration, CalibrationRecord, Direction};
pub use feetech::{FeetechBus, FeetechError, MotorReading, Register, Transport};
pub use kinematics::{OmniKinematics, WheelVelocities};
pub use sim::SimHandle;
