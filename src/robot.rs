// High-level controller for the LeKiwi robot (arm + omniwheel base)
//
// Owns the connection/calibration state machine and the motor bus, and is
// the only component that issues bus transactions. Every entry point blocks
// until its transaction completes; callers that must stay responsive run
// them on a blocking worker (see runtime.rs).
//
// Locking: `state` is only ever held briefly, `session` for a whole entry
// point. `state` may be taken while holding `session`, never the reverse.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use crate::config::{ControlMode, MotorConfig, RobotConfig};
use crate::error::RobotError;
use crate::messages::{Action, AppliedAction, BodyVelocity, Observation, RobotState};
use crate::motor::calibration::{HALF_TURN, MAX_HOMING_OFFSET, MAX_POSITION};
use crate::motor::feetech::{OperatingMode, SerialTransport};
use crate::motor::{
    normalize, Calibration, CalibrationRecord, Direction, FeetechBus, FeetechError, MotorReading,
    OmniKinematics, Register, SimHandle, Transport, WheelVelocities,
};

/// PID gains for arm joints in position mode
const ARM_P_COEFFICIENT: i32 = 16;
const ARM_I_COEFFICIENT: i32 = 0;
const ARM_D_COEFFICIENT: i32 = 32;

const MAX_ACCELERATION: i32 = 254;

/// Opens the byte channel to the motors at connect time
pub type TransportFactory =
    Box<dyn Fn(&RobotConfig) -> Result<Box<dyn Transport>, FeetechError> + Send + Sync>;

/// Operator side of an interactive calibration session
pub trait CalibrationOperator {
    /// Block until every arm joint sits in the middle of its range of motion
    fn await_homing_pose(&mut self) -> Result<(), RobotError>;

    /// Called after each range sample with the (min, max) raw positions seen
    /// so far. Returns true once every joint has been swept.
    fn ranges_recorded(
        &mut self,
        ranges: &BTreeMap<String, (i32, i32)>,
    ) -> Result<bool, RobotError>;
}

#[derive(Default)]
struct Session {
    bus: Option<FeetechBus>,
    calibration: Calibration,
}

impl Session {
    fn bus(&self) -> Result<&FeetechBus, RobotError> {
        self.bus.as_ref().ok_or(RobotError::NotConnected)
    }
}

/// Opens a serial port, or the simulated servo chain when configured
fn open_default_transport(config: &RobotConfig) -> Result<Box<dyn Transport>, FeetechError> {
    if config.simulate {
        info!("Using simulated servo chain");
        return Ok(SimHandle::new(&config.motor_ids()).transport());
    }
    let port = SerialTransport::open(&config.port, config.baudrate, config.timeout())?;
    Ok(Box::new(port))
}

pub struct RobotController {
    config: RobotConfig,
    kinematics: OmniKinematics,
    /// [left, back, right]
    wheel_ids: [u8; 3],
    state: Mutex<RobotState>,
    session: Mutex<Session>,
    calibrated: AtomicBool,
    abort_requested: AtomicBool,
    open_transport: TransportFactory,
}

impl RobotController {
    pub fn new(config: RobotConfig) -> Result<Self, RobotError> {
        Self::with_transport_factory(config, Box::new(open_default_transport))
    }

    pub fn with_transport_factory(
        config: RobotConfig,
        open_transport: TransportFactory,
    ) -> Result<Self, RobotError> {
        config.validate()?;
        let kinematics = OmniKinematics::from_config(&config.base)?;
        let wheel_ids = config.wheel_motors()?.map(|m| m.id);

        Ok(Self {
            config,
            kinematics,
            wheel_ids,
            state: Mutex::new(RobotState::Disconnected),
            session: Mutex::new(Session::default()),
            calibrated: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            open_transport,
        })
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn state(&self) -> RobotState {
        *self.state.lock()
    }

    /// True when every arm motor has a calibration record
    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: RobotState) {
        *self.state.lock() = state;
    }

    fn install_calibration(&self, session: &mut Session, calibration: Calibration) {
        let complete = calibration.covers(self.config.arm_motors());
        session.calibration = calibration;
        self.calibrated.store(complete, Ordering::SeqCst);
    }

    fn admit_connected(&self) -> Result<(), RobotError> {
        match *self.state.lock() {
            RobotState::Connected => Ok(()),
            RobotState::Calibrating => Err(RobotError::Busy),
            _ => Err(RobotError::NotConnected),
        }
    }

    /// Take the session for a command; the state may change while we wait
    fn begin(&self) -> Result<MutexGuard<'_, Session>, RobotError> {
        self.admit_connected()?;
        let session = self.session.lock();
        self.admit_connected()?;
        Ok(session)
    }

    fn fault(&self, err: &FeetechError) {
        error!("Unrecoverable bus fault, robot faulted: {}", err);
        self.set_state(RobotState::Faulted);
    }

    /// Reads are already retried by the bus; whatever survives is unrecoverable
    fn after_read<T>(&self, result: Result<T, FeetechError>) -> Result<T, RobotError> {
        result.map_err(|e| {
            if !matches!(e, FeetechError::NotConnected) {
                self.fault(&e);
            }
            RobotError::from(e)
        })
    }

    fn after_write<T>(&self, result: Result<T, FeetechError>) -> Result<T, RobotError> {
        result.map_err(|e| {
            if e.is_fatal() {
                self.fault(&e);
            }
            RobotError::from(e)
        })
    }

    // === Connection ===

    /// Open the bus, check every motor answers, apply calibration and configure motors
    pub fn connect(&self) -> Result<(), RobotError> {
        {
            let mut state = self.state.lock();
            match *state {
                RobotState::Disconnected => *state = RobotState::Connecting,
                RobotState::Connecting | RobotState::Calibrating => return Err(RobotError::Busy),
                RobotState::Connected | RobotState::Faulted => {
                    return Err(RobotError::AlreadyConnected);
                }
            }
        }

        let mut session = self.session.lock();
        match self.open_session(&mut session) {
            Ok(()) => {
                self.set_state(RobotState::Connected);
                info!("LeKiwi robot connected");
                Ok(())
            }
            Err(e) => {
                if let Some(bus) = session.bus.take() {
                    bus.close();
                }
                self.install_calibration(&mut session, Calibration::default());
                self.set_state(RobotState::Disconnected);
                error!("Failed to connect: {}", e);
                Err(e)
            }
        }
    }

    fn open_session(&self, session: &mut Session) -> Result<(), RobotError> {
        info!("Opening motor bus on {}", self.config.port);
        let transport = (self.open_transport)(&self.config).map_err(RobotError::Connection)?;
        let bus = session
            .bus
            .insert(FeetechBus::with_transport(transport, self.config.read_retries));

        // First, check that all motors are reachable
        for motor in &self.config.motors {
            match bus.ping(motor.id) {
                Ok(true) => debug!("Motor {} ({}) responding", motor.id, motor.name),
                Ok(false) => {
                    warn!("Motor {} ({}) not responding to ping", motor.id, motor.name);
                    return Err(RobotError::Connection(FeetechError::Timeout { id: motor.id }));
                }
                Err(e) => return Err(RobotError::Connection(e)),
            }
        }

        let calibration = self.load_calibration();
        self.configure_motors(bus, &calibration)
            .map_err(RobotError::Connection)?;
        self.install_calibration(session, calibration);
        Ok(())
    }

    fn load_calibration(&self) -> Calibration {
        let path = &self.config.calibration_path;
        let loaded = Calibration::load(path)
            .and_then(|c| c.map(|c| c.validate(&self.config.motors).map(|_| c)).transpose());

        match loaded {
            Ok(Some(calibration)) => calibration,
            Ok(None) => {
                warn!(
                    "No calibration at {}; arm motors will reject commands until calibrated",
                    path.display()
                );
                Calibration::default()
            }
            Err(e) => {
                error!("Ignoring calibration: {}", e);
                Calibration::default()
            }
        }
    }

    /// Write calibration and operating parameters with torque off, then re-enable torque
    fn configure_motors(
        &self,
        bus: &FeetechBus,
        calibration: &Calibration,
    ) -> Result<(), FeetechError> {
        // Disable torque on all motors (required before changing EEPROM values)
        for motor in &self.config.motors {
            bus.write(motor.id, Register::TorqueEnable, 0)?;
            bus.write(motor.id, Register::Lock, 0)?;
        }

        for motor in &self.config.motors {
            if let Some(record) = calibration.get(&motor.name) {
                bus.write(motor.id, Register::HomingOffset, record.homing_offset)?;
                bus.write(motor.id, Register::MinPositionLimit, record.range_min)?;
                bus.write(motor.id, Register::MaxPositionLimit, record.range_max)?;
            }

            bus.write(motor.id, Register::ReturnDelayTime, 0)?;
            bus.write(motor.id, Register::MaximumAcceleration, MAX_ACCELERATION)?;
            bus.write(motor.id, Register::Acceleration, MAX_ACCELERATION)?;

            match motor.control {
                ControlMode::Position => {
                    bus.write(motor.id, Register::OperatingMode, OperatingMode::Position as i32)?;
                    bus.write(motor.id, Register::PCoefficient, ARM_P_COEFFICIENT)?;
                    bus.write(motor.id, Register::ICoefficient, ARM_I_COEFFICIENT)?;
                    bus.write(motor.id, Register::DCoefficient, ARM_D_COEFFICIENT)?;
                }
                ControlMode::Velocity => {
                    bus.write(motor.id, Register::OperatingMode, OperatingMode::Velocity as i32)?;
                }
            }
        }

        for motor in &self.config.motors {
            bus.write(motor.id, Register::TorqueEnable, 1)?;
            bus.write(motor.id, Register::Lock, 1)?;
        }

        if !calibration.is_empty() {
            info!("Applied calibration for {} motors", calibration.len());
        }
        Ok(())
    }

    /// Stop the base, optionally release torque, and close the bus.
    /// The safety writes are best effort: closing always proceeds.
    pub fn disconnect(&self) -> Result<(), RobotError> {
        let admit = |state: RobotState| match state {
            RobotState::Connected | RobotState::Faulted => Ok(()),
            RobotState::Connecting | RobotState::Calibrating => Err(RobotError::Busy),
            RobotState::Disconnected => Err(RobotError::NotConnected),
        };
        admit(self.state())?;
        let mut session = self.session.lock();
        admit(self.state())?;

        if let Some(bus) = session.bus.take() {
            if let Err(e) = self.write_base_stop(&bus) {
                warn!("Failed to stop base before disconnect: {}", e);
            }

            if self.config.disable_torque_on_disconnect {
                let values: BTreeMap<u8, i32> =
                    self.config.motors.iter().map(|m| (m.id, 0)).collect();
                match bus.write_register(&values, Register::TorqueEnable) {
                    Ok(()) => debug!("Torque disabled on {} motors", values.len()),
                    Err(e) => warn!("Failed to disable torque on disconnect: {}", e),
                }
            }

            bus.close();
        }

        self.install_calibration(&mut session, Calibration::default());
        self.set_state(RobotState::Disconnected);
        info!("LeKiwi robot disconnected");
        Ok(())
    }

    // === Commands ===

    /// Send arm targets and/or a base velocity. Returns the action actually
    /// sent after safety clamping.
    pub fn send_action(&self, action: &Action) -> Result<AppliedAction, RobotError> {
        let session = self.begin()?;
        let bus = session.bus()?;

        let mut arm_targets: Vec<(&MotorConfig, f32)> = Vec::with_capacity(action.arm_targets.len());
        for (name, &target) in &action.arm_targets {
            let motor = self
                .config
                .motor(name)
                .filter(|m| m.control == ControlMode::Position)
                .ok_or_else(|| RobotError::Validation(format!("unknown arm motor '{}'", name)))?;
            if !target.is_finite() {
                return Err(RobotError::Validation(format!(
                    "target {} for '{}' is not a number",
                    target, name
                )));
            }
            if session.calibration.get(name).is_none() {
                return Err(RobotError::CalibrationMissing {
                    motor: name.clone(),
                });
            }
            arm_targets.push((motor, target));
        }

        let base_velocity = action
            .base_velocity
            .map(|velocity| self.clamp_base_velocity(velocity))
            .transpose()?;

        // Safety: cap goal position if too far from present
        if let (Some(limits), false) = (&self.config.max_relative_target, arm_targets.is_empty()) {
            let ids: Vec<u8> = arm_targets.iter().map(|(m, _)| m.id).collect();
            let present = self.after_read(bus.read_register(&ids, Register::PresentPosition))?;

            for (motor, target) in arm_targets.iter_mut() {
                let Some(max_delta) = limits.limit_for(&motor.name) else {
                    continue;
                };
                let raw = present_value(&present, motor.id)?;
                let present_pos =
                    normalize::from_raw(motor, session.calibration.get(&motor.name), raw)?;
                let delta = *target - present_pos;
                if delta.abs() > max_delta {
                    let capped = present_pos + max_delta.copysign(delta);
                    debug!(
                        "Capping {} target {:.2} to {:.2} (present {:.2})",
                        motor.name, target, capped, present_pos
                    );
                    *target = capped;
                }
            }
        }

        let mut goal_positions = BTreeMap::new();
        for (motor, target) in &arm_targets {
            let raw = normalize::to_raw(motor, session.calibration.get(&motor.name), *target)?;
            goal_positions.insert(motor.id, raw);
        }
        let wheel_command = base_velocity.map(|v| self.kinematics.body_to_wheel_raw(v));

        // Send commands
        self.after_write(bus.write_register(&goal_positions, Register::GoalPosition))?;
        if let Some(wheels) = wheel_command {
            debug!(
                "Setting wheel velocities: left={}, back={}, right={}",
                wheels.left, wheels.back, wheels.right
            );
            self.after_write(bus.write_register(&self.wheel_values(wheels), Register::GoalVelocity))?;
        }

        Ok(AppliedAction {
            arm_targets: arm_targets
                .into_iter()
                .map(|(motor, target)| (motor.name.clone(), target))
                .collect(),
            base_velocity,
            wheel_command,
        })
    }

    fn clamp_base_velocity(&self, velocity: BodyVelocity) -> Result<BodyVelocity, RobotError> {
        if !velocity.is_finite() {
            return Err(RobotError::Validation(format!(
                "base velocity {:?} is not finite",
                velocity
            )));
        }
        let linear = self.config.base.max_linear_speed;
        let angular = self.config.base.max_angular_speed;
        Ok(BodyVelocity::new(
            velocity.x_vel.clamp(-linear, linear),
            velocity.y_vel.clamp(-linear, linear),
            velocity.theta_vel.clamp(-angular, angular),
        ))
    }

    fn wheel_values(&self, wheels: WheelVelocities) -> BTreeMap<u8, i32> {
        self.wheel_ids
            .into_iter()
            .zip(wheels.as_array())
            .map(|(id, raw)| (id, raw as i32))
            .collect()
    }

    fn write_base_stop(&self, bus: &FeetechBus) -> Result<(), FeetechError> {
        bus.write_register(&self.wheel_values(WheelVelocities::zero()), Register::GoalVelocity)
    }

    /// Emergency stop for base motors. Arm motors hold their position.
    pub fn stop(&self) -> Result<(), RobotError> {
        let session = self.begin()?;
        let bus = session.bus()?;
        self.after_write(self.write_base_stop(bus))?;
        info!("Base motors stopped");
        Ok(())
    }

    /// Read every motor in one transaction: arm positions (normalized) and base velocity
    pub fn get_observation(&self) -> Result<Observation, RobotError> {
        let session = self.begin()?;
        let bus = session.bus()?;

        let readings = self.after_read(bus.read_state(&self.config.motor_ids()))?;

        let mut observation = Observation::default();
        for motor in self.config.arm_motors() {
            let reading = reading_for(&readings, motor.id)?;
            match session.calibration.get(&motor.name) {
                Some(record) => {
                    let position = normalize::from_raw(motor, Some(record), reading.position)?;
                    observation.arm_positions.insert(motor.name.clone(), position);
                }
                None => observation.uncalibrated.push(motor.name.clone()),
            }
        }

        let mut wheels = [0i16; 3];
        for (slot, id) in wheels.iter_mut().zip(self.wheel_ids) {
            let velocity = reading_for(&readings, id)?.velocity;
            *slot = velocity.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        let [left, back, right] = wheels;
        observation.base_velocity = self
            .kinematics
            .wheel_raw_to_body(WheelVelocities::new(left, back, right));

        Ok(observation)
    }

    // === Calibration ===

    /// Run an interactive calibration session. Exclusive: other entry points
    /// fail with `Busy` until it finishes. On failure the robot is left
    /// uncalibrated and nothing is saved.
    pub fn calibrate(&self, operator: &mut dyn CalibrationOperator) -> Result<(), RobotError> {
        {
            let mut state = self.state.lock();
            match *state {
                RobotState::Connected => {
                    // Cleared before the state is visible to abort_calibration
                    self.abort_requested.store(false, Ordering::SeqCst);
                    *state = RobotState::Calibrating;
                }
                RobotState::Calibrating | RobotState::Connecting => return Err(RobotError::Busy),
                RobotState::Disconnected | RobotState::Faulted => {
                    return Err(RobotError::NotConnected);
                }
            }
        }
        info!("Running calibration...");

        let mut session = self.session.lock();
        let outcome = match session.bus.as_ref() {
            Some(bus) => self.run_calibration(bus, operator),
            None => Err(RobotError::NotConnected),
        };

        // A dead link leaves nothing to restore
        if let Err(RobotError::Communication(e)) = &outcome {
            self.install_calibration(&mut session, Calibration::default());
            self.fault(e);
            return outcome.map(|_| ());
        }

        let result = match outcome {
            Ok(calibration) => {
                self.install_calibration(&mut session, calibration);
                info!("Calibration complete");
                Ok(())
            }
            Err(e) => {
                self.install_calibration(&mut session, Calibration::default());
                warn!("Calibration failed: {}", e);
                Err(e)
            }
        };

        // Restore operating configuration either way
        if let Some(bus) = session.bus.as_ref() {
            if let Err(e) = self.configure_motors(bus, &session.calibration) {
                warn!("Failed to reconfigure motors after calibration: {}", e);
            }
        }

        self.set_state(RobotState::Connected);
        result
    }

    /// Ask a running calibration session to stop at its next sample
    pub fn abort_calibration(&self) {
        let state = self.state.lock();
        if *state == RobotState::Calibrating {
            info!("Calibration abort requested");
            self.abort_requested.store(true, Ordering::SeqCst);
        }
    }

    fn check_abort(&self) -> Result<(), RobotError> {
        if self.abort_requested.swap(false, Ordering::SeqCst) {
            return Err(RobotError::Calibration("aborted by operator".to_string()));
        }
        Ok(())
    }

    fn run_calibration(
        &self,
        bus: &FeetechBus,
        operator: &mut dyn CalibrationOperator,
    ) -> Result<Calibration, RobotError> {
        // Exhausted reads and fatal writes surface as Communication and fault the robot
        let read_err = |e: FeetechError| RobotError::from(e);
        let bus_err = |e: FeetechError| {
            if e.is_fatal() {
                RobotError::Communication(e)
            } else {
                RobotError::Calibration(format!("bus error: {}", e))
            }
        };
        let arm: Vec<&MotorConfig> = self.config.arm_motors().collect();
        let arm_ids: Vec<u8> = arm.iter().map(|m| m.id).collect();

        // Arm goes limp in position mode so the operator can move it
        for motor in &arm {
            bus.write(motor.id, Register::TorqueEnable, 0).map_err(bus_err)?;
            bus.write(motor.id, Register::Lock, 0).map_err(bus_err)?;
            bus.write(motor.id, Register::OperatingMode, OperatingMode::Position as i32)
                .map_err(bus_err)?;
        }

        operator.await_homing_pose()?;
        self.check_abort()?;

        // Half-turn homing: shift each joint so its present position reads mid-range
        for motor in &arm {
            bus.write(motor.id, Register::HomingOffset, 0).map_err(bus_err)?;
        }
        let present = bus
            .read_register(&arm_ids, Register::PresentPosition)
            .map_err(read_err)?;
        let mut offsets = BTreeMap::new();
        for motor in &arm {
            // A joint resting at the last tick loses one tick to the register range
            let offset = (present_value(&present, motor.id)? - HALF_TURN)
                .clamp(-MAX_HOMING_OFFSET, MAX_HOMING_OFFSET);
            bus.write(motor.id, Register::HomingOffset, offset).map_err(bus_err)?;
            offsets.insert(motor.id, offset);
        }

        // Record ranges of motion for every joint that does not turn fully
        let swept: Vec<&MotorConfig> = arm.iter().copied().filter(|m| !m.full_turn).collect();
        let swept_ids: Vec<u8> = swept.iter().map(|m| m.id).collect();
        let mut ranges: BTreeMap<String, (i32, i32)> = BTreeMap::new();
        info!("Recording ranges of motion for {} joints", swept.len());
        loop {
            self.check_abort()?;
            let positions = bus
                .read_register(&swept_ids, Register::PresentPosition)
                .map_err(read_err)?;
            for motor in &swept {
                let position = present_value(&positions, motor.id)?;
                let range = ranges
                    .entry(motor.name.clone())
                    .or_insert((position, position));
                range.0 = range.0.min(position);
                range.1 = range.1.max(position);
            }
            if operator.ranges_recorded(&ranges)? {
                break;
            }
        }

        let mut calibration = Calibration::default();
        for motor in &self.config.motors {
            let (range_min, range_max) = match ranges.get(&motor.name) {
                Some(&(min, max)) if min == max => {
                    return Err(RobotError::Calibration(format!(
                        "motor '{}' did not move while recording ranges",
                        motor.name
                    )));
                }
                Some(&range) => range,
                None => (0, MAX_POSITION),
            };
            let record = CalibrationRecord {
                id: motor.id,
                direction: Direction::Normal,
                homing_offset: offsets.get(&motor.id).copied().unwrap_or(0),
                range_min,
                range_max,
            };
            record.validate(&motor.name)?;
            calibration.insert(&motor.name, record);
        }

        calibration.save(&self.config.calibration_path)?;
        Ok(calibration)
    }
}

fn present_value(values: &BTreeMap<u8, i32>, id: u8) -> Result<i32, RobotError> {
    values.get(&id).copied().ok_or_else(|| {
        RobotError::Communication(FeetechError::InvalidResponse {
            id,
            reason: "missing from sync read".to_string(),
        })
    })
}

fn reading_for(readings: &BTreeMap<u8, MotorReading>, id: u8) -> Result<MotorReading, RobotError> {
    readings.get(&id).copied().ok_or_else(|| {
        RobotError::Communication(FeetechError::InvalidResponse {
            id,
            reason: "missing from sync read".to_string(),
        })
    })
}
