// 50 Hz teleop loop with watchdog
// Note: a watchdog is a safety mechanism that triggers a safe action if something goes wrong
// Eg. without it if the keyboard task dies and stops sending commands, the base would keep
// driving at the last commanded velocity

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{CMD_TIMEOUT, LOOP_HZ};
use crate::error::RobotError;
use crate::messages::{Action, BodyVelocity, RuntimeHealth};
use crate::robot::RobotController;

pub struct Runtime {
    latest_cmd: Option<BodyVelocity>,
    cmd_received_at: Instant,
    health: RuntimeHealth,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    pub fn on_command(&mut self, cmd: BodyVelocity) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = Instant::now();
    }

    /// Compute base velocity based on watchdog state
    pub fn compute_actuation(&mut self) -> BodyVelocity {
        let cmd_age = self.cmd_received_at.elapsed();

        if cmd_age > CMD_TIMEOUT {
            // Watchdog triggered - stop the robot
            if self.health != RuntimeHealth::CmdStale {
                warn!("Command stale ({:?} old), stopping robot", cmd_age);
            }
            self.health = RuntimeHealth::CmdStale;
            BodyVelocity::zero()
        } else if let Some(cmd) = self.latest_cmd {
            if self.health != RuntimeHealth::Ok {
                info!("Receiving commands");
            }
            self.health = RuntimeHealth::Ok;
            cmd
        } else {
            // No command ever received
            self.health = RuntimeHealth::CmdStale;
            BodyVelocity::zero()
        }
    }
}

async fn send_base(
    controller: &Arc<RobotController>,
    velocity: BodyVelocity,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let robot = Arc::clone(controller);
    let result =
        tokio::task::spawn_blocking(move || robot.send_action(&Action::base(velocity))).await?;

    match result {
        Ok(_) => Ok(()),
        // Faulted or disconnected underneath us: nothing more to drive
        Err(RobotError::NotConnected) => Err(RobotError::NotConnected.into()),
        Err(e) => {
            warn!("Failed to send base command: {}", e);
            Ok(())
        }
    }
}

/// Drive the base from `commands` until the sender side is dropped.
/// The base is stopped on the way out.
pub async fn run(
    controller: Arc<RobotController>,
    mut commands: mpsc::Receiver<BodyVelocity>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut runtime = Runtime::new();
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let mut ticks: u64 = 0;

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );

    let outcome = loop {
        tick.tick().await;
        ticks += 1;

        // 1. Drain all pending commands (non-blocking), keep latest
        let mut closed = false;
        loop {
            match commands.try_recv() {
                Ok(cmd) => runtime.on_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        // 2. Compute actuation (includes watchdog logic)
        let actuation = runtime.compute_actuation();

        // 3. Send to the base
        if let Err(e) = send_base(&controller, actuation).await {
            break Err(e);
        }

        // 4. Report once a second
        if ticks % LOOP_HZ == 0 {
            let robot = Arc::clone(&controller);
            match tokio::task::spawn_blocking(move || robot.get_observation()).await? {
                Ok(obs) => info!(
                    "health={:?} base: x={:.2} m/s y={:.2} m/s theta={:.1} deg/s",
                    runtime.health(),
                    obs.base_velocity.x_vel,
                    obs.base_velocity.y_vel,
                    obs.base_velocity.theta_vel
                ),
                Err(e) => warn!("Failed to read observation: {}", e),
            }
        }

        if closed {
            info!("Command channel closed, leaving runtime loop");
            break Ok(());
        }
    };

    let robot = Arc::clone(&controller);
    if let Err(e) = tokio::task::spawn_blocking(move || robot.stop()).await? {
        warn!("Failed to stop base on exit: {}", e);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;
    use crate::motor::{FeetechError, Register, SimHandle, Transport};
    use std::collections::BTreeMap;

    #[test]
    fn test_stale_until_first_command() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.compute_actuation(), BodyVelocity::zero());
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_fresh_command_passes_through() {
        let mut runtime = Runtime::new();
        let cmd = BodyVelocity::new(0.2, 0.0, 30.0);
        runtime.on_command(cmd);

        assert_eq!(runtime.compute_actuation(), cmd);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_watchdog_zeroes_stale_command() {
        let mut runtime = Runtime::new();
        runtime.on_command(BodyVelocity::new(0.2, 0.1, 0.0));
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        runtime.compute_actuation();
        assert_eq!(runtime.health(), RuntimeHealth::Ok);

        // Pretend the last command arrived long ago
        runtime.cmd_received_at = Instant::now() - CMD_TIMEOUT - Duration::from_millis(50);
        assert_eq!(runtime.compute_actuation(), BodyVelocity::zero());
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[tokio::test]
    async fn test_run_drives_base_then_stops() {
        let sim = SimHandle::new(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let handle = sim.clone();
        let config = RobotConfig {
            calibration_path: std::env::temp_dir()
                .join(format!("lekiwi-runtime-{}", std::process::id()))
                .join("calibration.json"),
            ..RobotConfig::default()
        };
        let controller = RobotController::with_transport_factory(
            config,
            Box::new(move |_: &RobotConfig| -> Result<Box<dyn Transport>, FeetechError> {
                Ok(handle.transport())
            }),
        )
        .unwrap();
        controller.connect().unwrap();
        let controller = Arc::new(controller);

        let (tx, rx) = mpsc::channel(8);
        tx.send(BodyVelocity::new(0.1, 0.0, 0.0)).await.unwrap();
        drop(tx);

        run(Arc::clone(&controller), rx).await.unwrap();

        let writes = sim.sync_writes(Register::GoalVelocity);
        assert!(writes.len() >= 2);
        assert!(writes[0].values().any(|&v| v != 0));
        assert_eq!(
            writes.last().unwrap(),
            &BTreeMap::from([(7, 0), (8, 0), (9, 0)])
        );
    }

    #[tokio::test]
    async fn test_run_ends_when_robot_disconnected() {
        let sim = SimHandle::new(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let handle = sim.clone();
        let controller = RobotController::with_transport_factory(
            RobotConfig::default(),
            Box::new(move |_: &RobotConfig| -> Result<Box<dyn Transport>, FeetechError> {
                Ok(handle.transport())
            }),
        )
        .unwrap();
        let (_tx, rx) = mpsc::channel(8);

        let result = run(Arc::new(controller), rx).await;
        assert!(result.is_err());
        assert_eq!(sim.packet_count(), 0);
    }
}
