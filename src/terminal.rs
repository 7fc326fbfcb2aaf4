// Terminal front-ends: keyboard teleop and the interactive calibration operator
//
// Keyboard teleop: WASD move, Z/X rotate, R/F speed, Q quit

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::RobotError;
use crate::messages::BodyVelocity;
use crate::robot::CalibrationOperator;

const SPEEDS: [f32; 3] = [0.05, 0.15, 0.3]; // m/s
const THETA_SPEEDS: [f32; 3] = [15.0, 45.0, 90.0]; // deg/s
const INPUT_TIMEOUT: Duration = Duration::from_millis(100); // Reset velocities after this much time with no input
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Raw mode for as long as this lives
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

fn quit_requested(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Moved,
    SpeedChanged,
    Quit,
    Ignored,
}

/// Persistent velocity state driven by key presses
#[derive(Debug)]
pub struct KeyboardTeleop {
    speed_idx: usize,
    velocity: BodyVelocity,
    last_movement_input: Instant,
}

impl Default for KeyboardTeleop {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardTeleop {
    pub fn new() -> Self {
        Self {
            speed_idx: 0,
            velocity: BodyVelocity::zero(),
            last_movement_input: Instant::now(),
        }
    }

    pub fn speed_label(&self) -> &'static str {
        ["LOW", "MED", "HIGH"][self.speed_idx]
    }

    pub fn handle_key(&mut self, key: &KeyEvent) -> KeyOutcome {
        let pressed = key.kind == KeyEventKind::Press || key.kind == KeyEventKind::Repeat;
        if !pressed {
            return KeyOutcome::Ignored;
        }
        if quit_requested(key) {
            return KeyOutcome::Quit;
        }

        let speed = SPEEDS[self.speed_idx];
        let theta_speed = THETA_SPEEDS[self.speed_idx];
        match key.code {
            // Movement - update velocity and refresh timestamp
            KeyCode::Char('w') => self.velocity.x_vel = speed,
            KeyCode::Char('s') => self.velocity.x_vel = -speed,
            KeyCode::Char('a') => self.velocity.y_vel = speed,
            KeyCode::Char('d') => self.velocity.y_vel = -speed,

            // Rotation
            KeyCode::Char('z') => self.velocity.theta_vel = theta_speed,
            KeyCode::Char('x') => self.velocity.theta_vel = -theta_speed,

            // Speed control
            KeyCode::Char('r') => {
                self.speed_idx = (self.speed_idx + 1).min(SPEEDS.len() - 1);
                return KeyOutcome::SpeedChanged;
            }
            KeyCode::Char('f') => {
                self.speed_idx = self.speed_idx.saturating_sub(1);
                return KeyOutcome::SpeedChanged;
            }

            _ => return KeyOutcome::Ignored,
        }
        self.last_movement_input = Instant::now();
        KeyOutcome::Moved
    }

    /// Current command; zero once keys have been released for a while
    pub fn command(&mut self) -> BodyVelocity {
        if self.last_movement_input.elapsed() > INPUT_TIMEOUT {
            self.velocity = BodyVelocity::zero();
        }
        self.velocity
    }
}

/// Read the keyboard and send base commands at ~50Hz until the operator quits
/// or the receiving side goes away. Blocking; run on a blocking worker.
pub fn run_keyboard(commands: mpsc::Sender<BodyVelocity>) -> io::Result<()> {
    info!("Controls: WASD=move, Z/X=rotate, R/F=speed, Q=quit");

    let _raw = RawModeGuard::enable()?;
    let mut teleop = KeyboardTeleop::new();
    info!("Speed: {}", teleop.speed_label());

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(POLL_INTERVAL)? {
            if let Event::Key(key) = event::read()? {
                match teleop.handle_key(&key) {
                    KeyOutcome::Quit => break,
                    KeyOutcome::SpeedChanged => info!("Speed: {}", teleop.speed_label()),
                    KeyOutcome::Moved | KeyOutcome::Ignored => {}
                }
            }
        }

        if commands.blocking_send(teleop.command()).is_err() {
            warn!("Runtime stopped, leaving keyboard teleop");
            break;
        }
    }

    Ok(())
}

/// Guides a calibration session from the terminal
pub struct TerminalOperator {
    raw: Option<RawModeGuard>,
}

impl TerminalOperator {
    pub fn new() -> Self {
        Self { raw: None }
    }
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self::new()
    }
}

fn terminal_err(e: io::Error) -> RobotError {
    RobotError::Calibration(format!("terminal error: {}", e))
}

impl CalibrationOperator for TerminalOperator {
    fn await_homing_pose(&mut self) -> Result<(), RobotError> {
        print!("Move the arm to the middle of its range of motion and press ENTER...");
        io::stdout().flush().map_err(terminal_err)?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map_err(terminal_err)?;
        println!(
            "Move every joint except wrist_roll through its entire range of motion.\n\
             Recording positions. Press ENTER to stop, Q to abort..."
        );
        Ok(())
    }

    fn ranges_recorded(
        &mut self,
        ranges: &BTreeMap<String, (i32, i32)>,
    ) -> Result<bool, RobotError> {
        if self.raw.is_none() {
            self.raw = Some(RawModeGuard::enable().map_err(terminal_err)?);
        }

        let mut out = io::stdout().lock();
        let mut line = String::new();
        for (name, (min, max)) in ranges {
            line.push_str(&format!("{}: {}..{}  ", name, min, max));
        }
        write!(out, "\r{}", line).map_err(terminal_err)?;
        out.flush().map_err(terminal_err)?;

        if !event::poll(POLL_INTERVAL).map_err(terminal_err)? {
            return Ok(false);
        }
        let Event::Key(key) = event::read().map_err(terminal_err)? else {
            return Ok(false);
        };
        if key.kind != KeyEventKind::Press {
            return Ok(false);
        }
        if quit_requested(&key) {
            self.raw = None;
            return Err(RobotError::Calibration("cancelled by operator".to_string()));
        }
        if key.code == KeyCode::Enter {
            self.raw = None;
            write!(out, "\r\n").map_err(terminal_err)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE)
    }

    #[test]
    fn test_keys_set_velocity() {
        let mut teleop = KeyboardTeleop::new();
        assert_eq!(teleop.handle_key(&press('w')), KeyOutcome::Moved);
        assert_eq!(teleop.handle_key(&press('d')), KeyOutcome::Moved);
        assert_eq!(teleop.handle_key(&press('z')), KeyOutcome::Moved);

        let cmd = teleop.command();
        assert_eq!(cmd.x_vel, SPEEDS[0]);
        assert_eq!(cmd.y_vel, -SPEEDS[0]);
        assert_eq!(cmd.theta_vel, THETA_SPEEDS[0]);
    }

    #[test]
    fn test_speed_levels_saturate() {
        let mut teleop = KeyboardTeleop::new();
        for _ in 0..5 {
            teleop.handle_key(&press('r'));
        }
        assert_eq!(teleop.speed_label(), "HIGH");
        teleop.handle_key(&press('s'));
        assert_eq!(teleop.command().x_vel, -SPEEDS[2]);

        for _ in 0..5 {
            teleop.handle_key(&press('f'));
        }
        assert_eq!(teleop.speed_label(), "LOW");
    }

    #[test]
    fn test_released_keys_stop_the_base() {
        let mut teleop = KeyboardTeleop::new();
        teleop.handle_key(&press('a'));
        teleop.last_movement_input = Instant::now() - INPUT_TIMEOUT - Duration::from_millis(10);
        assert_eq!(teleop.command(), BodyVelocity::zero());
    }

    #[test]
    fn test_quit_keys() {
        let mut teleop = KeyboardTeleop::new();
        assert_eq!(teleop.handle_key(&press('q')), KeyOutcome::Quit);
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(teleop.handle_key(&ctrl_c), KeyOutcome::Quit);
        assert_eq!(teleop.handle_key(&press('c')), KeyOutcome::Ignored);
    }
}
