use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lekiwi_control::config::MotorConfig;
use lekiwi_control::motor::{FeetechBus, Register, SimHandle};
use lekiwi_control::terminal::{self, TerminalOperator};
use lekiwi_control::{RobotConfig, RobotController, runtime};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "lekiwi-control", about = "LeKiwi robot hardware control")]
struct Cli {
    /// Robot configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Use the simulated servo chain instead of hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ping every motor and print its state (read-only)
    Diagnose,
    /// Record homing offsets and ranges of motion for the arm
    Calibrate,
    /// Drive the base from the keyboard
    Teleop,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init(); // installs the subscriber globally

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut config = match &cli.config {
        Some(path) => RobotConfig::load(path)?,
        None => RobotConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.simulate |= cli.simulate;

    match cli.command {
        Command::Diagnose => tokio::task::spawn_blocking(move || diagnose(&config)).await?,
        Command::Calibrate => tokio::task::spawn_blocking(move || calibrate(config)).await?,
        Command::Teleop => teleop(config).await,
    }
}

/// Read-only check of every configured motor: nothing is written
fn diagnose(config: &RobotConfig) -> Result<(), BoxError> {
    let bus = if config.simulate {
        let sim = SimHandle::new(&config.motor_ids());
        FeetechBus::with_transport(sim.transport(), config.read_retries)
    } else {
        println!("Opening serial port {}...", config.port);
        FeetechBus::open_with_baudrate(&config.port, config.baudrate)?
    };

    println!();
    println!("{:<22} {:>3} {:>7} {:>9} {:>9}", "motor", "id", "model", "position", "velocity");
    let mut missing = Vec::new();
    for motor in &config.motors {
        if !bus.ping(motor.id)? {
            println!("{:<22} {:>3}  not responding", motor.name, motor.id);
            missing.push(motor.name.as_str());
            continue;
        }
        print_motor(&bus, motor)?;
    }
    println!();

    bus.close();
    if missing.is_empty() {
        println!("All {} motors responding", config.motors.len());
        Ok(())
    } else {
        Err(format!("motors not responding: {}", missing.join(", ")).into())
    }
}

fn print_motor(bus: &FeetechBus, motor: &MotorConfig) -> Result<(), BoxError> {
    let model = bus.read(motor.id, Register::ModelNumber)?;
    let state = bus.read_state(&[motor.id])?;
    let (position, velocity) = state
        .get(&motor.id)
        .map(|r| (r.position, r.velocity))
        .unwrap_or_default();
    println!(
        "{:<22} {:>3} {:>7} {:>9} {:>9}",
        motor.name, motor.id, model, position, velocity
    );
    Ok(())
}

fn calibrate(config: RobotConfig) -> Result<(), BoxError> {
    let robot = RobotController::new(config)?;
    robot.connect()?;

    let mut operator = TerminalOperator::new();
    let result = robot.calibrate(&mut operator);
    if let Err(e) = robot.disconnect() {
        warn!("Disconnect failed: {}", e);
    }
    result?;

    info!(
        "Calibration saved to {}",
        robot.config().calibration_path.display()
    );
    Ok(())
}

async fn teleop(config: RobotConfig) -> Result<(), BoxError> {
    let robot = Arc::new(RobotController::new(config)?);
    {
        let robot = Arc::clone(&robot);
        tokio::task::spawn_blocking(move || robot.connect()).await??;
    }

    let (tx, rx) = mpsc::channel(16);
    let keyboard = tokio::task::spawn_blocking(move || terminal::run_keyboard(tx));

    let outcome = runtime::run(Arc::clone(&robot), rx).await;

    // The keyboard loop exits once the runtime stops receiving
    if let Err(e) = keyboard.await? {
        warn!("Keyboard teleop failed: {}", e);
    }

    let disconnect = {
        let robot = Arc::clone(&robot);
        tokio::task::spawn_blocking(move || robot.disconnect()).await?
    };
    if let Err(e) = disconnect {
        warn!("Disconnect failed: {}", e);
    }
    outcome
}
