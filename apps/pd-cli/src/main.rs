use clap::{Parser, Subcommand};
use pd_core::ZoneId;
use pd_heater::{
    BoardConfig, BoardFileError, ControlError, SimulatedBoard, TemperatureControl, ThermalModel,
};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "pd-cli")]
#[command(about = "PurpleDrop heater control tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a board configuration as YAML
    Board {
        /// Board YAML file to load (defaults to the built-in v4 board)
        board_path: Option<PathBuf>,
        /// Scale the v4 duty ceilings by this factor
        #[arg(long, default_value_t = 1.0)]
        output_scale: f64,
        /// Write the YAML to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a board configuration file
    Check {
        /// Path to the board YAML file
        board_path: PathBuf,
    },
    /// Run the controller against a simulated board
    Simulate {
        /// Board YAML file (defaults to the built-in v4 board)
        #[arg(long)]
        board: Option<PathBuf>,
        /// Drop temperature target in degrees C
        #[arg(long)]
        target: f64,
        /// Simulated duration in seconds
        #[arg(long, default_value_t = 600.0)]
        duration: f64,
        /// Control tick in seconds (defaults to the board's tick period)
        #[arg(long)]
        dt: Option<f64>,
        /// Ambient temperature of the simulated board
        #[arg(long, default_value_t = 20.0)]
        ambient: f64,
        /// Cooling time constant of each heater in seconds
        #[arg(long, default_value_t = 60.0)]
        plant_tau: f64,
        /// Heating rate at full duty in degrees C per second
        #[arg(long, default_value_t = 1.0)]
        heat_rate: f64,
        /// Seconds between progress lines
        #[arg(long, default_value_t = 30.0)]
        report_every: f64,
        /// Print the final controller snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    BoardFile(#[from] BoardFileError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),
}

type CliResult<T> = Result<T, CliError>;

struct SimulateArgs {
    board: Option<PathBuf>,
    target: f64,
    duration: f64,
    dt: Option<f64>,
    model: (f64, f64, f64),
    report_every: f64,
    json: bool,
}

fn main() -> CliResult<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Board {
            board_path,
            output_scale,
            output,
        } => cmd_board(board_path.as_deref(), output_scale, output.as_deref()),
        Commands::Check { board_path } => cmd_check(&board_path),
        Commands::Simulate {
            board,
            target,
            duration,
            dt,
            ambient,
            plant_tau,
            heat_rate,
            report_every,
            json,
        } => cmd_simulate(SimulateArgs {
            board,
            target,
            duration,
            dt,
            model: (ambient, plant_tau, heat_rate),
            report_every,
            json,
        }),
    }
}

fn load_board(path: Option<&Path>) -> CliResult<BoardConfig> {
    match path {
        Some(path) => Ok(BoardConfig::load_yaml(path)?),
        None => Ok(BoardConfig::v4()),
    }
}

fn cmd_board(path: Option<&Path>, output_scale: f64, output: Option<&Path>) -> CliResult<()> {
    let board = match path {
        Some(path) => BoardConfig::load_yaml(path)?,
        None => BoardConfig::v4_scaled(output_scale),
    };
    match output {
        Some(output) => {
            board.save_yaml(output)?;
            println!("✓ Wrote board '{}' to {}", board.name, output.display());
        }
        None => print!("{}", board.to_yaml_string()?),
    }
    Ok(())
}

fn cmd_check(path: &Path) -> CliResult<()> {
    println!("Validating board: {}", path.display());
    let board = BoardConfig::load_yaml(path)?;
    println!("✓ Board '{}' is valid", board.name);
    for (index, zone) in board.zones.iter().enumerate() {
        println!(
            "  {} - sensor {} -> pwm {} (kp {}, ki {}, kd {}, duty {}..{})",
            ZoneId::from_index(index),
            zone.sensor_channel,
            zone.actuator_channel,
            zone.gains.kp,
            zone.gains.ki,
            zone.gains.kd,
            zone.min_duty,
            zone.max_duty
        );
    }
    Ok(())
}

fn cmd_simulate(args: SimulateArgs) -> CliResult<()> {
    let board = load_board(args.board.as_deref())?;
    let dt = args.dt.unwrap_or(board.control.tick_period_s);
    if !(dt > 0.0) || !(args.duration > 0.0) {
        return Err(CliError::InvalidArg(
            "dt and duration must be positive".to_string(),
        ));
    }

    let (ambient, plant_tau, heat_rate) = args.model;
    let model = ThermalModel::new(ambient, plant_tau, heat_rate)?;
    let channels = board
        .zones
        .iter()
        .map(|zone| zone.sensor_channel.index().max(zone.actuator_channel.index()) + 1)
        .max()
        .unwrap_or(0);
    let plant = SimulatedBoard::new(model, channels, dt);

    let control = TemperatureControl::new(plant.clone(), board)?;
    control.set_target(args.target)?;
    info!(target_c = args.target, dt, "simulating");

    let steps = (args.duration / dt).ceil() as u64;
    let report_every = ((args.report_every / dt).round() as u64).max(1);
    println!("{:>8}  {:>8}  duties", "t [s]", "drop [C]");
    for step in 1..=steps {
        let report = control.step(dt)?;
        if step % report_every == 0 || step == steps {
            let drop_c = control
                .drop_temperature()
                .map_or_else(|_| "-".to_string(), |t| format!("{t:.2}"));
            let duties: Vec<String> = report
                .duties
                .iter()
                .map(|d| d.map_or_else(|| "hold".to_string(), |d| format!("{d:.3}")))
                .collect();
            println!(
                "{:>8.1}  {:>8}  {}",
                step as f64 * dt,
                drop_c,
                duties.join(" ")
            );
        }
    }

    let snapshot = control.snapshot();
    control.stop()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        match snapshot.drop_temperature_c {
            Some(t) => println!("✓ Drop temperature {t:.2} C (target {:.2} C)", args.target),
            None => println!("Drop temperature unavailable"),
        }
    }
    Ok(())
}
