use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::block_in_place;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use odrive_zenoh_runtime::odrive::{
    AxisId, AxisPairController, ConnectOptions, DeviceFinder, DriveGeometry, OdriveError,
    ProvisionConfig, SerialFinder, SimFinder, SimulatedOdrive, WaitPolicy,
};
use odrive_zenoh_runtime::runtime;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "odrive-zenoh-runtime", about = "Differential-drive base on a dual-axis ODrive")]
struct Cli {
    /// Serial port of the board (default: scan USB for ODrive boards)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Only accept the board with this serial number (hex)
    #[arg(long, global = true)]
    serial_number: Option<String>,

    /// Physical axis driving the right wheel
    #[arg(long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    right_axis: u8,

    /// Discovery timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    /// Use a simulated board instead of hardware
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Engage the wheels and follow twist commands from zenoh
    Run {
        /// Run the full calibration sequence first
        #[arg(long)]
        calibrate: bool,
        /// Skip the encoder index search
        #[arg(long)]
        skip_preroll: bool,
    },
    /// Run the full calibration sequence on both axes
    Calibrate,
    /// Search for the encoder index on both axes
    Preroll {
        /// Return as soon as the search is requested
        #[arg(long)]
        no_wait: bool,
    },
    /// Write and persist board configuration, then reboot the board
    Provision {
        /// JSON file overriding the default provisioning values
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print axis errors and clear them
    Errors {
        /// Do not clear the error fields
        #[arg(long)]
        keep: bool,
    },
    /// Spin both wheels at a fixed velocity (counts/s) for a while
    Drive {
        #[arg(long, allow_hyphen_values = true)]
        left: f32,
        #[arg(long, allow_hyphen_values = true)]
        right: f32,
        #[arg(long, default_value_t = 1000)]
        duration_ms: u64,
    },
    /// Move both wheels to absolute positions (counts)
    DrivePos {
        #[arg(long, allow_hyphen_values = true)]
        left: f32,
        #[arg(long, allow_hyphen_values = true)]
        right: f32,
    },
    /// Print axis mapping and states
    Status,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init(); // installs the subscriber globally

    let cli = Cli::parse();

    let result = if cli.sim {
        info!("Using simulated ODrive");
        let controller = AxisPairController::new(SimFinder::new(SimulatedOdrive::new()))
            .with_wait_policy(WaitPolicy::immediate());
        execute(&cli, controller).await
    } else {
        execute(&cli, AxisPairController::new(SerialFinder::default())).await
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn execute<F: DeviceFinder>(
    cli: &Cli,
    mut controller: AxisPairController<F>,
) -> Result<(), BoxError> {
    let options = ConnectOptions {
        port: cli.port.clone(),
        right_axis: AxisId::from_index(cli.right_axis).unwrap_or(AxisId::Axis0),
        timeout: Duration::from_secs(cli.timeout),
        serial_number: cli.serial_number.clone(),
    };
    block_in_place(|| controller.connect(&options))?;

    match &cli.command {
        Command::Run {
            calibrate,
            skip_preroll,
        } => {
            if *calibrate {
                block_in_place(|| controller.calibrate())?;
            }
            if !*skip_preroll {
                block_in_place(|| controller.preroll(true))?;
            }
            block_in_place(|| controller.engage())?;
            let geometry = DriveGeometry::new(controller.encoder_cpr());
            runtime::run(&mut controller, geometry).await?;
        }
        Command::Calibrate => block_in_place(|| controller.calibrate())?,
        Command::Preroll { no_wait } => block_in_place(|| controller.preroll(!*no_wait))?,
        Command::Provision { config } => {
            let config = match config {
                Some(path) => ProvisionConfig::from_json(&std::fs::read_to_string(path)?)?,
                None => ProvisionConfig::default(),
            };
            block_in_place(|| controller.provision(&config))?;
        }
        Command::Errors { keep } => match block_in_place(|| controller.get_errors(!*keep))? {
            Some(errors) => println!("{}", errors),
            None => println!("No axis errors"),
        },
        Command::Drive {
            left,
            right,
            duration_ms,
        } => {
            block_in_place(|| {
                controller.engage()?;
                controller.drive(*left, *right)
            })?;
            tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
            block_in_place(|| controller.drive(0.0, 0.0))?;
        }
        Command::DrivePos { left, right } => {
            block_in_place(|| controller.drive_pos(*left, *right))?
        }
        Command::Status => {
            if let Some(axes) = controller.axes() {
                println!("Left wheel:  {}", axes.left);
                println!("Right wheel: {}", axes.right);
            }
            println!("Encoder CPR: {}", controller.encoder_cpr());
            let (idle, engaged, prerolling) = block_in_place(|| {
                Ok::<_, OdriveError>((
                    controller.idle()?,
                    controller.engaged()?,
                    controller.prerolling()?,
                ))
            })?;
            println!("Idle:        {}", idle);
            println!("Engaged:     {}", engaged);
            println!("Prerolling:  {}", prerolling);
        }
    }

    // Provisioning reboots the board and ends the session itself
    if controller.is_connected() {
        block_in_place(|| controller.disconnect())?;
    }
    Ok(())
}
