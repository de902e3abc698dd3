//! CLI entry point for the beamline positioner.
//!
//! Runs the positioning core against simulated devices:
//! - `check` validates a configuration and lists its stages (`--print`
//!   dumps the effective configuration)
//! - `move` moves the patient by (or to) a pose
//! - `image` runs an imaging acquisition
//! - `treat` delivers a treatment over evenly spaced ports
//!
//! # Usage
//!
//! ```bash
//! beamline_positioner --config config/beamline.toml move --tx 5 --rz 10
//! beamline_positioner image --angles 0,90 --z-start -10 --z-stop 10 --comment "setup"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use beamline_positioner::config::BeamlineConfig;
use beamline_positioner::hardware::mock::{
    MemoryImageStore, MockMode, SimulatedDevices, StaticAlignment,
};
use beamline_positioner::motion::{Dof, MoveMode, Pose};
use beamline_positioner::system::{PositioningSystem, SystemEvent};
use beamline_positioner::tracing_setup::{self, OutputFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "beamline_positioner")]
#[command(about = "Patient positioning and workflow sequencing core", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = beamline_positioner::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Simulate device timing instead of completing moves instantly
    #[arg(long)]
    realistic: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and list stages
    Check {
        /// Print the effective configuration (file plus environment) as TOML
        #[arg(long)]
        print: bool,
    },

    /// Move the patient
    Move {
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        tx: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        ty: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        tz: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        rx: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        ry: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        rz: f64,
        /// Treat the pose as absolute instead of relative
        #[arg(long)]
        absolute: bool,
    },

    /// Acquire an imaging set
    Image {
        /// Imaging angles in degrees
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_value = "0")]
        angles: Vec<f64>,
        /// Scan start, mm
        #[arg(long, allow_hyphen_values = true)]
        z_start: f64,
        /// Scan stop, mm
        #[arg(long, allow_hyphen_values = true)]
        z_stop: f64,
        /// Comment stored with the image set
        #[arg(long, default_value = "")]
        comment: String,
    },

    /// Deliver a treatment over evenly spaced rotation ports
    Treat {
        /// Number of ports
        #[arg(long, default_value_t = 1)]
        ports: usize,
        /// Scan half-length, mm
        #[arg(long, default_value_t = 5.0)]
        half_range: f64,
        /// Scan speed, mm/s
        #[arg(long, default_value_t = 5.0)]
        speed: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BeamlineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let format: OutputFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Commands::Check { print } = cli.command {
        return check(&config, print);
    }

    let mode = if cli.realistic {
        MockMode::Realistic
    } else {
        MockMode::Instant
    };
    let system = PositioningSystem::build(
        config,
        Arc::new(SimulatedDevices::new(mode)),
        Arc::new(MemoryImageStore::default()),
        Arc::new(StaticAlignment::new(Pose::ZERO)),
    )
    .await?;
    let logger = tokio::spawn(log_events(system.clone()));

    match cli.command {
        Commands::Check { .. } => {}
        Commands::Move {
            tx,
            ty,
            tz,
            rx,
            ry,
            rz,
            absolute,
        } => {
            let mode = if absolute {
                MoveMode::Absolute
            } else {
                MoveMode::Relative
            };
            let pose = Pose::new(tx, ty, tz, rx, ry, rz);
            let mut events = system.subscribe();
            let chain_move = system.move_patient(pose, mode).await?;
            while let Ok(event) = events.recv().await {
                if matches!(event, SystemEvent::MoveFinished(id) if id == chain_move.id) {
                    break;
                }
            }
            tracing::info!("Stage at {}", system.chain().position().await);
        }
        Commands::Image {
            angles,
            z_start,
            z_stop,
            comment,
        } => {
            system
                .acquire_images(angles, (z_start, z_stop), comment)
                .await?
                .wait()
                .await?;
        }
        Commands::Treat {
            ports,
            half_range,
            speed,
        } => {
            let step = 360.0 / ports.max(1) as f64;
            let offsets = (0..ports)
                .map(|i| Pose::single(Dof::Rz, step * i as f64))
                .collect();
            system
                .deliver_treatment(
                    offsets,
                    vec![(-half_range, half_range); ports],
                    vec![speed; ports],
                )
                .await?
                .wait()
                .await?;
        }
    }

    // Let the logger drain the last events
    tokio::time::sleep(Duration::from_millis(50)).await;
    logger.abort();
    Ok(())
}

fn check(config: &BeamlineConfig, print: bool) -> Result<()> {
    if print {
        println!("{}", toml::to_string_pretty(config).context("serializing configuration")?);
    }
    println!("Configuration OK: {}", config.application.name);
    for stage in &config.stages {
        let marker = if stage.name == config.active_stage { "*" } else { " " };
        println!("{} {} ({} axes)", marker, stage.name, stage.axes.len());
        for axis in &stage.axes {
            println!(
                "    {:<8} {:<3} order {:<2} limits [{}, {}]",
                axis.name, axis.dof, axis.order, axis.lower(), axis.upper()
            );
        }
    }
    Ok(())
}

async fn log_events(system: PositioningSystem) {
    let mut events = system.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SystemEvent::Connected(connected) => tracing::info!(connected, "Connection changed"),
            SystemEvent::NewMove(id) => tracing::info!(move_id = %id, "Move started"),
            SystemEvent::MoveFinished(id) => tracing::info!(move_id = %id, "Move finished"),
            SystemEvent::WorkflowFinished => tracing::info!("Workflow finished"),
            SystemEvent::DisplayMessage(text) => tracing::info!(message = %text, "Operator message"),
            SystemEvent::Status(status) => tracing::debug!(?status, "Status"),
        }
    }
}
