//! Headless snow-crystal runner
//!
//! Loads a run configuration, steps the simulation and logs crystal growth
//! until the configured number of timesteps is reached.

use std::process::ExitCode;

use clap::Parser;
use orchestrator::create_simulation;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Snow-crystal growth simulation runner
#[derive(Parser)]
#[command(name = "runner")]
#[command(about = "Run the snow-crystal simulation headless", long_about = None)]
struct Cli {
    /// Path to the JSON run configuration
    #[arg(short, long, default_value = "configs/snowflake-small.json")]
    config: String,

    /// Stop after this many timesteps (overrides max_timesteps)
    #[arg(short, long)]
    steps: Option<u64>,

    /// Timesteps between progress log lines (overrides log_interval)
    #[arg(short, long)]
    log_interval: Option<u64>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runner=info,orchestrator=info,compute=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (mut simulation, mut config) = match create_simulation(&cli.config) {
        Ok(created) => created,
        Err(e) => {
            tracing::error!("Failed to create simulation: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(interval) = cli.log_interval {
        config.log_interval = interval.max(1);
        simulation = simulation.log_interval(config.log_interval);
    }
    if cli.steps.is_some() {
        config.max_timesteps = cli.steps;
    }

    let max_timesteps = config.max_timesteps;
    let log_interval = config.log_interval;
    let stop = simulation.stop_handle();
    let registered = simulation.measurement(move |state, time| {
        if time % log_interval == 0 {
            tracing::info!(
                "t={}: centre occupancy {:.2}, {} frozen voxels, total mass {:.3}",
                time,
                state.occupancy(0.0, 0.0, 0.0),
                state.frozen_count(),
                state.total_mass()
            );
        }
        if max_timesteps.is_some_and(|max| time + 1 >= max) {
            stop.stop();
        }
    });
    if let Err(e) = registered {
        tracing::error!("{}", e);
        return ExitCode::FAILURE;
    }

    match max_timesteps {
        Some(max) => tracing::info!("Running {} for {} timesteps", config.name, max),
        None => tracing::info!("Running {} until interrupted", config.name),
    }

    match simulation.run(config.parameters) {
        Ok(summary) => {
            tracing::info!(
                "{}: {} timesteps in {:.2}s",
                config.name,
                summary.timesteps,
                summary.elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Simulation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
