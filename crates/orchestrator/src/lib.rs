//! Orchestration Layer
//!
//! This crate runs the snow-crystal growth simulation on top of `compute`:
//! - run configuration and medium coefficients
//! - initial fields and the seed crystal
//! - the A/B stepping loop over two GPU tensors
//! - measurement snapshots handed to a user callback
//! - the run controller and the viewer hook

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod seed;
pub mod simulation;
pub mod state;
pub mod step_pair;

pub use config::{Coefficients, Medium, SeedCrystal, SimulationConfig, SimulationParameters};
pub use controller::{FrameControl, Phase, RunSummary, Simulation, StopHandle, Viewer};
pub use state::SimulationState;

use compute::gpu::{ContextError, ProgramError, SchemaError};
use compute::TransitionError;

/// Callback receiving each downloaded timestep.
pub type MeasurementCallback = Box<dyn FnMut(&SimulationState<'_>, u64) + Send>;

/// Errors raised by the controller and the compute loop.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// `run` was called while a run is in progress.
    #[error("simulation is already running")]
    AlreadyRunning,
    /// The measurement callback cannot change during a run.
    #[error("cannot change the measurement callback while the simulation is running")]
    Running,
    /// Parameters failed validation.
    #[error("invalid simulation parameters: {0}")]
    InvalidParameters(String),
    /// Device or pool failure.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// A kernel failed to compile.
    #[error(transparent)]
    Program(#[from] ProgramError),
    /// Schema construction, submission or readback failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Volume swap protocol violation.
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// A step pair was submitted before its first schedule.
    #[error("step pair {0} submitted before being scheduled")]
    NotScheduled(&'static str),
    /// The viewer reported an error.
    #[error("viewer error: {0}")]
    Viewer(String),
    /// The compute thread could not be started.
    #[error("failed to spawn compute thread: {0}")]
    Spawn(String),
    /// The compute thread panicked.
    #[error("compute thread panicked")]
    WorkerPanicked,
}

/// Create a headless simulation from a configuration file
///
/// # Example
/// ```no_run
/// use orchestrator::create_simulation;
///
/// let (simulation, config) = create_simulation("configs/snowflake-small.json")?;
/// simulation.run(config.parameters)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_simulation(config_path: &str) -> Result<(Simulation, SimulationConfig), Box<dyn std::error::Error>> {
    tracing::info!("Creating simulation from config: {}", config_path);

    let config = SimulationConfig::load(config_path)?;
    tracing::info!(
        "Configuration loaded: {} ({}x{}x{} voxels)",
        config.name,
        config.parameters.voxel_x,
        config.parameters.voxel_y,
        config.parameters.voxel_z
    );
    if !config.headless {
        tracing::warn!("{}: no viewer attached, running headless", config.name);
    }

    let simulation = Simulation::new().log_interval(config.log_interval);
    Ok((simulation, config))
}
