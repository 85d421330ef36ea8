//! Simulation controller with lifecycle management
//!
//! [`Simulation::run`] blocks the caller for the whole run. The compute loop
//! runs on a background thread; with a [`Viewer`] attached the calling thread
//! drives the viewer's frames, otherwise it just joins the compute thread.
//! [`Simulation::stop`] (or a [`StopHandle`] held by the measurement
//! callback) ends the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use compute::gpu::{Context, ContextOptions, FieldBufferSet};
use parking_lot::Mutex;

use crate::config::SimulationParameters;
use crate::simulation::{run_compute, ComputeRun};
use crate::state::SimulationState;
use crate::{MeasurementCallback, SimulationError};

/// Default timesteps between progress log lines.
pub const DEFAULT_LOG_INTERVAL: u64 = 100;

/// What the viewer wants after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameControl {
    /// Keep going.
    Continue,
    /// The viewer was closed; stop the run.
    Quit,
}

/// Presents the render-sample volume while a run is in progress.
///
/// All methods are called on the thread that called [`Simulation::run`].
pub trait Viewer: Send {
    /// Called once per run before the compute thread starts.
    fn attach(&mut self, context: &Arc<Context>, volumes: &Arc<FieldBufferSet>) -> Result<(), String>;

    /// Draw one frame from `volumes.read_bind_group()`.
    fn frame(&mut self, volumes: &FieldBufferSet) -> Result<FrameControl, String>;

    /// Called once per run after the compute thread has exited.
    fn detach(&mut self) {}

    /// Frames that may still reference the previous read slot after a swap.
    fn frames_in_flight(&self) -> u32 {
        3
    }
}

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No run in progress
    Idle,
    /// `run` is executing
    Running,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// Timesteps computed and measured
    pub timesteps: u64,
    /// Wall time of the run
    pub elapsed: Duration,
}

struct ControlState {
    phase: Phase,
    parameters: Option<Arc<SimulationParameters>>,
    measurement: Option<MeasurementCallback>,
}

/// Shared between the controller, its stop handles and the compute thread
struct Shared {
    control: Mutex<ControlState>,
    stop: AtomicBool,
}

impl Shared {
    fn request_stop(&self) -> bool {
        let control = self.control.lock();
        if control.phase != Phase::Running {
            tracing::warn!("stop requested while no simulation is running");
            return false;
        }
        self.stop.store(true, Ordering::Release);
        tracing::info!("stop requested");
        true
    }
}

/// Stops the run of the [`Simulation`] it was taken from.
///
/// Does not keep the simulation alive.
#[derive(Clone)]
pub struct StopHandle(Weak<Shared>);

impl StopHandle {
    /// Request a stop. Returns `false` if no run is in progress.
    pub fn stop(&self) -> bool {
        self.0.upgrade().is_some_and(|shared| shared.request_stop())
    }
}

/// Handle for running and controlling the simulation
pub struct Simulation {
    shared: Arc<Shared>,
    viewer: Mutex<Option<Box<dyn Viewer>>>,
    log_interval: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    /// A headless simulation.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(ControlState {
                    phase: Phase::Idle,
                    parameters: None,
                    measurement: None,
                }),
                stop: AtomicBool::new(false),
            }),
            viewer: Mutex::new(None),
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }

    /// A simulation that renders into volume slots presented by `viewer`.
    pub fn with_viewer(viewer: Box<dyn Viewer>) -> Self {
        let simulation = Self::new();
        *simulation.viewer.lock() = Some(viewer);
        simulation
    }

    /// Set the timesteps between progress log lines.
    pub fn log_interval(mut self, interval: u64) -> Self {
        self.log_interval = interval.max(1);
        self
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.shared.control.lock().phase
    }

    /// Whether `run` is executing
    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Parameters of the current or most recent run
    pub fn parameters(&self) -> Option<Arc<SimulationParameters>> {
        self.shared.control.lock().parameters.clone()
    }

    /// A handle that can stop runs from anywhere, including the measurement
    /// callback.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::downgrade(&self.shared))
    }

    /// Request the running simulation to stop. Returns `false` if idle.
    pub fn stop(&self) -> bool {
        self.shared.request_stop()
    }

    /// Register the callback invoked with every downloaded timestep of the
    /// next run, replacing any previous registration. The callback is
    /// released when that run ends.
    pub fn measurement<F>(&self, callback: F) -> Result<(), SimulationError>
    where
        F: FnMut(&SimulationState<'_>, u64) + Send + 'static,
    {
        let mut control = self.shared.control.lock();
        if control.phase == Phase::Running {
            tracing::warn!("measurement callback change rejected: simulation is running");
            return Err(SimulationError::Running);
        }
        control.measurement = Some(Box::new(callback));
        Ok(())
    }

    /// Run until stopped. Blocks the calling thread.
    pub fn run(&self, parameters: SimulationParameters) -> Result<RunSummary, SimulationError> {
        let (parameters, measurement) = {
            let mut control = self.shared.control.lock();
            if control.phase == Phase::Running {
                tracing::warn!("run rejected: simulation is already running");
                return Err(SimulationError::AlreadyRunning);
            }
            parameters.validate().map_err(SimulationError::InvalidParameters)?;

            let parameters = Arc::new(parameters);
            self.shared.stop.store(false, Ordering::Release);
            control.phase = Phase::Running;
            control.parameters = Some(Arc::clone(&parameters));
            (parameters, control.measurement.take())
        };

        tracing::info!(
            "Starting simulation on a {}x{}x{} grid",
            parameters.voxel_x,
            parameters.voxel_y,
            parameters.voxel_z
        );
        let start = Instant::now();
        let result = self.execute(parameters, measurement);

        {
            let mut control = self.shared.control.lock();
            control.phase = Phase::Idle;
            self.shared.stop.store(false, Ordering::Release);
        }

        match result {
            Ok(timesteps) => {
                let summary = RunSummary {
                    timesteps,
                    elapsed: start.elapsed(),
                };
                tracing::info!(
                    "Simulation finished: {} timesteps in {:.2}s",
                    summary.timesteps,
                    summary.elapsed.as_secs_f64()
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!("Simulation failed: {}", e);
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        parameters: Arc<SimulationParameters>,
        measurement: Option<MeasurementCallback>,
    ) -> Result<u64, SimulationError> {
        let context = Arc::new(Context::new(&ContextOptions::default())?);
        let mut viewer = self.viewer.lock();

        let volumes = match viewer.as_mut() {
            Some(viewer) => {
                let volumes = Arc::new(FieldBufferSet::new(&context, parameters.extent()));
                viewer.attach(&context, &volumes).map_err(SimulationError::Viewer)?;
                Some(volumes)
            }
            None => None,
        };

        let run = ComputeRun {
            context,
            parameters,
            volumes: volumes.clone(),
            log_interval: self.log_interval,
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("simulation-compute".into())
            .spawn(move || {
                let mut measurement = measurement;
                let result = run_compute(&run, &shared.stop, &mut measurement);
                if result.is_err() {
                    shared.stop.store(true, Ordering::Release);
                }
                result
            })
            .map_err(|e| SimulationError::Spawn(e.to_string()))?;

        let frames = match (viewer.as_mut(), volumes.as_deref()) {
            (Some(viewer), Some(volumes)) => {
                let frames = drive_viewer(&mut **viewer, volumes, &handle, &self.shared.stop);
                if frames.is_err() {
                    self.shared.stop.store(true, Ordering::Release);
                }
                viewer.detach();
                frames
            }
            _ => Ok(()),
        };

        let timesteps = handle.join().map_err(|_| SimulationError::WorkerPanicked)??;
        frames?;
        Ok(timesteps)
    }
}

/// Reader side of the volume swap plus the viewer's frame loop.
fn drive_viewer(
    viewer: &mut dyn Viewer,
    volumes: &FieldBufferSet,
    compute: &thread::JoinHandle<Result<u64, SimulationError>>,
    stop: &AtomicBool,
) -> Result<(), SimulationError> {
    let drain = viewer.frames_in_flight().max(1);
    let mut countdown = 0u32;

    while !compute.is_finished() {
        if countdown == 0 {
            if volumes.try_transition_to_read_new() {
                countdown = drain;
            }
        } else {
            countdown -= 1;
            if countdown == 0 {
                volumes.complete_transition_to_read_new()?;
            }
        }

        match viewer.frame(volumes).map_err(SimulationError::Viewer)? {
            FrameControl::Continue => {}
            FrameControl::Quit => {
                tracing::info!("viewer closed");
                stop.store(true, Ordering::Release);
                break;
            }
        }
    }
    Ok(())
}
