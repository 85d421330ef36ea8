//! The compute loop.
//!
//! Two [`StepPair`]s ping-pong the solver fields between `tensor_0` and
//! `tensor_1`. Each pair's chain is submitted after the other's, so the GPU
//! always has the next step queued while the host measures the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use compute::gpu::{Context, FieldBufferSet, Program, ProgramDescriptor, SharedTensor, TensorBinding};
use compute::TripleBuffer;

use crate::config::SimulationParameters;
use crate::seed::seed_fields;
use crate::state::{SimulationState, SOLVER_FIELD_COUNT};
use crate::step_pair::{StepPair, StepPairResources};
use crate::{MeasurementCallback, SimulationError};

/// Loop iterations between a successful writer transition and its completion.
pub const WRITE_DRAIN_CYCLES: u32 = 2;

const SOLVER_WGSL: &str = concat!(
    include_str!("shaders/constants.wgsl"),
    "\n",
    include_str!("shaders/solver_substep.wgsl")
);

const SAMPLE_WGSL: &str = concat!(
    include_str!("shaders/constants.wgsl"),
    "\n",
    include_str!("shaders/sample_occupancy.wgsl")
);

/// Everything the compute thread needs for one run.
pub(crate) struct ComputeRun {
    pub context: Arc<Context>,
    pub parameters: Arc<SimulationParameters>,
    pub volumes: Option<Arc<FieldBufferSet>>,
    pub log_interval: u64,
}

/// Writer side of the volume swap. Advanced once per loop iteration.
#[derive(Default)]
struct WriterSwap {
    countdown: u32,
}

impl WriterSwap {
    fn advance(&mut self, swap: Option<&TripleBuffer>) -> Result<(), SimulationError> {
        let Some(swap) = swap else {
            return Ok(());
        };
        if self.countdown == 0 {
            if swap.try_transition_to_write_new() {
                self.countdown = WRITE_DRAIN_CYCLES;
            }
        } else {
            self.countdown -= 1;
            if self.countdown == 0 {
                swap.complete_transition_to_write_new()?;
            }
        }
        Ok(())
    }
}

/// Run until `stop` is raised. Returns the number of timesteps whose results
/// were measured.
pub(crate) fn run_compute(
    run: &ComputeRun,
    stop: &AtomicBool,
    measurement: &mut Option<MeasurementCallback>,
) -> Result<u64, SimulationError> {
    let context = run.context.as_ref();
    let params = run.parameters.as_ref();
    let volumes = run.volumes.as_deref();

    let elements = SOLVER_FIELD_COUNT * params.voxel_count();
    let bytes = (elements * std::mem::size_of::<f32>()) as u64;
    context.dryrun_shared_tensor(bytes)?;
    context.dryrun_shared_tensor(bytes)?;
    context.allocate_pools()?;
    let (device_bytes, host_bytes) = context.pool_totals();
    tracing::info!(
        "Allocated pools: {} bytes device-local, {} bytes host-visible for {} voxels",
        device_bytes,
        host_bytes,
        params.voxel_count()
    );

    let tensor_0 = context.shared_tensor::<f32>("tensor_0", elements)?;
    let tensor_1 = context.shared_tensor::<f32>("tensor_1", elements)?;
    seed_fields(params, &mut tensor_0.data_mut());

    let mut pair_a = build_pair(context, "a", params, &tensor_0, &tensor_1, volumes)?;
    let mut pair_b = build_pair(context, "b", params, &tensor_1, &tensor_0, volumes)?;

    let result = step_loop(run, stop, measurement, &mut pair_a, &mut pair_b);

    // Drain both chains before the tensors go away, even on error.
    let drained = pair_a.wait().and(pair_b.wait());
    let timesteps = result?;
    drained?;
    Ok(timesteps)
}

fn step_loop(
    run: &ComputeRun,
    stop: &AtomicBool,
    measurement: &mut Option<MeasurementCallback>,
    pair_a: &mut StepPair,
    pair_b: &mut StepPair,
) -> Result<u64, SimulationError> {
    let context = run.context.as_ref();
    let params = run.parameters.as_ref();
    let volumes = run.volumes.as_deref();
    let mut swap = WriterSwap::default();

    let start = Instant::now();
    let mut timestep = 0u64;

    pair_a.submit(true, true, None)?;
    pair_b.submit(false, true, pair_a.last_schema())?;

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        pair_a.wait()?;
        measure(pair_a, params, measurement, timestep);
        log_progress(timestep, run.log_interval, start);
        timestep += 1;
        swap.advance(volumes.map(FieldBufferSet::swap))?;
        pair_a.schedule(context, volumes)?;
        pair_a.submit(false, true, pair_b.last_schema())?;

        if stop.load(Ordering::Acquire) {
            break;
        }
        pair_b.wait()?;
        measure(pair_b, params, measurement, timestep);
        log_progress(timestep, run.log_interval, start);
        timestep += 1;
        pair_b.schedule(context, volumes)?;
        pair_b.submit(false, true, pair_a.last_schema())?;
    }

    tracing::info!(
        "Compute loop exiting: {} timesteps in {:.2}s",
        timestep,
        start.elapsed().as_secs_f64()
    );
    Ok(timestep)
}

fn measure(pair: &StepPair, params: &SimulationParameters, measurement: &mut Option<MeasurementCallback>, time: u64) {
    if let Some(callback) = measurement.as_mut() {
        let fields = pair.destination().data();
        let state = SimulationState::new(&fields, params);
        callback(&state, time);
    }
}

fn log_progress(timestep: u64, interval: u64, start: Instant) {
    if interval > 0 && timestep % interval == 0 {
        let elapsed = start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { (timestep + 1) as f64 / elapsed } else { 0.0 };
        tracing::debug!("Step {}: {:.1} steps/s", timestep, rate);
    }
}

fn build_pair(
    context: &Context,
    label: &'static str,
    params: &SimulationParameters,
    source: &Arc<SharedTensor<f32>>,
    destination: &Arc<SharedTensor<f32>>,
    volumes: Option<&FieldBufferSet>,
) -> Result<StepPair, SimulationError> {
    let specialization = params.specialization_constants();

    let step_parameters = context.parameter_set(
        &format!("{label}_step"),
        vec![source.clone() as Arc<dyn TensorBinding>, destination.clone()],
    );
    let render_parameters =
        context.parameter_set(&format!("{label}_render"), vec![destination.clone() as Arc<dyn TensorBinding>]);

    let step_program: Arc<Program> = context.program(&ProgramDescriptor {
        label: "solver_substep",
        wgsl: SOLVER_WGSL,
        entry_point: "main",
        specialization: &specialization,
        push_constants: &[],
        parameters: &step_parameters,
        secondary_layout: None,
    })?;

    let render_program = match volumes {
        Some(volumes) => Some(context.program(&ProgramDescriptor {
            label: "sample_occupancy",
            wgsl: SAMPLE_WGSL,
            entry_point: "main",
            specialization: &specialization,
            push_constants: &[],
            parameters: &render_parameters,
            secondary_layout: Some(volumes.write_layout()),
        })?),
        None => None,
    };

    StepPair::new(
        context,
        label,
        params,
        StepPairResources {
            source: source.clone(),
            destination: destination.clone(),
            step_parameters,
            render_parameters,
            step_program,
            render_program,
        },
        volumes,
    )
}

#[cfg(test)]
mod tests {
    use compute::SwapPhase;

    use super::*;

    /// Let the reader take the pending slot so the writer may move.
    fn reader_catches_up(swap: &TripleBuffer) {
        assert!(swap.try_transition_to_read_new());
        swap.complete_transition_to_read_new().unwrap();
        assert_eq!(swap.snapshot().distance(), 1);
    }

    #[test]
    fn test_writer_completes_after_drain_cycles() {
        let swap = TripleBuffer::new();
        let mut writer = WriterSwap::default();

        // The reader has not caught up yet.
        writer.advance(Some(&swap)).unwrap();
        assert_eq!(swap.snapshot().phase(), SwapPhase::General);
        assert_eq!(writer.countdown, 0);

        reader_catches_up(&swap);
        let before = swap.snapshot().write_idx();
        writer.advance(Some(&swap)).unwrap();
        let started = swap.snapshot();
        assert_eq!(started.phase(), SwapPhase::WritingNew);
        assert_eq!(started.write_idx(), (before + 1) % 3);

        for _ in 1..WRITE_DRAIN_CYCLES {
            writer.advance(Some(&swap)).unwrap();
            assert_eq!(swap.snapshot().phase(), SwapPhase::WritingNew);
            assert!(!swap.try_transition_to_read_new());
        }
        writer.advance(Some(&swap)).unwrap();
        let done = swap.snapshot();
        assert_eq!(done.phase(), SwapPhase::General);
        assert_eq!(done.distance(), 2);
        assert_eq!(writer.countdown, 0);
    }

    #[test]
    fn test_writer_cycles_with_reader() {
        let swap = TripleBuffer::new();
        let mut writer = WriterSwap::default();
        let mut writes = 0;

        for _ in 0..30 {
            if swap.try_transition_to_read_new() {
                swap.complete_transition_to_read_new().unwrap();
            }
            let phase = swap.snapshot().phase();
            writer.advance(Some(&swap)).unwrap();
            if phase == SwapPhase::WritingNew && swap.snapshot().phase() == SwapPhase::General {
                writes += 1;
            }
            assert!(matches!(swap.snapshot().distance(), 1 | 2));
        }
        assert!(writes >= 5);
    }

    #[test]
    fn test_headless_writer_is_a_no_op() {
        let mut writer = WriterSwap::default();
        for _ in 0..5 {
            writer.advance(None).unwrap();
        }
        assert_eq!(writer.countdown, 0);
    }
}
