//! Steps, schemas and completion fences.
//!
//! A [`SchemaBuilder`] collects [`Step`]s; [`SchemaBuilder::make`] validates
//! them into a submittable [`Schema`]. Every submission encodes the steps into
//! a fresh command buffer, enqueues it under the queue mutex and arms the
//! schema's fence. [`Schema::wait_for_completion`] blocks until the fence
//! fires, then refreshes the host mirrors of the schema's downloads.
//!
//! All schemas of a context share one queue, which executes submissions in
//! order. A dependency therefore only has to be submitted before its
//! dependent, and `submit_after` checks exactly that.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::program::{ParameterSet, Program};
use super::tensor::TensorBinding;
use super::{Context, SubmitQueue};
use crate::constants::{push_constant_bytes, Constant};

/// Bound on each fence wait before the device is polled again.
pub const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors raised while building or submitting a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A transfer step names a tensor without host staging.
    #[error("schema {schema}: step {step} transfers a tensor without staging")]
    NotStaged {
        /// Schema label.
        schema: String,
        /// Step index.
        step: usize,
    },
    /// A Work step's parameter set does not match its program.
    #[error("schema {schema}: program {program} expects {expected} bindings, parameter set has {found}")]
    BindingCountMismatch {
        /// Schema label.
        schema: String,
        /// Program label.
        program: String,
        /// Bindings the program was built for.
        expected: usize,
        /// Bindings in the parameter set.
        found: usize,
    },
    /// A Work step's push constants do not match its program.
    #[error("schema {schema}: program {program} expects {expected} push constant bytes, got {found}")]
    PushConstantSizeMismatch {
        /// Schema label.
        schema: String,
        /// Program label.
        program: String,
        /// Bytes the program was built for.
        expected: u32,
        /// Bytes supplied.
        found: u32,
    },
    /// A Work step's secondary bind group does not match its program.
    #[error("schema {schema}: program {program} secondary bind group expected: {expected}")]
    SecondaryMismatch {
        /// Schema label.
        schema: String,
        /// Program label.
        program: String,
        /// Whether the program has a group 1 layout.
        expected: bool,
    },
    /// The dependency has never been submitted.
    #[error("schema {schema} depends on {dependency}, which was never submitted")]
    DependencyNotSubmitted {
        /// Schema label.
        schema: String,
        /// Dependency label.
        dependency: String,
    },
    /// The dependency belongs to another context.
    #[error("schema {schema} depends on {dependency} from a different queue")]
    ForeignQueue {
        /// Schema label.
        schema: String,
        /// Dependency label.
        dependency: String,
    },
    /// Mapping a readback buffer failed.
    #[error("schema {schema}: readback failed: {message}")]
    Readback {
        /// Schema label.
        schema: String,
        /// Error reported by the mapping.
        message: String,
    },
}

/// One dispatch of a program over a parameter set.
#[derive(Clone)]
pub struct Work {
    program: Arc<Program>,
    parameters: Arc<ParameterSet>,
    secondary: Option<Arc<wgpu::BindGroup>>,
    push_constants: Vec<u8>,
    workgroups: [u32; 3],
}

impl Work {
    /// A single-workgroup dispatch with no push constants.
    pub fn new(program: Arc<Program>, parameters: Arc<ParameterSet>) -> Self {
        Self {
            program,
            parameters,
            secondary: None,
            push_constants: Vec::new(),
            workgroups: [1, 1, 1],
        }
    }

    /// Workgroup grid; zero dimensions are clamped to 1.
    pub fn workgroups(mut self, x: u32, y: u32, z: u32) -> Self {
        self.workgroups = [x.max(1), y.max(1), z.max(1)];
        self
    }

    /// Push constant values for this dispatch.
    pub fn push_constants(mut self, values: &[Constant]) -> Self {
        self.push_constants = push_constant_bytes(values);
        self
    }

    /// Bind group 1 for this dispatch.
    pub fn secondary(mut self, bind_group: Arc<wgpu::BindGroup>) -> Self {
        self.secondary = Some(bind_group);
        self
    }

    /// Dispatch size.
    pub fn workgroup_count(&self) -> [u32; 3] {
        self.workgroups
    }

    fn validate(&self, schema: &str) -> Result<(), SchemaError> {
        let program = &self.program;
        if program.binding_count() != self.parameters.len() {
            return Err(SchemaError::BindingCountMismatch {
                schema: schema.to_owned(),
                program: program.label().to_owned(),
                expected: program.binding_count(),
                found: self.parameters.len(),
            });
        }
        if program.push_constant_size() != self.push_constants.len() as u32 {
            return Err(SchemaError::PushConstantSizeMismatch {
                schema: schema.to_owned(),
                program: program.label().to_owned(),
                expected: program.push_constant_size(),
                found: self.push_constants.len() as u32,
            });
        }
        if program.has_secondary() != self.secondary.is_some() {
            return Err(SchemaError::SecondaryMismatch {
                schema: schema.to_owned(),
                program: program.label().to_owned(),
                expected: program.has_secondary(),
            });
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(self.program.label()),
            timestamp_writes: None,
        });
        pass.set_pipeline(self.program.pipeline());
        pass.set_bind_group(0, self.parameters.bind_group(), &[]);
        if let Some(secondary) = &self.secondary {
            pass.set_bind_group(1, secondary.as_ref(), &[]);
        }
        if !self.push_constants.is_empty() {
            pass.set_push_constants(0, &self.push_constants);
        }
        let [x, y, z] = self.workgroups;
        pass.dispatch_workgroups(x, y, z);
    }
}

/// One recordable GPU operation.
#[derive(Clone)]
pub enum Step {
    /// Copy each tensor's host staging to its device range.
    Upload(Vec<Arc<dyn TensorBinding>>),
    /// Copy each tensor's device range to its host staging.
    Download(Vec<Arc<dyn TensorBinding>>),
    /// Dispatch a program.
    Work(Work),
}

impl From<Work> for Step {
    fn from(work: Work) -> Self {
        Step::Work(work)
    }
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FenceState {
    /// Bumped on every submission.
    generation: u64,
    /// Highest generation whose work has finished.
    completed: u64,
    /// Highest generation whose downloads were copied to the host.
    refreshed: u64,
    submission: Option<wgpu::SubmissionIndex>,
}

#[derive(Default)]
struct Fence {
    state: Mutex<FenceState>,
    signal: Condvar,
}

impl Fence {
    /// Arm for a new submission. Called under the queue lock.
    fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.generation
    }

    fn submitted(&self, index: wgpu::SubmissionIndex) {
        self.state.lock().submission = Some(index);
    }

    fn signal(&self, generation: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(generation);
        self.signal.notify_all();
    }

    fn was_submitted(&self) -> bool {
        self.state.lock().generation > 0
    }

    /// `(generation, submission)` of the latest submission, if any.
    fn latest(&self) -> Option<(u64, wgpu::SubmissionIndex)> {
        let state = self.state.lock();
        state.submission.clone().map(|index| (state.generation, index))
    }

    /// Wait up to `timeout` for `generation` to complete.
    fn wait(&self, generation: u64, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.completed < generation {
            let _ = self.signal.wait_for(&mut state, timeout);
        }
        state.completed >= generation
    }

    fn is_signalled(&self, generation: u64) -> bool {
        self.state.lock().completed >= generation
    }

    /// Mark `generation` refreshed; false if it already was.
    fn claim_refresh(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.refreshed >= generation {
            return false;
        }
        state.refreshed = generation;
        true
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

struct SchemaCore {
    label: String,
    device: Arc<wgpu::Device>,
    queue: Arc<SubmitQueue>,
    fence: Arc<Fence>,
}

/// A schema being assembled. Cannot be submitted until [`make`](Self::make).
pub struct SchemaBuilder {
    core: SchemaCore,
    steps: Vec<Step>,
}

impl SchemaBuilder {
    pub(crate) fn new(context: &Context, label: &str) -> Self {
        Self {
            core: SchemaCore {
                label: label.to_owned(),
                device: Arc::clone(context.shared_device()),
                queue: Arc::clone(context.submit_queue()),
                fence: Arc::new(Fence::default()),
            },
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn add(&mut self, step: impl Into<Step>) -> &mut Self {
        self.steps.push(step.into());
        self
    }

    /// Discard all steps.
    pub fn clear(&mut self) -> &mut Self {
        self.steps.clear();
        self
    }

    /// Number of steps recorded so far.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps are recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Validate the steps and freeze them into a submittable schema.
    pub fn make(self) -> Result<Schema, SchemaError> {
        let label = &self.core.label;
        let mut downloads = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Upload(tensors) | Step::Download(tensors) => {
                    if tensors.iter().any(|t| t.staging().is_none()) {
                        return Err(SchemaError::NotStaged {
                            schema: label.clone(),
                            step: index,
                        });
                    }
                    if let Step::Download(tensors) = step {
                        downloads.extend(tensors.iter().cloned());
                    }
                }
                Step::Work(work) => work.validate(label)?,
            }
        }
        tracing::debug!("schema {label}: {} steps", self.steps.len());
        Ok(Schema {
            core: self.core,
            steps: self.steps,
            downloads,
        })
    }
}

/// A validated, submittable sequence of steps.
pub struct Schema {
    core: SchemaCore,
    steps: Vec<Step>,
    downloads: Vec<Arc<dyn TensorBinding>>,
}

impl Schema {
    /// Debug label.
    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// The frozen steps.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Turn back into an empty builder with the same fence.
    pub fn clear(self) -> SchemaBuilder {
        SchemaBuilder {
            core: self.core,
            steps: Vec::new(),
        }
    }

    /// Submit with no dependency.
    pub fn submit(&self) -> Result<(), SchemaError> {
        self.submit_after(None)
    }

    /// Submit, ordered after `dependency`'s latest submission.
    pub fn submit_after(&self, dependency: Option<&Schema>) -> Result<(), SchemaError> {
        if let Some(dependency) = dependency {
            if !Arc::ptr_eq(&dependency.core.queue, &self.core.queue) {
                return Err(SchemaError::ForeignQueue {
                    schema: self.core.label.clone(),
                    dependency: dependency.core.label.clone(),
                });
            }
            if !dependency.core.fence.was_submitted() {
                return Err(SchemaError::DependencyNotSubmitted {
                    schema: self.core.label.clone(),
                    dependency: dependency.core.label.clone(),
                });
            }
        }

        let commands = self.encode();

        let submit_queue = &self.core.queue;
        let _guard = submit_queue.lock.lock();
        let generation = self.core.fence.reset();
        for step in &self.steps {
            if let Step::Upload(tensors) = step {
                for staging in tensors.iter().filter_map(|t| t.staging()) {
                    staging.stage_upload(&submit_queue.queue);
                }
            }
        }
        let index = submit_queue.queue.submit(Some(commands));
        self.core.fence.submitted(index);
        let fence = Arc::clone(&self.core.fence);
        submit_queue
            .queue
            .on_submitted_work_done(move || fence.signal(generation));
        Ok(())
    }

    fn encode(&self) -> wgpu::CommandBuffer {
        let mut encoder = self.core.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&self.core.label),
        });
        for step in &self.steps {
            match step {
                Step::Upload(tensors) => {
                    for t in tensors {
                        if let Some(staging) = t.staging() {
                            staging.encode_upload(&mut encoder, t.tensor());
                        }
                    }
                }
                Step::Download(tensors) => {
                    for t in tensors {
                        if let Some(staging) = t.staging() {
                            staging.encode_download(&mut encoder, t.tensor());
                        }
                    }
                }
                Step::Work(work) => work.encode(&mut encoder),
            }
        }
        encoder.finish()
    }

    /// Whether the latest submission has executed. Never blocks; `true` for a
    /// schema that was never submitted.
    pub fn is_complete(&self) -> bool {
        let Some((generation, _)) = self.core.fence.latest() else {
            return true;
        };
        let _ = self.core.device.poll(wgpu::Maintain::Poll);
        self.core.fence.is_signalled(generation)
    }

    /// Block until the latest submission has executed, then refresh the host
    /// mirrors of every downloaded tensor. Returns immediately if the schema
    /// was never submitted.
    pub fn wait_for_completion(&self) -> Result<(), SchemaError> {
        let Some((generation, index)) = self.core.fence.latest() else {
            return Ok(());
        };

        loop {
            let _ = self.core.device.poll(wgpu::Maintain::wait_for(index.clone()));
            if self.core.fence.wait(generation, FENCE_POLL_INTERVAL) {
                break;
            }
            tracing::trace!("schema {}: fence wait timed out, retrying", self.core.label);
        }

        if self.core.fence.claim_refresh(generation) {
            for t in &self.downloads {
                if let Some(staging) = t.staging() {
                    staging.refresh(&self.core.device, &index).map_err(|e| SchemaError::Readback {
                        schema: self.core.label.clone(),
                        message: e.to_string(),
                    })?;
                }
            }
        }
        Ok(())
    }
}
