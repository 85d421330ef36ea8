//! One half of the A/B ping-pong: the schemas that advance the fields by a
//! single timestep from one tensor into the other.
//!
//! Pair A reads `tensor_0` and writes `tensor_1`; pair B mirrors it. Each pair
//! owns four schemas, submitted as a chain:
//!
//! ```text
//! [upload source]  ->  step  ->  [render sample]  ->  [download destination]
//!   first run only                not headless         when measuring
//! ```

use std::sync::Arc;

use compute::gpu::{dispatch_size, Context, FieldBufferSet, ParameterSet, Program, Schema, SchemaBuilder, SharedTensor, Step, TensorBinding, Work};

use crate::config::SimulationParameters;
use crate::SimulationError;

/// Invocations per workgroup along x in every simulation kernel.
pub const WORKGROUP_SIZE_X: u32 = 64;

/// Workgroup grid covering one invocation per voxel.
pub fn workgroup_grid(params: &SimulationParameters) -> [u32; 3] {
    [dispatch_size(params.voxel_x, WORKGROUP_SIZE_X), params.voxel_y, params.voxel_z]
}

/// Kernels and parameter sets of one pair.
pub struct StepPairResources {
    /// Fields at the start of the step.
    pub source: Arc<SharedTensor<f32>>,
    /// Fields at the end of the step.
    pub destination: Arc<SharedTensor<f32>>,
    /// `{source, destination}`.
    pub step_parameters: Arc<ParameterSet>,
    /// `{destination}`.
    pub render_parameters: Arc<ParameterSet>,
    /// Physics kernel.
    pub step_program: Arc<Program>,
    /// Render-sample kernel; `None` when headless.
    pub render_program: Option<Arc<Program>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Step,
    Render,
    Download,
}

/// Schemas for one direction of the ping-pong.
pub struct StepPair {
    label: &'static str,
    resources: StepPairResources,
    workgroups: [u32; 3],
    upload: Schema,
    step: Option<Schema>,
    render: Option<Schema>,
    download: Schema,
    last: Option<Stage>,
}

impl StepPair {
    /// Build the fixed upload/download schemas and a first step schedule.
    pub fn new(
        context: &Context,
        label: &'static str,
        params: &SimulationParameters,
        resources: StepPairResources,
        volumes: Option<&FieldBufferSet>,
    ) -> Result<Self, SimulationError> {
        let mut upload = context.schema(&format!("{label}_upload"));
        upload.add(Step::Upload(vec![resources.source.clone() as Arc<dyn TensorBinding>]));
        let mut download = context.schema(&format!("{label}_download"));
        download.add(Step::Download(vec![resources.destination.clone() as Arc<dyn TensorBinding>]));

        let mut pair = Self {
            label,
            resources,
            workgroups: workgroup_grid(params),
            upload: upload.make()?,
            step: None,
            render: None,
            download: download.make()?,
            last: None,
        };
        pair.schedule(context, volumes)?;
        Ok(pair)
    }

    /// Pair label.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Tensor this pair writes and downloads.
    pub fn destination(&self) -> &Arc<SharedTensor<f32>> {
        &self.resources.destination
    }

    /// Rebuild the step and render schemas. The render schema binds the
    /// volume slot that is current for writing at this call.
    pub fn schedule(&mut self, context: &Context, volumes: Option<&FieldBufferSet>) -> Result<(), SimulationError> {
        let [x, y, z] = self.workgroups;
        let r = &self.resources;

        let step = Work::new(r.step_program.clone(), r.step_parameters.clone()).workgroups(x, y, z);
        self.step = Some(rebuild(self.step.take(), context, &format!("{}_step", self.label), step)?);

        if let (Some(program), Some(volumes)) = (&r.render_program, volumes) {
            let render = Work::new(program.clone(), r.render_parameters.clone())
                .workgroups(x, y, z)
                .secondary(volumes.write_bind_group());
            self.render = Some(rebuild(self.render.take(), context, &format!("{}_render", self.label), render)?);
        }
        Ok(())
    }

    /// Submit `[upload] -> step -> [render] -> [download]`, the first stage
    /// ordered after `dependency`. Returns the last submitted schema.
    pub fn submit(
        &mut self,
        first_run: bool,
        do_download: bool,
        dependency: Option<&Schema>,
    ) -> Result<&Schema, SimulationError> {
        let mut previous = dependency;
        if first_run {
            self.upload.submit_after(previous)?;
            previous = Some(&self.upload);
        }

        let step = self.step.as_ref().ok_or(SimulationError::NotScheduled(self.label))?;
        step.submit_after(previous)?;
        let mut last = (Stage::Step, step);

        if let Some(render) = &self.render {
            render.submit_after(Some(last.1))?;
            last = (Stage::Render, render);
        }
        if do_download {
            self.download.submit_after(Some(last.1))?;
            last = (Stage::Download, &self.download);
        }

        self.last = Some(last.0);
        Ok(last.1)
    }

    /// The schema that ended the latest submission chain.
    pub fn last_schema(&self) -> Option<&Schema> {
        match self.last? {
            Stage::Step => self.step.as_ref(),
            Stage::Render => self.render.as_ref(),
            Stage::Download => Some(&self.download),
        }
    }

    /// Block until the latest chain has executed. Downloads are visible on
    /// the host afterwards.
    pub fn wait(&self) -> Result<(), SimulationError> {
        if let Some(schema) = self.last_schema() {
            schema.wait_for_completion()?;
        }
        Ok(())
    }
}

fn rebuild(previous: Option<Schema>, context: &Context, label: &str, work: Work) -> Result<Schema, SimulationError> {
    let mut builder: SchemaBuilder = match previous {
        Some(schema) => schema.clear(),
        None => context.schema(label),
    };
    builder.add(work);
    Ok(builder.make()?)
}
