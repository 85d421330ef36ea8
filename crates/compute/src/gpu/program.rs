//! Compiled compute programs and the parameter sets they consume.

use std::sync::Arc;

use super::tensor::TensorBinding;
use super::{bgl_storage_rw, Context};
use crate::constants::{push_constant_bytes, Constant, SpecializationConstants};

/// Errors raised while building a [`Program`].
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    /// The program declares push constants the device cannot provide.
    #[error("program {label}: push constants requested but the device lacks PUSH_CONSTANTS")]
    PushConstantsUnsupported {
        /// Program label.
        label: String,
    },
    /// WGSL validation or pipeline creation failed.
    #[error("program {label} failed to compile: {message}")]
    Compilation {
        /// Program label.
        label: String,
        /// Validation message reported by the device.
        message: String,
    },
}

/// A fixed group of tensors bound at slots 0..N of bind group 0.
pub struct ParameterSet {
    label: String,
    layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    tensors: Vec<Arc<dyn TensorBinding>>,
}

impl ParameterSet {
    /// Bind `tensors` in order. The set cannot be re-bound afterwards.
    pub fn new(context: &Context, label: &str, tensors: Vec<Arc<dyn TensorBinding>>) -> Self {
        let device = context.device();
        let entries: Vec<_> = (0..tensors.len() as u32).map(bgl_storage_rw).collect();
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label}_bgl")),
            entries: &entries,
        });

        let bindings: Vec<_> = tensors
            .iter()
            .enumerate()
            .map(|(slot, t)| wgpu::BindGroupEntry {
                binding: slot as u32,
                resource: t.tensor().binding_resource(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &bindings,
        });

        Self {
            label: label.to_owned(),
            layout,
            bind_group,
            tensors,
        }
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of bound tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether no tensors are bound.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Bound tensors in slot order.
    pub fn tensors(&self) -> &[Arc<dyn TensorBinding>] {
        &self.tensors
    }

    /// Layout of bind group 0.
    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub(crate) fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}

/// Inputs of [`Program::new`].
pub struct ProgramDescriptor<'a> {
    /// Pipeline label.
    pub label: &'a str,
    /// Full WGSL source, including any `override` declarations.
    pub wgsl: &'a str,
    /// Compute entry point.
    pub entry_point: &'a str,
    /// Values for the `@id(n)` overrides.
    pub specialization: &'a SpecializationConstants,
    /// Example push constant values; only their layout is used.
    pub push_constants: &'a [Constant],
    /// Example parameter set; only its binding count is used.
    pub parameters: &'a ParameterSet,
    /// Layout of the optional bind group 1.
    pub secondary_layout: Option<&'a wgpu::BindGroupLayout>,
}

/// A compute pipeline plus the interface metadata schemas validate against.
pub struct Program {
    label: String,
    pipeline: wgpu::ComputePipeline,
    binding_count: usize,
    push_constant_size: u32,
    has_secondary: bool,
}

impl Program {
    /// Compile `descriptor.wgsl` with its specialization constants.
    pub fn new(context: &Context, descriptor: &ProgramDescriptor<'_>) -> Result<Self, ProgramError> {
        let device = context.device();
        let label = descriptor.label;
        let push_constant_size = push_constant_bytes(descriptor.push_constants).len() as u32;
        if push_constant_size > 0 && !context.supports_push_constants() {
            return Err(ProgramError::PushConstantsUnsupported { label: label.to_owned() });
        }

        let mut bind_group_layouts = vec![descriptor.parameters.layout()];
        bind_group_layouts.extend(descriptor.secondary_layout);
        let push_constant_ranges: Vec<_> = (push_constant_size > 0)
            .then(|| wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..push_constant_size,
            })
            .into_iter()
            .collect();

        let constants = descriptor.specialization.pipeline_constants();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(descriptor.wgsl.into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}_layout")),
            bind_group_layouts: &bind_group_layouts,
            push_constant_ranges: &push_constant_ranges,
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&layout),
            module: &module,
            entry_point: Some(descriptor.entry_point),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ProgramError::Compilation {
                label: label.to_owned(),
                message: err.to_string(),
            });
        }

        tracing::debug!(
            "program {label}: {} bindings, {} specialization constants, {} push constant bytes",
            descriptor.parameters.len(),
            descriptor.specialization.len(),
            push_constant_size
        );

        Ok(Self {
            label: label.to_owned(),
            pipeline,
            binding_count: descriptor.parameters.len(),
            push_constant_size,
            has_secondary: descriptor.secondary_layout.is_some(),
        })
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Storage bindings expected in group 0.
    pub fn binding_count(&self) -> usize {
        self.binding_count
    }

    /// Bytes of push constants expected per dispatch.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    /// Whether a secondary bind group must accompany each dispatch.
    pub fn has_secondary(&self) -> bool {
        self.has_secondary
    }

    pub(crate) fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }
}
