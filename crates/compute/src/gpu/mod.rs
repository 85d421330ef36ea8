//! wgpu implementation of the scheduling engine.
//!
//! A [`Context`] owns the device, the single submission queue and two memory
//! pools:
//! - a device-local pool, one storage buffer carved into [`Tensor`] ranges;
//! - a host-visible pool, one persistently mapped arena carved into the
//!   staging ranges of [`SharedTensor`]s.
//!
//! Work is described with [`Program`]s (compiled WGSL plus specialization
//! constants) bound to [`ParameterSet`]s, recorded as [`Step`]s into a
//! [`Schema`], and submitted with explicit dependencies on other schemas.
//! [`FieldBufferSet`] holds the three render-facing volume slots.
//!
//! # Bind group layout
//! - Group 0: the parameter set, N read-write storage buffers at bindings 0..N.
//! - Group 1 (optional): a secondary group supplied per dispatch, e.g. the
//!   write-only storage texture of the current volume slot.

pub mod program;
pub mod schema;
pub mod tensor;
pub mod volume;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::{HostMemory, MemoryPool, PoolError};

pub use program::{ParameterSet, Program, ProgramDescriptor, ProgramError};
pub use schema::{Schema, SchemaBuilder, SchemaError, Step, Work, FENCE_POLL_INTERVAL};
pub use tensor::{DeviceMemory, SharedTensor, Staging, StorageTensor, Tensor, TensorBinding};
pub use volume::FieldBufferSet;

/// Errors raised while creating a context or its pooled resources.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// No adapter matched the request.
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    /// The adapter refused the device request.
    #[error("failed to create device: {0}")]
    RequestDevice(String),
    /// Pool misuse, exhaustion or missing memory.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Adapter selection for [`Context::new`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Device label.
    pub label: String,
    /// Adapter power preference.
    pub power_preference: wgpu::PowerPreference,
    /// Force a software adapter.
    pub force_fallback_adapter: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            label: "compute_device".into(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

/// The device queue plus the mutex serializing every enqueue on it.
pub(crate) struct SubmitQueue {
    pub(crate) queue: wgpu::Queue,
    pub(crate) lock: Mutex<()>,
}

struct Pools {
    device: MemoryPool<DeviceMemory>,
    host: MemoryPool<HostMemory>,
}

/// Device, queue and memory pools shared by every resource of a run.
pub struct Context {
    device: Arc<wgpu::Device>,
    queue: Arc<SubmitQueue>,
    adapter_info: wgpu::AdapterInfo,
    push_constants: bool,
    pools: Mutex<Pools>,
}

impl Context {
    /// Select an adapter, create the device and empty pools in sizing mode.
    pub fn new(options: &ContextOptions) -> Result<Self, ContextError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .ok_or(ContextError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        tracing::info!("GPU adapter: {:?} ({:?})", adapter_info.name, adapter_info.backend);

        // Pools are single large buffers, so ask for the adapter's real buffer
        // limits instead of the conservative defaults.
        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_buffer_size = adapter_limits.max_buffer_size;
        required_limits.max_storage_buffer_binding_size = adapter_limits.max_storage_buffer_binding_size;
        required_limits.max_storage_buffers_per_shader_stage =
            adapter_limits.max_storage_buffers_per_shader_stage;

        let push_constants = adapter.features().contains(wgpu::Features::PUSH_CONSTANTS);
        let mut required_features = wgpu::Features::empty();
        if push_constants {
            required_features |= wgpu::Features::PUSH_CONSTANTS;
            required_limits.max_push_constant_size = adapter_limits.max_push_constant_size;
        }

        tracing::info!(
            "Requesting max_buffer_size = {}, max_storage_buffer_binding_size = {}, push constants: {}",
            required_limits.max_buffer_size,
            required_limits.max_storage_buffer_binding_size,
            push_constants,
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(&options.label),
                required_features,
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| ContextError::RequestDevice(e.to_string()))?;

        let device = Arc::new(device);
        let pools = Pools {
            device: MemoryPool::new(DeviceMemory::new(Arc::clone(&device))),
            host: MemoryPool::new(HostMemory),
        };

        Ok(Self {
            device,
            queue: Arc::new(SubmitQueue {
                queue,
                lock: Mutex::new(()),
            }),
            adapter_info,
            push_constants,
            pools: Mutex::new(pools),
        })
    }

    /// The logical device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The submission queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue.queue
    }

    /// Information on the selected adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Whether programs may declare push constants.
    pub fn supports_push_constants(&self) -> bool {
        self.push_constants
    }

    pub(crate) fn shared_device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub(crate) fn submit_queue(&self) -> &Arc<SubmitQueue> {
        &self.queue
    }

    /// Register a future [`SharedTensor`] of `bytes` in both pools.
    pub fn dryrun_shared_tensor(&self, bytes: u64) -> Result<(), ContextError> {
        let mut pools = self.pools.lock();
        pools.device.dryrun_allocate(bytes)?;
        pools.host.dryrun_allocate(bytes)?;
        Ok(())
    }

    /// Register a future [`StorageTensor`] of `bytes` in the device pool.
    pub fn dryrun_storage_tensor(&self, bytes: u64) -> Result<(), ContextError> {
        self.pools.lock().device.dryrun_allocate(bytes)?;
        Ok(())
    }

    /// Create both pool backings. Tensor constructors do this implicitly.
    pub fn allocate_pools(&self) -> Result<(), ContextError> {
        let mut pools = self.pools.lock();
        activate(&mut pools.device)?;
        activate(&mut pools.host)?;
        Ok(())
    }

    /// Allocate a host-visible tensor of `count` elements of `T`.
    pub fn shared_tensor<T: bytemuck::Pod>(
        &self,
        label: &str,
        count: usize,
    ) -> Result<Arc<SharedTensor<T>>, ContextError> {
        let bytes = (count * std::mem::size_of::<T>()) as u64;
        let mut pools = self.pools.lock();
        activate(&mut pools.device)?;
        activate(&mut pools.host)?;
        let device_range = pools.device.allocate(bytes)?;
        let host_range = pools.host.allocate(bytes)?;
        let tensor = Tensor::new(device_range.backing, device_range.offset, bytes);
        let staging = Staging::new(&self.device, label, host_range.backing, host_range.offset, bytes);
        tracing::debug!("shared tensor {label}: {bytes} bytes at device offset {}", tensor.offset());
        Ok(Arc::new(SharedTensor::new(tensor, staging, count)))
    }

    /// Allocate a device-only tensor of `count` elements of `T`.
    pub fn storage_tensor<T: bytemuck::Pod>(
        &self,
        label: &str,
        count: usize,
    ) -> Result<Arc<StorageTensor>, ContextError> {
        let bytes = (count * std::mem::size_of::<T>()) as u64;
        let mut pools = self.pools.lock();
        activate(&mut pools.device)?;
        let device_range = pools.device.allocate(bytes)?;
        let tensor = Tensor::new(device_range.backing, device_range.offset, bytes);
        tracing::debug!("storage tensor {label}: {bytes} bytes at device offset {}", tensor.offset());
        Ok(Arc::new(StorageTensor::new(tensor)))
    }

    /// Bind tensors to sequential slots of a new parameter set.
    pub fn parameter_set(&self, label: &str, tensors: Vec<Arc<dyn TensorBinding>>) -> Arc<ParameterSet> {
        Arc::new(ParameterSet::new(self, label, tensors))
    }

    /// Compile a program.
    pub fn program(&self, descriptor: &ProgramDescriptor<'_>) -> Result<Arc<Program>, ProgramError> {
        Program::new(self, descriptor).map(Arc::new)
    }

    /// An empty schema on this context's queue.
    pub fn schema(&self, label: &str) -> SchemaBuilder {
        SchemaBuilder::new(self, label)
    }

    /// `(device pool, host pool)` bytes sized or allocated so far.
    pub fn pool_totals(&self) -> (u64, u64) {
        let pools = self.pools.lock();
        (pools.device.total(), pools.host.total())
    }

    /// Release both pool backings and return the pools to sizing mode.
    ///
    /// Tensors allocated before the clear must not be used afterwards.
    pub fn clear(&self) {
        let mut pools = self.pools.lock();
        pools.device.reset();
        pools.host.reset();
        tracing::debug!("context pools cleared");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Switch a pool to active mode if it is still sizing.
fn activate<M: crate::pool::PoolMemory>(pool: &mut MemoryPool<M>) -> Result<(), PoolError> {
    if !pool.is_active() {
        tracing::debug!("implicit allocate_pool() on {} pool ({} bytes)", M::KIND, pool.total());
        pool.allocate_pool()?;
    }
    Ok(())
}

// ---- Bind group layout entry helpers ----

pub(crate) fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn bgl_volume_sampled(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE | wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::VERTEX,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D3,
            multisampled: false,
        },
        count: None,
    }
}

pub(crate) fn bgl_sampler(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE | wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::VERTEX,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
        count: None,
    }
}

pub(crate) fn bgl_volume_write(binding: u32, format: wgpu::TextureFormat) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format,
            view_dimension: wgpu::TextureViewDimension::D3,
        },
        count: None,
    }
}

/// Calculate dispatch workgroup count: ceil(total / workgroup_size).
pub fn dispatch_size(total: u32, workgroup_size: u32) -> u32 {
    total.div_ceil(workgroup_size)
}
