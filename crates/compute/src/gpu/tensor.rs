//! Tensors: typed ranges of the pooled device buffer.
//!
//! A [`StorageTensor`] lives only on the device. A [`SharedTensor`] also owns a
//! range of the host-visible pool, exposed as a typed view, plus the two
//! transfer buffers Upload and Download steps copy through. Host and device
//! copies are never synchronized implicitly.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use crate::pool::{align_up, HostMapping, PoolError, PoolMemory, POOL_ALIGNMENT};

/// Device-local memory: one storage buffer per pool.
pub struct DeviceMemory {
    device: Arc<wgpu::Device>,
}

impl DeviceMemory {
    /// Memory provider for `device`.
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self { device }
    }
}

impl PoolMemory for DeviceMemory {
    type Backing = Arc<wgpu::Buffer>;
    const KIND: &'static str = "device-local";

    fn alignment(&self) -> u64 {
        let limits = self.device.limits();
        POOL_ALIGNMENT.max(limits.min_storage_buffer_offset_alignment as u64)
    }

    fn create_backing(&self, size: u64) -> Result<Arc<wgpu::Buffer>, PoolError> {
        let limits = self.device.limits();
        if size > limits.max_buffer_size {
            return Err(PoolError::NoSuitableMemory {
                pool: Self::KIND,
                size,
                reason: format!("device max_buffer_size is {}", limits.max_buffer_size),
            });
        }
        Ok(Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("device_pool"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })))
    }

    fn release_backing(&self, backing: &Arc<wgpu::Buffer>) {
        backing.destroy();
    }
}

/// Round a byte count up to the copy and binding granularity.
///
/// Tensor sizes come from pool ranges that were already aligned to at least
/// 32 bytes, so the rounding cannot overflow.
fn align4(bytes: u64) -> u64 {
    align_up(bytes.max(1), wgpu::COPY_BUFFER_ALIGNMENT).unwrap_or(bytes)
}

/// A range of the device pool buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Arc<wgpu::Buffer>,
    offset: u64,
    size: u64,
}

impl Tensor {
    pub(crate) fn new(buffer: Arc<wgpu::Buffer>, offset: u64, size: u64) -> Self {
        Self { buffer, offset, size }
    }

    /// The pool buffer this tensor lives in.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Byte offset inside the pool buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size used for copies and bindings.
    pub(crate) fn padded_size(&self) -> u64 {
        align4(self.size)
    }

    /// The tensor's range as a storage binding.
    pub fn binding_resource(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: self.offset,
            size: wgpu::BufferSize::new(self.padded_size()),
        })
    }
}

/// Host side of a [`SharedTensor`].
pub struct Staging {
    mapping: HostMapping,
    offset: u64,
    size: u64,
    upload: wgpu::Buffer,
    readback: wgpu::Buffer,
}

impl Staging {
    pub(crate) fn new(device: &wgpu::Device, label: &str, mapping: HostMapping, offset: u64, size: u64) -> Self {
        let padded = align4(size);
        let upload = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}_upload")),
            size: padded,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}_readback")),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            mapping,
            offset,
            size,
            upload,
            readback,
        }
    }

    fn padded_size(&self) -> u64 {
        align4(self.size)
    }

    /// Stage the host range into the upload buffer. Must run under the queue
    /// lock, right before the submission that copies it to the device.
    pub(crate) fn stage_upload(&self, queue: &wgpu::Queue) {
        let bytes = self.mapping.view::<u8>(self.offset, self.padded_size() as usize);
        queue.write_buffer(&self.upload, 0, &bytes);
    }

    /// Record the device copy of a staged upload.
    pub(crate) fn encode_upload(&self, encoder: &mut wgpu::CommandEncoder, tensor: &Tensor) {
        encoder.copy_buffer_to_buffer(&self.upload, 0, tensor.buffer(), tensor.offset(), self.padded_size());
    }

    /// Record the device-to-readback copy of a download.
    pub(crate) fn encode_download(&self, encoder: &mut wgpu::CommandEncoder, tensor: &Tensor) {
        encoder.copy_buffer_to_buffer(tensor.buffer(), tensor.offset(), &self.readback, 0, self.padded_size());
    }

    /// Copy the readback buffer into the host range. `submission` is the
    /// submission that filled it; later submissions stay in flight.
    pub(crate) fn refresh(
        &self,
        device: &wgpu::Device,
        submission: &wgpu::SubmissionIndex,
    ) -> Result<(), wgpu::BufferAsyncError> {
        let slice = self.readback.slice(..self.padded_size());
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let mapped = loop {
            let _ = device.poll(wgpu::Maintain::wait_for(submission.clone()));
            match rx.try_recv() {
                Ok(result) => break result,
                Err(std::sync::mpsc::TryRecvError::Empty) => std::thread::yield_now(),
                Err(std::sync::mpsc::TryRecvError::Disconnected) => return Err(wgpu::BufferAsyncError),
            }
        };
        mapped?;

        {
            let data = slice.get_mapped_range();
            let mut host = self.mapping.view_mut::<u8>(self.offset, self.padded_size() as usize);
            host.copy_from_slice(&data);
        }
        self.readback.unmap();
        Ok(())
    }
}

/// Anything that can be bound as a storage buffer and moved by transfer steps.
pub trait TensorBinding: Send + Sync {
    /// Device range.
    fn tensor(&self) -> &Tensor;

    /// Host staging, if the tensor has one.
    fn staging(&self) -> Option<&Staging> {
        None
    }
}

/// Tensor with a host-visible mirror of `len()` elements of `T`.
pub struct SharedTensor<T: bytemuck::Pod> {
    tensor: Tensor,
    staging: Staging,
    count: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: bytemuck::Pod> SharedTensor<T> {
    pub(crate) fn new(tensor: Tensor, staging: Staging, count: usize) -> Self {
        Self {
            tensor,
            staging,
            count,
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Host view. Reflects the device only after a completed Download step.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [T]> {
        self.staging.mapping.view(self.staging.offset, self.count)
    }

    /// Writable host view. Reaches the device only through an Upload step.
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [T]> {
        self.staging.mapping.view_mut(self.staging.offset, self.count)
    }
}

impl<T: bytemuck::Pod> TensorBinding for SharedTensor<T> {
    fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    fn staging(&self) -> Option<&Staging> {
        Some(&self.staging)
    }
}

/// Device-only tensor.
pub struct StorageTensor {
    tensor: Tensor,
}

impl StorageTensor {
    pub(crate) fn new(tensor: Tensor) -> Self {
        Self { tensor }
    }
}

impl TensorBinding for StorageTensor {
    fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}
