//! Three render-facing volume slots guarded by the triple-buffer protocol.
//!
//! Each slot is an `R32Float` 3D texture. The compute side writes the slot at
//! `write_idx` through a write-only storage texture bind group; a viewer samples
//! the slot at `read_idx` through a texture + non-filtering sampler bind group.

use std::sync::Arc;

use super::{bgl_sampler, bgl_volume_sampled, bgl_volume_write, Context};
use crate::triple_buffer::{TransitionError, TripleBuffer, TripleBufferState, SLOT_COUNT};

/// Texel format of every volume slot.
pub const VOLUME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

/// Triple-buffered 3D field shared by the compute loop and a viewer.
pub struct FieldBufferSet {
    extent: [u32; 3],
    textures: [wgpu::Texture; SLOT_COUNT],
    read_layout: wgpu::BindGroupLayout,
    write_layout: wgpu::BindGroupLayout,
    read_groups: [Arc<wgpu::BindGroup>; SLOT_COUNT],
    write_groups: [Arc<wgpu::BindGroup>; SLOT_COUNT],
    swap: TripleBuffer,
}

impl FieldBufferSet {
    /// Create three `x * y * z` slots.
    pub fn new(context: &Context, [x, y, z]: [u32; 3]) -> Self {
        let device = context.device();
        let size = wgpu::Extent3d {
            width: x.max(1),
            height: y.max(1),
            depth_or_array_layers: z.max(1),
        };

        let textures: [wgpu::Texture; SLOT_COUNT] = std::array::from_fn(|slot| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("volume_slot_{slot}")),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D3,
                format: VOLUME_FORMAT,
                usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
        });
        let views: [wgpu::TextureView; SLOT_COUNT] =
            std::array::from_fn(|slot| textures[slot].create_view(&wgpu::TextureViewDescriptor::default()));

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("volume_sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let read_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("volume_read_bgl"),
            entries: &[bgl_volume_sampled(0), bgl_sampler(1)],
        });
        let write_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("volume_write_bgl"),
            entries: &[bgl_volume_write(0, VOLUME_FORMAT)],
        });

        let read_groups = std::array::from_fn(|slot| {
            Arc::new(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("volume_read_{slot}")),
                layout: &read_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&views[slot]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&sampler),
                    },
                ],
            }))
        });
        let write_groups = std::array::from_fn(|slot| {
            Arc::new(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("volume_write_{slot}")),
                layout: &write_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&views[slot]),
                }],
            }))
        });

        Self {
            extent: [size.width, size.height, size.depth_or_array_layers],
            textures,
            read_layout,
            write_layout,
            read_groups,
            write_groups,
            swap: TripleBuffer::new(),
        }
    }

    /// Texel extent of every slot.
    pub fn extent(&self) -> [u32; 3] {
        self.extent
    }

    /// Slot texture.
    pub fn texture(&self, slot: usize) -> &wgpu::Texture {
        &self.textures[slot]
    }

    /// Layout of [`read_bind_group`](Self::read_bind_group).
    pub fn read_layout(&self) -> &wgpu::BindGroupLayout {
        &self.read_layout
    }

    /// Layout of [`write_bind_group`](Self::write_bind_group).
    pub fn write_layout(&self) -> &wgpu::BindGroupLayout {
        &self.write_layout
    }

    /// Sampled view of the slot at `read_idx`.
    pub fn read_bind_group(&self) -> Arc<wgpu::BindGroup> {
        Arc::clone(&self.read_groups[self.swap.read_idx()])
    }

    /// Storage view of the slot at `write_idx`.
    pub fn write_bind_group(&self) -> Arc<wgpu::BindGroup> {
        Arc::clone(&self.write_groups[self.swap.write_idx()])
    }

    /// Current swap state.
    pub fn state(&self) -> TripleBufferState {
        self.swap.snapshot()
    }

    /// Slot indices shared by the reader and the writer.
    pub fn swap(&self) -> &TripleBuffer {
        &self.swap
    }

    /// Reader: advance onto the newest written slot if one exists.
    pub fn try_transition_to_read_new(&self) -> bool {
        self.swap.try_transition_to_read_new()
    }

    /// Reader: finish the transition once old frames have drained.
    pub fn complete_transition_to_read_new(&self) -> Result<(), TransitionError> {
        self.swap.complete_transition_to_read_new()
    }

    /// Writer: advance onto a free slot if the reader has caught up.
    pub fn try_transition_to_write_new(&self) -> bool {
        self.swap.try_transition_to_write_new()
    }

    /// Writer: finish the transition once old work has drained.
    pub fn complete_transition_to_write_new(&self) -> Result<(), TransitionError> {
        self.swap.complete_transition_to_write_new()
    }
}
