//! GPU Compute Scheduling Engine
//!
//! This crate provides the resource and command scheduling layer that the
//! snow-crystal simulation runs on. It is designed to be independent of the
//! physics: kernels are opaque WGSL programs parameterized by constants.
//!
//! # Modules
//! - [`pool`] -- Linear two-phase memory pools (`SizeEstimator` -> `Allocator`).
//! - [`constants`] -- Specialization and push constant values and byte layouts.
//! - [`triple_buffer`] -- Reader/writer swap state machine for three field slots.
//! - [`gpu`] -- wgpu context, tensors, programs, schemas and volume slots
//!   (behind the default `gpu` feature).

#![warn(missing_docs)]

pub mod constants;
pub mod pool;
pub mod triple_buffer;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use constants::{Constant, SpecializationConstants};
pub use pool::{Allocator, HostMapping, HostMemory, MemoryPool, PoolError, SizeEstimator};
pub use triple_buffer::{SwapPhase, TransitionError, TripleBuffer, TripleBufferState};

#[cfg(feature = "gpu")]
pub use gpu::{
    gpu_available, Context, ContextError, ContextOptions, FieldBufferSet, ParameterSet, Program,
    ProgramDescriptor, ProgramError, Schema, SchemaBuilder, SchemaError, SharedTensor, Step,
    StorageTensor, Tensor, TensorBinding, Work,
};
