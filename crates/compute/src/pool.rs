//! Linear two-phase memory pools.
//!
//! A pool is sized first and allocated second. During sizing, a
//! [`SizeEstimator`] only advances a byte cursor for every intended
//! allocation. [`MemoryPool::allocate_pool`] then creates one fixed-size
//! backing allocation and hands the cursor over to an [`Allocator`], which
//! carves aligned sub-ranges out of it in the same order.
//!
//! Creating the backing is delegated to a [`PoolMemory`] implementation so the
//! bookkeeping stays testable without a device: [`HostMemory`] reserves a host
//! arena (the persistent mapping of host-visible pools), while the GPU module
//! provides a device-local implementation backed by a `wgpu::Buffer`.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Every allocation is rounded up to a multiple of this many bytes.
pub const POOL_ALIGNMENT: u64 = 32;

/// Round `bytes` up to the next multiple of `alignment` (a power of two).
/// `None` if the result does not fit in a `u64`.
pub fn align_up(bytes: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(bytes.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Bytes a request of `bytes` occupies in a pool. Empty requests still
/// reserve one aligned block so every allocation has a distinct offset.
fn reserved_size(bytes: u64, alignment: u64) -> Option<u64> {
    align_up(bytes.max(1), alignment)
}

/// Errors raised by pool misuse or exhaustion.
///
/// All of these are contract violations by the caller; the simulation treats
/// them as fatal for the current run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// `dryrun_allocate` on a pool that is already active.
    #[error("{pool} pool is already active; dry-run sizing is closed")]
    AlreadyActive {
        /// Pool kind.
        pool: &'static str,
    },
    /// `allocate` on a pool that is still sizing.
    #[error("{pool} pool is still sizing; allocate_pool() has not run")]
    NotActive {
        /// Pool kind.
        pool: &'static str,
    },
    /// `allocate_pool` with nothing dry-run beforehand.
    #[error("{pool} pool has no sized allocations")]
    EmptyPool {
        /// Pool kind.
        pool: &'static str,
    },
    /// The allocation would run past the fixed backing size.
    #[error("{pool} pool exhausted: {requested} bytes requested at offset {offset}, capacity {capacity}")]
    Exhausted {
        /// Pool kind.
        pool: &'static str,
        /// Aligned size of the failed request.
        requested: u64,
        /// Cursor position at the time of the request.
        offset: u64,
        /// Backing size fixed at `allocate_pool` time.
        capacity: u64,
    },
    /// A dry-run request pushed the sized total past `u64::MAX`.
    #[error("{pool} pool size overflow: {requested} bytes requested on top of {total}")]
    SizeOverflow {
        /// Pool kind.
        pool: &'static str,
        /// Unaligned size of the failed request.
        requested: u64,
        /// Total sized before the request.
        total: u64,
    },
    /// No memory with the pool's required properties could back the pool.
    #[error("no suitable {pool} memory for {size} bytes: {reason}")]
    NoSuitableMemory {
        /// Pool kind.
        pool: &'static str,
        /// Requested backing size.
        size: u64,
        /// Why the backing could not be created.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// SizeEstimator / Allocator
// ---------------------------------------------------------------------------

/// Sizing phase of a pool: accumulates aligned sizes, allocates nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimator {
    alignment: u64,
    total: u64,
}

impl SizeEstimator {
    /// Create an estimator. `alignment` is raised to at least
    /// [`POOL_ALIGNMENT`] and to the next power of two.
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment: alignment.max(POOL_ALIGNMENT).next_power_of_two(),
            total: 0,
        }
    }

    /// Register an intended allocation. Returns the running total, or
    /// `None` (leaving the total unchanged) if it would overflow.
    pub fn dryrun_allocate(&mut self, bytes: u64) -> Option<u64> {
        let size = reserved_size(bytes, self.alignment)?;
        self.total = self.total.checked_add(size)?;
        Some(self.total)
    }

    /// Total bytes registered so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Alignment applied to every registered size.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Close the sizing phase, fixing the capacity at the registered total.
    pub fn finalize(self) -> Allocator {
        Allocator {
            alignment: self.alignment,
            cursor: 0,
            capacity: self.total,
        }
    }
}

/// Active phase of a pool: carves aligned offsets out of a fixed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocator {
    alignment: u64,
    cursor: u64,
    capacity: u64,
}

impl Allocator {
    /// Reserve `bytes` (rounded up to the alignment) and return its offset,
    /// or `None` if the capacity would be exceeded.
    pub fn allocate(&mut self, bytes: u64) -> Option<u64> {
        let size = reserved_size(bytes, self.alignment)?;
        let end = self.cursor.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        let offset = self.cursor;
        self.cursor = end;
        Some(offset)
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Fixed capacity of the backing allocation.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Alignment of every returned offset.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

// ---------------------------------------------------------------------------
// Backing memory
// ---------------------------------------------------------------------------

/// Provider of the single backing allocation behind a [`MemoryPool`].
pub trait PoolMemory {
    /// Handle to the backing allocation, shared by every sub-range.
    type Backing: Clone;

    /// Human-readable pool kind used in errors and logs.
    const KIND: &'static str;

    /// Minimum alignment of sub-range offsets for this memory.
    fn alignment(&self) -> u64 {
        POOL_ALIGNMENT
    }

    /// Create the backing allocation of exactly `size` bytes.
    fn create_backing(&self, size: u64) -> Result<Self::Backing, PoolError>;

    /// Release a backing allocation when its pool is reset.
    fn release_backing(&self, _backing: &Self::Backing) {}
}

/// Host-visible memory: a host arena that stays mapped for the pool's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMemory;

impl PoolMemory for HostMemory {
    type Backing = HostMapping;
    const KIND: &'static str = "host-visible";

    fn create_backing(&self, size: u64) -> Result<HostMapping, PoolError> {
        HostMapping::new(size)
    }
}

/// Persistent mapping of a host-visible pool.
///
/// The arena is stored as 8-byte words so any view at a pool offset (always
/// a multiple of [`POOL_ALIGNMENT`]) is aligned for `f32`, `u32` and `f64`.
#[derive(Debug, Clone)]
pub struct HostMapping {
    words: Arc<RwLock<Vec<u64>>>,
    size: u64,
}

impl HostMapping {
    fn new(size: u64) -> Result<Self, PoolError> {
        let word_count = usize::try_from(size.div_ceil(8)).map_err(|_| PoolError::NoSuitableMemory {
            pool: HostMemory::KIND,
            size,
            reason: "size exceeds the host address space".into(),
        })?;
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|e| PoolError::NoSuitableMemory {
                pool: HostMemory::KIND,
                size,
                reason: e.to_string(),
            })?;
        words.resize(word_count, 0);
        Ok(Self {
            words: Arc::new(RwLock::new(words)),
            size,
        })
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Read-only typed view of `count` elements starting at byte `offset`.
    ///
    /// # Panics
    /// If the range lies outside the mapping or `offset` is not aligned for `T`.
    pub fn view<T: bytemuck::Pod>(&self, offset: u64, count: usize) -> MappedRwLockReadGuard<'_, [T]> {
        let range = byte_range::<T>(offset, count);
        RwLockReadGuard::map(self.words.read(), move |words| {
            bytemuck::cast_slice(&bytemuck::cast_slice::<u64, u8>(words)[range])
        })
    }

    /// Writable typed view of `count` elements starting at byte `offset`.
    ///
    /// # Panics
    /// If the range lies outside the mapping or `offset` is not aligned for `T`.
    pub fn view_mut<T: bytemuck::Pod>(&self, offset: u64, count: usize) -> MappedRwLockWriteGuard<'_, [T]> {
        let range = byte_range::<T>(offset, count);
        RwLockWriteGuard::map(self.words.write(), move |words| {
            bytemuck::cast_slice_mut(&mut bytemuck::cast_slice_mut::<u64, u8>(words)[range])
        })
    }
}

fn byte_range<T>(offset: u64, count: usize) -> std::ops::Range<usize> {
    debug_assert!(std::mem::align_of::<T>() <= 8);
    let start = offset as usize;
    start..start + count * std::mem::size_of::<T>()
}

// ---------------------------------------------------------------------------
// MemoryPool
// ---------------------------------------------------------------------------

/// One sub-range handed out by an active pool.
#[derive(Debug, Clone)]
pub struct PoolAllocation<B> {
    /// Backing allocation shared by the whole pool.
    pub backing: B,
    /// Byte offset of the sub-range.
    pub offset: u64,
    /// Aligned size reserved for the sub-range.
    pub size: u64,
}

enum PoolState<B> {
    Sizing(SizeEstimator),
    Active { allocator: Allocator, backing: B },
}

/// A linear pool that is sized with dry runs, then allocated once.
pub struct MemoryPool<M: PoolMemory> {
    memory: M,
    state: PoolState<M::Backing>,
}

impl<M: PoolMemory> MemoryPool<M> {
    /// Create a pool in sizing mode.
    pub fn new(memory: M) -> Self {
        let estimator = SizeEstimator::new(memory.alignment());
        Self {
            memory,
            state: PoolState::Sizing(estimator),
        }
    }

    /// Register an intended allocation. Fails once the pool is active.
    pub fn dryrun_allocate(&mut self, bytes: u64) -> Result<u64, PoolError> {
        match &mut self.state {
            PoolState::Sizing(estimator) => estimator.dryrun_allocate(bytes).ok_or(PoolError::SizeOverflow {
                pool: M::KIND,
                requested: bytes,
                total: estimator.total(),
            }),
            PoolState::Active { .. } => Err(PoolError::AlreadyActive { pool: M::KIND }),
        }
    }

    /// Create the backing allocation and switch to active mode.
    pub fn allocate_pool(&mut self) -> Result<(), PoolError> {
        let estimator = match &self.state {
            PoolState::Sizing(estimator) => *estimator,
            PoolState::Active { .. } => return Err(PoolError::AlreadyActive { pool: M::KIND }),
        };
        if estimator.total() == 0 {
            return Err(PoolError::EmptyPool { pool: M::KIND });
        }

        let backing = self.memory.create_backing(estimator.total())?;
        tracing::debug!(
            "{} pool active: {} bytes, alignment {}",
            M::KIND,
            estimator.total(),
            estimator.alignment()
        );
        self.state = PoolState::Active {
            allocator: estimator.finalize(),
            backing,
        };
        Ok(())
    }

    /// Carve a sub-range. Valid only once the pool is active.
    pub fn allocate(&mut self, bytes: u64) -> Result<PoolAllocation<M::Backing>, PoolError> {
        match &mut self.state {
            PoolState::Sizing(_) => Err(PoolError::NotActive { pool: M::KIND }),
            PoolState::Active { allocator, backing } => {
                let offset = allocator.used();
                let size = reserved_size(bytes, allocator.alignment()).unwrap_or(u64::MAX);
                match allocator.allocate(bytes) {
                    Some(offset) => Ok(PoolAllocation {
                        backing: backing.clone(),
                        offset,
                        size,
                    }),
                    None => Err(PoolError::Exhausted {
                        pool: M::KIND,
                        requested: size,
                        offset,
                        capacity: allocator.capacity(),
                    }),
                }
            }
        }
    }

    /// Whether `allocate_pool` has run.
    pub fn is_active(&self) -> bool {
        matches!(self.state, PoolState::Active { .. })
    }

    /// Bytes registered (sizing) or fixed capacity (active).
    pub fn total(&self) -> u64 {
        match &self.state {
            PoolState::Sizing(estimator) => estimator.total(),
            PoolState::Active { allocator, .. } => allocator.capacity(),
        }
    }

    /// Bytes handed out by the allocator; zero while sizing.
    pub fn used(&self) -> u64 {
        match &self.state {
            PoolState::Sizing(_) => 0,
            PoolState::Active { allocator, .. } => allocator.used(),
        }
    }

    /// The backing allocation, once active.
    pub fn backing(&self) -> Option<&M::Backing> {
        match &self.state {
            PoolState::Sizing(_) => None,
            PoolState::Active { backing, .. } => Some(backing),
        }
    }

    /// The memory provider.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Release the backing (if any) and return to an empty sizing phase.
    pub fn reset(&mut self) {
        if let PoolState::Active { backing, .. } = &self.state {
            self.memory.release_backing(backing);
        }
        self.state = PoolState::Sizing(SizeEstimator::new(self.memory.alignment()));
    }
}
