//! Pool allocation invariants.
//!
//! A dry run followed by the same sequence of allocations must fit exactly:
//! every offset is aligned, sub-ranges never overlap, and the cursor ends at
//! the sized total. Runs on the host pool, so no GPU is required.

use compute::pool::{align_up, HostMemory, MemoryPool, PoolError, SizeEstimator, POOL_ALIGNMENT};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_replayed_allocations_fit_exactly(sizes in prop::collection::vec(0u64..10_000, 1..32)) {
        let mut pool = MemoryPool::new(HostMemory);
        for &size in &sizes {
            pool.dryrun_allocate(size).unwrap();
        }
        let sized = pool.total();
        pool.allocate_pool().unwrap();

        let mut previous_end = 0;
        for &size in &sizes {
            let range = pool.allocate(size).unwrap();
            prop_assert_eq!(range.offset % POOL_ALIGNMENT, 0);
            prop_assert!(range.offset >= previous_end, "sub-ranges overlap");
            prop_assert!(range.size >= size);
            previous_end = range.offset + range.size;
        }
        prop_assert_eq!(pool.used(), sized);
        prop_assert!(pool.used() <= pool.total());
        prop_assert!(matches!(pool.allocate(1), Err(PoolError::Exhausted { .. })), "pool must be full");
    }

    #[test]
    fn prop_alignment_is_respected_for_any_power_of_two(
        shift in 0u32..10,
        sizes in prop::collection::vec(1u64..5_000, 1..16),
    ) {
        let mut estimator = SizeEstimator::new(1 << shift);
        let alignment = estimator.alignment();
        prop_assert!(alignment >= POOL_ALIGNMENT);

        for &size in &sizes {
            estimator.dryrun_allocate(size);
        }
        let expected: u64 = sizes.iter().filter_map(|&s| align_up(s, alignment)).sum();
        prop_assert_eq!(estimator.total(), expected);

        let mut allocator = estimator.finalize();
        for &size in &sizes {
            let offset = allocator.allocate(size);
            prop_assert!(offset.is_some());
            prop_assert_eq!(offset.unwrap_or(1) % alignment, 0);
        }
        prop_assert_eq!(allocator.used(), allocator.capacity());
    }

    #[test]
    fn prop_extra_allocation_is_exhausted(sizes in prop::collection::vec(1u64..1_000, 1..8), extra in 1u64..1_000) {
        let mut pool = MemoryPool::new(HostMemory);
        for &size in &sizes {
            pool.dryrun_allocate(size).unwrap();
        }
        pool.allocate_pool().unwrap();
        for &size in &sizes {
            pool.allocate(size).unwrap();
        }
        match pool.allocate(extra) {
            Err(PoolError::Exhausted { capacity, offset, .. }) => {
                prop_assert_eq!(capacity, offset);
            }
            other => prop_assert!(false, "expected exhaustion, got {:?}", other.map(|r| r.offset)),
        }
    }
}

#[test]
fn test_mode_transitions_are_one_directional() {
    let mut pool = MemoryPool::new(HostMemory);
    assert!(matches!(pool.allocate(8), Err(PoolError::NotActive { .. })));

    pool.dryrun_allocate(8).unwrap();
    pool.allocate_pool().unwrap();
    assert!(pool.is_active());
    assert!(matches!(pool.dryrun_allocate(8), Err(PoolError::AlreadyActive { .. })));
    assert!(matches!(pool.allocate_pool(), Err(PoolError::AlreadyActive { .. })));

    // Only an explicit reset reopens sizing.
    pool.reset();
    assert!(!pool.is_active());
    assert!(matches!(pool.allocate(8), Err(PoolError::NotActive { .. })));
}

#[test]
fn test_host_mapping_persists_across_allocations() {
    let mut pool = MemoryPool::new(HostMemory);
    pool.dryrun_allocate(4 * 3).unwrap();
    pool.dryrun_allocate(4 * 5).unwrap();
    pool.allocate_pool().unwrap();

    let a = pool.allocate(4 * 3).unwrap();
    a.backing.view_mut::<f32>(a.offset, 3).copy_from_slice(&[0.5, 1.5, 2.5]);
    let b = pool.allocate(4 * 5).unwrap();
    b.backing.view_mut::<u32>(b.offset, 5).fill(9);

    // Writing the second range left the first untouched.
    assert_eq!(&*a.backing.view::<f32>(a.offset, 3), &[0.5, 1.5, 2.5]);
    assert_eq!(a.backing.len(), pool.total());
}
