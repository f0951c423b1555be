//! Loop-domain transform tests.

use fusor_dtype::DType;

use crate::test::helpers::{loop_extents, unary_chain};
use crate::{Dim, Error, Fusion, IterType, LoadStoreOpType, LoopTransform, MemoryType, OpKind, ParallelType};

fn fixed_input(extents: &[i64]) -> (Fusion, crate::TvRef) {
    let mut fusion = Fusion::new();
    let shape: Vec<Dim> = extents.iter().map(|e| Dim::Fixed(*e)).collect();
    let tv0 = fusion.add_input(DType::Float32, &shape);
    (fusion, tv0)
}

// =========================================================================
// Split / Merge
// =========================================================================

#[test]
fn test_inner_split() {
    let (mut fusion, tv) = fixed_input(&[10]);
    fusion.split(tv, 0, 4, true).unwrap();
    assert_eq!(loop_extents(&fusion, tv), [3, 4]);
}

#[test]
fn test_outer_split() {
    let (mut fusion, tv) = fixed_input(&[10]);
    fusion.split(tv, -1, 4, false).unwrap();
    assert_eq!(loop_extents(&fusion, tv), [4, 3]);
}

#[test]
fn test_split_of_broadcast_stays_broadcast() {
    let mut fusion = Fusion::new();
    let tv = fusion.add_input(DType::Float32, &[Dim::Broadcast]);
    fusion.split(tv, 0, 4, true).unwrap();
    for id in fusion.tv(tv).loop_domain() {
        assert_eq!(fusion.id(*id).iter_type, IterType::Broadcast);
    }
}

#[test]
fn test_split_rejects_bad_factor() {
    let (mut fusion, tv) = fixed_input(&[10]);
    assert!(matches!(fusion.split(tv, 0, 0, true), Err(Error::InvalidSplitFactor { .. })));
    assert!(matches!(fusion.split(tv, 3, 2, true), Err(Error::AxisOutOfRange { axis: 3, .. })));
}

#[test]
fn test_transform_inside_compute_at() {
    let (mut fusion, [_, tv1, _]) = unary_chain();
    fusion.set_compute_at(tv1, 1).unwrap();
    assert!(matches!(fusion.split(tv1, 0, 4, true), Err(Error::TransformInsideComputeAt { .. })));
    assert!(fusion.split(tv1, 1, 4, true).is_ok());
}

#[test]
fn test_merge_places_output_at_outer() {
    let (mut fusion, tv) = fixed_input(&[2, 3, 5]);
    fusion.merge(tv, 2, 0).unwrap();
    assert_eq!(loop_extents(&fusion, tv), [3, 10]);

    let (mut fusion, tv) = fixed_input(&[2, 3, 5]);
    fusion.merge(tv, 0, 2).unwrap();
    assert_eq!(loop_extents(&fusion, tv), [10, 3]);
}

#[test]
fn test_merge_broadcast_takes_other_type() {
    let mut fusion = Fusion::new();
    let tv = fusion.add_input(DType::Float32, &[Dim::Broadcast, Dim::Fixed(7)]);
    fusion.merge(tv, 0, 1).unwrap();
    let merged = fusion.id(fusion.tv(tv).loop_domain()[0]);
    assert_eq!(merged.iter_type, IterType::Iteration);
    assert_eq!(merged.extent.as_int(), Some(7));
}

#[test]
fn test_merge_iteration_with_reduction_fails() {
    let (mut fusion, tv0) = fixed_input(&[4, 8]);
    let tv1 = fusion.sum(tv0, &[1]).unwrap();
    assert!(matches!(fusion.merge(tv1, 0, 1), Err(Error::MergeIterTypeMismatch { .. })));
    assert!(matches!(fusion.merge(tv1, 1, 1), Err(Error::MergeSameAxis { axis: 1, .. })));
}

// =========================================================================
// Reorder / replay
// =========================================================================

#[test]
fn test_reorder_fills_unmentioned_axes_in_order() {
    let (mut fusion, tv) = fixed_input(&[2, 3, 5, 7]);
    fusion.reorder(tv, &[(3, 0)]).unwrap();
    assert_eq!(loop_extents(&fusion, tv), [7, 2, 3, 5]);
    assert_eq!(fusion.tv(tv).transforms(), [LoopTransform::Reorder { new2old: vec![3, 0, 1, 2] }]);
}

#[test]
fn test_reorder_rejects_duplicates() {
    let (mut fusion, tv) = fixed_input(&[2, 3]);
    assert!(matches!(fusion.reorder(tv, &[(0, 1), (1, 1)]), Err(Error::InvalidReorder { .. })));
}

#[test]
fn test_replay_reproduces_loop_structure() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    fusion.merge(tv2, 0, 1).unwrap();
    fusion.split(tv2, 0, 128, true).unwrap();
    fusion.split(tv2, 0, 4, false).unwrap();

    let log = fusion.tv(tv2).transforms().to_vec();
    fusion.replay_transforms(tv1, &log).unwrap();

    assert_eq!(fusion.tv(tv1).n_dims(), 3);
    assert_eq!(fusion.tv(tv1).transforms(), log.as_slice());
    let extents = |tv| -> Vec<String> {
        fusion.tv(tv).loop_domain().iter().map(|id| fusion.id(*id).extent.to_string()).collect()
    };
    assert_eq!(extents(tv1)[1..], extents(tv2)[1..]);
}

#[test]
fn test_reset_loop_domain() {
    let (mut fusion, tv) = fixed_input(&[10]);
    fusion.split(tv, 0, 4, true).unwrap();
    fusion.reset_loop_domain(tv);
    assert_eq!(fusion.tv(tv).loop_domain(), fusion.tv(tv).logical_domain());
    assert!(fusion.tv(tv).transforms().is_empty());
}

// =========================================================================
// Annotations
// =========================================================================

#[test]
fn test_compute_at_updates_consumers() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    fusion.set_compute_at(tv1, 2).unwrap();
    assert_eq!(fusion.tv(tv2).max_producer_pos, 2);
    assert!(matches!(fusion.set_compute_at(tv1, 3), Err(Error::InvalidComputeAt { .. })));
}

#[test]
fn test_parallelize_and_circular_buffer() {
    let (mut fusion, [_, tv1, _]) = unary_chain();
    fusion.parallelize(tv1, -1, ParallelType::TIDx).unwrap();
    fusion.set_memory_type(tv1, MemoryType::Shared);
    fusion.circular_buffer(tv1, 4);

    let view = fusion.tv(tv1);
    assert_eq!(fusion.id(view.loop_domain()[1]).parallel_type, ParallelType::TIDx);
    assert!(view.is_circular_buffered());
    assert_eq!(view.memory_type, MemoryType::Shared);
}

#[test]
fn test_allocation_domain_must_be_connected() {
    let (mut fusion, [tv0, tv1, _]) = unary_chain();
    let mut allocation = fusion.tv(tv1).logical_domain().to_vec();
    allocation.reverse();
    fusion.set_allocation_domain(tv1, allocation.clone()).unwrap();
    assert_eq!(fusion.tv(tv1).maybe_allocation_domain(), allocation.as_slice());

    let foreign = fusion.tv(tv0).logical_domain().to_vec();
    assert!(matches!(fusion.set_allocation_domain(tv1, foreign), Err(Error::InvalidAllocationDomain { .. })));
}

// =========================================================================
// Caching
// =========================================================================

#[test]
fn test_cache_after_rewires_uses() {
    let (mut fusion, [tv0, tv1, _]) = unary_chain();
    let cache = fusion.cache_after(tv0, LoadStoreOpType::CpAsync);

    assert_eq!(fusion.producers_of(tv1), vec![cache]);
    assert_eq!(fusion.producers_of(cache), vec![tv0]);
    let def = fusion.tv(cache).definition().unwrap();
    assert_eq!(fusion.expr(def).kind.load_store_type(), Some(LoadStoreOpType::CpAsync));
}

#[test]
fn test_cache_before_moves_definition() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    let cache = fusion.cache_before(tv2).unwrap();

    let def = fusion.tv(cache).definition().unwrap();
    assert!(matches!(fusion.expr(def).kind, OpKind::Unary(_)));
    assert_eq!(fusion.producers_of(cache), vec![tv1]);
    assert_eq!(fusion.producers_of(tv2), vec![cache]);
    assert_eq!(fusion.tv(cache).memory_type, MemoryType::Local);
    assert_eq!(fusion.exprs().len(), 3);
}

#[test]
fn test_cache_fork_replaces_output() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    fusion.add_output(tv1);
    let fork = fusion.cache_fork(tv1);

    assert!(fusion.is_output(fork));
    assert!(!fusion.is_output(tv1));
    assert_eq!(fusion.tv(tv1).memory_type, MemoryType::Local);
    let consumers = fusion.consumers_of(tv1);
    assert!(consumers.contains(&fork) && consumers.contains(&tv2));
}
