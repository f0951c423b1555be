//! Axis equivalence tests.

use fusor_dtype::DType;

use crate::test::helpers::unary_chain;
use crate::{ComputeAtMap, Dim, Fusion, IdMappingMode};

#[test]
fn test_loop_mapping_follows_compute_at() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    for tv in [tv1, tv2] {
        fusion.merge(tv, 0, 1).unwrap();
        fusion.split(tv, 0, 128, true).unwrap();
    }
    fusion.set_compute_at(tv1, 1).unwrap();

    let map = ComputeAtMap::build(&fusion);
    let (p, c) = (fusion.tv(tv1).loop_domain().to_vec(), fusion.tv(tv2).loop_domain().to_vec());
    assert!(map.are_mapped(p[0], c[0], IdMappingMode::Loop));
    assert!(!map.are_mapped(p[1], c[1], IdMappingMode::Loop));
    // Split outputs are mapped through the history even where loops are not shared.
    assert!(map.are_mapped(p[1], c[1], IdMappingMode::Exact));
}

#[test]
fn test_split_factor_mismatch_is_not_mapped() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    fusion.split(tv1, 1, 4, true).unwrap();
    fusion.split(tv2, 1, 8, true).unwrap();

    let map = ComputeAtMap::build(&fusion);
    let (p, c) = (fusion.tv(tv1).loop_domain().to_vec(), fusion.tv(tv2).loop_domain().to_vec());
    assert!(map.are_mapped(p[0], c[0], IdMappingMode::Exact));
    assert!(!map.are_mapped(p[2], c[2], IdMappingMode::Permissive));
}

#[test]
fn test_broadcast_is_only_permissively_mapped() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Broadcast]);
    let tv2 = fusion.add(tv0, tv1).unwrap();
    fusion.add_output(tv2);

    let map = ComputeAtMap::build(&fusion);
    let bcast = fusion.tv(tv1).logical_domain()[1];
    let out = fusion.tv(tv2).logical_domain()[1];
    assert!(map.are_mapped(bcast, out, IdMappingMode::Permissive));
    assert!(!map.are_mapped(bcast, out, IdMappingMode::Exact));

    let concrete = map.concrete_mapped_id(bcast, IdMappingMode::Permissive);
    assert!(!fusion.id(concrete).is_broadcast());
    assert_eq!(map.concrete_mapped_id(bcast, IdMappingMode::Exact), bcast);
}

#[test]
fn test_merge_with_broadcast_maps_to_other_input() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Broadcast, Dim::Symbolic]);
    let tv1 = fusion.set(tv0);
    fusion.add_output(tv1);
    let inner = fusion.tv(tv1).logical_domain()[1];
    fusion.merge(tv1, 0, 1).unwrap();

    let map = ComputeAtMap::build(&fusion);
    let merged = fusion.tv(tv1).loop_domain()[0];
    assert!(map.are_mapped(inner, merged, IdMappingMode::Permissive));
    assert!(!map.are_mapped(inner, merged, IdMappingMode::Exact));
}

#[test]
fn test_concrete_prefers_parallelized_axis() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    fusion.parallelize(tv2, 1, crate::ParallelType::TIDx).unwrap();
    let map = ComputeAtMap::build(&fusion);
    let axis = fusion.tv(tv1).loop_domain()[1];
    assert_eq!(map.concrete_mapped_id(axis, IdMappingMode::Exact), fusion.tv(tv2).loop_domain()[1]);
    assert_eq!(map.disjoint_set(axis, IdMappingMode::Exact).len(), 3);
}

#[test]
fn test_self_mapping_through_permute() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.permute(tv0, &[1, 0]).unwrap();
    let tv2 = fusion.add(tv0, tv1).unwrap();
    fusion.add_output(tv2);

    let map = ComputeAtMap::build(&fusion);
    let (tv, a, b) = map.has_self_mapping().expect("transposed operand maps its own axes");
    assert_eq!(tv, tv0);
    assert_ne!(a, b);

    let (fusion, _) = unary_chain();
    assert!(ComputeAtMap::build(&fusion).has_self_mapping().is_none());
}
