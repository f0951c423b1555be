//! Buffer layout inference tests.

use fusor_dtype::DType;
use fusor_ir::{Dim, Fusion, MemoryType, ParallelType, UnaryOp, Val};
use fusor_lower::Allocate;
use test_case::test_case;

use crate::error::Error;
use crate::shape::*;
use crate::test::helpers::*;

#[test_case(&[2, 3, 4], &[false, false, false], &[12, 4, 1]; "row major")]
#[test_case(&[2, 1, 4], &[false, true, false], &[4, 0, 1]; "expanded axis")]
#[test_case(&[3, 0, 4], &[false, false, false], &[4, 1, 1]; "empty axis")]
#[test_case(&[0], &[false], &[1]; "empty vector")]
#[test_case(&[], &[], &[]; "scalar")]
fn test_contiguous_strides(sizes: &[i64], expand_flags: &[bool], expected: &[i64]) {
    assert_eq!(get_contiguous_strides(sizes, expand_flags).unwrap(), expected);
}

#[test]
fn test_contiguous_strides_reject_bad_input() {
    assert!(matches!(get_contiguous_strides(&[2, -1], &[false, false]), Err(Error::NegativeSize { size: -1 })));
    assert!(matches!(get_contiguous_strides(&[2], &[]), Err(Error::RankMismatch { .. })));
}

// ============================================================================
// Outputs
// ============================================================================

#[test]
fn test_output_without_allocation_domain() {
    let (fusion, [_, out]) = neg_2d();
    let evaluator = bound_evaluator(&fusion, &[&[3, 5]]);
    let meta = infer_shape_of_output(&fusion, out, &evaluator).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[3, 5]);
    assert_eq!(meta.strides.as_slice(), &[5, 1]);
    assert_eq!(meta.dtype, DType::Float32);
}

#[test]
fn test_expanded_output_takes_no_memory() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv1 = fusion.broadcast(tv0, &[true, false]).unwrap();
    let tv2 = fusion.expand(tv1, &[Some(Val::int(4)), None]).unwrap();
    fusion.add_output(tv2);

    let evaluator = bound_evaluator(&fusion, &[&[5]]);
    let meta = infer_shape_of_output(&fusion, tv2, &evaluator).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[4, 5]);
    assert_eq!(meta.strides.as_slice(), &[0, 1]);
}

#[test]
fn test_device_axis_holds_one_shard() {
    let (mut fusion, [_, out]) = neg_2d();
    fusion.parallelize(out, 0, ParallelType::DIDx).unwrap();
    let evaluator = bound_evaluator(&fusion, &[&[8, 5]]);
    let meta = infer_shape_of_output(&fusion, out, &evaluator).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[1, 5]);
}

#[test]
fn test_permuted_allocation_domain() {
    let (mut fusion, [_, out]) = neg_2d();
    let logical = fusion.tv(out).logical_domain().to_vec();
    fusion.set_allocation_domain(out, vec![logical[1], logical[0]]).unwrap();

    let evaluator = bound_evaluator(&fusion, &[&[3, 5]]);
    let meta = infer_shape_of_output(&fusion, out, &evaluator).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[3, 5]);
    assert_eq!(meta.strides.as_slice(), &[1, 3]);
}

#[test]
fn test_split_allocation_domain_is_merged_back() {
    let (mut fusion, [_, out]) = neg_2d();
    fusion.split(out, 1, Val::int(2), true).unwrap();
    let [l0, o, i] = <[_; 3]>::try_from(fusion.tv(out).loop_domain()).unwrap();
    fusion.set_allocation_domain(out, vec![o, i, l0]).unwrap();

    let evaluator = bound_evaluator(&fusion, &[&[4, 6]]);
    let meta = infer_shape_of_output(&fusion, out, &evaluator).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[4, 6]);
    assert_eq!(meta.strides.as_slice(), &[1, 4]);
}

#[test]
fn test_allocation_before_reshape_is_merged_forward() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.view_merge(tv0, 0).unwrap();
    fusion.add_output(tv1);
    let root = fusion.tv(tv1).maybe_root_domain().to_vec();
    fusion.set_allocation_domain(tv1, root).unwrap();

    let evaluator = bound_evaluator(&fusion, &[&[4, 6]]);
    let meta = infer_shape_of_output(&fusion, tv1, &evaluator).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[24]);
    assert_eq!(meta.strides.as_slice(), &[1]);
}

#[test]
fn test_permuted_allocation_before_reshape_is_not_viewable() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.view_merge(tv0, 0).unwrap();
    fusion.add_output(tv1);
    let root = fusion.tv(tv1).maybe_root_domain().to_vec();
    fusion.set_allocation_domain(tv1, vec![root[1], root[0]]).unwrap();

    let evaluator = bound_evaluator(&fusion, &[&[4, 6]]);
    let err = infer_shape_of_output(&fusion, tv1, &evaluator).unwrap_err();
    assert!(matches!(err, Error::NotViewable { .. }));
}

#[test]
fn test_resize_in_allocation_domain_is_unsupported() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv1 = fusion.pad(tv0, 0, Val::int(1), Val::int(1)).unwrap();
    fusion.add_output(tv1);
    let root = fusion.tv(tv1).maybe_root_domain().to_vec();
    fusion.set_allocation_domain(tv1, root).unwrap();

    let evaluator = bound_evaluator(&fusion, &[&[8]]);
    let err = infer_shape_of_output(&fusion, tv1, &evaluator).unwrap_err();
    assert!(matches!(err, Error::UnsupportedTransformation { transform: "Resize", .. }));
}

#[test]
fn test_unbound_extent_is_reported() {
    let (fusion, [_, out]) = neg_2d();
    let evaluator = fusor_ir::ExpressionEvaluator::new();
    let err = infer_shape_of_output(&fusion, out, &evaluator).unwrap_err();
    assert!(matches!(err, Error::UnresolvedSize { .. }));
}

// ============================================================================
// Intermediates
// ============================================================================

#[test]
fn test_intermediate_uses_allocate_shape() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(8)]);
    let tv1 = fusion.unary(UnaryOp::Neg, tv0);
    let tv2 = fusion.unary(UnaryOp::Exp, tv1);
    fusion.add_output(tv2);

    let alloc = Allocate::new(tv1, MemoryType::Shared, DType::Float16, vec![Val::int(4), Val::int(2).mul(&Val::int(4))]);
    let meta = infer_shape_of_intermediate(&fusion, &alloc, &fusor_ir::ExpressionEvaluator::new()).unwrap();
    assert_eq!(meta.sizes.as_slice(), &[4, 8]);
    assert_eq!(meta.strides.as_slice(), &[8, 1]);
    assert_eq!(meta.dtype, DType::Float16);

    let unbound = Allocate::new(tv1, MemoryType::Shared, DType::Float32, vec![Val::symbol("n")]);
    let err = infer_shape_of_intermediate(&fusion, &unbound, &fusor_ir::ExpressionEvaluator::new()).unwrap_err();
    assert!(matches!(err, Error::UnresolvedSize { .. }));
}
