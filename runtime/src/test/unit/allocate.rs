//! Output allocation tests.

use fusor_dtype::{DType, IndexType};
use fusor_ir::{AliasInfo, AllocationType, Dim, Fusion, TvRef, UnaryOp};
use test_case::test_case;

use crate::allocate::*;
use crate::buffer::get_buffer_infos;
use crate::config::AllocationOptions;
use crate::error::Error;
use crate::tensor::HostTensor;
use crate::test::helpers::*;

fn alias(kind: AllocationType, aliased_io: Option<TvRef>) -> AliasInfo {
    AliasInfo { kind, aliased_io, hide_output: false }
}

fn allocate(fusion: &Fusion, inputs: &[HostTensor], options: AllocationOptions) -> crate::Result<Vec<HostTensor>> {
    alloc_output_space(fusion, inputs, options)
}

fn with_nan() -> AllocationOptions {
    AllocationOptions::builder().fill_allocation_with_nan(true).build()
}

// ============================================================================
// NaN fill
// ============================================================================

#[test_case(DType::Int32, i32::MAX.to_le_bytes().to_vec(); "int32")]
#[test_case(DType::Int64, i64::MAX.to_le_bytes().to_vec(); "int64")]
#[test_case(DType::UInt8, vec![0xff]; "uint8")]
#[test_case(DType::Bool, vec![1]; "bool")]
#[test_case(DType::Float16, vec![0x00, 0x7e]; "half")]
fn test_fill_pattern(dtype: DType, expected: Vec<u8>) {
    let tensor = HostTensor::zeros(&[2, 3], dtype).unwrap();
    fill_tensor_with_nan(&tensor).unwrap();
    assert_eq!(tensor.element_bytes(&[0, 0]).unwrap(), expected);
    assert_eq!(tensor.element_bytes(&[1, 2]).unwrap(), expected);
}

#[test]
fn test_fill_float_is_nan() {
    let tensor = HostTensor::zeros(&[4], DType::Float32).unwrap();
    fill_tensor_with_nan(&tensor).unwrap();
    assert!((0..4).all(|i| f32_at(&tensor, &[i]).is_nan()));
}

#[test]
fn test_fill_index_is_unsupported() {
    let tensor = HostTensor::zeros(&[4], DType::Index).unwrap();
    let err = fill_tensor_with_nan(&tensor).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFillType { dtype: DType::Index }));
}

// ============================================================================
// New buffers
// ============================================================================

#[test]
fn test_new_output_is_fresh_storage() {
    let (fusion, _) = neg_2d();
    let inputs = host_inputs(&[&[3, 5]]);
    let outputs = allocate(&fusion, &inputs, AllocationOptions::default()).unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].sizes(), &[3, 5]);
    assert_eq!(outputs[0].strides(), &[5, 1]);
    assert!(!outputs[0].is_alias_of(&inputs[0]));
    assert_eq!(f32_at(&outputs[0], &[2, 4]), 0.0);
}

#[test]
fn test_new_output_filled_on_request() {
    let (fusion, _) = neg_2d();
    let outputs = allocate(&fusion, &host_inputs(&[&[3, 5]]), with_nan()).unwrap();
    assert!(f32_at(&outputs[0], &[0, 0]).is_nan());
    assert!(f32_at(&outputs[0], &[2, 4]).is_nan());
}

#[test]
fn test_duplicated_output_shares_one_buffer() {
    let (mut fusion, [_, out]) = neg_2d();
    fusion.add_output(out);
    let outputs = allocate(&fusion, &host_inputs(&[&[3, 5]]), AllocationOptions::default()).unwrap();
    assert_eq!(outputs.len(), 2);
    assert!(outputs[0].is_alias_of(&outputs[1]));
}

#[test]
fn test_input_passed_through_as_output() {
    let (mut fusion, [tv0, _]) = neg_2d();
    fusion.add_output(tv0);
    let inputs = host_inputs(&[&[3, 5]]);
    let outputs = allocate(&fusion, &inputs, AllocationOptions::default()).unwrap();
    assert!(!outputs[0].is_alias_of(&inputs[0]));
    assert!(outputs[1].is_alias_of(&inputs[0]));
}

// ============================================================================
// Aliases and evaluated outputs
// ============================================================================

#[test]
fn test_evaluated_permute_views_input() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.permute(tv0, &[1, 0]).unwrap();
    fusion.add_output(tv1);
    fusion.set_alias(tv1, alias(AllocationType::Evaluate, Some(tv0)));

    let inputs = host_inputs(&[&[3, 5]]);
    let outputs = allocate(&fusion, &inputs, AllocationOptions::default()).unwrap();
    assert!(outputs[0].is_alias_of(&inputs[0]));
    assert_eq!(outputs[0].sizes(), &[5, 3]);
    assert_eq!(outputs[0].strides(), &[1, 5]);
}

#[test]
fn test_evaluated_view_of_new_output_comes_after_it() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.unary(UnaryOp::Neg, tv0);
    let tv2 = fusion.view_split(tv1, 1, 2).unwrap();
    // The view is listed first but can only be evaluated once `tv1` exists.
    fusion.add_output(tv2);
    fusion.add_output(tv1);
    fusion.set_alias(tv2, alias(AllocationType::Evaluate, Some(tv1)));

    let outputs = allocate(&fusion, &host_inputs(&[&[4, 6]]), AllocationOptions::default()).unwrap();
    assert_eq!(outputs[0].sizes(), &[4, 3, 2]);
    assert_eq!(outputs[0].strides(), &[6, 2, 1]);
    assert_eq!(outputs[1].sizes(), &[4, 6]);
    assert!(outputs[0].is_alias_of(&outputs[1]));

    outputs[1].write_element_bytes(&[3, 5], &2.0f32.to_le_bytes()).unwrap();
    assert_eq!(f32_at(&outputs[0], &[3, 2, 1]), 2.0);
}

#[test]
fn test_reused_buffer_is_the_input() {
    let (mut fusion, [tv0, out]) = neg_2d();
    fusion.set_alias(out, alias(AllocationType::ReuseBuffer, Some(tv0)));
    let inputs = host_inputs(&[&[3, 5]]);
    let outputs = allocate(&fusion, &inputs, AllocationOptions::default()).unwrap();
    assert!(outputs[0].is_alias_of(&inputs[0]));
    assert_eq!(outputs[0].data_ptr(), inputs[0].data_ptr());
}

#[test]
fn test_reuse_needs_an_aliased_tensor() {
    let (mut fusion, [_, out]) = neg_2d();
    fusion.set_alias(out, alias(AllocationType::ReuseBuffer, None));
    let err = allocate(&fusion, &host_inputs(&[&[3, 5]]), AllocationOptions::default()).unwrap_err();
    assert!(matches!(err, Error::MissingAliasedIo { .. }));
}

#[test]
fn test_alias_of_intermediate_is_rejected() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv1 = fusion.unary(UnaryOp::Neg, tv0);
    let tv2 = fusion.unary(UnaryOp::Exp, tv1);
    fusion.add_output(tv2);
    fusion.set_alias(tv2, alias(AllocationType::ReuseBuffer, Some(tv1)));

    let err = allocate(&fusion, &host_inputs(&[&[8]]), AllocationOptions::default()).unwrap_err();
    assert!(matches!(err, Error::AliasNotFusionIo { .. }));
}

#[test]
fn test_arithmetic_cannot_be_evaluated_on_host() {
    let (mut fusion, [_, out]) = neg_2d();
    fusion.set_alias(out, alias(AllocationType::Evaluate, None));
    let err = allocate(&fusion, &host_inputs(&[&[3, 5]]), AllocationOptions::default()).unwrap_err();
    assert!(matches!(err, Error::NotHostEvaluable { .. }));
}

#[test]
fn test_evaluated_output_must_view_its_alias() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv2 = fusion.permute(tv0, &[1, 0]).unwrap();
    fusion.add_output(tv2);
    fusion.set_alias(tv2, alias(AllocationType::Evaluate, Some(tv1)));

    let err = allocate(&fusion, &host_inputs(&[&[3, 5], &[5, 3]]), AllocationOptions::default()).unwrap_err();
    assert!(matches!(err, Error::NotAnAlias { .. }));
}

// ============================================================================
// Bindings
// ============================================================================

#[test]
fn test_bindings_resolve_metadata_chains() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv1 = fusion.broadcast(tv0, &[true, false]).unwrap();
    let tv2 = fusion.set(tv1);
    fusion.add_output(tv2);

    let inputs = host_inputs(&[&[4]]);
    let mut bindings = TensorBindings::new(&fusion, &inputs).unwrap();
    assert!(bindings.is_known(tv0));
    assert!(!bindings.is_known(tv2));

    let tensor = bindings.evaluate(tv2).unwrap();
    assert_eq!(tensor.sizes(), &[1, 4]);
    assert!(tensor.is_alias_of(&inputs[0]));
    assert!(bindings.is_known(tv1));
}

#[test]
fn test_allocate_outputs_with_narrow_index() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Index, &[Dim::Symbolic]);
    let tv1 = fusion.unary(UnaryOp::Neg, tv0);
    fusion.add_output(tv1);

    let inputs = [HostTensor::zeros(&[6], DType::Int64).unwrap()];
    let mut bindings = TensorBindings::new(&fusion, &inputs).unwrap();
    let infos = get_buffer_infos(&fusion, bindings.evaluator(), IndexType::Int32, fusion.outputs()).unwrap();
    let outputs = allocate_outputs(&fusion, &infos, &mut bindings, with_nan()).unwrap();

    assert_eq!(outputs[0].dtype(), DType::Int32);
    assert_eq!(outputs[0].storage().len(), 24);
    assert_eq!(outputs[0].element_bytes(&[5]).unwrap(), i32::MAX.to_le_bytes());
}
