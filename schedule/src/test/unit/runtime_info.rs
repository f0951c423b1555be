//! Runtime info tests: alignment and index type selection.

use fusor_dtype::IndexType;
use fusor_ir::TensorArg;
use test_case::test_case;

use crate::runtime_info::{SchedulerRuntimeInfo, alignment_of};
use crate::test::helpers::*;

#[test_case(0, 16)]
#[test_case(4096, 16)]
#[test_case(8, 8)]
#[test_case(12, 4)]
#[test_case(6, 2)]
#[test_case(3, 1)]
fn test_alignment_of(address: usize, expected: usize) {
    assert_eq!(alignment_of(address), expected);
}

#[test]
fn test_contiguous_inputs_are_fully_aligned() {
    let (fusion, [tv0, tv1, out]) = elementwise_add();
    let info = runtime_info(&fusion, &[&[32, 32], &[32, 32]]);
    assert_eq!(info.alignment_size(tv0), 16);
    assert_eq!(info.alignment_size(tv1), 16);
    assert_eq!(info.alignment_size(out), 16);
}

#[test]
fn test_odd_row_pitch_limits_alignment() {
    let (fusion, [tv0, _, _]) = elementwise_add();
    let mut args = contiguous_args(&fusion, &[&[32, 32], &[32, 32]]);
    // Rows padded to 33 floats: 132 bytes, 4-byte aligned.
    args[0] = TensorArg { strides: vec![33, 1], ..args[0].clone() };
    let info = SchedulerRuntimeInfo::new(&fusion, &args).unwrap();
    assert_eq!(info.alignment_size(tv0), 4);
}

#[test]
fn test_small_fusion_uses_32_bit_indexing() {
    let (fusion, _) = elementwise_add();
    let info = runtime_info(&fusion, &[&[1024, 1024], &[1024, 1024]]);
    assert_eq!(info.index_type(), IndexType::Int32);
}

#[test]
fn test_huge_fusion_uses_64_bit_indexing() {
    let (fusion, _) = elementwise_add();
    let info = runtime_info(&fusion, &[&[65536, 65536], &[65536, 65536]]);
    assert_eq!(info.index_type(), IndexType::Int64);
}

#[test]
fn test_forced_index_type_wins() {
    let (fusion, _) = elementwise_add();
    let args = contiguous_args(&fusion, &[&[8, 8], &[8, 8]]);
    let info = SchedulerRuntimeInfo::with_index_type(&fusion, &args, Some(IndexType::Int64)).unwrap();
    assert_eq!(info.index_type(), IndexType::Int64);
}
