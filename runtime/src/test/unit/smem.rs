use fusor_dtype::{DType, IndexType};
use fusor_ir::{ExpressionEvaluator, Fusion, MemoryType, TvRef, Val};
use fusor_lower::{Allocate, LoweringContext};

use crate::error::Error;
use crate::smem::*;
use crate::test::helpers::neg_2d;

fn shared(buffer: TvRef, dtype: DType, elements: i64, address: Option<i64>) -> Allocate {
    let mut alloc = Allocate::new(buffer, MemoryType::Shared, dtype, vec![Val::int(elements)]);
    alloc.address = address.map(Val::int);
    alloc
}

fn buffer() -> TvRef {
    neg_2d().1[1]
}

#[test]
fn test_buffers_end_at_furthest_byte() {
    let a = shared(buffer(), DType::Float32, 16, Some(0));
    let b = shared(buffer(), DType::Float32, 16, Some(64));
    let bytes = compute_shared_memory(&ExpressionEvaluator::new(), &[&a, &b], IndexType::Int32, 0).unwrap();
    assert_eq!(bytes, 128);
}

#[test]
fn test_buffers_start_past_aligned_base() {
    let a = shared(buffer(), DType::Float32, 4, Some(0));
    let bytes = compute_shared_memory(&ExpressionEvaluator::new(), &[&a], IndexType::Int32, 4).unwrap();
    assert_eq!(bytes, 32);
}

#[test]
fn test_no_buffers_keep_base() {
    assert_eq!(compute_shared_memory(&ExpressionEvaluator::new(), &[], IndexType::Int32, 20).unwrap(), 20);
}

#[test]
fn test_aliased_buffer_takes_no_space() {
    let node = LoweringContext::new(Fusion::new()).next_node_id();
    let a = shared(buffer(), DType::Float32, 16, Some(0));
    let mut b = shared(buffer(), DType::Float32, 1024, None);
    b.alias = Some(node);
    let bytes = compute_shared_memory(&ExpressionEvaluator::new(), &[&a, &b], IndexType::Int32, 0).unwrap();
    assert_eq!(bytes, 64);
}

#[test]
fn test_index_buffers_follow_index_type() {
    let a = shared(buffer(), DType::Index, 8, Some(0));
    let evaluator = ExpressionEvaluator::new();
    assert_eq!(compute_shared_memory(&evaluator, &[&a], IndexType::Int32, 0).unwrap(), 32);
    assert_eq!(compute_shared_memory(&evaluator, &[&a], IndexType::Int64, 0).unwrap(), 64);
}

#[test]
fn test_symbolic_size_is_evaluated() {
    let mut a = shared(buffer(), DType::Float16, 0, Some(0));
    a.shape = vec![Val::symbol("n"), Val::int(4)];
    let mut evaluator = ExpressionEvaluator::new();
    evaluator.bind("n", 8).unwrap();
    assert_eq!(compute_shared_memory(&evaluator, &[&a], IndexType::Int32, 0).unwrap(), 64);

    let err = compute_shared_memory(&ExpressionEvaluator::new(), &[&a], IndexType::Int32, 0).unwrap_err();
    assert!(matches!(err, Error::UnresolvedSmemValue { what: "size", .. }));
}

#[test]
fn test_missing_address_is_an_error() {
    let a = shared(buffer(), DType::Float32, 16, None);
    let err = compute_shared_memory(&ExpressionEvaluator::new(), &[&a], IndexType::Int32, 0).unwrap_err();
    assert!(matches!(err, Error::MissingSmemAddress { .. }));
}
