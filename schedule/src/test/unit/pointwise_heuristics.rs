//! Pointwise heuristic tests.
//!
//! Expected launch shapes are worked out by hand from the default device
//! (108 SMs, 128 threads per block) and float32 tensors.

use fusor_ir::{ParallelType, TensorArg};
use test_case::test_case;

use crate::config::DeviceProperties;
use crate::params::PointwiseParams;
use crate::pointwise::get_pointwise_heuristics;
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::test::helpers::*;

fn broadcast_params(outer: i64, inner: i64, device: DeviceProperties) -> PointwiseParams {
    let (fusion, _) = outer_broadcast_add();
    let info = runtime_info_on(&fusion, &[&[outer, inner], &[inner]], device);
    get_pointwise_heuristics(&fusion, &info, None).unwrap()
}

// ============================================================================
// 2-D schedules
// ============================================================================

#[test]
fn test_broadcast_picks_2d_break_point() {
    let params = broadcast_params(1024, 1024, DeviceProperties::default());
    assert_eq!(params.break_point, 1);
    assert!(params.vectorize);
    assert_eq!(params.unroll_factor, 4);
    assert!(!params.flip_grid_binding);
    assert!(!params.split_block);
    assert!(!params.split_grid_y_dim);
    assert_eq!(params.launch.get(ParallelType::TIDx), Some(128));
    assert_eq!(params.launch.get(ParallelType::TIDy), None);
}

#[test]
fn test_narrow_inner_extent_splits_block() {
    let params = broadcast_params(8192, 256, DeviceProperties::default());
    assert_eq!(params.break_point, 1);
    assert!(params.split_block);
    assert_eq!(params.launch.get(ParallelType::TIDx), Some(64));
    assert_eq!(params.launch.get(ParallelType::TIDy), Some(2));
}

#[test]
fn test_small_l2_flips_grid_binding() {
    let device = DeviceProperties::builder().l2_cache_bytes(1024).build();
    let params = broadcast_params(1024, 1024, device);
    assert_eq!(params.break_point, 1);
    assert!(params.flip_grid_binding);
    assert!(!params.split_grid_y_dim);
}

#[test]
fn test_grid_y_limit_splits_grid() {
    let device = DeviceProperties::builder().max_grid_y(512).build();
    let params = broadcast_params(1024, 1024, device);
    assert_eq!(params.max_grid_y, 512);
    assert!(params.split_grid_y_dim);
    assert!(!params.flip_grid_binding);
}

// ============================================================================
// 1-D schedules
// ============================================================================

#[test]
fn test_plain_add_stays_1d() {
    let (fusion, _) = elementwise_add();
    let info = runtime_info(&fusion, &[&[1024, 1024], &[1024, 1024]]);
    let params = get_pointwise_heuristics(&fusion, &info, None).unwrap();
    assert_eq!(params.break_point, 0);
    assert!(params.vectorize);
    assert_eq!(params.unroll_factor, 4);
    assert_eq!(params.launch.get(ParallelType::TIDx), Some(128));
}

#[test]
fn test_small_fusion_does_not_unroll() {
    let (fusion, _) = elementwise_add();
    let info = runtime_info(&fusion, &[&[4, 8], &[4, 8]]);
    let params = get_pointwise_heuristics(&fusion, &info, None).unwrap();
    assert_eq!(params.break_point, 0);
    assert!(!params.vectorize);
    assert_eq!(params.unroll_factor, 1);
    assert_eq!(params.launch.get(ParallelType::TIDx), Some(128));
}

#[test]
fn test_misaligned_input_unrolls_instead() {
    let (fusion, _) = elementwise_add();
    let mut args = contiguous_args(&fusion, &[&[1024, 1024], &[1024, 1024]]);
    args[0].data_ptr = 4;
    let info = SchedulerRuntimeInfo::new(&fusion, &args).unwrap();
    let params = get_pointwise_heuristics(&fusion, &info, None).unwrap();
    assert!(!params.vectorize);
    assert_eq!(params.unroll_factor, 4);
}

#[test]
fn test_strided_inner_dim_does_not_vectorize() {
    let (fusion, _) = elementwise_add();
    let mut args = contiguous_args(&fusion, &[&[1024, 1024], &[1024, 1024]]);
    args[1] = TensorArg { strides: vec![1, 1024], ..args[1].clone() };
    let info = SchedulerRuntimeInfo::new(&fusion, &args).unwrap();
    let params = get_pointwise_heuristics(&fusion, &info, None).unwrap();
    assert!(!params.vectorize);
}

#[test_case(&[0, 8]; "empty outer")]
#[test_case(&[8, 0]; "empty inner")]
fn test_empty_fusion_gets_default_params(sizes: &[i64]) {
    let (fusion, _) = elementwise_add();
    let info = runtime_info(&fusion, &[sizes, sizes]);
    let params = get_pointwise_heuristics(&fusion, &info, None).unwrap();
    assert_eq!(params, PointwiseParams::with_index_type(info.index_type()));
}
