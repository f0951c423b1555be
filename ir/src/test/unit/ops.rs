//! Graph-building operation tests.

use fusor_dtype::DType;

use crate::test::helpers::extent_of;
use crate::{Dim, Error, Fusion, IdExpr, OpKind, Val, WelfordInit, WelfordRole};

// =========================================================================
// Elementwise
// =========================================================================

#[test]
fn test_elementwise_takes_extent_from_non_broadcast_operand() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Broadcast, Dim::Fixed(10)]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Fixed(4), Dim::Fixed(10)]);
    let tv2 = fusion.add(tv0, tv1).unwrap();

    let logical = fusion.tv(tv2).logical_domain().to_vec();
    assert!(!fusion.id(logical[0]).is_broadcast());
    assert_eq!(extent_of(&fusion, logical[0]), 4);
    assert_eq!(extent_of(&fusion, logical[1]), 10);
}

#[test]
fn test_elementwise_of_broadcasts_stays_broadcast() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Broadcast]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Expanded]);
    let tv2 = fusion.add(tv0, tv1).unwrap();

    let axis = fusion.id(fusion.tv(tv2).logical_domain()[0]);
    assert!(axis.is_broadcast());
    assert!(axis.has_expanded_extent());
}

#[test]
fn test_elementwise_rank_mismatch() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    assert!(matches!(fusion.add(tv0, tv1), Err(Error::InvalidOperands { op: "Binary", .. })));
}

// =========================================================================
// Reductions
// =========================================================================

#[test]
fn test_sum_marks_reduction_axes() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(4), Dim::Fixed(8)]);
    let tv1 = fusion.sum(tv0, &[1]).unwrap();

    let logical = fusion.tv(tv1).logical_domain().to_vec();
    assert!(!fusion.id(logical[0]).is_reduction());
    assert!(fusion.id(logical[1]).is_reduction());
    assert!(fusion.has_reduction(tv1));

    let def = fusion.tv(tv1).definition().unwrap();
    assert!(matches!(&fusion.expr(def).kind, OpKind::Reduction { init, .. } if init.is_zero()));

    // Consumers only see the surviving axis.
    let tv2 = fusion.set(tv1);
    assert_eq!(fusion.tv(tv2).n_dims(), 1);
}

#[test]
fn test_reduction_axis_out_of_range() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    assert!(fusion.sum(tv0, &[1]).is_err());
    assert!(fusion.sum(tv0, &[]).is_err());
}

#[test]
fn test_welford_outputs() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let init = WelfordInit { n: Val::int(1), ..Default::default() };
    let [avg, var, n] = fusion.welford(tv0, &[1], init).unwrap();

    assert_eq!(fusion.tv(n).dtype, DType::Index);
    assert_eq!(fusion.tv(avg).definition(), fusion.tv(var).definition());

    let def = fusion.tv(avg).definition().unwrap();
    let OpKind::Welford(init) = &fusion.expr(def).kind else { panic!("expected a Welford") };
    assert_eq!(init.for_role(WelfordRole::Avg), Val::float(0.0));
    assert_eq!(init.for_role(WelfordRole::N), Val::int(1));
}

#[test]
fn test_grouped_welford_init_by_output() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let inits = vec![WelfordInit::default(), WelfordInit { var: Some(Val::float(2.0)), ..Default::default() }];
    let outs = fusion.grouped_welford(&[tv0, tv1], &[0], inits).unwrap();
    assert_eq!(outs.len(), 6);

    let kind = &fusion.expr(fusion.tv(outs[0]).definition().unwrap()).kind;
    assert_eq!(kind.grouped_welford_init(4), Some(Val::float(2.0)));
    assert_eq!(kind.grouped_welford_init(5), Some(Val::zero()));
    assert_eq!(kind.grouped_welford_init(6), None);
}

// =========================================================================
// Shape operations
// =========================================================================

#[test]
fn test_broadcast_inserts_axes() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(3)]);
    let tv1 = fusion.broadcast(tv0, &[true, false, true]).unwrap();

    let kinds: Vec<bool> = fusion.tv(tv1).logical_domain().iter().map(|id| fusion.id(*id).is_broadcast()).collect();
    assert_eq!(kinds, [true, false, true]);
    assert!(fusion.broadcast(tv0, &[true, true]).is_err());
}

#[test]
fn test_squeeze_requires_broadcast() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Broadcast, Dim::Fixed(3)]);
    let tv1 = fusion.squeeze(tv0, &[true, false]).unwrap();
    assert_eq!(fusion.tv(tv1).n_dims(), 1);
    assert!(fusion.squeeze(tv0, &[false, true]).is_err());
}

#[test]
fn test_permute() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(2), Dim::Fixed(3), Dim::Fixed(5)]);
    let tv1 = fusion.permute(tv0, &[2, 0, 1]).unwrap();
    let extents: Vec<i64> = fusion.tv(tv1).logical_domain().iter().map(|id| extent_of(&fusion, *id)).collect();
    assert_eq!(extents, [5, 2, 3]);
    assert!(fusion.permute(tv0, &[0, 0, 1]).is_err());
}

#[test]
fn test_view_split_records_root() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(12)]);
    let tv1 = fusion.view_split(tv0, 0, 4).unwrap();

    let view = fusion.tv(tv1);
    assert!(view.has_root());
    assert_eq!(view.maybe_root_domain().len(), 1);
    assert_eq!(view.logical_domain().len(), 2);

    let def = fusion.id(view.logical_domain()[0]).definition().unwrap();
    assert!(matches!(fusion.id_expr(def), IdExpr::Split { inner_split: true, .. }));
    assert_eq!(extent_of(&fusion, view.logical_domain()[0]), 3);
    assert_eq!(extent_of(&fusion, view.logical_domain()[1]), 4);
}

#[test]
fn test_view_merge() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(3), Dim::Fixed(4), Dim::Fixed(5)]);
    let tv1 = fusion.view_merge(tv0, 1).unwrap();
    let extents: Vec<i64> = fusion.tv(tv1).logical_domain().iter().map(|id| extent_of(&fusion, *id)).collect();
    assert_eq!(extents, [3, 20]);
    assert!(fusion.view_merge(tv0, 2).is_err());
}

#[test]
fn test_pad_and_slice_resize() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(8)]);
    let padded = fusion.pad(tv0, 0, Val::int(1), Val::int(2)).unwrap();
    assert_eq!(extent_of(&fusion, fusion.tv(padded).logical_domain()[0]), 11);

    let sliced = fusion.slice(tv0, 0, Val::int(2), Val::int(6)).unwrap();
    assert_eq!(extent_of(&fusion, fusion.tv(sliced).logical_domain()[0]), 4);
}

#[test]
fn test_mma_output_shape() {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(DType::Float16, &[Dim::Fixed(64), Dim::Broadcast, Dim::Fixed(16)]);
    let b = fusion.add_input(DType::Float16, &[Dim::Broadcast, Dim::Fixed(64), Dim::Fixed(16)]);
    let out = fusion.mma(a, b, crate::MmaMacro::HOPPER_64_64_16, None).unwrap();

    let logical = fusion.tv(out).logical_domain().to_vec();
    assert_eq!(extent_of(&fusion, logical[1]), 64);
    assert!(fusion.id(logical[2]).is_reduction());
    assert_eq!(fusion.tv(out).dtype, DType::Float32);
}
