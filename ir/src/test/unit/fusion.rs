//! Fusion arena and graph query tests.

use fusor_dtype::DType;

use crate::test::helpers::unary_chain;
use crate::{Dim, Fusion, OpKind, UnaryOp, Val, ValKind};

#[test]
fn test_input_extents_are_named_symbols() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Fixed(8), Dim::Broadcast]);
    let logical = fusion.tv(tv0).logical_domain().to_vec();

    assert!(matches!(fusion.id(logical[0]).extent.kind(), ValKind::Symbol(name) if name == "T0.size0"));
    assert_eq!(fusion.id(logical[1]).extent, Val::int(8));
    assert!(fusion.id(logical[2]).is_broadcast());
    assert_eq!(fusion.tv(tv0).memory_type, crate::MemoryType::Global);
}

#[test]
fn test_exprs_are_topological() {
    let (fusion, [tv0, tv1, tv2]) = unary_chain();
    let exprs = fusion.exprs();
    assert_eq!(exprs.len(), 2);
    assert_eq!(fusion.expr(exprs[0]).outputs, vec![tv1]);
    assert_eq!(fusion.expr(exprs[1]).outputs, vec![tv2]);
    assert_eq!(fusion.all_tvs(), vec![tv0, tv1, tv2]);
}

#[test]
fn test_producers_and_consumers() {
    let (fusion, [tv0, tv1, tv2]) = unary_chain();
    assert_eq!(fusion.producers_of(tv1), vec![tv0]);
    assert_eq!(fusion.consumers_of(tv1), vec![tv2]);
    assert!(fusion.producers_of(tv0).is_empty());
}

#[test]
fn test_terminating_outputs_skip_consumed_outputs() {
    let (mut fusion, [_, tv1, tv2]) = unary_chain();
    fusion.add_output(tv1);
    assert_eq!(fusion.terminating_outputs(), vec![tv2]);
}

#[test]
fn test_dead_exprs_are_ignored() {
    let (mut fusion, [tv0, _, _]) = unary_chain();
    let dead = fusion.unary(UnaryOp::Abs, tv0);
    assert!(!fusion.exprs().iter().any(|e| fusion.expr(*e).outputs.contains(&dead)));
    assert!(!fusion.has_op(|kind| matches!(kind, OpKind::Unary(UnaryOp::Abs))));
}

#[test]
fn test_exprs_between_follows_transform_history() {
    let (mut fusion, [_, tv1, _]) = unary_chain();
    let logical = fusion.tv(tv1).logical_domain().to_vec();
    fusion.merge(tv1, 0, 1).unwrap();
    fusion.split(tv1, 0, 128, true).unwrap();

    let exprs = fusion.exprs_between(&logical, fusion.tv(tv1).loop_domain());
    let names: Vec<_> = exprs.iter().map(|e| fusion.id_expr(*e).name()).collect();
    assert_eq!(names, ["Merge", "Split"]);

    let between = fusion.ids_between(&logical, fusion.tv(tv1).loop_domain());
    assert_eq!(between.len(), 5);
}
