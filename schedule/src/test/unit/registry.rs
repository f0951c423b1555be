//! Scheduler registry tests: priority order, rejection reasons and forced
//! heuristics.

use fusor_dtype::DType;
use fusor_ir::{AllocationType, Dim, Fusion, UnaryOp};
use test_case::test_case;

use crate::error::Error;
use crate::heuristic::ScheduleHeuristic;
use crate::params::{HeuristicParams, PointwiseParams};
use crate::registry::*;
use crate::test::helpers::*;
use crate::transpose::can_schedule_transpose;

fn propose(fusion: &Fusion, sizes: &[&[i64]]) -> (SchedulerRegistry, Option<ScheduleHeuristic>) {
    let registry = SchedulerRegistry::new();
    let info = runtime_info(fusion, sizes);
    let proposed = registry.propose_heuristics(fusion, &info).unwrap();
    (registry, proposed)
}

fn disconnected() -> Fusion {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv1 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    let tv2 = fusion.unary(UnaryOp::Neg, tv0);
    let tv3 = fusion.unary(UnaryOp::Neg, tv1);
    fusion.add_output(tv2);
    fusion.add_output(tv3);
    fusion
}

fn passthrough() -> Fusion {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic]);
    fusion.add_output(tv0);
    fusion
}

// ============================================================================
// Proposal
// ============================================================================

#[test]
fn test_elementwise_is_pointwise() {
    let (fusion, _) = elementwise_add();
    let (_, proposed) = propose(&fusion, &[&[64, 64], &[64, 64]]);
    assert_eq!(proposed, Some(ScheduleHeuristic::PointWise));
}

#[test]
fn test_single_matmul_is_evaluated() {
    let fusion = single_matmul();
    let (_, proposed) = propose(&fusion, &[&[16, 32], &[32, 8]]);
    assert_eq!(proposed, Some(ScheduleHeuristic::ExprEval));
}

#[test]
fn test_passthrough_is_no_op() {
    let fusion = passthrough();
    let (_, proposed) = propose(&fusion, &[&[16]]);
    assert_eq!(proposed, Some(ScheduleHeuristic::NoOp));
}

#[test_case(&[0, 8]; "empty outer")]
#[test_case(&[8, 0]; "empty inner")]
fn test_empty_output_is_no_op(sizes: &[i64]) {
    let (fusion, _) = elementwise_add();
    let (_, proposed) = propose(&fusion, &[sizes, sizes]);
    assert_eq!(proposed, Some(ScheduleHeuristic::NoOp));
}

#[test]
fn test_reduction_has_no_scheduler() {
    let fusion = row_sum();
    let (registry, proposed) = propose(&fusion, &[&[32, 32]]);
    assert_eq!(proposed, None);
    assert_eq!(
        registry.last_reject(),
        Some((ScheduleHeuristic::PointWise, "no support for reduction ops".to_string()))
    );
}

#[test]
fn test_matmul_with_epilogue_is_rejected() {
    let mut fusion = single_matmul();
    let c = fusion.outputs()[0];
    let d = fusion.unary(UnaryOp::Relu, c);
    fusion.add_output(d);

    let (registry, proposed) = propose(&fusion, &[&[16, 32], &[32, 8]]);
    assert_eq!(proposed, None);
    assert_eq!(
        registry.last_reject(),
        Some((ScheduleHeuristic::PointWise, "Matmul ops are not supported.".to_string()))
    );
}

#[test]
fn test_disconnected_graph_is_rejected() {
    let fusion = disconnected();
    assert!(!is_connected_fusion_graph(&fusion));
    let (registry, proposed) = propose(&fusion, &[&[16], &[16]]);
    assert_eq!(proposed, None);
    assert_eq!(
        registry.last_reject(),
        Some((ScheduleHeuristic::PointWise, "Connected fusion graph check failed!".to_string()))
    );
}

#[test]
fn test_connected_graph() {
    let (fusion, _) = outer_broadcast_add();
    assert!(is_connected_fusion_graph(&fusion));
    assert!(is_connected_fusion_graph(&Fusion::new()));
}

#[test]
fn test_unregistered_heuristic_is_rejected() {
    let (fusion, _) = elementwise_add();
    let registry = SchedulerRegistry::new();
    let info = runtime_info(&fusion, &[&[8, 8], &[8, 8]]);
    assert!(!registry.can_schedule(ScheduleHeuristic::Reduction, &fusion, &info, None).unwrap());
    assert_eq!(
        registry.last_reject(),
        Some((ScheduleHeuristic::Reduction, "no scheduler is registered".to_string()))
    );
}

#[test]
fn test_permuted_output_defers_to_pointwise() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.permute(tv0, &[1, 0]).unwrap();
    let tv2 = fusion.unary(UnaryOp::Neg, tv1);
    fusion.add_output(tv2);

    assert!(can_schedule_transpose(&fusion));
    let (_, proposed) = propose(&fusion, &[&[64, 64]]);
    assert_eq!(proposed, Some(ScheduleHeuristic::PointWise));
}

#[test]
fn test_elementwise_is_not_transpose() {
    let (fusion, _) = outer_broadcast_add();
    assert!(!can_schedule_transpose(&fusion));
}

// ============================================================================
// Forced heuristics
// ============================================================================

#[test]
fn test_forced_pointwise_on_matmul_fails() {
    let fusion = single_matmul();
    let registry = SchedulerRegistry::new();
    let info = runtime_info(&fusion, &[&[16, 32], &[32, 8]]);
    let err = registry.make_entry(ScheduleHeuristic::PointWise, &fusion, &info, None).unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed { heuristic: ScheduleHeuristic::PointWise, .. }));
}

#[test]
fn test_make_entry_of_unregistered_heuristic() {
    let (fusion, _) = elementwise_add();
    let registry = SchedulerRegistry::new();
    let info = runtime_info(&fusion, &[&[8, 8], &[8, 8]]);
    let err = registry.make_entry(ScheduleHeuristic::Transpose, &fusion, &info, None).unwrap_err();
    assert!(matches!(err, Error::HeuristicNotRegistered { heuristic: ScheduleHeuristic::Transpose }));
}

#[test]
fn test_schedule_rejects_mismatched_entry() {
    let (mut fusion, _) = elementwise_add();
    let registry = SchedulerRegistry::new();
    let entry = SchedulerEntry { heuristic: ScheduleHeuristic::NoOp, params: HeuristicParams::PointWise(PointwiseParams::default()) };
    let err = registry.schedule(&mut fusion, &entry).unwrap_err();
    assert!(matches!(
        err,
        Error::ParamsMismatch { heuristic: ScheduleHeuristic::NoOp, actual: ScheduleHeuristic::PointWise }
    ));
}

#[test]
fn test_make_entry_then_schedule() {
    let (mut fusion, _) = elementwise_add();
    let registry = SchedulerRegistry::new();
    let info = runtime_info(&fusion, &[&[256, 256], &[256, 256]]);
    let entry = registry.make_entry(ScheduleHeuristic::PointWise, &fusion, &info, None).unwrap();
    assert_eq!(entry.params.heuristic(), ScheduleHeuristic::PointWise);
    registry.schedule(&mut fusion, &entry).unwrap();
}

#[test]
fn test_expr_eval_outputs_are_evaluated() {
    let mut fusion = single_matmul();
    let registry = SchedulerRegistry::new();
    let info = runtime_info(&fusion, &[&[16, 32], &[32, 8]]);
    let entry = registry.make_entry(ScheduleHeuristic::ExprEval, &fusion, &info, None).unwrap();
    registry.schedule(&mut fusion, &entry).unwrap();

    let out = fusion.outputs()[0];
    assert_eq!(fusion.output_alias(out).kind, AllocationType::Evaluate);
    assert_eq!(fusion.output_alias(out).aliased_io, None);
}

#[test]
fn test_no_op_aliases_passthrough_output() {
    let mut fusion = passthrough();
    let registry = SchedulerRegistry::new();
    let info = runtime_info(&fusion, &[&[16]]);
    let entry = registry.make_entry(ScheduleHeuristic::NoOp, &fusion, &info, None).unwrap();
    registry.schedule(&mut fusion, &entry).unwrap();

    let out = fusion.outputs()[0];
    assert_eq!(fusion.output_alias(out).kind, AllocationType::Evaluate);
    assert_eq!(fusion.output_alias(out).aliased_io, Some(out));
}

// ============================================================================
// Eligibility
// ============================================================================

#[test]
fn test_eligibility_accessors() {
    assert!(Eligibility::Accepted.is_accepted());
    assert_eq!(Eligibility::Accepted.reason(), None);
    let rejected = Eligibility::rejected("too small");
    assert!(!rejected.is_accepted());
    assert_eq!(rejected.reason(), Some("too small"));
}

#[test]
fn test_registry_debug_lists_schedulers() {
    let registry = SchedulerRegistry::new();
    assert_eq!(format!("{registry:?}"), "SchedulerRegistry { registered: [ExprEval, NoOp, PointWise] }");
}
