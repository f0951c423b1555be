//! Pointwise scheduler.
//!
//! Claims fusions without reductions whose outputs share one iteration
//! space. The reference output is flattened to one axis, or to two axes split
//! at a break point when broadcasts make a 2-D traversal move fewer bytes,
//! and every other tensor follows the reference's loop structure.

mod heuristics;
mod schedule;

pub use heuristics::get_pointwise_heuristics;
pub use schedule::schedule_pointwise;

use enumset::EnumSet;
use fusor_ir::{ComputeAtMap, Fusion, IdMappingMode, OpKind, ParallelType, TvRef};

use crate::domain_map::DomainMap;
use crate::error::*;
use crate::heuristic::ScheduleHeuristic;
use crate::params::HeuristicParams;
use crate::registry::{Eligibility, Scheduler};
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::{HeuristicSummary, entry};
use crate::transpose;
use crate::utils::has_view_ops;

/// Reference output of a pointwise schedule, if the fusion has one.
pub fn reference_tensor_view(fusion: &Fusion) -> Option<TvRef> {
    DomainMap::new(fusion).find_reference_tensor_view(fusion, 0)
}

fn device_types(fusion: &Fusion, tv: TvRef) -> EnumSet<ParallelType> {
    fusion
        .tv(tv)
        .loop_domain()
        .iter()
        .map(|id| fusion.id(*id).parallel_type)
        .filter(|pt| pt.is_device_dim())
        .collect()
}

/// `true` when some expression moves data between devices: a producer and
/// consumer disagree on their device-parallel axes.
pub fn is_resharding(fusion: &Fusion) -> bool {
    fusion.exprs().into_iter().any(|e| {
        let expr = fusion.expr(e);
        expr.tensor_inputs().any(|input| {
            let producer = device_types(fusion, input);
            expr.outputs.iter().any(|out| device_types(fusion, *out) != producer)
        })
    })
}

/// A reshape consuming another reshape's output can not be replayed
/// backwards onto the producers.
pub fn requires_forward_view_replay(fusion: &Fusion) -> bool {
    fusion.exprs().into_iter().any(|e| {
        let expr = fusion.expr(e);
        matches!(expr.kind, OpKind::View)
            && expr
                .tensor_inputs()
                .filter_map(|input| fusion.tv(input).definition())
                .any(|def| matches!(fusion.expr(def).kind, OpKind::View))
    })
}

/// `true` when a broadcast axis is concretized to axes that are not exactly
/// mapped to each other, i.e. might broadcast to several sizes.
pub fn has_non_unique_broadcast(fusion: &Fusion, ca_map: &ComputeAtMap) -> bool {
    fusion.id_refs().filter(|id| fusion.id(*id).is_broadcast()).any(|id| {
        let mut concrete =
            ca_map.disjoint_set(id, IdMappingMode::Permissive).iter().copied().filter(|m| !fusion.id(*m).is_broadcast());
        let Some(first) = concrete.next() else {
            return false;
        };
        concrete.any(|other| !ca_map.are_mapped(first, other, IdMappingMode::Exact))
    })
}

/// Gathers read their lookup table in place, so it has to be a fusion input.
fn gather_lookup_not_input(fusion: &Fusion) -> Option<TvRef> {
    fusion.exprs().into_iter().find_map(|e| {
        let expr = fusion.expr(e);
        if !matches!(expr.kind, OpKind::IndexSelect { .. }) {
            return None;
        }
        expr.tensor_inputs().next().filter(|lookup| !fusion.is_input(*lookup))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PointWiseScheduler;

impl Scheduler for PointWiseScheduler {
    fn heuristic(&self) -> ScheduleHeuristic {
        ScheduleHeuristic::PointWise
    }

    fn can_schedule_compile_time(&self, fusion: &Fusion) -> Eligibility {
        if fusion.exprs().is_empty() || fusion.outputs().is_empty() {
            return Eligibility::rejected("Fusion has no expressions to schedule.");
        }
        if is_resharding(fusion) {
            return Eligibility::rejected("Fusion is resharding.");
        }
        if reference_tensor_view(fusion).is_none() {
            return Eligibility::rejected("cannot find reference tensor");
        }
        if let Some(lookup) = gather_lookup_not_input(fusion) {
            return Eligibility::Rejected(format!("{lookup} is gathered from but is not a fusion input"));
        }
        if has_view_ops(fusion) && requires_forward_view_replay(fusion) {
            return Eligibility::rejected("Fusion requires view being reversible.");
        }
        if fusion.has_op(OpKind::is_reduction) {
            return Eligibility::rejected("no support for reduction ops");
        }
        if has_non_unique_broadcast(fusion, &ComputeAtMap::build(fusion)) {
            return Eligibility::rejected("Broadcasting dimension might be broadcasting to multiple sizes.");
        }
        Eligibility::Accepted
    }

    fn can_schedule_run_time(
        &self,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        mut summary: Option<&mut HeuristicSummary>,
    ) -> Result<Eligibility> {
        let transpose_feasible = HeuristicSummary::entry::<entry::CanScheduleTranspose>(summary.as_deref_mut(), || {
            Ok(transpose::can_schedule_transpose(fusion))
        })?;
        if !*transpose_feasible {
            return Ok(Eligibility::Accepted);
        }
        // Only take a transpose candidate when the transpose scheduler would not.
        Ok(match transpose::runtime_reject_reason(fusion, runtime_info, summary)? {
            Some(_) => Eligibility::Accepted,
            None => Eligibility::rejected("the transpose scheduler accepts this fusion"),
        })
    }

    fn compute_heuristics(
        &self,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        summary: Option<&mut HeuristicSummary>,
    ) -> Result<HeuristicParams> {
        get_pointwise_heuristics(fusion, runtime_info, summary).map(HeuristicParams::PointWise)
    }

    fn schedule(&self, fusion: &mut Fusion, params: &HeuristicParams) -> Result<()> {
        let Some(params) = params.as_pointwise() else {
            return ParamsMismatchSnafu { heuristic: ScheduleHeuristic::PointWise, actual: params.heuristic() }.fail();
        };
        schedule_pointwise(fusion, params)
    }
}
