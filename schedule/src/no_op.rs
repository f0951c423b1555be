//! Scheduler for fusions that need no kernel: no expressions at all, or
//! outputs that are empty or only made of broadcast and reduction axes.

use fusor_ir::{Fusion, IdRef, TvRef};

use crate::error::Result;
use crate::heuristic::ScheduleHeuristic;
use crate::params::HeuristicParams;
use crate::registry::{Eligibility, Scheduler};
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::HeuristicSummary;
use crate::utils::mark_aliases;

fn concrete_axes(fusion: &Fusion, tv: TvRef) -> Vec<IdRef> {
    fusion
        .tv(tv)
        .logical_domain()
        .iter()
        .copied()
        .filter(|id| {
            let axis = fusion.id(*id);
            !axis.is_broadcast() && !axis.is_reduction()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpScheduler;

impl Scheduler for NoOpScheduler {
    fn heuristic(&self) -> ScheduleHeuristic {
        ScheduleHeuristic::NoOp
    }

    fn can_schedule_compile_time(&self, fusion: &Fusion) -> Eligibility {
        if fusion.exprs().is_empty() {
            return Eligibility::Accepted;
        }
        // An output whose extents are all known and positive is never empty.
        let never_empty = fusion.outputs().iter().find(|out| {
            let axes = concrete_axes(fusion, **out);
            !axes.is_empty() && axes.iter().all(|id| fusion.id(*id).extent.as_int().is_some_and(|e| e > 0))
        });
        match never_empty {
            Some(out) => Eligibility::Rejected(format!("output {out} has non-empty concrete dimensions")),
            None => Eligibility::Accepted,
        }
    }

    fn can_schedule_run_time(
        &self,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        _summary: Option<&mut HeuristicSummary>,
    ) -> Result<Eligibility> {
        if fusion.exprs().is_empty() {
            return Ok(Eligibility::Accepted);
        }
        for out in fusion.outputs() {
            let axes = concrete_axes(fusion, *out);
            if axes.is_empty() {
                continue;
            }
            let is_empty = axes
                .iter()
                .any(|id| runtime_info.evaluator().evaluate_int(&fusion.id(*id).extent).is_ok_and(|extent| extent == 0));
            if !is_empty {
                return Ok(Eligibility::Rejected(format!("output {out} is not empty")));
            }
        }
        Ok(Eligibility::Accepted)
    }

    fn compute_heuristics(
        &self,
        _fusion: &Fusion,
        _runtime_info: &SchedulerRuntimeInfo,
        _summary: Option<&mut HeuristicSummary>,
    ) -> Result<HeuristicParams> {
        Ok(HeuristicParams::NoOp)
    }

    fn schedule(&self, fusion: &mut Fusion, _params: &HeuristicParams) -> Result<()> {
        mark_aliases(fusion);
        Ok(())
    }
}
