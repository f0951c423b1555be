//! Scheduler for a single op evaluated by a library call (matmul, linear,
//! attention). No kernel is generated; outputs are produced by the host-side
//! expression evaluator.

use fusor_ir::{AliasInfo, AllocationType, Fusion};
use tracing::trace;

use crate::error::Result;
use crate::heuristic::ScheduleHeuristic;
use crate::params::HeuristicParams;
use crate::registry::{Eligibility, Scheduler};
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::HeuristicSummary;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvalScheduler;

impl Scheduler for ExprEvalScheduler {
    fn heuristic(&self) -> ScheduleHeuristic {
        ScheduleHeuristic::ExprEval
    }

    fn can_schedule_compile_time(&self, fusion: &Fusion) -> Eligibility {
        let exprs = fusion.exprs();
        let [expr] = exprs.as_slice() else {
            return Eligibility::Rejected(format!("fusion has {} expressions, expected exactly one", exprs.len()));
        };
        let kind = &fusion.expr(*expr).kind;
        if kind.is_library_call() {
            Eligibility::Accepted
        } else {
            Eligibility::rejected("only matmul, linear and sdpa ops are evaluated on the host")
        }
    }

    fn can_schedule_run_time(
        &self,
        _fusion: &Fusion,
        _runtime_info: &SchedulerRuntimeInfo,
        _summary: Option<&mut HeuristicSummary>,
    ) -> Result<Eligibility> {
        Ok(Eligibility::Accepted)
    }

    fn compute_heuristics(
        &self,
        _fusion: &Fusion,
        _runtime_info: &SchedulerRuntimeInfo,
        _summary: Option<&mut HeuristicSummary>,
    ) -> Result<HeuristicParams> {
        Ok(HeuristicParams::ExprEval)
    }

    fn schedule(&self, fusion: &mut Fusion, _params: &HeuristicParams) -> Result<()> {
        for out in fusion.outputs().to_vec() {
            trace!(output = %out, "evaluated on the host");
            fusion.set_alias(out, AliasInfo { kind: AllocationType::Evaluate, aliased_io: None, hide_output: false });
        }
        Ok(())
    }
}
