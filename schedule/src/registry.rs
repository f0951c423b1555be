//! Scheduler registry.
//!
//! Each [`Scheduler`] answers three questions about a fusion: whether its
//! structure is supported at all (compile-time check), whether the concrete
//! arguments are (run-time check), and which parameters to schedule it with.
//! The [`SchedulerRegistry`] runs these checks in priority order and records
//! why candidates were rejected.

use std::collections::HashSet;

use fusor_ir::{ComputeAtMap, Fusion, OpKind, TvRef};
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, instrument};

use crate::error::*;
use crate::expr_eval::ExprEvalScheduler;
use crate::heuristic::{ALL_HEURISTICS_IN_PRIORITY_ORDER, ScheduleHeuristic};
use crate::no_op::NoOpScheduler;
use crate::params::HeuristicParams;
use crate::pointwise::PointWiseScheduler;
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::HeuristicSummary;

/// Outcome of an eligibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Accepted,
    Rejected(String),
}

impl Eligibility {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Accepted => None,
            Self::Rejected(reason) => Some(reason),
        }
    }
}

/// One scheduling strategy.
pub trait Scheduler: Send + Sync {
    fn heuristic(&self) -> ScheduleHeuristic;

    /// Structural check that does not depend on argument values.
    fn can_schedule_compile_time(&self, fusion: &Fusion) -> Eligibility;

    /// Check against concrete arguments. Entries read here are recorded in
    /// `summary` when it is recording.
    fn can_schedule_run_time(
        &self,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        summary: Option<&mut HeuristicSummary>,
    ) -> Result<Eligibility>;

    fn compute_heuristics(
        &self,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        summary: Option<&mut HeuristicSummary>,
    ) -> Result<HeuristicParams>;

    /// Applies `params` to `fusion` in place.
    fn schedule(&self, fusion: &mut Fusion, params: &HeuristicParams) -> Result<()>;
}

/// A chosen heuristic together with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerEntry {
    pub heuristic: ScheduleHeuristic,
    pub params: HeuristicParams,
}

// ============================================================================
// GLOBAL PRECONDITIONS
// ============================================================================

/// `true` when every input and output is reachable from every other through
/// producer/consumer edges.
pub fn is_connected_fusion_graph(fusion: &Fusion) -> bool {
    let terminals: Vec<TvRef> = fusion.inputs().iter().chain(fusion.outputs()).copied().collect();
    let Some(start) = terminals.first().copied() else {
        return true;
    };
    let mut seen = HashSet::from([start]);
    let mut stack = vec![start];
    while let Some(tv) = stack.pop() {
        for next in fusion.producers_of(tv).into_iter().chain(fusion.consumers_of(tv)) {
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    terminals.iter().all(|tv| seen.contains(tv))
}

/// Conditions every heuristic other than `ExprEval` requires.
fn check_global_preconditions(heuristic: ScheduleHeuristic, fusion: &Fusion) -> Eligibility {
    if fusion.has_op(OpKind::is_sdpa) {
        return Eligibility::rejected("SdpaOps are not supported.");
    }
    if heuristic != ScheduleHeuristic::Matmul && fusion.has_op(OpKind::is_matmul_like) {
        return Eligibility::rejected("Matmul ops are not supported.");
    }
    if !is_connected_fusion_graph(fusion) {
        return Eligibility::rejected("Connected fusion graph check failed!");
    }
    if let Some((tv, a, b)) = ComputeAtMap::build(fusion).has_self_mapping() {
        return Eligibility::Rejected(format!("Iter domain graph check failed! {tv} maps {a} to {b}"));
    }
    Eligibility::Accepted
}

// ============================================================================
// REGISTRY
// ============================================================================

pub struct SchedulerRegistry {
    schedulers: Vec<Box<dyn Scheduler>>,
    last_reject: Mutex<Option<(ScheduleHeuristic, String)>>,
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<ScheduleHeuristic> = self.schedulers.iter().map(|s| s.heuristic()).collect();
        f.debug_struct("SchedulerRegistry").field("registered", &registered).finish()
    }
}

impl SchedulerRegistry {
    /// Registry with the ExprEval, NoOp and PointWise schedulers.
    pub fn new() -> Self {
        Self::with_schedulers(vec![Box::new(ExprEvalScheduler), Box::new(NoOpScheduler), Box::new(PointWiseScheduler)])
    }

    pub fn with_schedulers(schedulers: Vec<Box<dyn Scheduler>>) -> Self {
        Self { schedulers, last_reject: Mutex::new(None) }
    }

    pub fn get(&self, heuristic: ScheduleHeuristic) -> Option<&dyn Scheduler> {
        self.schedulers.iter().find(|s| s.heuristic() == heuristic).map(|s| s.as_ref())
    }

    fn scheduler(&self, heuristic: ScheduleHeuristic) -> Result<&dyn Scheduler> {
        self.get(heuristic).ok_or(Error::HeuristicNotRegistered { heuristic })
    }

    /// The most recent rejection, for diagnostics.
    pub fn last_reject(&self) -> Option<(ScheduleHeuristic, String)> {
        self.last_reject.lock().clone()
    }

    fn reject(&self, heuristic: ScheduleHeuristic, reason: &str) -> bool {
        debug!(target: "fusor_schedule::reject", heuristic = %heuristic, reason, "can not schedule");
        *self.last_reject.lock() = Some((heuristic, reason.to_string()));
        false
    }

    /// Whether `heuristic` can schedule `fusion` with the arguments in
    /// `runtime_info`.
    ///
    /// Compile-time checks only run without a summary: a summary exists once
    /// the heuristic was already proposed for this fusion.
    pub fn can_schedule(
        &self,
        heuristic: ScheduleHeuristic,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        summary: Option<&mut HeuristicSummary>,
    ) -> Result<bool> {
        let Some(scheduler) = self.get(heuristic) else {
            return Ok(self.reject(heuristic, "no scheduler is registered"));
        };

        if heuristic == ScheduleHeuristic::ExprEval {
            return Ok(match scheduler.can_schedule_compile_time(fusion) {
                Eligibility::Accepted => true,
                Eligibility::Rejected(reason) => self.reject(heuristic, &reason),
            });
        }

        if summary.is_none() {
            if let Eligibility::Rejected(reason) = check_global_preconditions(heuristic, fusion) {
                return Ok(self.reject(heuristic, &reason));
            }
            if let Eligibility::Rejected(reason) = scheduler.can_schedule_compile_time(fusion) {
                return Ok(self.reject(heuristic, &reason));
            }
        }

        Ok(match scheduler.can_schedule_run_time(fusion, runtime_info, summary)? {
            Eligibility::Accepted => true,
            Eligibility::Rejected(reason) => self.reject(heuristic, &reason),
        })
    }

    /// Computes the parameters of `heuristic` for `fusion`.
    ///
    /// The global preconditions are re-checked and fail hard here: the caller
    /// committed to this heuristic.
    #[instrument(skip_all, fields(heuristic = %heuristic))]
    pub fn make_entry(
        &self,
        heuristic: ScheduleHeuristic,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        summary: Option<&mut HeuristicSummary>,
    ) -> Result<SchedulerEntry> {
        let scheduler = self.scheduler(heuristic)?;
        if heuristic != ScheduleHeuristic::ExprEval
            && let Eligibility::Rejected(reason) = check_global_preconditions(heuristic, fusion)
        {
            return PreconditionFailedSnafu { heuristic, reason }.fail();
        }
        let params = scheduler.compute_heuristics(fusion, runtime_info, summary)?;
        debug!(params = %params, "computed heuristics");
        Ok(SchedulerEntry { heuristic, params })
    }

    /// Applies `entry` to `fusion`.
    #[instrument(skip_all, fields(heuristic = %entry.heuristic))]
    pub fn schedule(&self, fusion: &mut Fusion, entry: &SchedulerEntry) -> Result<()> {
        ensure!(
            entry.params.heuristic() == entry.heuristic,
            ParamsMismatchSnafu { heuristic: entry.heuristic, actual: entry.params.heuristic() }
        );
        self.scheduler(entry.heuristic)?.schedule(fusion, &entry.params)
    }

    /// First heuristic in priority order that accepts `fusion`.
    #[instrument(skip_all)]
    pub fn propose_heuristics(
        &self,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
    ) -> Result<Option<ScheduleHeuristic>> {
        for heuristic in ALL_HEURISTICS_IN_PRIORITY_ORDER {
            if self.can_schedule(heuristic, fusion, runtime_info, None)? {
                debug!(heuristic = %heuristic, "proposed heuristic");
                return Ok(Some(heuristic));
            }
        }
        Ok(None)
    }
}

impl HeuristicSummary {
    /// Records every entry `heuristic` reads for `fusion`, then switches to
    /// replay mode.
    pub fn new(
        registry: &SchedulerRegistry,
        heuristic: ScheduleHeuristic,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
    ) -> Result<Self> {
        let mut summary = Self::recording(heuristic);
        let scheduler = registry.scheduler(heuristic)?;
        scheduler.compute_heuristics(fusion, runtime_info, Some(&mut summary))?;
        scheduler.can_schedule_run_time(fusion, runtime_info, Some(&mut summary))?;
        summary.finish()?;
        Ok(summary)
    }
}
