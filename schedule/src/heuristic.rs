//! Scheduler kinds and their priority.

/// Kind of scheduler that can claim a fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumIter, strum::AsRefStr, strum::Display)]
pub enum ScheduleHeuristic {
    /// Single op evaluated by a library call on the host side.
    ExprEval,
    NoOp,
    Matmul,
    Reduction,
    InnerPersistent,
    OuterPersistent,
    InnerOuterPersistent,
    Transpose,
    PointWise,
}

/// Order in which [`propose_heuristics`](crate::SchedulerRegistry::propose_heuristics)
/// tries the schedulers; the first one that accepts wins.
pub const ALL_HEURISTICS_IN_PRIORITY_ORDER: [ScheduleHeuristic; 9] = [
    ScheduleHeuristic::ExprEval,
    ScheduleHeuristic::NoOp,
    ScheduleHeuristic::Matmul,
    ScheduleHeuristic::Reduction,
    ScheduleHeuristic::InnerPersistent,
    ScheduleHeuristic::OuterPersistent,
    ScheduleHeuristic::InnerOuterPersistent,
    ScheduleHeuristic::Transpose,
    ScheduleHeuristic::PointWise,
];

impl ScheduleHeuristic {
    pub fn is_persistent(self) -> bool {
        matches!(self, Self::InnerPersistent | Self::OuterPersistent | Self::InnerOuterPersistent)
    }
}
