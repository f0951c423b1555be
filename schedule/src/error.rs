use snafu::Snafu;

use fusor_ir::TvRef;

use crate::heuristic::ScheduleHeuristic;
use crate::summary::EntryType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(context(false), display("IR error: {source}"))]
    Ir { source: fusor_ir::Error },

    #[snafu(display("no valid reference tensor found for the {heuristic} scheduler"))]
    NoReferenceTensor { heuristic: ScheduleHeuristic },

    /// Left and right axis groups of the break point share an ancestor.
    #[snafu(display("left and right axes of {tensor} at break point {break_point} are not disjoint"))]
    BreakPointGroupsNotDisjoint { tensor: TvRef, break_point: usize },

    #[snafu(display("no axis of {tensor} falls right of break point {break_point}"))]
    EmptyRightGroup { tensor: TvRef, break_point: usize },

    /// A required entry was not produced while recording.
    #[snafu(display("{heuristic} summary is missing the {entry} entry"))]
    MissingSummaryEntry { heuristic: ScheduleHeuristic, entry: EntryType },

    /// Replay mode never computes; every entry must have been recorded.
    #[snafu(display("{entry} was not recorded for the {heuristic} summary"))]
    SummaryReplayMiss { heuristic: ScheduleHeuristic, entry: EntryType },

    #[snafu(display("no scheduler is registered for {heuristic}"))]
    HeuristicNotRegistered { heuristic: ScheduleHeuristic },

    /// Graph-level precondition violated when a heuristic is forced.
    #[snafu(display("{heuristic} can not schedule this fusion: {reason}"))]
    PreconditionFailed { heuristic: ScheduleHeuristic, reason: String },

    #[snafu(display("{heuristic} scheduler was given {actual} parameters"))]
    ParamsMismatch { heuristic: ScheduleHeuristic, actual: ScheduleHeuristic },
}
