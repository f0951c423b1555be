use snafu::Snafu;

use crate::types::IterType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Axis index outside of a tensor's loop domain.
    #[snafu(display("axis {axis} is out of range for {tensor} with {ndims} loop axes"))]
    AxisOutOfRange { tensor: String, axis: i64, ndims: usize },

    /// Loop axes left of the compute-at position are owned by the consumer.
    #[snafu(display("cannot transform axis {axis} of {tensor}: it is inside the compute-at position {compute_at}"))]
    TransformInsideComputeAt { tensor: String, axis: usize, compute_at: usize },

    #[snafu(display("split factor {factor} for {tensor} must be a positive integer"))]
    InvalidSplitFactor { tensor: String, factor: String },

    #[snafu(display("cannot merge axis {axis} of {tensor} with itself"))]
    MergeSameAxis { tensor: String, axis: usize },

    #[snafu(display("cannot merge {outer:?} axis with {inner:?} axis in {tensor}"))]
    MergeIterTypeMismatch { tensor: String, outer: IterType, inner: IterType },

    #[snafu(display("invalid reorder of {tensor}: {reason}"))]
    InvalidReorder { tensor: String, reason: String },

    #[snafu(display("compute-at position {position} exceeds the {ndims} loop axes of {tensor}"))]
    InvalidComputeAt { tensor: String, position: usize, ndims: usize },

    #[snafu(display("allocation domain of {tensor} is invalid: {reason}"))]
    InvalidAllocationDomain { tensor: String, reason: String },

    /// Operand shapes or kinds do not fit the operation being built.
    #[snafu(display("cannot build {op}: {reason}"))]
    InvalidOperands { op: &'static str, reason: String },

    /// Symbolic value that the evaluator has no binding for.
    #[snafu(display("could not resolve the value of {value}"))]
    UnresolvedValue { value: String },

    #[snafu(display("division by zero while evaluating {value}"))]
    DivisionByZero { value: String },

    #[snafu(display("expected {expected} tensor arguments for the fusion inputs, got {actual}"))]
    InputCount { expected: usize, actual: usize },

    #[snafu(display("argument for {tensor} has rank {actual}, expected {expected}"))]
    InputRank { tensor: String, expected: usize, actual: usize },

    #[snafu(display("conflicting bindings for {symbol}: {existing} and {new}"))]
    ConflictingBinding { symbol: String, existing: i64, new: i64 },
}
