use snafu::Snafu;

use fusor_ir::{ExprRef, TvRef};

use crate::kir::NodeId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(context(false), display("IR error: {source}"))]
    Ir { source: fusor_ir::Error },

    /// The allocation pass runs before predicates are lowered into conditionals.
    #[snafu(display("unexpected if-then-else node {node} in the allocation pass"))]
    UnexpectedConditional { node: NodeId },

    /// Reduction axis left of the allocation point of a tensor that is not a terminating output.
    #[snafu(display("invalid computeAt of {tensor}: reduction axis {axis} is outside the computeAt point of a non-output tensor"))]
    ReductionOutsideComputeAt { tensor: TvRef, axis: usize },

    #[snafu(display("could not find the loop following {node} in the loop nest"))]
    LoopNotFound { node: NodeId },

    #[snafu(display("{op} of {tensor} must not be initialized to the non-zero value {value}"))]
    NonZeroAsyncCopyInit { op: &'static str, tensor: TvRef, value: String },

    /// Predicate elimination and the op itself both produced an init value.
    #[snafu(display("{tensor} of {expr} has an init value from both the op and predicate elimination"))]
    ConflictingInitValue { tensor: TvRef, expr: ExprRef },

    #[snafu(display("outputs of {expr} disagree on circular-buffer depth: {expected} vs {actual}"))]
    CircularBufferDepthMismatch { expr: ExprRef, expected: usize, actual: usize },

    #[snafu(display("allocation {node} is already registered"))]
    DuplicateAllocationInfo { node: NodeId },

    /// A compute-at axis excluded from a Hopper MMA output allocation is missing from its allocation domain.
    #[snafu(display("compute-at axes {axes} of {tensor} are not found in its allocation domain"))]
    ExcludedComputeAtAxisNotAllocated { tensor: TvRef, axes: String },

    #[snafu(display("cannot circular-buffer {tensor}: {reason}"))]
    InvalidCircularBufferAxis { tensor: TvRef, reason: String },

    #[snafu(display("no edit anchor {node} in scope {scope:?}"))]
    EditAnchorNotFound { node: NodeId, scope: Option<NodeId> },
}
