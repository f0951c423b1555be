//! Error types for buffer shapes and output allocation.

use snafu::Snafu;

use fusor_dtype::DType;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while sizing or allocating buffers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(context(false), display("IR error: {source}"))]
    Ir { source: fusor_ir::Error },

    #[snafu(display("size is assumed non-negative but received {size}"))]
    NegativeSize { size: i64 },

    #[snafu(display("{what}: expected {expected} entries, got {actual}"))]
    RankMismatch { what: &'static str, expected: usize, actual: usize },

    /// An extent of a buffer does not resolve against the bound arguments.
    #[snafu(display("could not infer {size} for the buffer {tensor}: {source}"))]
    UnresolvedSize { tensor: String, size: String, source: fusor_ir::Error },

    /// Only splits and merges relate an allocation domain to its logical domain.
    #[snafu(display("unsupported {transform} in the allocation domain of {tensor}"))]
    UnsupportedTransformation { tensor: String, transform: &'static str },

    #[snafu(display("axes {missing:?} of the logical domain of {tensor} are not reachable from its allocation domain"))]
    UnreachableLogicalAxes { tensor: String, missing: Vec<String> },

    #[snafu(display("view of sizes {sizes:?} with strides {strides:?} as {target:?} is not possible without a copy"))]
    NotViewable { sizes: Vec<i64>, strides: Vec<i64>, target: Vec<i64> },

    #[snafu(display("shape {target:?} is invalid for a tensor of {numel} elements"))]
    InvalidShape { target: Vec<i64>, numel: i64 },

    #[snafu(display("{dims:?} is not a permutation of rank {rank}"))]
    InvalidPermutation { dims: Vec<usize>, rank: usize },

    #[snafu(display("cannot expand axis {axis} of size {size} to {target}"))]
    InvalidExpand { axis: usize, size: i64, target: i64 },

    #[snafu(display("cannot squeeze axis {axis} of size {size}"))]
    InvalidSqueeze { axis: usize, size: i64 },

    #[snafu(display("index {index:?} is out of bounds for sizes {sizes:?}"))]
    IndexOutOfBounds { index: Vec<i64>, sizes: Vec<i64> },

    #[snafu(display("no fill pattern for {dtype}"))]
    UnsupportedFillType { dtype: DType },

    #[snafu(display("shared memory address is not set for buffer {tensor}"))]
    MissingSmemAddress { tensor: String },

    #[snafu(display("failed to evaluate {what} {value} of shared memory buffer {tensor}: {source}"))]
    UnresolvedSmemValue { tensor: String, what: &'static str, value: String, source: fusor_ir::Error },

    /// Aliases are only resolved against tensors that exist outside the kernel.
    #[snafu(display("{aliased} aliased by {output} is expected to be a fusion input or output"))]
    AliasNotFusionIo { output: String, aliased: String },

    #[snafu(display("no tensor is bound to {tensor}"))]
    UnboundTensor { tensor: String },

    #[snafu(display("{output} reuses the buffer of an aliased tensor but names none"))]
    MissingAliasedIo { output: String },

    #[snafu(display("{tensor} was evaluated with sizes {actual:?} but its buffer has sizes {expected:?}"))]
    LayoutMismatch { tensor: String, expected: Vec<i64>, actual: Vec<i64> },

    #[snafu(display("failed to evaluate {output} as an alias of {aliased}"))]
    NotAnAlias { output: String, aliased: String },

    /// Host evaluation only reproduces metadata operations.
    #[snafu(display("cannot evaluate {tensor} on the host: {reason}"))]
    NotHostEvaluable { tensor: String, reason: String },

    #[snafu(display("kernel requests {requested} bytes of dynamic shared memory but the device allows {available}"))]
    SharedMemoryExceeded { requested: i64, available: i64 },

    #[snafu(display("asynchronous copies need compute capability 8.0 or newer, found {major}.{minor}"))]
    CpAsyncUnsupported { major: u32, minor: u32 },

    /// The kernel was compiled for vector accesses the argument cannot serve.
    #[snafu(display("{tensor} cannot be accessed {vector_bytes} bytes at a time: {reason}"))]
    MisalignedVectorAccess { tensor: String, vector_bytes: usize, reason: String },
}
