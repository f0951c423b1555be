//! Annotation types attached to axes, tensors and expressions.

use enumset::{EnumSet, EnumSetType, enum_set};

// ============================================================================
// PARALLELIZATION
// ============================================================================

/// How a loop axis is executed.
#[derive(Debug, Hash, PartialOrd, Ord, Default)]
#[derive(EnumSetType, strum::EnumIter, strum::AsRefStr, strum::Display)]
pub enum ParallelType {
    /// Device (multi-GPU) dimension.
    DIDx,
    BIDz,
    BIDy,
    BIDx,
    TIDz,
    TIDy,
    TIDx,
    Stream,
    Vectorize,
    Unroll,
    Unswitch,
    Mma,
    Bulk,
    Group,
    #[default]
    Serial,
}

/// Grid dimensions.
pub const BLOCK_DIMS: EnumSet<ParallelType> = enum_set!(ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz);

/// Block-local thread dimensions.
pub const THREAD_DIMS: EnumSet<ParallelType> = enum_set!(ParallelType::TIDx | ParallelType::TIDy | ParallelType::TIDz);

impl ParallelType {
    pub fn is_block_dim(self) -> bool {
        BLOCK_DIMS.contains(self)
    }

    pub fn is_thread_dim(self) -> bool {
        THREAD_DIMS.contains(self)
    }

    /// Bound to any grid or block dimension.
    pub fn is_thread(self) -> bool {
        self.is_block_dim() || self.is_thread_dim()
    }

    pub fn is_device_dim(self) -> bool {
        matches!(self, Self::DIDx)
    }

    pub fn is_unroll(self) -> bool {
        matches!(self, Self::Unroll | Self::Unswitch | Self::Vectorize)
    }
}

// ============================================================================
// AXES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::AsRefStr)]
pub enum IterType {
    #[default]
    Iteration,
    Reduction,
    Broadcast,
    /// Placeholder axis produced by strided gathers.
    Stride,
}

/// Equivalence relation used when comparing axes of different tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::AsRefStr)]
pub enum IdMappingMode {
    /// Same extent and kind: broadcasts only map to broadcasts.
    Exact,
    /// Broadcasts also map to the axis they are concretized to.
    Permissive,
    /// Permissive mapping restricted to axes that share a loop after inlining.
    Loop,
}

// ============================================================================
// MEMORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::AsRefStr, strum::Display)]
pub enum MemoryType {
    #[default]
    Local,
    Shared,
    Global,
}

impl MemoryType {
    /// Each value of `pt` sees a distinct slice of the buffer.
    pub fn is_partitioned_across(self, pt: ParallelType) -> bool {
        match self {
            Self::Local => pt.is_thread() || pt.is_device_dim(),
            Self::Shared => pt.is_block_dim() || pt.is_device_dim(),
            Self::Global => pt.is_device_dim(),
        }
    }

    /// Every value of `pt` can address the whole buffer.
    pub fn is_shared_across(self, pt: ParallelType) -> bool {
        match self {
            Self::Local => false,
            Self::Shared => pt.is_thread_dim(),
            Self::Global => pt.is_thread(),
        }
    }
}

/// Cache hint for loads from global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::AsRefStr)]
pub enum CacheOp {
    #[default]
    Unspecified,
    /// Cache at all levels.
    AllLevels,
    /// Cache in L2 only.
    Global,
    /// Evict first.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::AsRefStr)]
pub enum LoadStoreOpType {
    #[default]
    Set,
    SegmenterSet,
    LdMatrix,
    StMatrix,
    CpAsync,
    CpAsyncBulk,
    CpAsyncBulkTensorTile,
}

// ============================================================================
// OPERATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Relu,
    Cast(fusor_dtype::DType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr)]
pub enum TernaryOp {
    Where,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr)]
pub enum ReduceOp {
    Add,
    Mul,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr)]
pub enum MmaArch {
    Turing,
    Ampere,
    Hopper,
}

/// Tensor-core instruction shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmaMacro {
    pub arch: MmaArch,
    pub m: u16,
    pub n: u16,
    pub k: u16,
}

impl MmaMacro {
    pub const AMPERE_16_8_16: Self = Self { arch: MmaArch::Ampere, m: 16, n: 8, k: 16 };
    pub const HOPPER_64_64_16: Self = Self { arch: MmaArch::Hopper, m: 64, n: 64, k: 16 };

    pub fn is_hopper(&self) -> bool {
        self.arch == MmaArch::Hopper
    }
}

// ============================================================================
// OUTPUT ALIASING
// ============================================================================

/// How the runtime materializes a fusion output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::AsRefStr)]
pub enum AllocationType {
    /// Fresh buffer written by the kernel.
    #[default]
    New,
    /// Written in place into the aliased input's buffer.
    ReuseBuffer,
    /// Computed on the host by the expression evaluator, usually as a view.
    Evaluate,
}
