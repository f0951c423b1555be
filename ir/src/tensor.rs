use std::fmt;

use fusor_dtype::DType;

use crate::domain::{IdRef, TensorDomain};
use crate::op::ExprRef;
use crate::types::{AllocationType, MemoryType};
use crate::val::Val;

/// Handle to a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TvRef(pub(crate) u32);

impl TvRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TvRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Positional record of a loop-domain transform, replayable on another tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopTransform {
    Split { axis: usize, factor: Val, inner_split: bool },
    Merge { outer: usize, inner: usize },
    /// `new2old[i]` is the old position of the axis now at `i`.
    Reorder { new2old: Vec<usize> },
}

#[derive(Debug, Clone)]
pub struct TensorView {
    pub name: String,
    pub dtype: DType,
    pub domain: TensorDomain,
    pub memory_type: MemoryType,
    /// Loop axes `[0, compute_at_pos)` are shared with the consumer's loops.
    pub compute_at_pos: usize,
    /// Largest compute-at position of any producer inlined into this tensor.
    pub max_producer_pos: usize,
    /// `1` when not circular-buffered.
    pub circular_buffer_depth: usize,
    pub(crate) definition: Option<ExprRef>,
    pub(crate) uses: Vec<ExprRef>,
    pub(crate) transforms: Vec<LoopTransform>,
}

impl TensorView {
    pub(crate) fn new(name: String, dtype: DType, domain: TensorDomain) -> Self {
        Self {
            name,
            dtype,
            domain,
            memory_type: MemoryType::Local,
            compute_at_pos: 0,
            max_producer_pos: 0,
            circular_buffer_depth: 1,
            definition: None,
            uses: Vec::new(),
            transforms: Vec::new(),
        }
    }

    pub fn n_dims(&self) -> usize {
        self.domain.loop_domain.len()
    }

    /// Loop axis at `pos`.
    pub fn axis(&self, pos: usize) -> Option<IdRef> {
        self.domain.loop_domain.get(pos).copied()
    }

    pub fn loop_domain(&self) -> &[IdRef] {
        &self.domain.loop_domain
    }

    pub fn logical_domain(&self) -> &[IdRef] {
        &self.domain.logical
    }

    pub fn maybe_root_domain(&self) -> &[IdRef] {
        self.domain.maybe_root()
    }

    pub fn has_root(&self) -> bool {
        self.domain.root.is_some()
    }

    pub fn allocation_domain(&self) -> Option<&[IdRef]> {
        self.domain.allocation.as_deref()
    }

    pub fn has_allocation(&self) -> bool {
        self.domain.allocation.is_some()
    }

    pub fn maybe_allocation_domain(&self) -> &[IdRef] {
        self.domain.maybe_allocation()
    }

    pub fn is_circular_buffered(&self) -> bool {
        self.circular_buffer_depth > 1
    }

    pub fn definition(&self) -> Option<ExprRef> {
        self.definition
    }

    pub fn uses(&self) -> &[ExprRef] {
        &self.uses
    }

    /// Loop transforms applied since the loop domain was last reset.
    pub fn transforms(&self) -> &[LoopTransform] {
        &self.transforms
    }
}

/// How an output is related to another fusion input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasInfo {
    pub kind: AllocationType,
    pub aliased_io: Option<TvRef>,
    /// Output only exists to carry an in-place update of `aliased_io`.
    pub hide_output: bool,
}

impl AliasInfo {
    pub fn new_buffer() -> Self {
        Self { kind: AllocationType::New, aliased_io: None, hide_output: false }
    }
}
