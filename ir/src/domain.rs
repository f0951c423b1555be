//! Iteration axes and the transforms between them.
//!
//! Axes live in the [`Fusion`](crate::Fusion) arena and are addressed by
//! [`IdRef`]. Every split, merge or resize creates fresh output axes and an
//! [`IdExpr`] recording where they came from, so the history from a tensor's
//! root domain to its loop domain is an explicit DAG that later passes walk in
//! either direction.

use std::fmt;

use smallvec::{SmallVec, smallvec};

use crate::types::{IterType, ParallelType};
use crate::val::Val;

/// Handle to an iteration axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdRef(pub(crate) u32);

impl IdRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iS{}", self.0)
    }
}

/// Handle to an axis transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdExprRef(pub(crate) u32);

/// One iteration axis.
#[derive(Debug, Clone)]
pub struct IterDomain {
    pub extent: Val,
    pub start: Val,
    pub iter_type: IterType,
    pub parallel_type: ParallelType,
    /// Physical extent of an expanded broadcast.
    pub expanded_extent: Option<Val>,
    pub(crate) definition: Option<IdExprRef>,
    pub(crate) uses: SmallVec<[IdExprRef; 2]>,
}

impl IterDomain {
    pub fn new(extent: Val, iter_type: IterType) -> Self {
        Self {
            extent,
            start: Val::zero(),
            iter_type,
            parallel_type: ParallelType::Serial,
            expanded_extent: None,
            definition: None,
            uses: SmallVec::new(),
        }
    }

    pub fn iteration(extent: Val) -> Self {
        Self::new(extent, IterType::Iteration)
    }

    pub fn reduction(extent: Val) -> Self {
        Self::new(extent, IterType::Reduction)
    }

    pub fn broadcast() -> Self {
        Self::new(Val::one(), IterType::Broadcast)
    }

    pub fn expanded_broadcast(expanded: Val) -> Self {
        Self { expanded_extent: Some(expanded), ..Self::broadcast() }
    }

    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }

    pub fn is_stride(&self) -> bool {
        self.iter_type == IterType::Stride
    }

    pub fn is_device_dim(&self) -> bool {
        self.parallel_type.is_device_dim()
    }

    pub fn is_thread_dim(&self) -> bool {
        self.parallel_type.is_thread_dim()
    }

    pub fn has_expanded_extent(&self) -> bool {
        self.expanded_extent.is_some()
    }

    /// Expanded extent for expanded broadcasts, the plain extent otherwise.
    pub fn maybe_expanded_extent(&self) -> &Val {
        self.expanded_extent.as_ref().unwrap_or(&self.extent)
    }

    pub fn definition(&self) -> Option<IdExprRef> {
        self.definition
    }

    pub fn uses(&self) -> &[IdExprRef] {
        &self.uses
    }
}

/// Transform between iteration axes.
#[derive(Debug, Clone)]
pub enum IdExpr {
    Split { input: IdRef, outer: IdRef, inner: IdRef, factor: Val, inner_split: bool },
    Merge { outer: IdRef, inner: IdRef, output: IdRef },
    /// Pad or slice of an axis; not an affine view of the input.
    Resize { input: IdRef, output: IdRef, left: Val, right: Val },
}

impl IdExpr {
    pub fn inputs(&self) -> SmallVec<[IdRef; 2]> {
        match self {
            Self::Split { input, .. } | Self::Resize { input, .. } => smallvec![*input],
            Self::Merge { outer, inner, .. } => smallvec![*outer, *inner],
        }
    }

    pub fn outputs(&self) -> SmallVec<[IdRef; 2]> {
        match self {
            Self::Split { outer, inner, .. } => smallvec![*outer, *inner],
            Self::Merge { output, .. } | Self::Resize { output, .. } => smallvec![*output],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Split { .. } => "Split",
            Self::Merge { .. } => "Merge",
            Self::Resize { .. } => "Resize",
        }
    }
}

/// The four views of a tensor's transform history.
///
/// `root` is only present when the logical domain was derived from it by a
/// reshape; `allocation` only when the physical layout differs from the
/// logical one.
#[derive(Debug, Clone, Default)]
pub struct TensorDomain {
    pub root: Option<Vec<IdRef>>,
    pub logical: Vec<IdRef>,
    pub allocation: Option<Vec<IdRef>>,
    pub loop_domain: Vec<IdRef>,
}

impl TensorDomain {
    pub fn new(logical: Vec<IdRef>) -> Self {
        Self { root: None, loop_domain: logical.clone(), logical, allocation: None }
    }

    pub fn maybe_root(&self) -> &[IdRef] {
        self.root.as_deref().unwrap_or(&self.logical)
    }

    /// Allocation domain if set, otherwise the logical domain.
    pub fn maybe_allocation(&self) -> &[IdRef] {
        self.allocation.as_deref().unwrap_or(&self.logical)
    }
}
