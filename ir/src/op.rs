//! Tensor expressions.
//!
//! [`OpKind`] is a closed enum: passes that must treat every operation kind
//! (the allocation pass picking init values, the scheduler rejecting
//! unsupported ops) match on it exhaustively, so adding a kind is a compile
//! error until each of them decides what to do with it.

use std::fmt;

use crate::tensor::TvRef;
use crate::types::{BinaryOp, CacheOp, LoadStoreOpType, MmaMacro, ReduceOp, TernaryOp, UnaryOp};
use crate::val::Val;

/// Handle to a tensor expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprRef(pub(crate) u32);

impl ExprRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Tensor(TvRef),
    Scalar(Val),
}

impl Operand {
    pub fn as_tensor(&self) -> Option<TvRef> {
        match self {
            Self::Tensor(tv) => Some(*tv),
            Self::Scalar(_) => None,
        }
    }
}

/// Which of the three Welford outputs a tensor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelfordRole {
    Avg,
    Var,
    N,
}

impl WelfordRole {
    /// Welford outputs are laid out as `[avg, var, n]`.
    pub fn of_output(index: usize) -> Self {
        match index % 3 {
            0 => Self::Avg,
            1 => Self::Var,
            _ => Self::N,
        }
    }
}

/// Initial values of a Welford reduction.
#[derive(Debug, Clone)]
pub struct WelfordInit {
    pub avg: Option<Val>,
    pub var: Option<Val>,
    pub n: Val,
}

impl Default for WelfordInit {
    fn default() -> Self {
        Self { avg: None, var: None, n: Val::zero() }
    }
}

impl WelfordInit {
    /// Mean and variance start from `0.0` unless set explicitly.
    pub fn for_role(&self, role: WelfordRole) -> Val {
        match role {
            WelfordRole::Avg => self.avg.clone().unwrap_or_else(|| Val::float(0.0)),
            WelfordRole::Var => self.var.clone().unwrap_or_else(|| Val::float(0.0)),
            WelfordRole::N => self.n.clone(),
        }
    }
}

#[derive(Debug, Clone, strum::AsRefStr)]
pub enum OpKind {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Full { value: Val },
    Iota,
    Reduction { op: ReduceOp, init: Val },
    GroupedReduction { ops: Vec<ReduceOp>, inits: Vec<Val> },
    Welford(WelfordInit),
    /// One [`WelfordInit`] per group of three outputs.
    GroupedWelford(Vec<WelfordInit>),
    Mma { mma_macro: MmaMacro, init: Option<Val> },
    Matmul,
    Linear,
    SdpaFwd,
    SdpaBwd,
    LoadStore { op: LoadStoreOpType, cache: CacheOp },
    Broadcast { is_new: Vec<bool> },
    Squeeze { is_squeezed: Vec<bool> },
    Expand,
    /// Reshape; the output's root-to-logical transforms describe it.
    View,
    Permute { new2old: Vec<usize> },
    Pad,
    Slice,
    Cat { axis: usize },
    IndexSelect { axis: usize },
}

impl OpKind {
    pub fn set() -> Self {
        Self::LoadStore { op: LoadStoreOpType::Set, cache: CacheOp::Unspecified }
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self, Self::Reduction { .. } | Self::GroupedReduction { .. } | Self::Welford(_) | Self::GroupedWelford(_))
    }

    pub fn is_matmul_like(&self) -> bool {
        matches!(self, Self::Mma { .. } | Self::Matmul | Self::Linear)
    }

    pub fn is_sdpa(&self) -> bool {
        matches!(self, Self::SdpaFwd | Self::SdpaBwd)
    }

    pub fn load_store_type(&self) -> Option<LoadStoreOpType> {
        match self {
            Self::LoadStore { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Output is a relayout of the input that never touches element values.
    pub fn is_metadata(&self) -> bool {
        match self {
            Self::LoadStore { op, .. } => matches!(op, LoadStoreOpType::Set | LoadStoreOpType::SegmenterSet),
            Self::View | Self::Squeeze { .. } | Self::Broadcast { .. } | Self::Expand | Self::Permute { .. } => true,
            _ => false,
        }
    }

    /// Evaluated by a library call rather than a generated kernel.
    pub fn is_library_call(&self) -> bool {
        matches!(self, Self::Matmul | Self::Linear | Self::SdpaFwd | Self::SdpaBwd)
    }

    pub fn grouped_reduction_init(&self, output: usize) -> Option<&Val> {
        match self {
            Self::GroupedReduction { inits, .. } => inits.get(output),
            _ => None,
        }
    }

    pub fn grouped_welford_init(&self, output: usize) -> Option<Val> {
        match self {
            Self::GroupedWelford(groups) => {
                groups.get(output / 3).map(|init| init.for_role(WelfordRole::of_output(output)))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: OpKind,
    pub inputs: Vec<Operand>,
    pub outputs: Vec<TvRef>,
}

impl Expr {
    pub fn tensor_inputs(&self) -> impl Iterator<Item = TvRef> + '_ {
        self.inputs.iter().filter_map(Operand::as_tensor)
    }

    pub fn output(&self, index: usize) -> Option<TvRef> {
        self.outputs.get(index).copied()
    }
}
