//! Symbolic scalar values.
//!
//! A [`Val`] is an immutable, reference-counted scalar expression: a constant,
//! a named runtime symbol (typically a fusion input extent such as `T0.size1`),
//! or an arithmetic node over other values. Extents of iteration axes, split
//! factors, init values and allocation sizes are all `Val`s.
//!
//! Constructors fold constant operands eagerly, so `Val::int(2).mul(&Val::int(4))`
//! is the constant `8` and multiplying by one returns the other operand. Anything
//! that cannot be folded is resolved later by the
//! [`ExpressionEvaluator`](crate::evaluator::ExpressionEvaluator).

use std::fmt;
use std::sync::Arc;

use fusor_dtype::DType;

/// Concrete scalar value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Int(v) => *v == 0,
            Self::Float(v) => *v == 0.0,
            Self::Bool(v) => !*v,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(*v as i64),
            Self::Float(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Arithmetic on symbolic values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValOp {
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Mod,
    Max,
    Min,
}

impl ValOp {
    /// Integer semantics; `None` on division by zero.
    pub fn apply(&self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            Self::Add => Some(lhs + rhs),
            Self::Sub => Some(lhs - rhs),
            Self::Mul => Some(lhs * rhs),
            Self::Div => (rhs != 0).then(|| lhs / rhs),
            Self::CeilDiv => (rhs != 0).then(|| (lhs + rhs - 1).div_euclid(rhs)),
            Self::Mod => (rhs != 0).then(|| lhs % rhs),
            Self::Max => Some(lhs.max(rhs)),
            Self::Min => Some(lhs.min(rhs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValKind {
    Const(Scalar),
    Symbol(String),
    Binary { op: ValOp, lhs: Val, rhs: Val },
}

#[derive(Debug, PartialEq)]
struct ValNode {
    kind: ValKind,
    dtype: DType,
}

/// Shared handle to a symbolic scalar expression. Equality is structural.
#[derive(Clone, PartialEq)]
pub struct Val(Arc<ValNode>);

impl Val {
    pub fn new(kind: ValKind, dtype: DType) -> Self {
        Self(Arc::new(ValNode { kind, dtype }))
    }

    pub fn int(value: i64) -> Self {
        Self::new(ValKind::Const(Scalar::Int(value)), DType::Index)
    }

    pub fn typed_int(value: i64, dtype: DType) -> Self {
        Self::new(ValKind::Const(Scalar::Int(value)), dtype)
    }

    pub fn float(value: f64) -> Self {
        Self::new(ValKind::Const(Scalar::Float(value)), DType::Float64)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(ValKind::Const(Scalar::Bool(value)), DType::Bool)
    }

    pub fn zero() -> Self {
        Self::int(0)
    }

    pub fn one() -> Self {
        Self::int(1)
    }

    /// Named runtime scalar of index type.
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::new(ValKind::Symbol(name.into()), DType::Index)
    }

    pub fn kind(&self) -> &ValKind {
        &self.0.kind
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    /// Same expression reinterpreted as `dtype`.
    pub fn with_dtype(&self, dtype: DType) -> Self {
        if self.dtype() == dtype {
            return self.clone();
        }
        Self::new(self.0.kind.clone(), dtype)
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match self.kind() {
            ValKind::Const(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        self.as_scalar().and_then(|s| s.as_int())
    }

    pub fn is_const(&self) -> bool {
        matches!(self.kind(), ValKind::Const(_))
    }

    pub fn is_zero(&self) -> bool {
        self.as_scalar().is_some_and(|s| s.is_zero())
    }

    pub fn is_one(&self) -> bool {
        self.as_int() == Some(1)
    }

    pub fn binary(op: ValOp, lhs: &Val, rhs: &Val) -> Self {
        if let (Some(l), Some(r)) = (lhs.as_int(), rhs.as_int())
            && let Some(folded) = op.apply(l, r)
        {
            return Self::typed_int(folded, lhs.dtype());
        }

        match op {
            ValOp::Mul if lhs.is_one() => return rhs.clone(),
            ValOp::Mul | ValOp::Div | ValOp::CeilDiv if rhs.is_one() => return lhs.clone(),
            ValOp::Mul if lhs.is_zero() || rhs.is_zero() => return Self::typed_int(0, lhs.dtype()),
            ValOp::Add if lhs.is_zero() => return rhs.clone(),
            ValOp::Add | ValOp::Sub if rhs.is_zero() => return lhs.clone(),
            _ => {}
        }

        Self::new(ValKind::Binary { op, lhs: lhs.clone(), rhs: rhs.clone() }, lhs.dtype())
    }

    pub fn add(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::Add, self, rhs)
    }

    pub fn sub(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::Sub, self, rhs)
    }

    pub fn mul(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::Mul, self, rhs)
    }

    pub fn div(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::Div, self, rhs)
    }

    pub fn ceil_div(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::CeilDiv, self, rhs)
    }

    pub fn max(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::Max, self, rhs)
    }

    pub fn min(&self, rhs: &Val) -> Self {
        Self::binary(ValOp::Min, self, rhs)
    }

    /// Product of `vals`, `1` for an empty sequence.
    pub fn product<'a>(vals: impl IntoIterator<Item = &'a Val>) -> Self {
        vals.into_iter().fold(Self::one(), |acc, v| acc.mul(v))
    }
}

impl From<i64> for Val {
    fn from(value: i64) -> Self {
        Self::int(value)
    }
}

impl From<i32> for Val {
    fn from(value: i32) -> Self {
        Self::int(value.into())
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValKind::Const(s) => write!(f, "{s}"),
            ValKind::Symbol(name) => f.write_str(name),
            ValKind::Binary { op, lhs, rhs } => match op {
                ValOp::Add => write!(f, "({lhs} + {rhs})"),
                ValOp::Sub => write!(f, "({lhs} - {rhs})"),
                ValOp::Mul => write!(f, "({lhs} * {rhs})"),
                ValOp::Div => write!(f, "({lhs} / {rhs})"),
                ValOp::Mod => write!(f, "({lhs} % {rhs})"),
                ValOp::CeilDiv => write!(f, "ceilDiv({lhs}, {rhs})"),
                ValOp::Max => write!(f, "max({lhs}, {rhs})"),
                ValOp::Min => write!(f, "min({lhs}, {rhs})"),
            },
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
