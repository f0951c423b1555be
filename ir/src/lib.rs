//! Tensor-program IR for the Fusor compiler.
//!
//! This crate defines the graph that every later stage works on.
//!
//! # Module Organization
//!
//! - [`fusion`] - The arena owning axes, tensors and expressions
//! - [`domain`] - Iteration axes and the split/merge/resize transforms between them
//! - [`tensor`] - Tensors, their memory placement and inlining positions
//! - [`op`] - Tensor expressions and the closed set of operation kinds
//! - [`ops`] - Graph-building operations
//! - [`transform`] - Scheduling transforms on loop domains
//! - [`id_graph`] - Axis equivalence classes (exact, permissive, loop)
//! - [`val`] - Symbolic scalars with constant folding
//! - [`evaluator`] - Binding runtime arguments and evaluating symbols
//! - [`types`] - Parallel, iteration and memory kinds

pub mod domain;
pub mod error;
pub mod evaluator;
pub mod fusion;
pub mod id_graph;
pub mod op;
pub mod ops;
pub mod tensor;
pub mod transform;
pub mod types;
pub mod val;


pub use domain::{IdExpr, IdExprRef, IdRef, IterDomain, TensorDomain};
pub use error::{Error, Result};
pub use evaluator::{ExpressionEvaluator, TensorArg};
pub use fusion::{Dim, Fusion};
pub use id_graph::ComputeAtMap;
pub use op::{Expr, ExprRef, OpKind, Operand, WelfordInit, WelfordRole};
pub use tensor::{AliasInfo, LoopTransform, TensorView, TvRef};
pub use types::{
    AllocationType, BinaryOp, CacheOp, IdMappingMode, IterType, LoadStoreOpType, MemoryType, MmaArch, MmaMacro,
    ParallelType, ReduceOp, TernaryOp, UnaryOp,
};
pub use val::{Scalar, Val, ValKind, ValOp};
