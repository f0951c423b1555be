//! Kernel IR.
//!
//! The lowered kernel is a tree of [`KirExpr`] nodes: tensor operations from
//! the fusion wrapped in explicit loops, plus the allocation, initialization
//! and synchronization nodes that lowering passes insert. Every node carries a
//! [`NodeId`] that stays stable while passes rebuild the tree around it.

use std::fmt;

use fusor_dtype::DType;
use fusor_ir::{ExprRef, IdRef, MemoryType, TvRef, Val};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct KirExpr {
    pub id: NodeId,
    pub kind: KirKind,
}

#[derive(Debug, Clone)]
pub enum KirKind {
    /// A tensor expression of the fusion.
    TensorOp { expr: ExprRef },
    ForLoop(ForLoop),
    IfThenElse { predicate: Val, then_body: Vec<KirExpr>, else_body: Vec<KirExpr> },
    Allocate(Allocate),
    /// `out = value` for every element the enclosing loops visit.
    InitSet { out: TvRef, value: Val },
    MBarrierInit { mbarrier: TvRef, count: Val },
    MBarrierInvalidate { mbarrier: TvRef },
    BlockSync,
}

#[derive(Debug, Clone)]
pub struct ForLoop {
    /// Concrete loop axis this loop iterates.
    pub iter_domain: IdRef,
    pub body: Vec<KirExpr>,
}

/// A concrete buffer.
#[derive(Debug, Clone)]
pub struct Allocate {
    pub buffer: TvRef,
    pub memory_type: MemoryType,
    pub dtype: DType,
    pub shape: Vec<Val>,
    pub zero_init: bool,
    /// Buffer is known to be zero again whenever a kernel finishes using it.
    pub resets_to_zero: bool,
    /// Allocation whose storage this one reuses.
    pub alias: Option<NodeId>,
    /// Byte offset inside the dynamic shared-memory block.
    pub address: Option<Val>,
}

impl Allocate {
    pub fn new(buffer: TvRef, memory_type: MemoryType, dtype: DType, shape: Vec<Val>) -> Self {
        Self { buffer, memory_type, dtype, shape, zero_init: false, resets_to_zero: false, alias: None, address: None }
    }

    /// Number of elements.
    pub fn size(&self) -> Val {
        Val::product(&self.shape)
    }
}

impl KirExpr {
    pub fn as_for_loop(&self) -> Option<&ForLoop> {
        match &self.kind {
            KirKind::ForLoop(fl) => Some(fl),
            _ => None,
        }
    }

    pub fn as_allocate(&self) -> Option<&Allocate> {
        match &self.kind {
            KirKind::Allocate(alloc) => Some(alloc),
            _ => None,
        }
    }

    pub fn tensor_op(&self) -> Option<ExprRef> {
        match &self.kind {
            KirKind::TensorOp { expr } => Some(*expr),
            _ => None,
        }
    }

    /// Nested bodies of a scoped node.
    pub fn bodies(&self) -> Vec<&[KirExpr]> {
        match &self.kind {
            KirKind::ForLoop(fl) => vec![fl.body.as_slice()],
            KirKind::IfThenElse { then_body, else_body, .. } => vec![then_body.as_slice(), else_body.as_slice()],
            _ => Vec::new(),
        }
    }

    pub(crate) fn bodies_mut(&mut self) -> Vec<&mut Vec<KirExpr>> {
        match &mut self.kind {
            KirKind::ForLoop(fl) => vec![&mut fl.body],
            KirKind::IfThenElse { then_body, else_body, .. } => vec![then_body, else_body],
            _ => Vec::new(),
        }
    }
}

/// Renders the tree one node per line, nested bodies indented.
pub fn to_string(exprs: &[KirExpr]) -> String {
    let mut out = String::new();
    write_tree(exprs, 0, &mut out);
    out
}

fn write_tree(exprs: &[KirExpr], depth: usize, out: &mut String) {
    use std::fmt::Write;
    for expr in exprs {
        let pad = "  ".repeat(depth);
        let _ = match &expr.kind {
            KirKind::TensorOp { expr } => writeln!(out, "{pad}{expr}"),
            KirKind::ForLoop(fl) => writeln!(out, "{pad}FOR {}", fl.iter_domain),
            KirKind::IfThenElse { predicate, .. } => writeln!(out, "{pad}IF {predicate}"),
            KirKind::Allocate(alloc) => {
                let shape: Vec<String> = alloc.shape.iter().map(Val::to_string).collect();
                writeln!(out, "{pad}ALLOCATE {} {} [{}]", alloc.buffer, alloc.memory_type, shape.join(", "))
            }
            KirKind::InitSet { out: tv, value } => writeln!(out, "{pad}{tv} = {value}"),
            KirKind::MBarrierInit { mbarrier, count } => writeln!(out, "{pad}MBARRIER_INIT {mbarrier} {count}"),
            KirKind::MBarrierInvalidate { mbarrier } => writeln!(out, "{pad}MBARRIER_INVAL {mbarrier}"),
            KirKind::BlockSync => writeln!(out, "{pad}BLOCK_SYNC"),
        };
        for body in expr.bodies() {
            write_tree(body, depth + 1, out);
        }
    }
}
