//! Device lowering for the Fusor compiler.
//!
//! Turns a scheduled fusion into kernel IR with explicit loops, buffers and
//! synchronization.
//!
//! # Module Organization
//!
//! - [`kir`] - Kernel IR nodes
//! - [`loops`] - Loop-nest generation from loop domains and compute-at positions
//! - [`utils`] - Allocation-position inference and expression predicates
//! - [`pass`] - Allocation insertion and the deferred edit list it produces
//! - [`context`] - Per-run lowering state passed to every pass
//! - [`circular_buffer`] - Circular-buffer axis and stage-size bookkeeping

pub mod circular_buffer;
pub mod context;
pub mod error;
pub mod kir;
pub mod loops;
pub mod pass;
pub mod utils;


pub use circular_buffer::CircularBufferInfo;
pub use context::{AllocationDomainInfo, LoopPromotion, LoweringContext, MapPredicateElimination, PredicateElimination};
pub use error::{Error, Result};
pub use kir::{Allocate, ForLoop, KirExpr, KirKind, NodeId};
pub use loops::build_loop_nest;
pub use pass::{EditList, insert_allocations};
pub use utils::{AllocationPosition, BasicAllocInfo, LoopInfo, get_alloc_information};

/// Kernel IR of one fusion together with the state its passes recorded.
#[derive(Debug)]
pub struct LoweredKernel {
    pub exprs: Vec<KirExpr>,
    pub ctx: LoweringContext,
}

/// Lowers the fusion owned by `ctx`: builds the loop nest, then inserts allocations.
#[tracing::instrument(skip_all)]
pub fn lower(mut ctx: LoweringContext) -> Result<LoweredKernel> {
    let exprs = build_loop_nest(&mut ctx);
    let exprs = insert_allocations(&mut ctx, exprs)?;
    tracing::debug!(allocations = ctx.allocation_infos().len(), "lowered");
    Ok(LoweredKernel { exprs, ctx })
}
