//! Lowering utilities and allocation-position inference.

use std::collections::HashMap;
use std::fmt;

use fusor_dtype::DType;
use fusor_ir::{ExprRef, Fusion, IdMappingMode, IdRef, IterDomain, LoadStoreOpType, MemoryType, ParallelType, TvRef, Val};
use tracing::trace;

use crate::context::LoweringContext;
use crate::error::*;
use crate::kir::{Allocate, KirExpr, KirKind, NodeId};

/// Index into a tensor's loop axes: axes left of it are materialized by
/// enclosing loops and do not take part in the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct AllocationPosition(usize);

impl AllocationPosition {
    pub fn new(pos: usize) -> Self {
        Self(pos)
    }

    pub fn get(self) -> usize {
        self.0
    }

    fn advance(&mut self) {
        self.0 += 1;
    }

    /// Whether loop axis `axis` is left of this position.
    pub fn covers(self, axis: usize) -> bool {
        axis < self.0
    }
}

impl fmt::Display for AllocationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open loop of the loop nest: the kernel IR node and the concrete axis it iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopInfo {
    pub node: NodeId,
    pub iter_domain: IdRef,
}

/// Where a tensor's buffer and its initialization belong in the loop nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BasicAllocInfo {
    /// Innermost loop whose iterations must re-initialize the buffer.
    pub init_for_loop: Option<LoopInfo>,
    /// Innermost loop whose iterations need a fresh buffer.
    pub alloc_for_loop: Option<LoopInfo>,
    pub alloc_pos: AllocationPosition,
}

/// Walks the loops enclosing the expression that defines `tv` to find where
/// its buffer must be allocated and initialized.
///
/// # Arguments
///
/// * `ctx` - Lowering context providing the axis map and circular-buffer info
/// * `tv` - Tensor being allocated
/// * `loops` - Enclosing loops, outermost first
/// * `id_map` - Optional replacement of `tv`'s axes before they are compared with loops
///
/// # Returns
///
/// The allocation position and the two anchor loops. Fails if a reduction
/// axis of a tensor that is not a terminating output lies outside its
/// compute-at point.
pub fn get_alloc_information(
    ctx: &LoweringContext,
    tv: TvRef,
    loops: &[LoopInfo],
    id_map: Option<&HashMap<IdRef, IdRef>>,
) -> Result<BasicAllocInfo> {
    let fusion = ctx.fusion();
    let view = fusion.tv(tv);
    let mut info = BasicAllocInfo::default();
    let mut outer_alloc_found = false;

    for fl in loops {
        let pos = info.alloc_pos.get();
        if pos == view.compute_at_pos {
            break;
        }
        let Some(local_id) = view.axis(pos) else {
            break;
        };

        if fusion.id(local_id).is_reduction() {
            if !fusion.terminating_outputs().contains(&tv) {
                return ReductionOutsideComputeAtSnafu { tensor: tv, axis: pos }.fail();
            }
            break;
        }

        let loop_pt = fusion.id(fl.iter_domain).parallel_type;
        if loop_pt == ParallelType::Unroll {
            break;
        }

        // Unswitch duplicates its body, so shared buffers must live outside of it.
        if loop_pt == ParallelType::Unswitch && view.memory_type == MemoryType::Shared {
            outer_alloc_found = true;
        }
        if view.memory_type == MemoryType::Global {
            outer_alloc_found = true;
        }
        if view.is_circular_buffered() && local_id == ctx.circular_buffer_info.circular_buffer_axis(fusion, tv)? {
            outer_alloc_found = true;
        }

        let local_id = id_map.and_then(|map| map.get(&local_id).copied()).unwrap_or(local_id);
        if ctx.ca_map().are_mapped(local_id, fl.iter_domain, IdMappingMode::Permissive) {
            info.alloc_pos.advance();
        }

        info.init_for_loop = Some(*fl);
        if !outer_alloc_found {
            info.alloc_for_loop = Some(*fl);
        }
    }

    trace!(tensor = %tv, alloc_pos = %info.alloc_pos, outer_alloc_found, "allocation information");
    Ok(info)
}

// =========================================================================
// Expression predicates
// =========================================================================

/// Node that writes a tensor.
pub fn is_tv_op(expr: &KirExpr) -> bool {
    matches!(expr.kind, KirKind::TensorOp { .. } | KirKind::InitSet { .. })
}

pub fn is_cp_async_op(fusion: &Fusion, expr: ExprRef) -> bool {
    fusion.expr(expr).kind.load_store_type() == Some(LoadStoreOpType::CpAsync)
}

pub fn is_cp_async_bulk(fusion: &Fusion, expr: ExprRef) -> bool {
    matches!(
        fusion.expr(expr).kind.load_store_type(),
        Some(LoadStoreOpType::CpAsyncBulk | LoadStoreOpType::CpAsyncBulkTensorTile)
    )
}

/// Bulk copy from global into shared memory.
pub fn is_cp_async_bulk_load(fusion: &Fusion, expr: ExprRef) -> bool {
    if !is_cp_async_bulk(fusion, expr) {
        return false;
    }
    let e = fusion.expr(expr);
    let input_global = e.tensor_inputs().next().is_some_and(|tv| fusion.tv(tv).memory_type == MemoryType::Global);
    let output_shared = e.output(0).is_some_and(|tv| fusion.tv(tv).memory_type == MemoryType::Shared);
    input_global && output_shared
}

/// Initialization of a reduction buffer.
pub fn is_reduction_init_expr(fusion: &Fusion, expr: &KirExpr) -> bool {
    match &expr.kind {
        KirKind::InitSet { out, .. } => fusion.has_reduction(*out),
        _ => false,
    }
}

/// Product of the extents of `tv`'s loop axes bound to thread dimensions.
pub fn get_num_threads_in_tensor_view(fusion: &Fusion, tv: TvRef) -> Val {
    let extents: Vec<Val> = fusion
        .tv(tv)
        .loop_domain()
        .iter()
        .map(|id| fusion.id(*id))
        .filter(|axis| axis.is_thread_dim())
        .map(|axis| axis.extent.clone())
        .collect();
    Val::product(&extents)
}

/// Every non-scope node in program order.
pub fn flatten_scoped_exprs(exprs: &[KirExpr]) -> Vec<&KirExpr> {
    let mut flat = Vec::new();
    let mut stack: Vec<std::slice::Iter<'_, KirExpr>> = vec![exprs.iter()];
    while let Some(top) = stack.last_mut() {
        let Some(expr) = top.next() else {
            stack.pop();
            continue;
        };
        let bodies = expr.bodies();
        if matches!(expr.kind, KirKind::ForLoop(_) | KirKind::IfThenElse { .. }) {
            for body in bodies.into_iter().rev() {
                stack.push(body.iter());
            }
        } else {
            flat.push(expr);
        }
    }
    flat
}

/// 1-D global work buffer used for grid-wide communication.
pub fn alloc_global_buffer_for_grid_comm(
    ctx: &mut LoweringContext,
    size: Val,
    dtype: DType,
    zero_init: bool,
    resets_to_zero: bool,
) -> KirExpr {
    let fusion = ctx.fusion_mut();
    let axis = fusion.add_id(IterDomain::iteration(size.clone()));
    let buffer = fusion.new_tensor(dtype, vec![axis]);
    fusion.set_memory_type(buffer, MemoryType::Global);

    let mut alloc = Allocate::new(buffer, MemoryType::Global, dtype, vec![size]);
    alloc.zero_init = zero_init;
    alloc.resets_to_zero = resets_to_zero;
    KirExpr { id: ctx.next_node_id(), kind: KirKind::Allocate(alloc) }
}
