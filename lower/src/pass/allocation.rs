//! Allocation insertion.
//!
//! Walks the loop nest once and, for every tensor written by a tensor
//! operation, decides where its buffer lives, how large it is and whether it
//! needs an initialization loop. Global-to-shared bulk copies additionally get
//! the mbarriers that signal their completion.
//!
//! The walk only records edits; [`insert_allocations`] applies them once the
//! whole tree has been visited.

use std::collections::HashMap;

use fusor_dtype::DType;
use fusor_ir::{ExprRef, IdMappingMode, IdRef, IterDomain, MemoryType, OpKind, TvRef, Val, WelfordRole};
use snafu::ensure;
use tracing::{debug, trace};

use crate::context::{AllocationDomainInfo, LoweringContext};
use crate::error::*;
use crate::kir::{Allocate, ForLoop, KirExpr, KirKind, NodeId};
use crate::pass::edits::EditList;
use crate::utils::{
    AllocationPosition, LoopInfo, get_alloc_information, get_num_threads_in_tensor_view, is_cp_async_bulk,
    is_cp_async_bulk_load, is_cp_async_op,
};

/// Where one tensor's allocation and initialization go.
#[derive(Debug, Clone)]
pub struct AllocationInformation {
    pub buffer: TvRef,
    pub alloc_pos: AllocationPosition,
    pub init_for_loop: Option<LoopInfo>,
    pub init_place_before: NodeId,
    pub alloc_for_loop: Option<LoopInfo>,
    pub alloc_place_before: NodeId,
}

/// Extents of a buffer and the axes they come from.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSizes {
    pub extents: Vec<Val>,
    pub ids: Vec<IdRef>,
}

/// Inserts allocations, initializations and mbarriers into `exprs`.
#[tracing::instrument(skip_all)]
pub fn insert_allocations(ctx: &mut LoweringContext, exprs: Vec<KirExpr>) -> Result<Vec<KirExpr>> {
    let edits = plan_allocations(ctx, &exprs)?;
    debug!(edits = edits.len(), "allocation edits planned");
    edits.apply(exprs)
}

/// Records the edits [`insert_allocations`] would apply, without applying them.
pub fn plan_allocations(ctx: &mut LoweringContext, exprs: &[KirExpr]) -> Result<EditList> {
    let mut inserter = AllocationInserter { ctx, top_level: exprs, loops: Vec::new(), edits: EditList::new() };
    inserter.walk(exprs)?;
    Ok(inserter.edits)
}

struct AllocationInserter<'a> {
    ctx: &'a mut LoweringContext,
    top_level: &'a [KirExpr],
    loops: Vec<LoopInfo>,
    edits: EditList,
}

impl<'a> AllocationInserter<'a> {
    fn walk(&mut self, exprs: &'a [KirExpr]) -> Result<()> {
        for expr in exprs {
            match &expr.kind {
                KirKind::ForLoop(fl) => {
                    self.loops.push(LoopInfo { node: expr.id, iter_domain: fl.iter_domain });
                    self.walk(&fl.body)?;
                    self.loops.pop();
                }
                KirKind::IfThenElse { .. } => return UnexpectedConditionalSnafu { node: expr.id }.fail(),
                KirKind::TensorOp { expr: tensor_expr } => self.handle(expr.id, *tensor_expr)?,
                KirKind::Allocate(_)
                | KirKind::InitSet { .. }
                | KirKind::MBarrierInit { .. }
                | KirKind::MBarrierInvalidate { .. }
                | KirKind::BlockSync => {}
            }
        }
        Ok(())
    }

    fn innermost_scope(&self) -> Option<NodeId> {
        self.loops.last().map(|l| l.node)
    }

    fn handle(&mut self, node: NodeId, expr: ExprRef) -> Result<()> {
        let outputs = self.ctx.fusion().expr(expr).outputs.clone();
        let mut circular_buffer_depth: Option<usize> = None;

        for (index, out) in outputs.iter().copied().enumerate() {
            let default_val = self.ctx.predicate_elimination().init_value(out);
            let mut init = op_init_value(self.ctx, expr, index, out, default_val)?;

            // Async copies zero-fill out-of-bounds elements themselves. This
            // holds for bulk (TMA) copies as well as cp.async.
            let fusion = self.ctx.fusion();
            let async_op = if is_cp_async_op(fusion, expr) {
                Some("cp.async")
            } else if is_cp_async_bulk(fusion, expr) {
                Some("cp.async.bulk")
            } else {
                None
            };
            if let Some(op) = async_op {
                if let Some(value) = &init
                    && !value.is_zero()
                {
                    return NonZeroAsyncCopyInitSnafu { op, tensor: out, value: value.to_string() }.fail();
                }
                init = None;
            }

            let is_output = fusion.is_output(out);
            if is_output && init.is_none() {
                continue;
            }

            let info = self.allocation_information(out, node)?;
            let alloc = if is_output { None } else { Some(self.create_allocation(&info)?) };
            let init_expr = init.map(|value| self.create_init(&info, value));

            let depth = self.ctx.fusion().tv(out).circular_buffer_depth;
            match circular_buffer_depth {
                None => circular_buffer_depth = Some(depth),
                Some(expected) => {
                    ensure!(expected == depth, CircularBufferDepthMismatchSnafu { expr, expected, actual: depth })
                }
            }

            if let Some((alloc, ids)) = alloc {
                self.ctx.register_allocation_info(alloc.id, AllocationDomainInfo { ids })?;
                if self.ctx.fusion().tv(out).memory_type == MemoryType::Shared {
                    if let Some(first) = self.top_level.first() {
                        self.edits.insert_before(None, first.id, alloc);
                    }
                } else {
                    self.edits.insert_before(info.alloc_for_loop.map(|l| l.node), info.alloc_place_before, alloc);
                }
            }
            if let Some(init_expr) = init_expr {
                self.edits.insert_before(info.init_for_loop.map(|l| l.node), info.init_place_before, init_expr);
            }
        }

        if is_cp_async_bulk_load(self.ctx.fusion(), expr) {
            self.insert_mbarrier(node, expr, circular_buffer_depth.unwrap_or(1))?;
        }
        Ok(())
    }

    fn allocation_information(&self, tv: TvRef, expr_node: NodeId) -> Result<AllocationInformation> {
        let basic = get_alloc_information(self.ctx, tv, &self.loops, None)?;
        let init_place_before = self.place_before(basic.init_for_loop, expr_node)?;
        let alloc_place_before = self.place_before(basic.alloc_for_loop, expr_node)?;
        trace!(
            tensor = %tv,
            alloc_pos = %basic.alloc_pos,
            %init_place_before,
            %alloc_place_before,
            "allocation placement"
        );
        Ok(AllocationInformation {
            buffer: tv,
            alloc_pos: basic.alloc_pos,
            init_for_loop: basic.init_for_loop,
            init_place_before,
            alloc_for_loop: basic.alloc_for_loop,
            alloc_place_before,
        })
    }

    /// Node inside `anchor`'s body before which code hoisted to `anchor` goes.
    fn place_before(&self, anchor: Option<LoopInfo>, expr_node: NodeId) -> Result<NodeId> {
        let Some(anchor) = anchor else {
            return Ok(self.loops.first().map_or(expr_node, |l| l.node));
        };
        if self.loops.last().is_some_and(|l| l.node == anchor.node) {
            return Ok(expr_node);
        }
        let pos = self.loops.iter().position(|l| l.node == anchor.node);
        match pos.and_then(|p| self.loops.get(p + 1)) {
            Some(next) => Ok(next.node),
            None => LoopNotFoundSnafu { node: anchor.node }.fail(),
        }
    }

    fn create_allocation(&mut self, info: &AllocationInformation) -> Result<(KirExpr, Vec<IdRef>)> {
        let tv = info.buffer;
        let AllocationSizes { mut extents, ids } = allocation_sizes(self.ctx, tv, info.alloc_pos)?;

        let view = self.ctx.fusion().tv(tv);
        let (memory_type, dtype, depth) = (view.memory_type, view.dtype, view.circular_buffer_depth);
        if view.is_circular_buffered() {
            let stage = Val::product(&extents);
            self.ctx.circular_buffer_info.set_original_alloc_size(tv, stage);
            extents.push(Val::int(depth as i64));
        }

        let alloc = Allocate::new(tv, memory_type, dtype, extents);
        debug!(tensor = %tv, memory = %memory_type, size = %alloc.size(), "allocate");
        Ok((KirExpr { id: self.ctx.next_node_id(), kind: KirKind::Allocate(alloc) }, ids))
    }

    /// Loops over the axes right of the allocation position around `tv = value`.
    fn create_init(&mut self, info: &AllocationInformation, value: Val) -> KirExpr {
        let fusion = self.ctx.fusion();
        let axes: Vec<IdRef> = fusion
            .tv(info.buffer)
            .loop_domain()
            .iter()
            .skip(info.alloc_pos.get())
            .filter(|id| {
                let axis = fusion.id(**id);
                !axis.is_reduction() && !axis.is_broadcast()
            })
            .map(|id| self.ctx.ca_map().concrete_mapped_id(*id, IdMappingMode::Loop))
            .collect();

        let mut nest = KirExpr { id: self.ctx.next_node_id(), kind: KirKind::InitSet { out: info.buffer, value } };
        for iter_domain in axes.into_iter().rev() {
            nest = KirExpr {
                id: self.ctx.next_node_id(),
                kind: KirKind::ForLoop(ForLoop { iter_domain, body: vec![nest] }),
            };
        }
        nest
    }

    fn insert_mbarrier(&mut self, node: NodeId, expr: ExprRef, depth: usize) -> Result<()> {
        let Some(out) = self.ctx.fusion().expr(expr).output(0) else {
            return Ok(());
        };
        let scope = self.innermost_scope();

        if depth > 1 {
            let tokens = self.new_shared_u64(Some(depth));
            let mbarrier = self.new_shared_u64(Some(depth));
            let tokens_alloc = self.shared_alloc(tokens, vec![Val::int(depth as i64)]);
            let mbarrier_alloc = self.shared_alloc(mbarrier, vec![Val::int(depth as i64)]);
            let init = self.node(KirKind::MBarrierInit { mbarrier, count: Val::typed_int(1, DType::UInt32) });
            let inval = self.node(KirKind::MBarrierInvalidate { mbarrier });

            self.ctx.ldst_mbarrier_map.insert(node, mbarrier);
            self.ctx.ldst_mbarrier_token_map.insert(init.id, tokens);
            self.ctx.ldst_mbarrier_token_map.insert(inval.id, tokens);
            self.ctx.mbarrier_token_smem_alloc_set.insert(tokens_alloc.id);
            self.ctx.mbarrier_token_smem_alloc_set.insert(mbarrier_alloc.id);

            // The circular-buffering pass adds the block syncs around these.
            self.edits.insert_before(scope, node, tokens_alloc);
            self.edits.insert_before(scope, node, mbarrier_alloc);
            self.edits.insert_before(scope, node, init);
            self.edits.insert_after(scope, node, inval);
            debug!(tensor = %out, depth, "circular-buffered mbarriers");
        } else {
            let mbarrier = self.new_shared_u64(None);
            let mbarrier_alloc = self.shared_alloc(mbarrier, Vec::new());
            let count = get_num_threads_in_tensor_view(self.ctx.fusion(), out).with_dtype(DType::UInt32);
            let init = self.node(KirKind::MBarrierInit { mbarrier, count });
            let sync_init = self.node(KirKind::BlockSync);
            let inval = self.node(KirKind::MBarrierInvalidate { mbarrier });
            let sync_inval = self.node(KirKind::BlockSync);

            self.ctx.ldst_mbarrier_map.insert(node, mbarrier);

            self.edits.insert_before(scope, node, mbarrier_alloc);
            self.edits.insert_before(scope, node, init);
            self.edits.insert_before(scope, node, sync_init);
            self.edits.insert_after(scope, node, inval);
            self.edits.insert_after(scope, node, sync_inval);
            debug!(tensor = %out, "mbarrier");
        }
        Ok(())
    }

    fn new_shared_u64(&mut self, len: Option<usize>) -> TvRef {
        let fusion = self.ctx.fusion_mut();
        let axes = match len {
            Some(len) => vec![fusion.add_id(IterDomain::iteration(Val::int(len as i64)))],
            None => Vec::new(),
        };
        let tv = fusion.new_tensor(DType::UInt64, axes);
        fusion.set_memory_type(tv, MemoryType::Shared);
        tv
    }

    fn shared_alloc(&mut self, buffer: TvRef, shape: Vec<Val>) -> KirExpr {
        self.node(KirKind::Allocate(Allocate::new(buffer, MemoryType::Shared, DType::UInt64, shape)))
    }

    fn node(&mut self, kind: KirKind) -> KirExpr {
        KirExpr { id: self.ctx.next_node_id(), kind }
    }
}

/// Initial value of output `index` of `expr`, combining the op's own init
/// with the predicate-elimination default.
fn op_init_value(
    ctx: &LoweringContext,
    expr: ExprRef,
    index: usize,
    out: TvRef,
    default_val: Option<Val>,
) -> Result<Option<Val>> {
    let fusion = ctx.fusion();
    let kind = &fusion.expr(expr).kind;
    let no_default = || -> Result<()> {
        ensure!(default_val.is_none(), ConflictingInitValueSnafu { tensor: out, expr });
        Ok(())
    };

    let init = match kind {
        OpKind::Reduction { init, .. } if fusion.has_reduction(out) => {
            no_default()?;
            Some(init.clone())
        }
        OpKind::GroupedReduction { .. } if fusion.has_reduction(out) => {
            no_default()?;
            kind.grouped_reduction_init(index).cloned()
        }
        OpKind::Mma { init, .. } => init.clone(),
        OpKind::Welford(init) => {
            no_default()?;
            Some(init.for_role(WelfordRole::of_output(index)))
        }
        OpKind::GroupedWelford(_) => {
            no_default()?;
            kind.grouped_welford_init(index)
        }
        OpKind::Reduction { .. }
        | OpKind::GroupedReduction { .. }
        | OpKind::Unary(_)
        | OpKind::Binary(_)
        | OpKind::Ternary(_)
        | OpKind::Full { .. }
        | OpKind::Iota
        | OpKind::Matmul
        | OpKind::Linear
        | OpKind::SdpaFwd
        | OpKind::SdpaBwd
        | OpKind::LoadStore { .. }
        | OpKind::Broadcast { .. }
        | OpKind::Squeeze { .. }
        | OpKind::Expand
        | OpKind::View
        | OpKind::Permute { .. }
        | OpKind::Pad
        | OpKind::Slice
        | OpKind::Cat { .. }
        | OpKind::IndexSelect { .. } => default_val,
    };
    Ok(init)
}

/// Extents to allocate for `tv` when its first `alloc_pos` loop axes are
/// provided by enclosing loops.
///
/// An allocation of a tensor with non-reduction axes always has at least one
/// extent. The circular-buffer depth is not included.
pub fn allocation_sizes(ctx: &LoweringContext, tv: TvRef, alloc_pos: AllocationPosition) -> Result<AllocationSizes> {
    let fusion = ctx.fusion();
    let view = fusion.tv(tv);
    let mut sizes = if view.memory_type == MemoryType::Global {
        global_allocation_sizes(ctx, tv)
    } else if is_hopper_mma_output(ctx, tv) {
        hopper_mma_allocation_sizes(ctx, tv, alloc_pos)?
    } else {
        non_global_allocation_sizes(ctx, tv, alloc_pos)
    };

    if sizes.extents.is_empty() && !fusion.no_reductions(view.loop_domain()).is_empty() {
        sizes.extents.push(Val::one());
    }
    Ok(sizes)
}

/// Allocation-domain extents with broadcast and device axes collapsed to 1.
fn global_allocation_sizes(ctx: &LoweringContext, tv: TvRef) -> AllocationSizes {
    let fusion = ctx.fusion();
    let mut sizes = AllocationSizes { extents: Vec::new(), ids: Vec::new() };
    for id in fusion.tv(tv).maybe_allocation_domain() {
        let axis = fusion.id(*id);
        if axis.is_reduction() || axis.is_stride() {
            continue;
        }
        let extent = if axis.is_broadcast() || axis.is_device_dim() { Val::one() } else { axis.extent.clone() };
        sizes.extents.push(extent);
        sizes.ids.push(*id);
    }
    sizes
}

fn non_global_allocation_sizes(ctx: &LoweringContext, tv: TvRef, alloc_pos: AllocationPosition) -> AllocationSizes {
    let fusion = ctx.fusion();
    let view = fusion.tv(tv);
    let memory_type = view.memory_type;
    let mut sizes = AllocationSizes { extents: Vec::new(), ids: Vec::new() };

    for (i, id) in view.loop_domain().iter().enumerate() {
        let axis = fusion.id(*id);
        if axis.is_reduction() || axis.is_stride() || axis.is_broadcast() || axis.is_device_dim() {
            continue;
        }
        let concrete = ctx.ca_map().concrete_mapped_id(*id, IdMappingMode::Loop);
        let pt = fusion.id(concrete).parallel_type;

        if alloc_pos.covers(i) {
            // Threads sharing the enclosing loop iteration still need distinct slots.
            let expanded = (memory_type == MemoryType::Shared && pt.is_thread_dim())
                || (memory_type == MemoryType::Global && pt.is_thread());
            if !expanded {
                continue;
            }
        } else if (memory_type == MemoryType::Shared && pt.is_block_dim())
            || (memory_type == MemoryType::Local && pt.is_thread())
        {
            continue;
        }

        let promoted = ctx.loop_promotion.promoted(concrete);
        sizes.extents.push(fusion.id(promoted).extent.clone());
        sizes.ids.push(*id);
    }
    sizes
}

fn is_hopper_mma_output(ctx: &LoweringContext, tv: TvRef) -> bool {
    let fusion = ctx.fusion();
    let view = fusion.tv(tv);
    let hopper = view
        .definition()
        .is_some_and(|def| matches!(&fusion.expr(def).kind, OpKind::Mma { mma_macro, .. } if mma_macro.is_hopper()));
    hopper
}

/// Sizes from the allocation domain of a Hopper MMA output, or from its
/// loop domain when it has none.
///
/// Compute-at axes not shared across their parallel type are excluded, and
/// each of them must appear in the allocation domain.
fn hopper_mma_allocation_sizes(
    ctx: &LoweringContext,
    tv: TvRef,
    alloc_pos: AllocationPosition,
) -> Result<AllocationSizes> {
    let fusion = ctx.fusion();
    let view = fusion.tv(tv);
    let memory_type = view.memory_type;
    let allocation = view.allocation_domain().unwrap_or(view.loop_domain());

    let mut excluded: Vec<IdRef> = view.loop_domain()[..alloc_pos.get().min(view.n_dims())]
        .iter()
        .copied()
        .filter(|id| !memory_type.is_shared_across(fusion.id(*id).parallel_type))
        .collect();

    let promoted: HashMap<IdRef, IdRef> = view
        .loop_domain()
        .iter()
        .map(|id| (*id, ctx.loop_promotion.promoted(ctx.ca_map().concrete_mapped_id(*id, IdMappingMode::Loop))))
        .collect();

    let mut sizes = AllocationSizes { extents: Vec::new(), ids: Vec::new() };
    for id in allocation {
        if let Some(pos) = excluded.iter().position(|e| e == id) {
            excluded.swap_remove(pos);
            continue;
        }
        let axis = fusion.id(*id);
        if memory_type.is_partitioned_across(axis.parallel_type) {
            continue;
        }
        if axis.is_reduction() || axis.is_stride() || axis.is_broadcast() || axis.is_device_dim() {
            continue;
        }
        let source = promoted.get(id).copied().unwrap_or(*id);
        sizes.extents.push(fusion.id(source).extent.clone());
        sizes.ids.push(*id);
    }

    if !excluded.is_empty() {
        let axes: Vec<String> = excluded.iter().map(IdRef::to_string).collect();
        return ExcludedComputeAtAxisNotAllocatedSnafu { tensor: tv, axes: axes.join(", ") }.fail();
    }
    Ok(sizes)
}
