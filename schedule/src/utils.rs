//! Analyses and graph rewrites shared by the schedulers.
//!
//! The analyses (broadcast multiples, reshape-coherent break points, reorder
//! maps) only read the fusion and are safe to memoize in a
//! [`HeuristicSummary`](crate::summary::HeuristicSummary). The rewrites
//! (caching, memory-type promotion, alias marking) mutate it and belong to
//! the scheduling phase.

use std::collections::{HashMap, HashSet};

use fusor_dtype::IndexType;
use fusor_ir::{
    AliasInfo, AllocationType, CacheOp, ComputeAtMap, ExprRef, Fusion, IdExpr, IdMappingMode, IdRef, LoadStoreOpType,
    LoopTransform, MemoryType, OpKind, TvRef,
};
use tracing::{debug, trace};

use crate::domain_map::DomainMap;
use crate::error::Result;

// ============================================================================
// ARITHMETIC
// ============================================================================

pub fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Largest power of two `<= n`, `0` for non-positive `n`.
pub fn last_pow2(n: i64) -> i64 {
    if n <= 0 { 0 } else { 1 << (63 - n.leading_zeros()) }
}

/// Largest power of two dividing `n`, `1` for non-positive `n`.
pub fn max_pow2_divisor(n: i64) -> i64 {
    if n <= 0 { 1 } else { n & n.wrapping_neg() }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Fusion inputs followed by outputs, without duplicates.
pub fn inputs_and_outputs(fusion: &Fusion) -> Vec<TvRef> {
    let mut tvs = Vec::new();
    for tv in fusion.inputs().iter().chain(fusion.outputs()) {
        if !tvs.contains(tv) {
            tvs.push(*tv);
        }
    }
    tvs
}

fn live_uses(fusion: &Fusion, tv: TvRef) -> Vec<ExprRef> {
    let live: HashSet<ExprRef> = fusion.exprs().into_iter().collect();
    fusion.tv(tv).uses().iter().copied().filter(|e| live.contains(e)).collect()
}

/// Permutes `ids` so that `ids[old]` lands at `old2new[old]`; positions the
/// map does not mention keep their relative order in the free slots.
pub fn ordered_as(ids: &[IdRef], old2new: &HashMap<usize, usize>) -> Vec<IdRef> {
    let mut slots: Vec<Option<IdRef>> = vec![None; ids.len()];
    for (old, new) in old2new {
        if *old < ids.len() && *new < ids.len() {
            slots[*new] = Some(ids[*old]);
        }
    }
    let mut rest = ids.iter().enumerate().filter(|(pos, _)| !old2new.contains_key(pos)).map(|(_, id)| *id);
    slots
        .into_iter()
        .map(|slot| slot.or_else(|| rest.next()))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_else(|| ids.to_vec())
}

/// Logical axes of `reference` the heuristics reason about: reordered by
/// `logical_reorder_map`, without reduction or device axes.
pub fn working_axes(fusion: &Fusion, reference: TvRef, logical_reorder_map: &HashMap<usize, usize>) -> Vec<IdRef> {
    let logical = fusion.tv(reference).logical_domain();
    let ordered = if logical_reorder_map.is_empty() { logical.to_vec() } else { ordered_as(logical, logical_reorder_map) };
    ordered
        .into_iter()
        .filter(|id| {
            let axis = fusion.id(*id);
            !axis.is_reduction() && !axis.is_device_dim()
        })
        .collect()
}

pub fn has_view_ops(fusion: &Fusion) -> bool {
    fusion.has_op(|kind| matches!(kind, OpKind::View))
}

// ============================================================================
// BROADCAST MULTIPLES
// ============================================================================

/// Bytes moved per element on either side of a break point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastMultiple {
    /// Summed element sizes of inputs and outputs with an axis left of the break point.
    pub lhs_multiple: i64,
    /// Summed element sizes of inputs and outputs with an axis at or right of it.
    pub rhs_multiple: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastMultipleInformation {
    /// Per reference axis, the id of the reshape-coherent set it belongs to.
    pub view_disjoint_set_ids: Vec<usize>,
    /// Per reference axis, the multiples of breaking in front of it.
    pub broadcast_multiples: Vec<BroadcastMultiple>,
}

/// Reference positions that a reshape anywhere in the fusion ties together
/// share an id; a break point must not separate them.
pub fn get_view_disjoint_set_ids(
    fusion: &Fusion,
    domain_map: &DomainMap,
    reference: TvRef,
    axes: &[IdRef],
) -> Vec<usize> {
    let coverage = DomainMap::coverage(fusion, reference, axes);
    let mut positions: Vec<usize> = (0..axes.len()).collect();

    for e in fusion.exprs() {
        let expr = fusion.expr(e);
        if !matches!(expr.kind, OpKind::View) {
            continue;
        }
        let Some(out) = expr.output(0) else { continue };
        let view = fusion.tv(out);

        // Axes linked by the reshape transforms form connected components.
        let mut parent: HashMap<IdRef, IdRef> = HashMap::new();
        let mut linked: HashSet<IdRef> = HashSet::new();
        for ie in fusion.exprs_between(view.maybe_root_domain(), view.logical_domain()) {
            let id_expr = fusion.id_expr(ie);
            let mut members = id_expr.inputs();
            members.extend(id_expr.outputs());
            linked.extend(members.iter().copied());
            for pair in members.windows(2) {
                let (a, b) = (find_id(&mut parent, pair[0]), find_id(&mut parent, pair[1]));
                if a != b {
                    parent.insert(a, b);
                }
            }
        }

        let mut components: HashMap<IdRef, Vec<usize>> = HashMap::new();
        for id in linked {
            let Some(pos) = domain_map.mapped_position(&coverage, id) else { continue };
            let root = find_id(&mut parent, id);
            components.entry(root).or_default().push(pos);
        }
        for members in components.values() {
            for pair in members.windows(2) {
                let (a, b) = (find_pos(&mut positions, pair[0]), find_pos(&mut positions, pair[1]));
                positions[a.max(b)] = a.min(b);
            }
        }
    }

    (0..axes.len()).map(|pos| find_pos(&mut positions, pos)).collect()
}

fn find_id(parent: &mut HashMap<IdRef, IdRef>, id: IdRef) -> IdRef {
    let mut root = id;
    while let Some(next) = parent.get(&root).copied() {
        root = next;
    }
    if root != id {
        parent.insert(id, root);
    }
    root
}

fn find_pos(parent: &mut [usize], pos: usize) -> usize {
    let mut root = pos;
    while parent[root] != root {
        root = parent[root];
    }
    parent[pos] = root;
    root
}

/// `true` when no set id appears on both sides of `break_point`.
pub fn break_is_disjoint(set_ids: &[usize], break_point: usize) -> bool {
    if break_point == 0 || break_point >= set_ids.len() {
        return true;
    }
    let left: HashSet<usize> = set_ids[..break_point].iter().copied().collect();
    set_ids[break_point..].iter().all(|id| !left.contains(id))
}

/// Byte multiples of breaking the reference axes at each position.
pub fn get_broadcast_multiples(
    fusion: &Fusion,
    domain_map: &DomainMap,
    reference: TvRef,
    axes: &[IdRef],
    index_type: IndexType,
) -> BroadcastMultipleInformation {
    let coverage = DomainMap::coverage(fusion, reference, axes);
    let mut multiples = vec![BroadcastMultiple::default(); axes.len()];

    for tv in inputs_and_outputs(fusion) {
        let mut remaining: Vec<IdRef> = fusion
            .tv(tv)
            .maybe_root_domain()
            .iter()
            .copied()
            .filter(|id| {
                let axis = fusion.id(*id);
                !axis.is_reduction() && !axis.is_broadcast()
            })
            .collect();

        let mut mapped = vec![false; axes.len()];
        for (pos, axis) in axes.iter().enumerate() {
            if fusion.id(*axis).is_broadcast() {
                continue;
            }
            let hit = remaining.iter().position(|id| {
                coverage[pos].iter().any(|c| domain_map.ca_map().are_mapped(*id, *c, IdMappingMode::Permissive))
            });
            if let Some(hit) = hit {
                remaining.remove(hit);
                mapped[pos] = true;
            }
        }

        let size = fusion.tv(tv).dtype.size_in_bytes(index_type) as i64;
        let mut lhs = false;
        for pos in 0..axes.len() {
            if lhs {
                multiples[pos].lhs_multiple += size;
            } else if mapped[pos] {
                lhs = true;
            }
        }
        let mut rhs = false;
        for pos in (0..axes.len()).rev() {
            if rhs || mapped[pos] {
                multiples[pos].rhs_multiple += size;
                rhs = true;
            }
        }
    }

    BroadcastMultipleInformation {
        view_disjoint_set_ids: get_view_disjoint_set_ids(fusion, domain_map, reference, axes),
        broadcast_multiples: multiples,
    }
}

// ============================================================================
// REORDER MAPS
// ============================================================================

pub fn num_device_dims(fusion: &Fusion, tv: TvRef) -> usize {
    fusion.tv(tv).loop_domain().iter().filter(|id| fusion.id(**id).is_device_dim()).count()
}

pub fn reorder_device_dims_to_front(fusion: &mut Fusion, tv: TvRef) -> Result<()> {
    let device_positions: Vec<usize> = fusion
        .tv(tv)
        .loop_domain()
        .iter()
        .enumerate()
        .filter(|(_, id)| fusion.id(**id).is_device_dim())
        .map(|(pos, _)| pos)
        .collect();
    if device_positions.is_empty() {
        return Ok(());
    }
    let pairs: Vec<(i64, i64)> = device_positions.iter().enumerate().map(|(new, old)| (*old as i64, new as i64)).collect();
    fusion.reorder(tv, &pairs)?;
    Ok(())
}

/// Applies an old-to-new position map to the loop domain of `tv`.
pub fn reorder_by_map(fusion: &mut Fusion, tv: TvRef, old2new: &HashMap<usize, usize>) -> Result<()> {
    if old2new.is_empty() {
        return Ok(());
    }
    let mut pairs: Vec<(i64, i64)> = old2new.iter().map(|(old, new)| (*old as i64, *new as i64)).collect();
    pairs.sort_unstable();
    fusion.reorder(tv, &pairs)?;
    Ok(())
}

/// Loop positions of `tv` sorted by the first logical axis each descends
/// from, as an old-to-new map.
pub fn domain_reorder_as_logical_map(fusion: &Fusion, tv: TvRef) -> HashMap<usize, usize> {
    let view = fusion.tv(tv);
    let logical = view.logical_domain();
    let keys: Vec<usize> = view
        .loop_domain()
        .iter()
        .map(|id| logical.iter().position(|l| fusion.ids_between(&[*l], &[*id]).contains(l)).unwrap_or(usize::MAX))
        .collect();
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|pos| keys[*pos]);
    order.into_iter().enumerate().map(|(new, old)| (old, new)).collect()
}

/// Loop position to allocation position, when the allocation domain is a
/// non-trivial permutation of the loop domain; empty otherwise.
pub fn maybe_logical_reorder_as_allocation_map(fusion: &Fusion, tv: TvRef) -> HashMap<usize, usize> {
    let view = fusion.tv(tv);
    let Some(allocation) = view.allocation_domain() else {
        return HashMap::new();
    };
    let loop_domain = view.loop_domain();
    if allocation == loop_domain || allocation.len() != loop_domain.len() {
        return HashMap::new();
    }
    let mut map = HashMap::new();
    for (pos, id) in loop_domain.iter().enumerate() {
        let Some(alloc_pos) = allocation.iter().position(|a| a == id) else {
            return HashMap::new();
        };
        map.insert(pos, alloc_pos);
    }
    map
}

// ============================================================================
// CACHING
// ============================================================================

/// Every intermediate tensor goes back to registers.
pub fn clear_memory_space(fusion: &mut Fusion) {
    for tv in fusion.all_tvs() {
        if !fusion.is_input(tv) && !fusion.is_output(tv) {
            fusion.set_memory_type(tv, MemoryType::Local);
        }
    }
}

/// Inserts a register copy after each fusion input that is read elementwise.
///
/// Inputs read by a slice or pad, and index tensors of a gather, are read in
/// place.
pub fn cache_inputs(fusion: &mut Fusion, unroll: bool) -> Vec<TvRef> {
    if !unroll {
        return Vec::new();
    }
    let mut cached = Vec::new();
    for input in fusion.inputs().to_vec() {
        let uses = live_uses(fusion, input);
        let read_in_place = uses.iter().any(|e| {
            let expr = fusion.expr(*e);
            match expr.kind {
                OpKind::Slice | OpKind::Pad => true,
                OpKind::IndexSelect { .. } => expr.tensor_inputs().nth(1) == Some(input),
                _ => false,
            }
        });
        if uses.is_empty() || read_in_place {
            continue;
        }
        let cache = fusion.cache_after(input, LoadStoreOpType::Set);
        trace!(input = %input, cache = %cache, "cached input");
        cached.push(cache);
    }
    cached
}

/// Computes each output into a register copy first; outputs also consumed
/// inside the fusion are forked so the copy feeds both.
///
/// Returns `(cache, output)` pairs.
pub fn cache_and_fork_outputs(fusion: &mut Fusion, unroll: bool) -> Vec<(TvRef, TvRef)> {
    let mut cached = Vec::new();
    for output in fusion.outputs().to_vec() {
        if fusion.tv(output).definition().is_none() || fusion.output_alias(output).kind == AllocationType::Evaluate {
            continue;
        }
        let output = if live_uses(fusion, output).is_empty() { output } else { fusion.cache_fork(output) };
        if unroll && let Some(cache) = fusion.cache_before(output) {
            trace!(output = %output, cache = %cache, "cached output");
            cached.push((cache, output));
        }
    }
    cached
}

/// Producer-consumer pairs whose consumer reads the producer at shifted or
/// gathered positions.
fn non_pointwise_pairs(fusion: &Fusion) -> Vec<(TvRef, TvRef)> {
    let mut pairs = Vec::new();
    for e in fusion.exprs() {
        let expr = fusion.expr(e);
        let producers: Vec<TvRef> = match expr.kind {
            OpKind::Pad | OpKind::Slice | OpKind::Cat { .. } => expr.tensor_inputs().collect(),
            OpKind::IndexSelect { .. } => expr.tensor_inputs().take(1).collect(),
            _ => continue,
        };
        for consumer in &expr.outputs {
            pairs.extend(producers.iter().map(|p| (*p, *consumer)));
        }
    }
    pairs
}

/// Gives every intermediate read by a non-pointwise op its own copy, so the
/// copy alone can later be promoted to a wider memory space.
pub fn prepare_for_memory_type_promotion(fusion: &mut Fusion) {
    let mut cached = HashSet::new();
    for (producer, _) in non_pointwise_pairs(fusion) {
        if fusion.is_input(producer) || !cached.insert(producer) {
            continue;
        }
        let cache = fusion.cache_after(producer, LoadStoreOpType::Set);
        trace!(producer = %producer, cache = %cache, "cached for memory promotion");
    }
}

fn memory_rank(memory_type: MemoryType) -> u8 {
    match memory_type {
        MemoryType::Local => 0,
        MemoryType::Shared => 1,
        MemoryType::Global => 2,
    }
}

/// Promotes producers of non-pointwise ops whose values cross threads.
///
/// When a producer axis and the consumer axis bound to the same parallel
/// type are not mapped, a thread reads values another thread wrote: shared
/// memory suffices within a block, global memory across blocks.
pub fn promote_producer_memory_types(fusion: &mut Fusion) {
    let ca_map = ComputeAtMap::build(fusion);
    let mut promotions: HashMap<TvRef, MemoryType> = HashMap::new();
    for (producer, consumer) in non_pointwise_pairs(fusion) {
        if fusion.is_input(producer) {
            continue;
        }
        for p_id in fusion.tv(producer).loop_domain() {
            let pt = fusion.id(*p_id).parallel_type;
            if !pt.is_thread() {
                continue;
            }
            let c_id = fusion.tv(consumer).loop_domain().iter().find(|c| fusion.id(**c).parallel_type == pt);
            if c_id.is_some_and(|c| ca_map.are_mapped(*p_id, *c, IdMappingMode::Permissive)) {
                continue;
            }
            let needed = if pt.is_block_dim() { MemoryType::Global } else { MemoryType::Shared };
            let entry = promotions.entry(producer).or_insert(MemoryType::Local);
            if memory_rank(needed) > memory_rank(*entry) {
                *entry = needed;
            }
        }
    }
    for (tv, memory_type) in promotions {
        if memory_rank(memory_type) > memory_rank(fusion.tv(tv).memory_type) {
            debug!(tensor = %tv, memory_type = %memory_type, "promoted producer memory type");
            fusion.set_memory_type(tv, memory_type);
        }
    }
}

/// Loads from fusion inputs stream past L1 unless the loaded value is
/// broadcast and therefore read again.
pub fn refine_cache_policy(fusion: &mut Fusion) {
    for e in fusion.exprs() {
        let expr = fusion.expr(e);
        if !matches!(expr.kind, OpKind::LoadStore { op: LoadStoreOpType::Set, .. }) {
            continue;
        }
        let (Some(src), Some(cache)) = (expr.tensor_inputs().next(), expr.output(0)) else { continue };
        if !fusion.is_input(src) {
            continue;
        }
        let reused = live_uses(fusion, cache).iter().any(|u| matches!(fusion.expr(*u).kind, OpKind::Broadcast { .. }));
        let policy = if reused { CacheOp::AllLevels } else { CacheOp::Global };
        if let OpKind::LoadStore { cache, .. } = &mut fusion.expr_mut(e).kind {
            *cache = policy;
        }
    }
}

// ============================================================================
// LOOP DOMAIN REWRITES
// ============================================================================

/// Moves broadcast loop axes that never meet a concrete extent to the
/// innermost positions of every tensor except `ignored`.
pub fn move_non_concretized_broadcast_innermost(fusion: &mut Fusion, ignored: &[TvRef]) -> Result<()> {
    let ca_map = ComputeAtMap::build(fusion);
    for tv in fusion.all_tvs() {
        if fusion.is_input(tv) || ignored.contains(&tv) {
            continue;
        }
        let loop_domain = fusion.tv(tv).loop_domain();
        let is_dangling = |id: &IdRef| {
            fusion.id(*id).is_broadcast()
                && ca_map.disjoint_set(*id, IdMappingMode::Permissive).iter().all(|m| fusion.id(*m).is_broadcast())
        };
        let (dangling, concrete): (Vec<usize>, Vec<usize>) = (0..loop_domain.len()).partition(|pos| is_dangling(&loop_domain[*pos]));
        if dangling.is_empty() || dangling.iter().enumerate().all(|(i, pos)| *pos == concrete.len() + i) {
            continue;
        }
        let new2old: Vec<usize> = concrete.into_iter().chain(dangling).collect();
        fusion.reorder_by_new2old(tv, &new2old)?;
    }
    Ok(())
}

/// Positional loop transforms that rebuild `logical` from `root`.
fn reshape_as_loop_transforms(fusion: &Fusion, root: &[IdRef], logical: &[IdRef]) -> Vec<LoopTransform> {
    let mut current = root.to_vec();
    let mut transforms = Vec::new();
    for ie in fusion.exprs_between(root, logical) {
        match fusion.id_expr(ie) {
            IdExpr::Split { input, outer, inner, factor, inner_split } => {
                let Some(axis) = current.iter().position(|id| id == input) else { continue };
                current[axis] = *outer;
                current.insert(axis + 1, *inner);
                transforms.push(LoopTransform::Split { axis, factor: factor.clone(), inner_split: *inner_split });
            }
            IdExpr::Merge { outer, inner, output } => {
                let (Some(o), Some(i)) =
                    (current.iter().position(|id| id == outer), current.iter().position(|id| id == inner))
                else {
                    continue;
                };
                let insert_at = if o < i { o } else { o - 1 };
                current.remove(o.max(i));
                current.remove(o.min(i));
                current.insert(insert_at, *output);
                transforms.push(LoopTransform::Merge { outer: o, inner: i });
            }
            IdExpr::Resize { .. } => {}
        }
    }
    if current.as_slice() != logical {
        let new2old: Option<Vec<usize>> = logical.iter().map(|id| current.iter().position(|c| c == id)).collect();
        if let Some(new2old) = new2old.filter(|n2o| n2o.len() == current.len()) {
            transforms.push(LoopTransform::Reorder { new2old });
        }
    }
    transforms
}

/// Replays every reshape onto the tensors upstream of it, so that producers
/// and consumers of a reshape share one loop structure.
pub fn propagate_reshape_transforms(fusion: &mut Fusion) -> Result<()> {
    for e in fusion.exprs() {
        let expr = fusion.expr(e);
        if !matches!(expr.kind, OpKind::View) {
            continue;
        }
        let (Some(input), Some(out)) = (expr.tensor_inputs().next(), expr.output(0)) else { continue };
        let root = fusion.tv(out).maybe_root_domain().to_vec();
        let transforms = reshape_as_loop_transforms(fusion, &root, fusion.tv(out).logical_domain());
        if transforms.is_empty() {
            continue;
        }

        let mut seen = HashSet::new();
        let mut stack = vec![input];
        while let Some(tv) = stack.pop() {
            if fusion.is_input(tv) || !seen.insert(tv) {
                continue;
            }
            if fusion.tv(tv).n_dims() == root.len() {
                trace!(tensor = %tv, view = %out, "replaying reshape");
                fusion.replay_transforms(tv, &transforms)?;
            }
            stack.extend(fusion.producers_of(tv));
        }
    }
    Ok(())
}

// ============================================================================
// ALIASES
// ============================================================================

/// Outputs that are a metadata-only rearrangement of an input are evaluated
/// as views of that input instead of being computed.
pub fn mark_aliases(fusion: &mut Fusion) {
    for output in fusion.outputs().to_vec() {
        if fusion.output_alias(output).kind != AllocationType::New {
            continue;
        }
        let mut current = output;
        while !fusion.is_input(current) {
            let Some(def) = fusion.tv(current).definition() else { break };
            let expr = fusion.expr(def);
            let inputs: Vec<TvRef> = expr.tensor_inputs().collect();
            if !expr.kind.is_metadata() || inputs.len() != 1 {
                break;
            }
            current = inputs[0];
        }
        if fusion.is_input(current) {
            debug!(output = %output, input = %current, "output aliases input");
            fusion.set_alias(
                output,
                AliasInfo { kind: AllocationType::Evaluate, aliased_io: Some(current), hide_output: false },
            );
        }
    }
}
