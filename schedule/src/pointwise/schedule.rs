//! Applying [`PointwiseParams`] to a fusion.

use std::collections::HashSet;

use enumset::EnumSet;
use fusor_ir::{Fusion, IdRef, ParallelType, TvRef, Val};
use snafu::ensure;
use tracing::{debug, instrument};

use crate::config::PointwiseConfig;
use crate::domain_map::{DomainMap, n_root_dims};
use crate::error::*;
use crate::heuristic::ScheduleHeuristic;
use crate::params::PointwiseParams;
use crate::propagate::{inline_all_at, inline_most, parallelize_all_like, propagate_transforms};
use crate::utils::{
    cache_and_fork_outputs, cache_inputs, clear_memory_space, domain_reorder_as_logical_map, has_view_ops,
    mark_aliases, maybe_logical_reorder_as_allocation_map, move_non_concretized_broadcast_innermost,
    num_device_dims, prepare_for_memory_type_promotion, promote_producer_memory_types,
    propagate_reshape_transforms, refine_cache_policy, reorder_by_map, reorder_device_dims_to_front,
    working_axes,
};
use crate::vectorize::inputs_outputs_with_inner_dim;

fn block_dim(parallel_type: ParallelType) -> Val {
    match parallel_type {
        ParallelType::TIDy => Val::symbol("blockDim.y"),
        _ => Val::symbol("blockDim.x"),
    }
}

/// Merges the reference's loop axes into one axis per side of the break
/// point when reshapes are present. Returns the `(lhs, rhs)` positions.
fn merge_through_reshapes(
    fusion: &mut Fusion,
    reference: TvRef,
    num_device_dims: usize,
    break_point: usize,
) -> Result<(Option<usize>, Option<usize>)> {
    let logical = fusion.tv(reference).logical_domain().to_vec();
    let loop_domain: Vec<IdRef> = fusion.tv(reference).loop_domain()[num_device_dims..].to_vec();
    let split_at = break_point.min(logical.len());
    let lhs_ids = fusion.ids_between(&logical[..split_at], &loop_domain);
    let rhs_ids = fusion.ids_between(&logical[split_at..], &loop_domain);

    ensure!(
        lhs_ids.is_disjoint(&rhs_ids),
        BreakPointGroupsNotDisjointSnafu { tensor: reference, break_point }
    );
    ensure!(!rhs_ids.is_empty(), EmptyRightGroupSnafu { tensor: reference, break_point });

    let mut lhs_i: Option<usize> = None;
    let mut rhs_i: Option<usize> = None;
    let ndims = fusion.tv(reference).n_dims();
    for pos in (0..ndims).rev() {
        let Some(id) = fusion.tv(reference).axis(pos) else { continue };
        if lhs_ids.contains(&id) {
            if let Some(lhs) = lhs_i {
                fusion.merge(reference, pos as i64, lhs as i64)?;
                if rhs_i.is_some_and(|rhs| rhs > pos) {
                    rhs_i = rhs_i.map(|rhs| rhs - 1);
                }
            }
            lhs_i = Some(pos);
        } else if rhs_ids.contains(&id) {
            if let Some(rhs) = rhs_i {
                fusion.merge(reference, pos as i64, rhs as i64)?;
                if lhs_i.is_some_and(|lhs| lhs > pos) {
                    lhs_i = lhs_i.map(|lhs| lhs - 1);
                }
            }
            rhs_i = Some(pos);
        }
    }
    Ok((lhs_i, rhs_i))
}

/// Merges the reference's axes right of the break point into the innermost
/// axis and the ones left of it into one axis after the device axes.
fn merge_plain(
    fusion: &mut Fusion,
    reference: TvRef,
    num_device_dims: usize,
    break_point: usize,
) -> Result<(Option<usize>, Option<usize>)> {
    let ndims = fusion.tv(reference).n_dims();
    let mut rhs_i: Option<usize> = None;
    for axis in (break_point..ndims).rev() {
        if let Some(rhs) = rhs_i {
            fusion.merge(reference, axis as i64, rhs as i64)?;
        }
        rhs_i = Some(axis);
    }
    if let Some(rhs) = rhs_i {
        fusion.reorder(reference, &[(rhs as i64, -1)])?;
    }

    let mut lhs_i: Option<usize> = None;
    for axis in (num_device_dims..break_point).rev() {
        if let Some(lhs) = lhs_i {
            fusion.merge(reference, axis as i64, lhs as i64)?;
        }
        lhs_i = Some(axis);
    }
    Ok((lhs_i, rhs_i))
}

/// Splits and binds the merged `[lhs, rhs]` pair; returns the unswitch position
/// and the axis that carries the vector width.
fn schedule_2d(fusion: &mut Fusion, reference: TvRef, params: &PointwiseParams, lhs_i: usize) -> Result<(usize, Option<IdRef>)> {
    let tv = reference;
    fusion.reorder(tv, &[(lhs_i as i64, 0), (-1, 1)])?;

    let mut vectorize_id = None;
    if params.vectorize {
        fusion.split(tv, 1, params.unroll_factor, true)?;
        fusion.split(tv, 1, block_dim(ParallelType::TIDx), true)?;
        fusion.split(tv, 0, 1i64, true)?;
        // [outer, unswitch | remainder, TIDx, vectorize]
        fusion.parallelize(tv, 1, ParallelType::Unswitch)?;
        fusion.parallelize(tv, 3, ParallelType::TIDx)?;
        vectorize_id = fusion.tv(tv).axis(4);
        fusion.reorder(tv, &[(1, 2), (2, 1), (3, 4), (4, 3)])?;
        // [outer | remainder, unswitch, vectorize, TIDx]
    } else {
        fusion.split(tv, 1, block_dim(ParallelType::TIDx), true)?;
        fusion.split(tv, 1, params.unroll_factor, true)?;
        fusion.split(tv, 0, 1i64, true)?;
        fusion.reorder(tv, &[(1, 2)])?;
        // [outer, remainder, unswitch, unroll, TIDx]
        fusion.parallelize(tv, 2, ParallelType::Unswitch)?;
        fusion.parallelize(tv, 4, ParallelType::TIDx)?;
    }

    fusion.reorder(tv, &[(1, 0)])?;
    // [remainder | outer | unswitch, unroll, TIDx]
    let max_grid_y = params.max_grid_y;
    let unswitch_pos = match (params.split_block, params.flip_grid_binding) {
        (true, true) => {
            fusion.split(tv, 1, block_dim(ParallelType::TIDy), true)?;
            // [BIDy | BIDx, TIDy | unswitch, unroll, TIDx]
            fusion.parallelize(tv, 1, ParallelType::BIDx)?;
            fusion.parallelize(tv, 2, ParallelType::TIDy)?;
            if params.split_grid_y_dim {
                fusion.split(tv, 0, max_grid_y, true)?;
                fusion.parallelize(tv, 1, ParallelType::BIDy)?;
                5
            } else {
                fusion.parallelize(tv, 0, ParallelType::BIDy)?;
                4
            }
        }
        (true, false) => {
            fusion.split(tv, 1, block_dim(ParallelType::TIDy), true)?;
            // [BIDx | BIDy, TIDy | unswitch, unroll, TIDx]
            fusion.parallelize(tv, 0, ParallelType::BIDx)?;
            fusion.parallelize(tv, 2, ParallelType::TIDy)?;
            if params.split_grid_y_dim {
                fusion.split(tv, 1, max_grid_y, true)?;
                fusion.parallelize(tv, 2, ParallelType::BIDy)?;
                5
            } else {
                fusion.parallelize(tv, 1, ParallelType::BIDy)?;
                4
            }
        }
        (false, true) => {
            // [BIDy | BIDx | unswitch, unroll, TIDx]
            fusion.parallelize(tv, 1, ParallelType::BIDx)?;
            if params.split_grid_y_dim {
                fusion.split(tv, 0, max_grid_y, true)?;
                fusion.parallelize(tv, 1, ParallelType::BIDy)?;
                4
            } else {
                fusion.parallelize(tv, 0, ParallelType::BIDy)?;
                3
            }
        }
        (false, false) => {
            // [BIDx | BIDy | unswitch, unroll, TIDx]
            fusion.parallelize(tv, 0, ParallelType::BIDx)?;
            if params.split_grid_y_dim {
                fusion.split(tv, 1, max_grid_y, true)?;
                fusion.parallelize(tv, 2, ParallelType::BIDy)?;
                4
            } else {
                fusion.parallelize(tv, 1, ParallelType::BIDy)?;
                3
            }
        }
    };
    Ok((unswitch_pos, vectorize_id))
}

/// Splits and binds the single merged axis.
fn schedule_1d(fusion: &mut Fusion, reference: TvRef, params: &PointwiseParams) -> Result<Option<IdRef>> {
    let tv = reference;
    let threads = params.launch.get(ParallelType::TIDx).unwrap_or(PointwiseConfig::default().threads_per_block);
    fusion.reorder(tv, &[(-1, 0)])?;

    if params.vectorize {
        fusion.split(tv, 0, params.unroll_factor, true)?;
        fusion.split(tv, 0, 1i64, true)?;
        fusion.split(tv, 0, threads, true)?;
        // [BIDx, TIDx, unswitch, vectorize]
        fusion.parallelize(tv, 0, ParallelType::BIDx)?;
        fusion.parallelize(tv, 1, ParallelType::TIDx)?;
        fusion.parallelize(tv, 2, ParallelType::Unswitch)?;
        let vectorize_id = fusion.tv(tv).axis(3);
        fusion.reorder(tv, &[(1, 3), (2, 1), (3, 2)])?;
        // [BIDx, unswitch, vectorize, TIDx]
        Ok(vectorize_id)
    } else {
        fusion.split(tv, 0, threads, true)?;
        fusion.split(tv, 0, params.unroll_factor, true)?;
        fusion.split(tv, 0, 1i64, true)?;
        // [BIDx, unswitch, unroll, TIDx]; the unroll axis stays serial and is
        // unrolled by inlining the caches at the unswitch position only.
        fusion.parallelize(tv, 0, ParallelType::BIDx)?;
        fusion.parallelize(tv, 1, ParallelType::Unswitch)?;
        fusion.parallelize(tv, 3, ParallelType::TIDx)?;
        Ok(None)
    }
}

/// Marks the vector axis on every vectorizable input and output; inputs
/// hand the marking to their consumers, the copies that read them.
fn vectorize_inputs_and_outputs(fusion: &mut Fusion, reference: TvRef, vectorize_id: IdRef) -> Result<()> {
    let domain_map = DomainMap::new(fusion);
    let axes = working_axes(fusion, reference, &Default::default());
    let mut vectorized = Vec::new();
    let mut vectorize_reference = false;
    for tv in inputs_outputs_with_inner_dim(fusion, &domain_map, reference, &axes) {
        vectorize_reference |= tv == reference;
        if fusion.is_input(tv) {
            vectorized.extend(fusion.consumers_of(tv));
        } else {
            vectorized.push(tv);
        }
    }
    if vectorized.is_empty() {
        return Ok(());
    }

    fusion.id_mut(vectorize_id).parallel_type = ParallelType::Vectorize;
    parallelize_all_like(fusion, reference, &vectorized, EnumSet::only(ParallelType::Vectorize))?;
    if !vectorize_reference {
        fusion.id_mut(vectorize_id).parallel_type = ParallelType::Serial;
    }
    Ok(())
}

/// Schedules `fusion` in place according to `params`.
#[instrument(skip_all, fields(params = %params))]
pub fn schedule_pointwise(fusion: &mut Fusion, params: &PointwiseParams) -> Result<()> {
    clear_memory_space(fusion);
    let cached_inputs = cache_inputs(fusion, true);
    let cached_outputs = cache_and_fork_outputs(fusion, true);
    prepare_for_memory_type_promotion(fusion);
    refine_cache_policy(fusion);

    let max_dims = fusion
        .inputs()
        .iter()
        .filter(|tv| !fusion.consumers_of(**tv).is_empty())
        .chain(fusion.outputs())
        .map(|tv| n_root_dims(fusion, *tv))
        .max()
        .unwrap_or(0);
    if max_dims == 0 {
        debug!("only zero-dimensional tensors, nothing to schedule");
        return Ok(());
    }

    let reference = DomainMap::new(fusion)
        .find_reference_tensor_view(fusion, 0)
        .ok_or(Error::NoReferenceTensor { heuristic: ScheduleHeuristic::PointWise })?;
    move_non_concretized_broadcast_innermost(fusion, &[reference])?;

    let device_dims = num_device_dims(fusion, reference);
    let break_point = params.break_point + device_dims;

    let (lhs_i, rhs_i) = if has_view_ops(fusion) {
        propagate_reshape_transforms(fusion)?;
        let to_logical = domain_reorder_as_logical_map(fusion, reference);
        reorder_by_map(fusion, reference, &to_logical)?;
        reorder_device_dims_to_front(fusion, reference)?;
        merge_through_reshapes(fusion, reference, device_dims, break_point)?
    } else {
        let to_allocation = maybe_logical_reorder_as_allocation_map(fusion, reference);
        reorder_by_map(fusion, reference, &to_allocation)?;
        reorder_device_dims_to_front(fusion, reference)?;
        merge_plain(fusion, reference, device_dims, break_point)?
    };

    let (unswitch_pos, vectorize_id) = match (params.break_point, lhs_i, rhs_i) {
        (0, _, Some(_)) => (2, schedule_1d(fusion, reference, params)?),
        (_, Some(lhs), Some(_)) => schedule_2d(fusion, reference, params, lhs)?,
        _ => return EmptyRightGroupSnafu { tensor: reference, break_point: params.break_point }.fail(),
    };
    debug!(reference = %reference, unswitch_pos, "scheduled reference");

    propagate_transforms(fusion, reference)?;
    let all_tvs = fusion.all_tvs();
    parallelize_all_like(fusion, reference, &all_tvs, EnumSet::all())?;

    if params.vectorize
        && let Some(vectorize_id) = vectorize_id
    {
        vectorize_inputs_and_outputs(fusion, reference, vectorize_id)?;
    }

    // Caches keep the unswitch position; the rest of the graph is inlined
    // as deep as it goes.
    inline_all_at(fusion, unswitch_pos)?;
    let keep_at_unswitch: HashSet<TvRef> =
        cached_inputs.iter().copied().chain(cached_outputs.iter().map(|(_, output)| *output)).collect();
    let innermost: Vec<TvRef> = fusion.all_tvs().into_iter().filter(|tv| !keep_at_unswitch.contains(tv)).collect();
    inline_most(fusion, &innermost)?;

    promote_producer_memory_types(fusion);
    mark_aliases(fusion);
    Ok(())
}
