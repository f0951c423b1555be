//! Launch and unroll parameters of the pointwise schedule.

use fusor_ir::{Fusion, ParallelType};
use tracing::debug;

use crate::domain_map::DomainMap;
use crate::error::*;
use crate::heuristic::ScheduleHeuristic;
use crate::params::PointwiseParams;
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::{HeuristicSummary, entry};
use crate::utils::{
    BroadcastMultipleInformation, break_is_disjoint, ceil_div, get_broadcast_multiples, has_view_ops, last_pow2,
    maybe_logical_reorder_as_allocation_map, working_axes,
};
use crate::vectorize::{get_vectorization_factor, inputs_outputs_with_inner_dim};

/// Winning 2-D split of the reference axes.
#[derive(Debug, Clone, Copy)]
struct BreakPoint {
    position: usize,
    flip_grid_binding: bool,
    bdimx: i64,
    bdimy: i64,
    gdim_left: i64,
    gdim_right: i64,
}

/// Computes the pointwise parameters of `fusion` for the arguments bound in
/// `runtime_info`.
///
/// Every analysis that only depends on the fusion shape is read through
/// `summary`, so that a replayed summary skips them.
pub fn get_pointwise_heuristics(
    fusion: &Fusion,
    runtime_info: &SchedulerRuntimeInfo,
    mut summary: Option<&mut HeuristicSummary>,
) -> Result<PointwiseParams> {
    let index_type = runtime_info.index_type();
    let device = &runtime_info.device;
    let config = &runtime_info.pointwise;
    let mut params = PointwiseParams { max_grid_y: device.max_grid_y, ..PointwiseParams::with_index_type(index_type) };

    let domain_map =
        HeuristicSummary::entry::<entry::DomainMap>(summary.as_deref_mut(), || Ok(DomainMap::new(fusion)))?;
    let references = HeuristicSummary::entry::<entry::ReferenceTensors>(summary.as_deref_mut(), || {
        Ok(domain_map.find_reference_tensor_view(fusion, 0).into_iter().collect())
    })?;
    let reference =
        references.first().copied().ok_or(Error::NoReferenceTensor { heuristic: ScheduleHeuristic::PointWise })?;

    let max_input_dtype_size = fusion
        .inputs()
        .iter()
        .map(|tv| fusion.tv(*tv).dtype.size_in_bytes(index_type) as i64)
        .fold(2, i64::max);

    let logical_reorder_map = HeuristicSummary::entry::<entry::LogicalReorderMap>(summary.as_deref_mut(), || {
        Ok(if has_view_ops(fusion) { Default::default() } else { maybe_logical_reorder_as_allocation_map(fusion, reference) })
    })?;

    let axes = working_axes(fusion, reference, &logical_reorder_map);
    let mut elem_counts = Vec::with_capacity(axes.len());
    for id in &axes {
        elem_counts.push(runtime_info.evaluator().evaluate_int(&fusion.id(*id).extent)?);
    }
    let n_elems: i64 = elem_counts.iter().product();

    let has_concrete_loop = fusion.tv(reference).loop_domain().iter().any(|id| {
        let axis = fusion.id(*id);
        !axis.is_broadcast() && !axis.is_reduction() && !axis.is_device_dim()
    });
    if !has_concrete_loop || n_elems == 0 {
        // Every entry the summary is validated against must still be recorded.
        HeuristicSummary::entry::<entry::VectorizableInputsAndOutputs>(summary.as_deref_mut(), || Ok(Vec::new()))?;
        HeuristicSummary::entry::<entry::BroadcastMultiples>(summary.as_deref_mut(), || {
            Ok(BroadcastMultipleInformation::default())
        })?;
        get_vectorization_factor(runtime_info, fusion, summary, &domain_map, reference, &axes, 0)?;
        debug!(reference = %reference, n_elems, "degenerate pointwise fusion");
        return Ok(params);
    }

    let vectorizable = HeuristicSummary::entry::<entry::VectorizableInputsAndOutputs>(summary.as_deref_mut(), || {
        Ok(inputs_outputs_with_inner_dim(fusion, &domain_map, reference, &axes))
    })?;

    let threads = config.threads_per_block;
    let wave = device.multiprocessor_count * threads;
    let mut max_unroll_factor = ceil_div(
        config.max_vectorize_bytes / max_input_dtype_size,
        (last_pow2(vectorizable.len() as i64) >> 2).max(1),
    )
    .max(1);
    // Unrolling must not cost a full wave of blocks.
    if n_elems < wave && max_unroll_factor > 1 {
        max_unroll_factor = max_unroll_factor.min(ceil_div(n_elems, wave));
    }

    let broadcast_info = HeuristicSummary::entry::<entry::BroadcastMultiples>(summary.as_deref_mut(), || {
        Ok(get_broadcast_multiples(fusion, &domain_map, reference, &axes, index_type))
    })?;

    let dtype_sum: i64 = fusion
        .inputs()
        .iter()
        .chain(fusion.outputs())
        .map(|tv| fusion.tv(*tv).dtype.size_in_bytes(index_type) as i64)
        .sum();
    let transfer_size_1d = elem_counts.iter().fold(1i64, |acc, count| acc.saturating_mul(count.saturating_mul(dtype_sum)));

    let mut best: Option<BreakPoint> = None;
    if n_elems.saturating_mul(config.min_2d_elements_multiple) > wave {
        let mut min_total_transfer = i64::MAX;
        for position in 0..axes.len() {
            if !break_is_disjoint(&broadcast_info.view_disjoint_set_ids, position) {
                continue;
            }
            let right_elems: i64 = elem_counts[position..].iter().product();
            let left_elems = n_elems / right_elems;
            if left_elems <= 1 {
                continue;
            }

            let Some(multiple) = broadcast_info.broadcast_multiples.get(position).copied() else {
                continue;
            };
            let left_transfer = elem_counts[..position]
                .iter()
                .fold(1i64, |acc, count| acc.saturating_mul(count.saturating_mul(multiple.lhs_multiple)));
            let right_transfer = elem_counts[position..]
                .iter()
                .fold(1i64, |acc, count| acc.saturating_mul(count.saturating_mul(multiple.rhs_multiple)));
            let transfer = left_transfer.saturating_mul(right_transfer);

            // A 2-D schedule has to save at least a tenth of the 1-D traffic.
            if transfer >= min_total_transfer || transfer.saturating_mul(10) >= transfer_size_1d.saturating_mul(9) {
                continue;
            }
            if ceil_div(right_elems, max_unroll_factor) <= device.warp_size {
                continue;
            }

            let flip_grid_binding = multiple.lhs_multiple <= multiple.rhs_multiple
                && device.l2_cache_bytes < right_transfer.saturating_mul(2);
            let bdimx = ceil_div(right_elems, max_unroll_factor).min(threads);
            let bdimy = if left_elems > device.multiprocessor_count { threads / bdimx } else { 1 };
            best = Some(BreakPoint {
                position,
                flip_grid_binding,
                bdimx,
                bdimy,
                gdim_left: ceil_div(left_elems, bdimy),
                gdim_right: ceil_div(right_elems, bdimx * max_unroll_factor),
            });
            min_total_transfer = transfer;
        }
    }

    let break_point = best.map_or(0, |bp| bp.position);
    let vectorize_factor = max_unroll_factor.min(get_vectorization_factor(
        runtime_info,
        fusion,
        summary,
        &domain_map,
        reference,
        &axes,
        break_point,
    )?);
    if vectorize_factor == 1 {
        params.vectorize = false;
        params.unroll_factor = max_unroll_factor;
    } else {
        params.vectorize = true;
        params.unroll_factor = vectorize_factor;
    }

    let bp = best.unwrap_or(BreakPoint {
        position: 0,
        flip_grid_binding: false,
        bdimx: threads,
        bdimy: 1,
        gdim_left: 1,
        gdim_right: 1,
    });
    params.break_point = bp.position;
    params.flip_grid_binding = bp.flip_grid_binding;
    params.split_block = bp.bdimy > 1;
    params.launch.bind(bp.bdimx, ParallelType::TIDx);
    if params.split_block {
        params.launch.bind(bp.bdimy, ParallelType::TIDy);
    }
    let grid_y = if bp.flip_grid_binding { bp.gdim_right } else { bp.gdim_left };
    params.split_grid_y_dim = grid_y > device.max_grid_y;

    debug!(
        reference = %reference,
        n_elems,
        ?elem_counts,
        max_input_dtype_size,
        vectorize_factor,
        ?logical_reorder_map,
        params = %params,
        "pointwise heuristics"
    );
    Ok(params)
}
