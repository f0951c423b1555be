//! Vectorization analysis.
//!
//! A tensor can be accessed with vector loads when its innermost allocated
//! axis iterates along the innermost reference axis. The widest usable
//! vector is bounded by the dtype, by the buffer alignment and by the
//! contiguous run of elements right of the break point.

use std::collections::HashMap;

use fusor_ir::{Fusion, IdRef, TvRef, Val};
use tracing::trace;

use crate::domain_map::DomainMap;
use crate::error::Result;
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::{HeuristicSummary, entry};
use crate::utils::{inputs_and_outputs, max_pow2_divisor};

/// Innermost allocated axis of `tv` that is neither broadcast nor reduction.
fn innermost_allocated_axis(fusion: &Fusion, tv: TvRef) -> Option<IdRef> {
    fusion.tv(tv).maybe_allocation_domain().iter().rev().copied().find(|id| {
        let axis = fusion.id(*id);
        !axis.is_broadcast() && !axis.is_reduction()
    })
}

/// Inputs and outputs whose innermost allocated axis maps to the innermost
/// of the reference `axes`.
pub fn inputs_outputs_with_inner_dim(
    fusion: &Fusion,
    domain_map: &DomainMap,
    reference: TvRef,
    axes: &[IdRef],
) -> Vec<TvRef> {
    let Some(inner_pos) = axes.len().checked_sub(1) else {
        return Vec::new();
    };
    let coverage = DomainMap::coverage(fusion, reference, axes);
    inputs_and_outputs(fusion)
        .into_iter()
        .filter(|tv| {
            innermost_allocated_axis(fusion, *tv)
                .is_some_and(|id| domain_map.mapped_position(&coverage, id) == Some(inner_pos))
        })
        .collect()
}

/// For every break point `0..=axes.len()`, the symbolic number of contiguous
/// innermost elements of each of `tvs` that lie right of it.
pub fn contig_inner_size_maps(
    fusion: &Fusion,
    domain_map: &DomainMap,
    reference: TvRef,
    axes: &[IdRef],
    tvs: &[TvRef],
) -> Vec<HashMap<TvRef, Val>> {
    let coverage = DomainMap::coverage(fusion, reference, axes);
    (0..=axes.len())
        .map(|break_point| {
            tvs.iter()
                .map(|tv| {
                    let mut size = Val::one();
                    for id in fusion.tv(*tv).maybe_allocation_domain().iter().rev() {
                        let axis = fusion.id(*id);
                        if axis.is_broadcast() || axis.is_reduction() {
                            continue;
                        }
                        match domain_map.mapped_position(&coverage, *id) {
                            Some(pos) if pos >= break_point => size = size.mul(&axis.extent),
                            _ => break,
                        }
                    }
                    (*tv, size)
                })
                .collect()
        })
        .collect()
}

/// Widest vector width every vectorizable input and output supports at
/// `break_point`; `1` disables vectorization.
///
/// Records the vectorizable tensors and their contiguous inner sizes in
/// `summary`.
pub fn get_vectorization_factor(
    runtime_info: &SchedulerRuntimeInfo,
    fusion: &Fusion,
    mut summary: Option<&mut HeuristicSummary>,
    domain_map: &DomainMap,
    reference: TvRef,
    axes: &[IdRef],
    break_point: usize,
) -> Result<i64> {
    let vectorizable = HeuristicSummary::entry::<entry::VectorizableInputsAndOutputs>(summary.as_deref_mut(), || {
        Ok(inputs_outputs_with_inner_dim(fusion, domain_map, reference, axes))
    })?;
    let inner_sizes = HeuristicSummary::entry::<entry::TvToContigInnerSizeMaps>(summary, || {
        Ok(contig_inner_size_maps(fusion, domain_map, reference, axes, &vectorizable))
    })?;

    if vectorizable.is_empty() {
        return Ok(1);
    }
    let Some(sizes) = inner_sizes.get(break_point) else {
        return Ok(1);
    };

    let max_bytes = runtime_info.pointwise.max_vectorize_bytes;
    let mut factor = max_bytes;
    for tv in vectorizable.iter() {
        let dtype_size = fusion.tv(*tv).dtype.size_in_bytes(runtime_info.index_type()) as i64;
        let inner = match sizes.get(tv) {
            Some(size) => runtime_info.evaluator().evaluate_int(size)?,
            None => 1,
        };
        let tv_factor = if inner <= 0 {
            1
        } else {
            let alignment = runtime_info.alignment_size(*tv) as i64;
            (max_bytes / dtype_size).min(alignment / dtype_size).min(max_pow2_divisor(inner)).max(1)
        };
        trace!(tensor = %tv, inner, tv_factor, "vectorization bound");
        factor = factor.min(tv_factor);
    }
    Ok(factor.max(1))
}
