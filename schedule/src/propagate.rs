//! Propagating a scheduled reference to the rest of the fusion.
//!
//! The reference tensor is transformed explicitly; every other tensor gets
//! the same loop structure by replaying the reference's positional transform
//! log, after its logical axes are permuted into the reference's order.
//! Parallel types are then copied position by position, and tensors are
//! inlined into their consumers as deep as the mapped loops allow.

use enumset::EnumSet;
use fusor_ir::{ComputeAtMap, Fusion, IdMappingMode, IdRef, ParallelType, TvRef};
use tracing::trace;

use crate::error::Result;

/// Permutation putting `tv`'s loop axes in the order of `reference_axes`,
/// as `new2old`; `None` when the axes do not pair up one-to-one.
fn alignment_with(fusion: &Fusion, ca_map: &ComputeAtMap, tv: TvRef, reference_axes: &[IdRef]) -> Option<Vec<usize>> {
    let loop_domain = fusion.tv(tv).loop_domain();
    let mut taken = vec![false; loop_domain.len()];
    let mut new2old = Vec::with_capacity(reference_axes.len());
    for axis in reference_axes {
        let pos = (0..loop_domain.len())
            .find(|pos| !taken[*pos] && ca_map.are_mapped(*axis, loop_domain[*pos], IdMappingMode::Permissive))?;
        taken[pos] = true;
        new2old.push(pos);
    }
    Some(new2old)
}

/// Replays the transform log of `reference` on every non-input tensor whose
/// loop rank equals the reference's logical rank.
pub fn propagate_transforms(fusion: &mut Fusion, reference: TvRef) -> Result<()> {
    let ca_map = ComputeAtMap::build(fusion);
    let reference_axes = fusion.tv(reference).logical_domain().to_vec();
    let transforms = fusion.tv(reference).transforms().to_vec();

    for tv in fusion.all_tvs() {
        if tv == reference || fusion.is_input(tv) {
            continue;
        }
        if fusion.tv(tv).n_dims() != reference_axes.len() {
            trace!(tensor = %tv, reference = %reference, "rank differs, not propagated");
            continue;
        }
        if let Some(new2old) = alignment_with(fusion, &ca_map, tv, &reference_axes)
            && new2old.iter().enumerate().any(|(new, old)| new != *old)
        {
            fusion.reorder_by_new2old(tv, &new2old)?;
        }
        fusion.replay_transforms(tv, &transforms)?;
    }
    Ok(())
}

/// Copies the parallel types in `types` from the loop axes of `reference`
/// to the same positions of each of `tvs` with the same loop rank.
pub fn parallelize_all_like(
    fusion: &mut Fusion,
    reference: TvRef,
    tvs: &[TvRef],
    types: EnumSet<ParallelType>,
) -> Result<()> {
    let reference_types: Vec<ParallelType> =
        fusion.tv(reference).loop_domain().iter().map(|id| fusion.id(*id).parallel_type).collect();
    for tv in tvs {
        if *tv == reference || fusion.tv(*tv).n_dims() != reference_types.len() {
            continue;
        }
        for (pos, pt) in reference_types.iter().enumerate() {
            if types.contains(*pt) {
                fusion.parallelize(*tv, pos as i64, *pt)?;
            }
        }
    }
    Ok(())
}

/// Deepest position `tv` can be inlined at: leading loop axes mapped to the
/// same positions of every consumer, stopping at vectorized and reduction
/// axes.
pub fn max_inline_position(fusion: &Fusion, ca_map: &ComputeAtMap, tv: TvRef) -> usize {
    let consumers = fusion.consumers_of(tv);
    if consumers.is_empty() {
        return 0;
    }
    let mut position = 0;
    for (pos, p_id) in fusion.tv(tv).loop_domain().iter().enumerate() {
        let axis = fusion.id(*p_id);
        if axis.is_reduction() || axis.parallel_type == ParallelType::Vectorize {
            break;
        }
        let mapped = consumers.iter().all(|consumer| {
            fusion.tv(*consumer).axis(pos).is_some_and(|c_id| {
                fusion.id(c_id).parallel_type != ParallelType::Vectorize
                    && ca_map.are_mapped(*p_id, c_id, IdMappingMode::Permissive)
            })
        });
        if !mapped {
            break;
        }
        position = pos + 1;
    }
    position
}

/// Inlines every non-input tensor at `position`, or as deep as legal when
/// that is shallower.
pub fn inline_all_at(fusion: &mut Fusion, position: usize) -> Result<()> {
    let ca_map = ComputeAtMap::build(fusion);
    for tv in fusion.all_tvs() {
        if fusion.is_input(tv) {
            continue;
        }
        let target = position.min(max_inline_position(fusion, &ca_map, tv));
        if target > 0 {
            fusion.set_compute_at(tv, target)?;
        }
    }
    Ok(())
}

/// Inlines each of `tvs` as deep as legal.
pub fn inline_most(fusion: &mut Fusion, tvs: &[TvRef]) -> Result<()> {
    let ca_map = ComputeAtMap::build(fusion);
    for tv in tvs {
        if fusion.is_input(*tv) {
            continue;
        }
        let target = max_inline_position(fusion, &ca_map, *tv);
        if target > fusion.tv(*tv).compute_at_pos {
            trace!(tensor = %tv, position = target, "inlined");
            fusion.set_compute_at(*tv, target)?;
        }
    }
    Ok(())
}
