//! Circular-buffer bookkeeping shared by lowering passes.

use std::collections::HashMap;

use snafu::ensure;

use fusor_ir::{Fusion, IdRef, TvRef, Val};

use crate::error::*;

/// Loop axis of `tv` whose iterations rotate through the buffer stages.
///
/// The axis is the innermost one left of both the compute-at position and
/// the first unrolled axis that is neither thread-parallel nor broadcast.
pub fn circular_buffer_axis_position(fusion: &Fusion, tv: TvRef) -> Result<usize> {
    let view = fusion.tv(tv);
    ensure!(
        view.compute_at_pos > 0,
        InvalidCircularBufferAxisSnafu { tensor: tv, reason: "compute-at position must be larger than 0" }
    );

    let first_unroll = view
        .loop_domain()
        .iter()
        .position(|id| fusion.id(*id).parallel_type.is_unroll())
        .unwrap_or(view.n_dims());
    let unroll_or_ca = view.compute_at_pos.min(first_unroll);
    ensure!(
        unroll_or_ca > 0,
        InvalidCircularBufferAxisSnafu { tensor: tv, reason: "no valid axis outside of the unrolled axes" }
    );

    let valid = (0..unroll_or_ca).rev().find(|pos| {
        let axis = fusion.id(view.loop_domain()[*pos]);
        !axis.parallel_type.is_thread() && !axis.is_broadcast()
    });
    match valid {
        Some(pos) => Ok(pos),
        None => InvalidCircularBufferAxisSnafu { tensor: tv, reason: "every candidate axis is parallelized or broadcast" }
            .fail(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircularBufferInfo {
    original_alloc_size: HashMap<TvRef, Val>,
}

impl CircularBufferInfo {
    pub fn depth(fusion: &Fusion, tv: TvRef) -> usize {
        fusion.tv(tv).circular_buffer_depth
    }

    pub fn circular_buffer_axis(&self, fusion: &Fusion, tv: TvRef) -> Result<IdRef> {
        let pos = circular_buffer_axis_position(fusion, tv)?;
        Ok(fusion.tv(tv).loop_domain()[pos])
    }

    /// Records the size of one stage, before multiplying by the depth.
    pub fn set_original_alloc_size(&mut self, tv: TvRef, size: Val) {
        self.original_alloc_size.insert(tv, size);
    }

    pub fn original_alloc_size(&self, tv: TvRef) -> Option<&Val> {
        self.original_alloc_size.get(&tv)
    }
}
