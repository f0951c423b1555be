//! Concrete sizes and strides of kernel buffers.
//!
//! Intermediates only need a chunk of memory as large as their `Allocate`
//! node says. Fusion outputs are laid out along their allocation domain,
//! with expanded broadcasts taking no memory, and are then presented in
//! logical order by replaying the allocation-to-logical transforms as
//! views and permutations.

use snafu::{ResultExt, ensure};
use tracing::trace;

use fusor_ir::{ExpressionEvaluator, Fusion, IdExpr, IdRef, TvRef, Val};
use fusor_lower::Allocate;

use crate::error::*;
use crate::tensor::TensorMeta;

/// Row-major strides of `sizes`, with stride zero on expanded axes.
///
/// An axis of size zero gets stride one and does not scale the axes outside
/// it, so an empty tensor keeps the strides of a non-empty one.
pub fn get_contiguous_strides(sizes: &[i64], expand_flags: &[bool]) -> Result<Vec<i64>> {
    ensure!(
        sizes.len() == expand_flags.len(),
        RankMismatchSnafu { what: "expand flags", expected: sizes.len(), actual: expand_flags.len() }
    );
    let mut strides = vec![0; sizes.len()];
    let mut current: i64 = 1;
    for axis in (0..sizes.len()).rev() {
        let size = sizes[axis];
        ensure!(size >= 0, NegativeSizeSnafu { size });
        strides[axis] = if expand_flags[axis] {
            0
        } else if size == 0 {
            1
        } else {
            let stride = current;
            current *= size;
            stride
        };
    }
    Ok(strides)
}

/// Evaluates `symbolic_sizes` and lays them out contiguously.
fn infer_shape(
    fusion: &Fusion,
    tv: TvRef,
    symbolic_sizes: &[Val],
    expand_flags: &[bool],
    evaluator: &ExpressionEvaluator,
) -> Result<TensorMeta> {
    let mut sizes = Vec::with_capacity(symbolic_sizes.len());
    for size in symbolic_sizes {
        let value = evaluator
            .evaluate_int(size)
            .context(UnresolvedSizeSnafu { tensor: fusion.name(tv), size: size.to_string() })?;
        sizes.push(value);
    }
    let strides = get_contiguous_strides(&sizes, expand_flags)?;
    TensorMeta::new(&sizes, &strides, fusion.tv(tv).dtype)
}

/// Layout of an intermediate buffer: the `Allocate` shape, never expanded.
pub fn infer_shape_of_intermediate(
    fusion: &Fusion,
    alloc: &Allocate,
    evaluator: &ExpressionEvaluator,
) -> Result<TensorMeta> {
    let expand_flags = vec![false; alloc.shape.len()];
    let mut meta = infer_shape(fusion, alloc.buffer, &alloc.shape, &expand_flags, evaluator)?;
    meta.dtype = alloc.dtype;
    Ok(meta)
}

/// Allocation-domain axes that occupy a dimension of the buffer.
fn allocated_axes(fusion: &Fusion, axes: &[IdRef]) -> Vec<IdRef> {
    axes.iter()
        .copied()
        .filter(|id| {
            let axis = fusion.id(*id);
            !axis.is_reduction() && !axis.is_stride()
        })
        .collect()
}

/// Logical-order sizes and strides of the output `tv`.
///
/// Device-parallel axes hold a single shard and count as size one.
#[tracing::instrument(skip_all, fields(tensor = %tv))]
pub fn infer_shape_of_output(fusion: &Fusion, tv: TvRef, evaluator: &ExpressionEvaluator) -> Result<TensorMeta> {
    let view = fusion.tv(tv);
    let mut symbolic_sizes = Vec::new();
    let mut expand_flags = Vec::new();
    for id in allocated_axes(fusion, view.maybe_allocation_domain()) {
        let axis = fusion.id(id);
        if axis.is_device_dim() {
            symbolic_sizes.push(Val::one());
        } else {
            symbolic_sizes.push(axis.maybe_expanded_extent().clone());
        }
        expand_flags.push(axis.has_expanded_extent());
    }

    let meta = infer_shape(fusion, tv, &symbolic_sizes, &expand_flags, evaluator)?;
    if !view.has_allocation() {
        return Ok(meta);
    }
    let meta = AllocationToLogical::new(fusion, tv, evaluator).run(meta)?;
    trace!(sizes = ?meta.sizes, strides = ?meta.strides, "output layout");
    Ok(meta)
}

// ============================================================================
// ALLOCATION TO LOGICAL
// ============================================================================

/// Replays the transforms between the allocation and logical domains of a
/// tensor on a layout that starts in allocation order.
///
/// The frontier lists the axis each layout dimension currently stands for.
/// Transforms that run from the allocation domain towards the logical domain
/// are applied as they are; transforms that produced the allocation domain
/// from the logical domain are undone in reverse order.
struct AllocationToLogical<'a> {
    fusion: &'a Fusion,
    tv: TvRef,
    evaluator: &'a ExpressionEvaluator,
    frontier: Vec<IdRef>,
}

impl<'a> AllocationToLogical<'a> {
    fn new(fusion: &'a Fusion, tv: TvRef, evaluator: &'a ExpressionEvaluator) -> Self {
        Self { fusion, tv, evaluator, frontier: Vec::new() }
    }

    fn run(mut self, mut meta: TensorMeta) -> Result<TensorMeta> {
        let fusion = self.fusion;
        let view = fusion.tv(self.tv);
        let logical = allocated_axes(fusion, view.logical_domain());
        let alloc = allocated_axes(fusion, view.maybe_allocation_domain());
        ensure!(
            meta.rank() == alloc.len(),
            RankMismatchSnafu { what: "allocation domain", expected: alloc.len(), actual: meta.rank() }
        );
        self.frontier = alloc.clone();

        for expr in fusion.exprs_between(&alloc, &logical) {
            meta = self.forward(fusion.id_expr(expr), meta)?;
        }
        for expr in fusion.exprs_between(&logical, &alloc).into_iter().rev() {
            meta = self.backward(fusion.id_expr(expr), meta)?;
        }

        let mut dims = Vec::with_capacity(logical.len());
        let mut missing = Vec::new();
        for id in &logical {
            match self.position(*id) {
                Some(pos) => dims.push(pos),
                None => missing.push(id.to_string()),
            }
        }
        ensure!(
            missing.is_empty() && self.frontier.len() == logical.len(),
            UnreachableLogicalAxesSnafu { tensor: fusion.name(self.tv), missing }
        );
        meta.permute(&dims)
    }

    fn position(&self, id: IdRef) -> Option<usize> {
        self.frontier.iter().position(|f| *f == id)
    }

    fn unsupported(&self, expr: &IdExpr) -> Error {
        UnsupportedTransformationSnafu { tensor: self.fusion.name(self.tv), transform: expr.name() }.build()
    }

    fn forward(&mut self, expr: &IdExpr, meta: TensorMeta) -> Result<TensorMeta> {
        match expr {
            IdExpr::Split { input, outer, inner, factor, inner_split } => {
                let Some(axis) = self.on_frontier(*input) else {
                    return Ok(meta);
                };
                let factor = self.evaluator.evaluate_int(factor)?;
                let meta = split_axis(&meta, axis, factor, *inner_split)?;
                self.frontier.splice(axis..=axis, [*outer, *inner]);
                Ok(meta)
            }
            IdExpr::Merge { outer, inner, output } => self.merge_pair(meta, *outer, *inner, *output),
            IdExpr::Resize { .. } => Err(self.unsupported(expr)),
        }
    }

    fn backward(&mut self, expr: &IdExpr, meta: TensorMeta) -> Result<TensorMeta> {
        match expr {
            IdExpr::Split { input, outer, inner, .. } => self.merge_pair(meta, *outer, *inner, *input),
            IdExpr::Merge { outer, inner, output } => {
                let Some(axis) = self.on_frontier(*output) else {
                    return Ok(meta);
                };
                let factor = self.evaluator.evaluate_int(&self.fusion.id(*inner).extent)?;
                let meta = split_axis(&meta, axis, factor, true)?;
                self.frontier.splice(axis..=axis, [*outer, *inner]);
                Ok(meta)
            }
            IdExpr::Resize { .. } => Err(self.unsupported(expr)),
        }
    }

    /// Frontier position of `id`.
    ///
    /// Compatibility shim: an allocation domain that sits on both sides of
    /// the logical domain yields transforms whose operands never reach the
    /// frontier. Those transforms are skipped rather than rejected.
    fn on_frontier(&self, id: IdRef) -> Option<usize> {
        let pos = self.position(id);
        if pos.is_none() {
            trace!(tensor = %self.tv, %id, "transform operand is not on the frontier; skipped");
        }
        pos
    }

    /// Views `outer` and `inner` as the single axis `merged`, permuting them
    /// next to each other first when needed.
    fn merge_pair(&mut self, meta: TensorMeta, outer: IdRef, inner: IdRef, merged: IdRef) -> Result<TensorMeta> {
        let (Some(outer_pos), Some(inner_pos)) = (self.on_frontier(outer), self.on_frontier(inner)) else {
            return Ok(meta);
        };
        let left = outer_pos.min(inner_pos);
        let meta = if outer_pos + 1 != inner_pos {
            let mut dims: Vec<usize> = (0..left).collect();
            dims.extend([outer_pos, inner_pos]);
            dims.extend((left..meta.rank()).filter(|d| *d != outer_pos && *d != inner_pos));
            meta.permute(&dims)?
        } else {
            meta
        };

        let mut shape: Vec<i64> = Vec::with_capacity(meta.rank() - 1);
        for (axis, size) in meta.sizes.iter().enumerate() {
            if axis == left {
                shape.push(-1);
            } else if axis != left + 1 {
                shape.push(*size);
            }
        }
        let meta = meta.view(&shape)?;

        let removed = outer_pos.max(inner_pos);
        self.frontier[left] = merged;
        self.frontier.remove(removed);
        Ok(meta)
    }
}

/// Views axis `axis` as two axes; `factor` is the inner extent of an inner
/// split and the outer extent otherwise.
fn split_axis(meta: &TensorMeta, axis: usize, factor: i64, inner_split: bool) -> Result<TensorMeta> {
    let mut shape: Vec<i64> = Vec::with_capacity(meta.rank() + 1);
    for (pos, size) in meta.sizes.iter().enumerate() {
        if pos == axis {
            if inner_split {
                shape.extend([-1, factor]);
            } else {
                shape.extend([factor, -1]);
            }
        } else {
            shape.push(*size);
        }
    }
    meta.view(&shape)
}
