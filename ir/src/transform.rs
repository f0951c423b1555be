//! Loop-domain transforms and memory annotations applied by schedulers.
//!
//! Every transform creates fresh axes linked to their inputs by an
//! [`IdExpr`], replaces the transformed positions of the loop domain, and is
//! appended to the tensor's positional [`LoopTransform`] log so that the same
//! sequence can later be replayed on structurally similar tensors.

use snafu::ensure;

use crate::domain::{IdExpr, IdRef, IterDomain, TensorDomain};
use crate::error::*;
use crate::fusion::Fusion;
use crate::op::{OpKind, Operand};
use crate::tensor::{LoopTransform, TvRef};
use crate::types::{IterType, LoadStoreOpType, MemoryType, ParallelType};
use crate::val::Val;

impl Fusion {
    /// Resolves a possibly negative loop-axis index of `tv`.
    pub fn normalize_axis(&self, tv: TvRef, axis: i64) -> Result<usize> {
        let ndims = self.tv(tv).n_dims();
        let pos = if axis < 0 { axis + ndims as i64 } else { axis };
        ensure!(
            (0..ndims as i64).contains(&pos),
            AxisOutOfRangeSnafu { tensor: self.name(tv).to_string(), axis, ndims }
        );
        Ok(pos as usize)
    }

    fn check_outside_compute_at(&self, tv: TvRef, axis: usize) -> Result<()> {
        let compute_at = self.tv(tv).compute_at_pos;
        ensure!(
            axis >= compute_at,
            TransformInsideComputeAtSnafu { tensor: self.name(tv).to_string(), axis, compute_at }
        );
        Ok(())
    }

    /// Splits loop axis `axis` by `factor`.
    ///
    /// With `inner_split` the inner output has extent `factor`, otherwise the
    /// outer one does.
    pub fn split(&mut self, tv: TvRef, axis: i64, factor: impl Into<Val>, inner_split: bool) -> Result<()> {
        let factor = factor.into();
        let pos = self.normalize_axis(tv, axis)?;
        self.check_outside_compute_at(tv, pos)?;
        if let Some(f) = factor.as_int() {
            ensure!(
                f > 0,
                InvalidSplitFactorSnafu { tensor: self.name(tv).to_string(), factor: factor.to_string() }
            );
        }

        let input = self.tv(tv).domain.loop_domain[pos];
        let (outer, inner) = self.split_id(input, &factor, inner_split);

        let loop_domain = &mut self.tv_mut(tv).domain.loop_domain;
        loop_domain[pos] = outer;
        loop_domain.insert(pos + 1, inner);
        self.tv_mut(tv).transforms.push(LoopTransform::Split { axis: pos, factor, inner_split });
        Ok(())
    }

    pub(crate) fn split_id(&mut self, input: IdRef, factor: &Val, inner_split: bool) -> (IdRef, IdRef) {
        let src = self.id(input).clone();
        let divided = |extent: &Val| extent.ceil_div(factor);
        let (outer_extent, inner_extent) = if src.is_broadcast() {
            (Val::one(), Val::one())
        } else if inner_split {
            (divided(&src.extent), factor.clone())
        } else {
            (factor.clone(), divided(&src.extent))
        };

        let mut outer = IterDomain::new(outer_extent, src.iter_type);
        let mut inner = IterDomain::new(inner_extent, src.iter_type);
        if let Some(expanded) = &src.expanded_extent {
            let (o, i) = if inner_split {
                (divided(expanded), factor.clone())
            } else {
                (factor.clone(), divided(expanded))
            };
            outer.expanded_extent = Some(o);
            inner.expanded_extent = Some(i);
        }

        let outer = self.add_id(outer);
        let inner = self.add_id(inner);
        self.add_id_expr(IdExpr::Split { input, outer, inner, factor: factor.clone(), inner_split });
        (outer, inner)
    }

    /// Merges loop axes `outer` and `inner` into one axis placed at `outer`'s position.
    pub fn merge(&mut self, tv: TvRef, outer: i64, inner: i64) -> Result<()> {
        let outer_pos = self.normalize_axis(tv, outer)?;
        let inner_pos = self.normalize_axis(tv, inner)?;
        ensure!(outer_pos != inner_pos, MergeSameAxisSnafu { tensor: self.name(tv).to_string(), axis: outer_pos });
        self.check_outside_compute_at(tv, outer_pos.min(inner_pos))?;

        let outer_id = self.tv(tv).domain.loop_domain[outer_pos];
        let inner_id = self.tv(tv).domain.loop_domain[inner_pos];
        let merged = self.merge_id(tv, outer_id, inner_id)?;

        let insert_at = if outer_pos < inner_pos { outer_pos } else { outer_pos - 1 };
        let loop_domain = &mut self.tv_mut(tv).domain.loop_domain;
        loop_domain.remove(outer_pos.max(inner_pos));
        loop_domain.remove(outer_pos.min(inner_pos));
        loop_domain.insert(insert_at, merged);
        self.tv_mut(tv).transforms.push(LoopTransform::Merge { outer: outer_pos, inner: inner_pos });
        Ok(())
    }

    pub(crate) fn merge_id(&mut self, tv: TvRef, outer: IdRef, inner: IdRef) -> Result<IdRef> {
        let (o, i) = (self.id(outer).clone(), self.id(inner).clone());
        let iter_type = match (o.iter_type, i.iter_type) {
            (IterType::Broadcast, IterType::Broadcast) => IterType::Broadcast,
            (IterType::Broadcast, other) | (other, IterType::Broadcast) => other,
            (a, b) if a == b => a,
            (a, b) => {
                return MergeIterTypeMismatchSnafu { tensor: self.name(tv).to_string(), outer: a, inner: b }.fail();
            }
        };

        let merged = if iter_type == IterType::Broadcast {
            let mut merged = IterDomain::broadcast();
            if o.has_expanded_extent() || i.has_expanded_extent() {
                merged.expanded_extent = Some(o.maybe_expanded_extent().mul(i.maybe_expanded_extent()));
            }
            merged
        } else {
            IterDomain::new(o.maybe_expanded_extent().mul(i.maybe_expanded_extent()), iter_type)
        };

        let output = self.add_id(merged);
        self.add_id_expr(IdExpr::Merge { outer, inner, output });
        Ok(output)
    }

    /// Moves loop axes; `old2new` pairs may use negative indices.
    ///
    /// Axes that are not mentioned keep their relative order and fill the
    /// remaining positions.
    pub fn reorder(&mut self, tv: TvRef, old2new: &[(i64, i64)]) -> Result<()> {
        let ndims = self.tv(tv).n_dims();
        let mut new2old: Vec<Option<usize>> = vec![None; ndims];
        let mut moved = vec![false; ndims];
        for (old, new) in old2new {
            let old = self.normalize_axis(tv, *old)?;
            let new = self.normalize_axis(tv, *new)?;
            ensure!(
                !moved[old] && new2old[new].is_none(),
                InvalidReorderSnafu { tensor: self.name(tv).to_string(), reason: "duplicate axis in reorder map" }
            );
            moved[old] = true;
            new2old[new] = Some(old);
        }
        let mut rest = (0..ndims).filter(|old| !moved[*old]);
        let new2old: Vec<usize> = new2old.into_iter().map(|slot| slot.or_else(|| rest.next()).unwrap_or(0)).collect();
        self.reorder_by_new2old(tv, &new2old)
    }

    /// Applies a full permutation: the axis at new position `i` was at `new2old[i]`.
    pub fn reorder_by_new2old(&mut self, tv: TvRef, new2old: &[usize]) -> Result<()> {
        let ndims = self.tv(tv).n_dims();
        let mut seen = vec![false; ndims];
        for old in new2old {
            ensure!(
                *old < ndims && !std::mem::replace(&mut seen[*old], true),
                InvalidReorderSnafu { tensor: self.name(tv).to_string(), reason: format!("{new2old:?} is not a permutation") }
            );
        }
        ensure!(
            new2old.len() == ndims,
            InvalidReorderSnafu { tensor: self.name(tv).to_string(), reason: format!("expected {ndims} positions") }
        );
        let compute_at = self.tv(tv).compute_at_pos;
        if let Some(axis) = (0..compute_at).find(|i| new2old[*i] != *i) {
            return TransformInsideComputeAtSnafu { tensor: self.name(tv).to_string(), axis, compute_at }.fail();
        }
        if new2old.iter().enumerate().all(|(i, old)| i == *old) {
            return Ok(());
        }

        let old_loop = self.tv(tv).domain.loop_domain.clone();
        let view = self.tv_mut(tv);
        view.domain.loop_domain = new2old.iter().map(|old| old_loop[*old]).collect();
        view.transforms.push(LoopTransform::Reorder { new2old: new2old.to_vec() });
        Ok(())
    }

    pub fn parallelize(&mut self, tv: TvRef, axis: i64, parallel_type: ParallelType) -> Result<()> {
        let pos = self.normalize_axis(tv, axis)?;
        let id = self.tv(tv).domain.loop_domain[pos];
        self.id_mut(id).parallel_type = parallel_type;
        Ok(())
    }

    pub fn set_memory_type(&mut self, tv: TvRef, memory_type: MemoryType) {
        self.tv_mut(tv).memory_type = memory_type;
    }

    /// Replicates the buffer `depth` times; `1` disables circular buffering.
    pub fn circular_buffer(&mut self, tv: TvRef, depth: usize) {
        self.tv_mut(tv).circular_buffer_depth = depth.max(1);
    }

    /// Inlines `tv` into its consumers' loops up to `position`.
    pub fn set_compute_at(&mut self, tv: TvRef, position: usize) -> Result<()> {
        let ndims = self.tv(tv).n_dims();
        ensure!(
            position <= ndims,
            InvalidComputeAtSnafu { tensor: self.name(tv).to_string(), position, ndims }
        );
        self.tv_mut(tv).compute_at_pos = position;
        for consumer in self.consumers_of(tv) {
            let max_producer_pos =
                self.producers_of(consumer).iter().map(|p| self.tv(*p).compute_at_pos).max().unwrap_or(0);
            self.tv_mut(consumer).max_producer_pos = max_producer_pos;
        }
        Ok(())
    }

    /// Sets an explicit physical layout; every axis must be connected to the logical domain.
    pub fn set_allocation_domain(&mut self, tv: TvRef, allocation: Vec<IdRef>) -> Result<()> {
        let logical = self.tv(tv).domain.logical.clone();
        let related = self.ids_between(&logical, &allocation);
        let ancestors = self.ids_between(&allocation, &logical);
        for id in &allocation {
            ensure!(
                logical.contains(id) || related.contains(id) || ancestors.contains(id),
                InvalidAllocationDomainSnafu {
                    tensor: self.name(tv).to_string(),
                    reason: format!("{id} is not connected to the logical domain"),
                }
            );
        }
        self.tv_mut(tv).domain.allocation = Some(allocation);
        Ok(())
    }

    /// Restores the loop domain to the logical domain and forgets the transform log.
    pub fn reset_loop_domain(&mut self, tv: TvRef) {
        let view = self.tv_mut(tv);
        view.domain.loop_domain = view.domain.logical.clone();
        view.transforms.clear();
    }

    /// Replays a positional transform log recorded on another tensor.
    pub fn replay_transforms(&mut self, tv: TvRef, transforms: &[LoopTransform]) -> Result<()> {
        for transform in transforms {
            match transform {
                LoopTransform::Split { axis, factor, inner_split } => {
                    self.split(tv, *axis as i64, factor.clone(), *inner_split)?
                }
                LoopTransform::Merge { outer, inner } => self.merge(tv, *outer as i64, *inner as i64)?,
                LoopTransform::Reorder { new2old } => self.reorder_by_new2old(tv, new2old)?,
            }
        }
        Ok(())
    }

    // =========================================================================
    // Caching
    // =========================================================================

    /// Inserts `cache = op(tv)` and makes every consumer of `tv` read `cache`.
    pub fn cache_after(&mut self, tv: TvRef, op: LoadStoreOpType) -> TvRef {
        let logical = self.no_reductions(self.tv(tv).logical_domain());
        let cache = self.new_tensor_like(self.tv(tv).dtype, &logical);
        let live: Vec<_> = self.exprs();
        let uses: Vec<_> = self.tv(tv).uses().iter().copied().filter(|e| live.contains(e)).collect();
        for use_expr in uses {
            self.replace_input(use_expr, tv, cache);
        }
        self.add_expr(
            OpKind::LoadStore { op, cache: Default::default() },
            vec![Operand::Tensor(tv)],
            vec![cache],
        );
        cache
    }

    /// Moves the computation of `tv` into a new local producer and turns `tv`
    /// into a plain copy of it.
    pub fn cache_before(&mut self, tv: TvRef) -> Option<TvRef> {
        let def = self.tv(tv).definition()?;
        let domain = self.tv(tv).domain.clone();
        let transforms = self.tv(tv).transforms.clone();
        let dtype = self.tv(tv).dtype;

        let cache = self.new_tensor(dtype, Vec::new());
        let view = self.tv_mut(cache);
        view.domain = domain.clone();
        view.transforms = transforms;

        let logical = self.no_reductions(&domain.logical);
        let fresh: Vec<IdRef> = logical.iter().map(|id| self.clone_id(*id)).collect();
        // A permuted allocation domain carries over to the fresh axes.
        let allocation = domain.allocation.as_ref().and_then(|alloc| {
            alloc.iter().map(|id| logical.iter().position(|l| l == id).map(|pos| fresh[pos])).collect::<Option<Vec<_>>>()
        });
        let view = self.tv_mut(tv);
        view.domain = TensorDomain::new(fresh);
        view.domain.allocation = allocation;
        view.transforms.clear();

        self.replace_output_of(def, tv, cache);
        self.add_expr(OpKind::set(), vec![Operand::Tensor(cache)], vec![tv]);
        Some(cache)
    }

    /// For an output that is also consumed inside the fusion, adds a copy that
    /// becomes the output while `tv` stays an intermediate.
    pub fn cache_fork(&mut self, tv: TvRef) -> TvRef {
        let logical = self.no_reductions(self.tv(tv).logical_domain());
        let fork = self.new_tensor_like(self.tv(tv).dtype, &logical);
        self.add_expr(OpKind::set(), vec![Operand::Tensor(tv)], vec![fork]);
        self.replace_output(tv, fork);
        self.tv_mut(tv).memory_type = MemoryType::Local;
        fork
    }
}
