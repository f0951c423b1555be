//! Graph-building operations.
//!
//! Each operation validates its operands, creates the output tensors with
//! fresh axes and registers the defining expression. Output axes of
//! elementwise operations take their extent from the first operand that is
//! not broadcast along that position.

use fusor_dtype::DType;
use snafu::ensure;

use crate::domain::{IdExpr, IdRef, IterDomain, TensorDomain};
use crate::error::*;
use crate::fusion::Fusion;
use crate::op::{OpKind, Operand, WelfordInit};
use crate::tensor::TvRef;
use crate::types::{BinaryOp, LoadStoreOpType, MmaMacro, ReduceOp, TernaryOp, UnaryOp};
use crate::val::Val;

impl Fusion {
    /// Logical axes of `tv` a consumer iterates over.
    fn consumed_axes(&self, tv: TvRef) -> Vec<IdRef> {
        self.no_reductions(self.tv(tv).logical_domain())
    }

    /// Output axes of an elementwise operation over `operands`.
    fn elementwise_axes(&mut self, op: &'static str, operands: &[TvRef]) -> Result<Vec<IdRef>> {
        let shapes: Vec<Vec<IdRef>> = operands.iter().map(|tv| self.consumed_axes(*tv)).collect();
        let rank = shapes.first().map_or(0, Vec::len);
        ensure!(
            shapes.iter().all(|s| s.len() == rank),
            InvalidOperandsSnafu { op, reason: format!("operand ranks differ: {:?}", shapes.iter().map(Vec::len).collect::<Vec<_>>()) }
        );

        let mut axes = Vec::with_capacity(rank);
        for pos in 0..rank {
            let concrete = shapes.iter().map(|s| s[pos]).find(|id| !self.id(*id).is_broadcast());
            let id = match concrete {
                Some(id) => IterDomain::iteration(self.id(id).extent.clone()),
                None => match shapes.iter().find_map(|s| self.id(s[pos]).expanded_extent.clone()) {
                    Some(expanded) => IterDomain::expanded_broadcast(expanded),
                    None => IterDomain::broadcast(),
                },
            };
            axes.push(self.add_id(id));
        }
        Ok(axes)
    }

    fn elementwise(&mut self, kind: OpKind, op: &'static str, operands: &[TvRef], dtype: DType) -> Result<TvRef> {
        let axes = self.elementwise_axes(op, operands)?;
        let out = self.new_tensor(dtype, axes);
        self.add_expr(kind, operands.iter().map(|tv| Operand::Tensor(*tv)).collect(), vec![out]);
        Ok(out)
    }

    pub fn unary(&mut self, op: UnaryOp, x: TvRef) -> TvRef {
        let axes = self.consumed_axes(x);
        let out = self.new_tensor_like(self.tv(x).dtype, &axes);
        self.add_expr(OpKind::Unary(op), vec![Operand::Tensor(x)], vec![out]);
        out
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: TvRef, rhs: TvRef) -> Result<TvRef> {
        let dtype = self.tv(lhs).dtype;
        self.elementwise(OpKind::Binary(op), "Binary", &[lhs, rhs], dtype)
    }

    pub fn add(&mut self, lhs: TvRef, rhs: TvRef) -> Result<TvRef> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: TvRef, rhs: TvRef) -> Result<TvRef> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    /// Elementwise op of a tensor and a scalar.
    pub fn binary_scalar(&mut self, op: BinaryOp, lhs: TvRef, rhs: Val) -> TvRef {
        let axes = self.consumed_axes(lhs);
        let out = self.new_tensor_like(self.tv(lhs).dtype, &axes);
        self.add_expr(OpKind::Binary(op), vec![Operand::Tensor(lhs), Operand::Scalar(rhs)], vec![out]);
        out
    }

    pub fn ternary(&mut self, op: TernaryOp, a: TvRef, b: TvRef, c: TvRef) -> Result<TvRef> {
        let dtype = self.tv(b).dtype;
        self.elementwise(OpKind::Ternary(op), "Ternary", &[a, b, c], dtype)
    }

    pub fn set(&mut self, x: TvRef) -> TvRef {
        self.load_store(x, LoadStoreOpType::Set)
    }

    pub fn load_store(&mut self, x: TvRef, op: LoadStoreOpType) -> TvRef {
        let axes = self.consumed_axes(x);
        let out = self.new_tensor_like(self.tv(x).dtype, &axes);
        self.add_expr(OpKind::LoadStore { op, cache: Default::default() }, vec![Operand::Tensor(x)], vec![out]);
        out
    }

    /// Tensor of `shape` filled with `value`.
    pub fn full(&mut self, shape: &[Val], value: Val, dtype: DType) -> TvRef {
        let axes = shape.iter().map(|extent| self.add_id(IterDomain::iteration(extent.clone()))).collect();
        let out = self.new_tensor(dtype, axes);
        self.add_expr(OpKind::Full { value: value.clone() }, vec![Operand::Scalar(value)], vec![out]);
        out
    }

    pub fn iota(&mut self, length: Val, dtype: DType) -> TvRef {
        let axis = self.add_id(IterDomain::iteration(length.clone()));
        let out = self.new_tensor(dtype, vec![axis]);
        self.add_expr(OpKind::Iota, vec![Operand::Scalar(length)], vec![out]);
        out
    }

    // =========================================================================
    // Reductions
    // =========================================================================

    /// Output axes of a reduction of `x` over `axes`.
    fn reduction_axes(&mut self, op: &'static str, x: TvRef, axes: &[usize]) -> Result<Vec<IdRef>> {
        let input = self.consumed_axes(x);
        ensure!(
            !axes.is_empty() && axes.iter().all(|a| *a < input.len()),
            InvalidOperandsSnafu { op, reason: format!("reduction axes {axes:?} for rank {}", input.len()) }
        );
        Ok(input
            .iter()
            .enumerate()
            .map(|(pos, id)| {
                let src = self.id(*id);
                let axis = if axes.contains(&pos) {
                    IterDomain::reduction(src.maybe_expanded_extent().clone())
                } else {
                    let mut copy = IterDomain::new(src.extent.clone(), src.iter_type);
                    copy.expanded_extent = src.expanded_extent.clone();
                    copy
                };
                self.add_id(axis)
            })
            .collect())
    }

    pub fn reduction(&mut self, op: ReduceOp, x: TvRef, axes: &[usize], init: Val) -> Result<TvRef> {
        let logical = self.reduction_axes("Reduction", x, axes)?;
        let out = self.new_tensor(self.tv(x).dtype, logical);
        self.add_expr(OpKind::Reduction { op, init }, vec![Operand::Tensor(x)], vec![out]);
        Ok(out)
    }

    pub fn sum(&mut self, x: TvRef, axes: &[usize]) -> Result<TvRef> {
        let init = Val::zero().with_dtype(self.tv(x).dtype);
        self.reduction(ReduceOp::Add, x, axes, init)
    }

    /// Several reductions over the same axes computed in one pass.
    pub fn grouped_reduction(
        &mut self,
        ops: &[ReduceOp],
        xs: &[TvRef],
        axes: &[usize],
        inits: Vec<Val>,
    ) -> Result<Vec<TvRef>> {
        ensure!(
            ops.len() == xs.len() && xs.len() == inits.len() && !xs.is_empty(),
            InvalidOperandsSnafu { op: "GroupedReduction", reason: "ops, operands and inits must pair up" }
        );
        let mut outs = Vec::with_capacity(xs.len());
        for x in xs {
            let logical = self.reduction_axes("GroupedReduction", *x, axes)?;
            outs.push(self.new_tensor(self.tv(*x).dtype, logical));
        }
        self.add_expr(
            OpKind::GroupedReduction { ops: ops.to_vec(), inits },
            xs.iter().map(|x| Operand::Tensor(*x)).collect(),
            outs.clone(),
        );
        Ok(outs)
    }

    /// Running mean, variance and count of `x` over `axes`.
    pub fn welford(&mut self, x: TvRef, axes: &[usize], init: WelfordInit) -> Result<[TvRef; 3]> {
        let outs = self.welford_outputs("Welford", x, axes)?;
        self.add_expr(OpKind::Welford(init), vec![Operand::Tensor(x)], outs.to_vec());
        Ok(outs)
    }

    pub fn grouped_welford(&mut self, xs: &[TvRef], axes: &[usize], inits: Vec<WelfordInit>) -> Result<Vec<TvRef>> {
        ensure!(
            xs.len() == inits.len() && !xs.is_empty(),
            InvalidOperandsSnafu { op: "GroupedWelford", reason: "one init per operand is required" }
        );
        let mut outs = Vec::with_capacity(xs.len() * 3);
        for x in xs {
            outs.extend(self.welford_outputs("GroupedWelford", *x, axes)?);
        }
        self.add_expr(
            OpKind::GroupedWelford(inits),
            xs.iter().map(|x| Operand::Tensor(*x)).collect(),
            outs.clone(),
        );
        Ok(outs)
    }

    fn welford_outputs(&mut self, op: &'static str, x: TvRef, axes: &[usize]) -> Result<[TvRef; 3]> {
        let avg_axes = self.reduction_axes(op, x, axes)?;
        let dtype = self.tv(x).dtype;
        let avg = self.new_tensor(dtype, avg_axes.clone());
        let var = self.new_tensor_like(dtype, &avg_axes);
        let n = self.new_tensor_like(DType::Index, &avg_axes);
        Ok([avg, var, n])
    }

    // =========================================================================
    // Shape operations
    // =========================================================================

    /// Inserts new broadcast axes where `is_new` is set.
    pub fn broadcast(&mut self, x: TvRef, is_new: &[bool]) -> Result<TvRef> {
        let input = self.consumed_axes(x);
        let kept = is_new.iter().filter(|n| !**n).count();
        ensure!(
            kept == input.len(),
            InvalidOperandsSnafu {
                op: "Broadcast",
                reason: format!("{kept} existing axes flagged for an operand of rank {}", input.len()),
            }
        );
        let mut src = input.into_iter();
        let mut axes = Vec::with_capacity(is_new.len());
        for new in is_new {
            let id = if *new {
                self.add_id(IterDomain::broadcast())
            } else if let Some(id) = src.next() {
                self.clone_id(id)
            } else {
                continue;
            };
            axes.push(id);
        }
        let out = self.new_tensor(self.tv(x).dtype, axes);
        self.add_expr(OpKind::Broadcast { is_new: is_new.to_vec() }, vec![Operand::Tensor(x)], vec![out]);
        Ok(out)
    }

    /// Removes broadcast axes flagged in `is_squeezed`.
    pub fn squeeze(&mut self, x: TvRef, is_squeezed: &[bool]) -> Result<TvRef> {
        let input = self.consumed_axes(x);
        ensure!(
            is_squeezed.len() == input.len(),
            InvalidOperandsSnafu { op: "Squeeze", reason: "one flag per operand axis is required" }
        );
        for (id, squeezed) in input.iter().zip(is_squeezed) {
            ensure!(
                !squeezed || self.id(*id).is_broadcast(),
                InvalidOperandsSnafu { op: "Squeeze", reason: format!("{id} is not a broadcast axis") }
            );
        }
        let kept: Vec<IdRef> = input.iter().zip(is_squeezed).filter(|(_, s)| !**s).map(|(id, _)| *id).collect();
        let out = self.new_tensor_like(self.tv(x).dtype, &kept);
        self.add_expr(OpKind::Squeeze { is_squeezed: is_squeezed.to_vec() }, vec![Operand::Tensor(x)], vec![out]);
        Ok(out)
    }

    /// Expands broadcast axes to the given extents; `None` keeps the axis.
    pub fn expand(&mut self, x: TvRef, extents: &[Option<Val>]) -> Result<TvRef> {
        let input = self.consumed_axes(x);
        ensure!(
            extents.len() == input.len(),
            InvalidOperandsSnafu { op: "Expand", reason: "one extent per operand axis is required" }
        );
        let mut axes = Vec::with_capacity(input.len());
        for (id, extent) in input.iter().zip(extents) {
            let axis = match extent {
                Some(extent) => {
                    ensure!(
                        self.id(*id).is_broadcast(),
                        InvalidOperandsSnafu { op: "Expand", reason: format!("{id} is not a broadcast axis") }
                    );
                    self.add_id(IterDomain::expanded_broadcast(extent.clone()))
                }
                None => self.clone_id(*id),
            };
            axes.push(axis);
        }
        let out = self.new_tensor(self.tv(x).dtype, axes);
        self.add_expr(OpKind::Expand, vec![Operand::Tensor(x)], vec![out]);
        Ok(out)
    }

    /// Output axis `i` is operand axis `new2old[i]`.
    pub fn permute(&mut self, x: TvRef, new2old: &[usize]) -> Result<TvRef> {
        let input = self.consumed_axes(x);
        let mut sorted = new2old.to_vec();
        sorted.sort_unstable();
        ensure!(
            sorted == (0..input.len()).collect::<Vec<_>>(),
            InvalidOperandsSnafu { op: "Permute", reason: format!("{new2old:?} is not a permutation of rank {}", input.len()) }
        );
        let permuted: Vec<IdRef> = new2old.iter().map(|old| input[*old]).collect();
        let out = self.new_tensor_like(self.tv(x).dtype, &permuted);
        self.add_expr(OpKind::Permute { new2old: new2old.to_vec() }, vec![Operand::Tensor(x)], vec![out]);
        Ok(out)
    }

    /// Output whose root domain copies the operand and whose logical domain
    /// is derived from it by the transform `rewrite` builds.
    fn reshaped(
        &mut self,
        op: OpKind,
        x: TvRef,
        rewrite: impl FnOnce(&mut Self, &mut Vec<IdRef>) -> Result<()>,
    ) -> Result<TvRef> {
        let input = self.consumed_axes(x);
        let root: Vec<IdRef> = input.iter().map(|id| self.clone_id(*id)).collect();
        let mut logical = root.clone();
        rewrite(self, &mut logical)?;

        let out = self.new_tensor(self.tv(x).dtype, Vec::new());
        self.tv_mut(out).domain =
            TensorDomain { root: Some(root), loop_domain: logical.clone(), logical, allocation: None };
        self.add_expr(op, vec![Operand::Tensor(x)], vec![out]);
        Ok(out)
    }

    /// Reshape splitting axis `axis` into `[extent / factor, factor]`.
    pub fn view_split(&mut self, x: TvRef, axis: usize, factor: i64) -> Result<TvRef> {
        ensure!(
            axis < self.consumed_axes(x).len() && factor > 0,
            InvalidOperandsSnafu { op: "View", reason: format!("cannot split axis {axis} by {factor}") }
        );
        self.reshaped(OpKind::View, x, |fusion, logical| {
            let (outer, inner) = fusion.split_id(logical[axis], &Val::int(factor), true);
            logical[axis] = outer;
            logical.insert(axis + 1, inner);
            Ok(())
        })
    }

    /// Reshape merging axes `axis` and `axis + 1`.
    pub fn view_merge(&mut self, x: TvRef, axis: usize) -> Result<TvRef> {
        ensure!(
            axis + 1 < self.consumed_axes(x).len(),
            InvalidOperandsSnafu { op: "View", reason: format!("cannot merge axis {axis} with its successor") }
        );
        self.reshaped(OpKind::View, x, |fusion, logical| {
            let merged = fusion.merge_id(x, logical[axis], logical[axis + 1])?;
            logical.splice(axis..axis + 2, [merged]);
            Ok(())
        })
    }

    /// Pads axis `axis` with `left` and `right` elements.
    pub fn pad(&mut self, x: TvRef, axis: usize, left: Val, right: Val) -> Result<TvRef> {
        self.resized(OpKind::Pad, "Pad", x, axis, left, right)
    }

    /// Keeps `[start, stop)` of axis `axis`.
    pub fn slice(&mut self, x: TvRef, axis: usize, start: Val, stop: Val) -> Result<TvRef> {
        let extent = match self.consumed_axes(x).get(axis) {
            Some(id) => self.id(*id).extent.clone(),
            None => return InvalidOperandsSnafu { op: "Slice", reason: format!("axis {axis} out of range") }.fail(),
        };
        let left = Val::zero().sub(&start);
        let right = stop.sub(&extent);
        self.resized(OpKind::Slice, "Slice", x, axis, left, right)
    }

    fn resized(&mut self, kind: OpKind, op: &'static str, x: TvRef, axis: usize, left: Val, right: Val) -> Result<TvRef> {
        ensure!(
            axis < self.consumed_axes(x).len(),
            InvalidOperandsSnafu { op, reason: format!("axis {axis} out of range") }
        );
        self.reshaped(kind, x, |fusion, logical| {
            let input = logical[axis];
            let extent = fusion.id(input).extent.add(&left).add(&right);
            let output = fusion.add_id(IterDomain::iteration(extent));
            fusion.add_id_expr(IdExpr::Resize { input, output, left, right });
            logical[axis] = output;
            Ok(())
        })
    }

    /// Concatenation along `axis`; all other axes must agree.
    pub fn cat(&mut self, xs: &[TvRef], axis: usize) -> Result<TvRef> {
        let Some(first) = xs.first().copied() else {
            return InvalidOperandsSnafu { op: "Cat", reason: "no operands" }.fail();
        };
        let shapes: Vec<Vec<IdRef>> = xs.iter().map(|tv| self.consumed_axes(*tv)).collect();
        let rank = shapes[0].len();
        ensure!(
            axis < rank && shapes.iter().all(|s| s.len() == rank),
            InvalidOperandsSnafu { op: "Cat", reason: format!("cannot concatenate along axis {axis}") }
        );
        let extent = shapes.iter().fold(Val::zero(), |acc, s| acc.add(&self.id(s[axis]).extent));
        let mut axes = shapes[0].clone();
        axes.remove(axis);
        let mut out_axes: Vec<IdRef> = axes.iter().map(|id| self.clone_id(*id)).collect();
        out_axes.insert(axis, self.add_id(IterDomain::iteration(extent)));
        let out = self.new_tensor(self.tv(first).dtype, out_axes);
        self.add_expr(OpKind::Cat { axis }, xs.iter().map(|x| Operand::Tensor(*x)).collect(), vec![out]);
        Ok(out)
    }

    /// Gathers entries of `x` along `axis` at the positions held in the 1-D `index`.
    pub fn index_select(&mut self, x: TvRef, axis: usize, index: TvRef) -> Result<TvRef> {
        let input = self.consumed_axes(x);
        let index_axes = self.consumed_axes(index);
        ensure!(
            axis < input.len() && index_axes.len() == 1,
            InvalidOperandsSnafu { op: "IndexSelect", reason: "expects a valid axis and a 1-D index" }
        );
        let mut axes: Vec<IdRef> = input.iter().map(|id| self.clone_id(*id)).collect();
        axes[axis] = self.clone_id(index_axes[0]);
        let out = self.new_tensor(self.tv(x).dtype, axes);
        self.add_expr(OpKind::IndexSelect { axis }, vec![Operand::Tensor(x), Operand::Tensor(index)], vec![out]);
        Ok(out)
    }

    // =========================================================================
    // Matrix products
    // =========================================================================

    /// Tensor-core product of `a: [M, 1, K]` and `b: [1, N, K]` into `[M, N, rK]`.
    pub fn mma(&mut self, a: TvRef, b: TvRef, mma_macro: MmaMacro, init: Option<Val>) -> Result<TvRef> {
        let (lhs, rhs) = (self.consumed_axes(a), self.consumed_axes(b));
        ensure!(
            lhs.len() == 3 && rhs.len() == 3,
            InvalidOperandsSnafu { op: "Mma", reason: "operands must be [M, 1, K] and [1, N, K]" }
        );
        let m = IterDomain::iteration(self.id(lhs[0]).extent.clone());
        let n = IterDomain::iteration(self.id(rhs[1]).extent.clone());
        let k = IterDomain::reduction(self.id(lhs[2]).extent.clone());
        let axes = vec![self.add_id(m), self.add_id(n), self.add_id(k)];
        let out = self.new_tensor(DType::Float32, axes);
        self.add_expr(OpKind::Mma { mma_macro, init }, vec![Operand::Tensor(a), Operand::Tensor(b)], vec![out]);
        Ok(out)
    }

    /// `a: [M, K] @ b: [K, N]`.
    pub fn matmul(&mut self, a: TvRef, b: TvRef) -> Result<TvRef> {
        self.library_product(OpKind::Matmul, a, b, 1)
    }

    /// `a: [M, K] @ weight: [N, K]^T`.
    pub fn linear(&mut self, a: TvRef, weight: TvRef) -> Result<TvRef> {
        self.library_product(OpKind::Linear, a, weight, 0)
    }

    fn library_product(&mut self, kind: OpKind, a: TvRef, b: TvRef, n_axis: usize) -> Result<TvRef> {
        let op = if matches!(kind, OpKind::Matmul) { "Matmul" } else { "Linear" };
        let (lhs, rhs) = (self.consumed_axes(a), self.consumed_axes(b));
        ensure!(
            lhs.len() == 2 && rhs.len() == 2,
            InvalidOperandsSnafu { op, reason: "operands must be 2-D" }
        );
        let m = self.clone_id(lhs[0]);
        let n = self.clone_id(rhs[n_axis]);
        let out = self.new_tensor(self.tv(a).dtype, vec![m, n]);
        self.add_expr(kind, vec![Operand::Tensor(a), Operand::Tensor(b)], vec![out]);
        Ok(out)
    }

    /// Attention forward; the output has the shape of `query`.
    pub fn sdpa_fwd(&mut self, query: TvRef, key: TvRef, value: TvRef) -> Result<TvRef> {
        let q = self.consumed_axes(query);
        ensure!(
            q.len() == self.consumed_axes(key).len() && q.len() == self.consumed_axes(value).len(),
            InvalidOperandsSnafu { op: "SdpaFwd", reason: "query, key and value ranks differ" }
        );
        let out = self.new_tensor_like(self.tv(query).dtype, &q);
        self.add_expr(
            OpKind::SdpaFwd,
            vec![Operand::Tensor(query), Operand::Tensor(key), Operand::Tensor(value)],
            vec![out],
        );
        Ok(out)
    }
}
