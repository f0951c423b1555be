//! The fusion arena.
//!
//! A [`Fusion`] owns every axis, axis transform, tensor and expression of one
//! tensor program. Handles ([`IdRef`], [`TvRef`], [`ExprRef`]) index into the
//! arena, so graph edges are plain copies and the whole graph can be cloned to
//! give each lowering or scheduling run its own snapshot.

use std::collections::{HashMap, HashSet};

use fusor_dtype::DType;
use smallvec::SmallVec;

use crate::domain::{IdExpr, IdExprRef, IdRef, IterDomain, TensorDomain};
use crate::op::{Expr, ExprRef, OpKind, Operand};
use crate::tensor::{AliasInfo, TensorView, TvRef};
use crate::val::Val;

/// Shape of one fusion-input dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    /// Extent bound from the runtime argument.
    Symbolic,
    Fixed(i64),
    Broadcast,
    /// Broadcast whose expanded extent is bound from the runtime argument.
    Expanded,
}

#[derive(Debug, Clone, Default)]
pub struct Fusion {
    ids: Vec<IterDomain>,
    id_exprs: Vec<IdExpr>,
    tvs: Vec<TensorView>,
    exprs: Vec<Expr>,
    inputs: Vec<TvRef>,
    outputs: Vec<TvRef>,
    aliases: HashMap<TvRef, AliasInfo>,
}

impl Fusion {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Arena access
    // =========================================================================

    pub fn id(&self, id: IdRef) -> &IterDomain {
        &self.ids[id.index()]
    }

    pub fn id_mut(&mut self, id: IdRef) -> &mut IterDomain {
        &mut self.ids[id.index()]
    }

    pub fn id_expr(&self, expr: IdExprRef) -> &IdExpr {
        &self.id_exprs[expr.0 as usize]
    }

    pub fn tv(&self, tv: TvRef) -> &TensorView {
        &self.tvs[tv.index()]
    }

    pub fn tv_mut(&mut self, tv: TvRef) -> &mut TensorView {
        &mut self.tvs[tv.index()]
    }

    pub fn expr(&self, expr: ExprRef) -> &Expr {
        &self.exprs[expr.index()]
    }

    pub fn expr_mut(&mut self, expr: ExprRef) -> &mut Expr {
        &mut self.exprs[expr.index()]
    }

    pub fn num_ids(&self) -> usize {
        self.ids.len()
    }

    pub fn id_refs(&self) -> impl Iterator<Item = IdRef> + use<> {
        (0..self.ids.len() as u32).map(IdRef)
    }

    pub fn id_expr_refs(&self) -> impl Iterator<Item = IdExprRef> + use<> {
        (0..self.id_exprs.len() as u32).map(IdExprRef)
    }

    pub fn tv_refs(&self) -> impl Iterator<Item = TvRef> + use<> {
        (0..self.tvs.len() as u32).map(TvRef)
    }

    /// Display name of a tensor.
    pub fn name(&self, tv: TvRef) -> &str {
        &self.tv(tv).name
    }

    // =========================================================================
    // Construction
    // =========================================================================

    pub fn add_id(&mut self, id: IterDomain) -> IdRef {
        self.ids.push(id);
        IdRef(self.ids.len() as u32 - 1)
    }

    /// Registers a transform and links its inputs and outputs to it.
    pub fn add_id_expr(&mut self, expr: IdExpr) -> IdExprRef {
        let handle = IdExprRef(self.id_exprs.len() as u32);
        for input in expr.inputs() {
            self.id_mut(input).uses.push(handle);
        }
        for output in expr.outputs() {
            self.id_mut(output).definition = Some(handle);
        }
        self.id_exprs.push(expr);
        handle
    }

    /// Tensor over `logical`, named after its handle.
    pub fn new_tensor(&mut self, dtype: DType, logical: Vec<IdRef>) -> TvRef {
        let handle = TvRef(self.tvs.len() as u32);
        self.tvs.push(TensorView::new(handle.to_string(), dtype, TensorDomain::new(logical)));
        handle
    }

    /// Tensor over a fresh copy of `axes`, for outputs of shape-preserving ops.
    pub fn new_tensor_like(&mut self, dtype: DType, axes: &[IdRef]) -> TvRef {
        let logical = axes.iter().map(|id| self.clone_id(*id)).collect();
        self.new_tensor(dtype, logical)
    }

    /// Fresh axis with the same extent and kind as `id`.
    pub fn clone_id(&mut self, id: IdRef) -> IdRef {
        let src = self.id(id);
        let mut copy = IterDomain::new(src.extent.clone(), src.iter_type);
        copy.expanded_extent = src.expanded_extent.clone();
        copy.start = src.start.clone();
        self.add_id(copy)
    }

    /// Registers a fusion input whose extents become named symbols.
    pub fn add_input(&mut self, dtype: DType, shape: &[Dim]) -> TvRef {
        let name = format!("T{}", self.tvs.len());
        let logical = shape
            .iter()
            .enumerate()
            .map(|(i, dim)| {
                let id = match dim {
                    Dim::Symbolic => IterDomain::iteration(Val::symbol(format!("{name}.size{i}"))),
                    Dim::Fixed(extent) => IterDomain::iteration(Val::int(*extent)),
                    Dim::Broadcast => IterDomain::broadcast(),
                    Dim::Expanded => IterDomain::expanded_broadcast(Val::symbol(format!("{name}.size{i}"))),
                };
                self.add_id(id)
            })
            .collect();
        let tv = self.new_tensor(dtype, logical);
        self.tv_mut(tv).memory_type = crate::types::MemoryType::Global;
        self.inputs.push(tv);
        tv
    }

    pub fn add_output(&mut self, tv: TvRef) {
        self.outputs.push(tv);
        self.tv_mut(tv).memory_type = crate::types::MemoryType::Global;
    }

    /// Replaces every occurrence of `old` in the output list.
    pub fn replace_output(&mut self, old: TvRef, new: TvRef) {
        for out in self.outputs.iter_mut().filter(|out| **out == old) {
            *out = new;
        }
        if let Some(alias) = self.aliases.remove(&old) {
            self.aliases.insert(new, alias);
        }
        self.tv_mut(new).memory_type = crate::types::MemoryType::Global;
    }

    pub fn add_expr(&mut self, kind: OpKind, inputs: Vec<Operand>, outputs: Vec<TvRef>) -> ExprRef {
        let handle = ExprRef(self.exprs.len() as u32);
        for input in inputs.iter().filter_map(Operand::as_tensor) {
            let uses = &mut self.tv_mut(input).uses;
            if !uses.contains(&handle) {
                uses.push(handle);
            }
        }
        for output in &outputs {
            self.tv_mut(*output).definition = Some(handle);
        }
        self.exprs.push(Expr { kind, inputs, outputs });
        handle
    }

    /// Rewires `expr` to read `new` wherever it read `old`.
    pub fn replace_input(&mut self, expr: ExprRef, old: TvRef, new: TvRef) {
        for operand in self.exprs[expr.index()].inputs.iter_mut() {
            if operand.as_tensor() == Some(old) {
                *operand = Operand::Tensor(new);
            }
        }
        self.tv_mut(old).uses.retain(|e| *e != expr);
        let uses = &mut self.tv_mut(new).uses;
        if !uses.contains(&expr) {
            uses.push(expr);
        }
    }

    /// Rewires `expr` to write `new` instead of `old`.
    pub fn replace_output_of(&mut self, expr: ExprRef, old: TvRef, new: TvRef) {
        for out in self.exprs[expr.index()].outputs.iter_mut().filter(|out| **out == old) {
            *out = new;
        }
        self.tv_mut(old).definition = None;
        self.tv_mut(new).definition = Some(expr);
    }

    pub fn set_alias(&mut self, output: TvRef, info: AliasInfo) {
        self.aliases.insert(output, info);
    }

    /// Alias information of an output; [`AliasInfo::new_buffer`] if none was set.
    pub fn output_alias(&self, output: TvRef) -> AliasInfo {
        self.aliases.get(&output).cloned().unwrap_or_else(AliasInfo::new_buffer)
    }

    // =========================================================================
    // Graph queries
    // =========================================================================

    pub fn inputs(&self) -> &[TvRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TvRef] {
        &self.outputs
    }

    pub fn is_input(&self, tv: TvRef) -> bool {
        self.inputs.contains(&tv)
    }

    pub fn is_output(&self, tv: TvRef) -> bool {
        self.outputs.contains(&tv)
    }

    /// Expressions needed to compute the outputs, producers first.
    pub fn exprs(&self) -> Vec<ExprRef> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for out in &self.outputs {
            self.visit_producers(*out, &mut visited, &mut order);
        }
        order
    }

    fn visit_producers(&self, tv: TvRef, visited: &mut HashSet<ExprRef>, order: &mut Vec<ExprRef>) {
        let Some(def) = self.tv(tv).definition else {
            return;
        };
        if !visited.insert(def) {
            return;
        }
        for input in self.expr(def).tensor_inputs() {
            self.visit_producers(input, visited, order);
        }
        order.push(def);
    }

    /// Inputs followed by every tensor produced by [`Fusion::exprs`].
    pub fn all_tvs(&self) -> Vec<TvRef> {
        let mut seen = HashSet::new();
        let mut tvs = Vec::new();
        let exprs = self.exprs();
        let candidates = self
            .inputs
            .iter()
            .copied()
            .chain(exprs.iter().flat_map(|e| self.expr(*e).tensor_inputs().collect::<Vec<_>>()))
            .chain(exprs.iter().flat_map(|e| self.expr(*e).outputs.clone()))
            .chain(self.outputs.iter().copied());
        for tv in candidates {
            if seen.insert(tv) {
                tvs.push(tv);
            }
        }
        tvs
    }

    pub fn producers_of(&self, tv: TvRef) -> Vec<TvRef> {
        self.tv(tv).definition.map(|def| self.expr(def).tensor_inputs().collect()).unwrap_or_default()
    }

    pub fn consumers_of(&self, tv: TvRef) -> Vec<TvRef> {
        let live: HashSet<ExprRef> = self.exprs().into_iter().collect();
        let mut consumers = Vec::new();
        for use_expr in self.tv(tv).uses.iter().filter(|e| live.contains(e)) {
            for out in &self.expr(*use_expr).outputs {
                if !consumers.contains(out) {
                    consumers.push(*out);
                }
            }
        }
        consumers
    }

    /// Outputs not consumed by any other expression.
    pub fn terminating_outputs(&self) -> Vec<TvRef> {
        let live: HashSet<ExprRef> = self.exprs().into_iter().collect();
        self.outputs
            .iter()
            .copied()
            .filter(|out| !self.tv(*out).uses.iter().any(|e| live.contains(e)))
            .collect()
    }

    pub fn has_reduction(&self, tv: TvRef) -> bool {
        self.tv(tv).loop_domain().iter().any(|id| self.id(*id).is_reduction())
    }

    pub fn no_reductions(&self, ids: &[IdRef]) -> Vec<IdRef> {
        ids.iter().copied().filter(|id| !self.id(*id).is_reduction()).collect()
    }

    pub fn has_op(&self, pred: impl Fn(&OpKind) -> bool) -> bool {
        self.exprs().into_iter().any(|e| pred(&self.expr(e).kind))
    }

    // =========================================================================
    // Axis graph traversal
    // =========================================================================

    /// Axis transforms on paths from `from` to `to`, in topological order.
    ///
    /// A transform is included when it feeds `to` and at least one of its
    /// inputs depends on `from`.
    pub fn exprs_between(&self, from: &[IdRef], to: &[IdRef]) -> Vec<IdExprRef> {
        let from: HashSet<IdRef> = from.iter().copied().collect();
        let mut depends: HashMap<IdRef, bool> = HashMap::new();
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for id in to {
            self.collect_between(*id, &from, &mut depends, &mut visited, &mut order);
        }
        order
    }

    fn collect_between(
        &self,
        id: IdRef,
        from: &HashSet<IdRef>,
        depends: &mut HashMap<IdRef, bool>,
        visited: &mut HashSet<IdExprRef>,
        order: &mut Vec<IdExprRef>,
    ) -> bool {
        if from.contains(&id) {
            return true;
        }
        if let Some(known) = depends.get(&id) {
            return *known;
        }
        let Some(def) = self.id(id).definition else {
            depends.insert(id, false);
            return false;
        };
        let inputs: SmallVec<[IdRef; 2]> = self.id_expr(def).inputs();
        let mut any = false;
        for input in inputs {
            any |= self.collect_between(input, from, depends, visited, order);
        }
        if any && visited.insert(def) {
            order.push(def);
        }
        depends.insert(id, any);
        any
    }

    /// Axes that depend on `from` and feed `to`, endpoints included.
    pub fn ids_between(&self, from: &[IdRef], to: &[IdRef]) -> HashSet<IdRef> {
        let backward = self.ids_reaching(to);
        self.ids_reachable_from(from).into_iter().filter(|id| backward.contains(id)).collect()
    }

    fn ids_reachable_from(&self, from: &[IdRef]) -> HashSet<IdRef> {
        let mut seen: HashSet<IdRef> = from.iter().copied().collect();
        let mut stack: Vec<IdRef> = from.to_vec();
        while let Some(id) = stack.pop() {
            for use_expr in self.id(id).uses() {
                for out in self.id_expr(*use_expr).outputs() {
                    if seen.insert(out) {
                        stack.push(out);
                    }
                }
            }
        }
        seen
    }

    fn ids_reaching(&self, to: &[IdRef]) -> HashSet<IdRef> {
        let mut seen: HashSet<IdRef> = to.iter().copied().collect();
        let mut stack: Vec<IdRef> = to.to_vec();
        while let Some(id) = stack.pop() {
            if let Some(def) = self.id(id).definition() {
                for input in self.id_expr(def).inputs() {
                    if seen.insert(input) {
                        stack.push(input);
                    }
                }
            }
        }
        seen
    }
}
