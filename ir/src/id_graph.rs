//! Equivalence classes of iteration axes.
//!
//! [`ComputeAtMap`] groups axes of different tensors that iterate over the
//! same index space, at three strengths:
//!
//! - `Exact`: same extent and both broadcast or both not broadcast.
//! - `Permissive`: additionally maps a broadcast axis to the axis it is
//!   broadcast to.
//! - `Loop`: permissive pairs that share a loop because the producer is
//!   inlined into the consumer at that axis.
//!
//! Producer and consumer axes are paired positionally through each tensor
//! expression, then the pairing is pushed through splits and merges until no
//! new pair appears.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::domain::{IdExpr, IdRef};
use crate::fusion::Fusion;
use crate::op::{ExprRef, OpKind};
use crate::tensor::TvRef;
use crate::types::{IdMappingMode, ParallelType};

/// Union-find over axis handles.
#[derive(Debug, Clone)]
struct DisjointSets {
    parent: Vec<u32>,
}

impl DisjointSets {
    fn new(size: usize) -> Self {
        Self { parent: (0..size as u32).collect() }
    }

    fn find(&self, id: IdRef) -> IdRef {
        let mut current = id.0;
        while self.parent[current as usize] != current {
            current = self.parent[current as usize];
        }
        IdRef(current)
    }

    /// Returns `true` when the two sets were distinct.
    fn union(&mut self, a: IdRef, b: IdRef) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (keep, drop) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[drop.index()] = keep.0;
        true
    }

    fn same(&self, a: IdRef, b: IdRef) -> bool {
        self.find(a) == self.find(b)
    }
}

#[derive(Debug, Clone)]
pub struct ComputeAtMap {
    exact: DisjointSets,
    permissive: DisjointSets,
    loop_map: DisjointSets,
    members: HashMap<(IdMappingMode, IdRef), Vec<IdRef>>,
    concrete: HashMap<(IdMappingMode, IdRef), IdRef>,
    self_mapping: Option<(TvRef, IdRef, IdRef)>,
}

impl ComputeAtMap {
    pub fn build(fusion: &Fusion) -> Self {
        let size = fusion.num_ids();
        let mut map = Self {
            exact: DisjointSets::new(size),
            permissive: DisjointSets::new(size),
            loop_map: DisjointSets::new(size),
            members: HashMap::new(),
            concrete: HashMap::new(),
            self_mapping: None,
        };

        for expr in fusion.exprs() {
            for (producer, consumer) in Self::paired_axes(fusion, expr) {
                map.map_pair(fusion, producer, consumer);
            }
        }
        map.propagate(fusion);
        map.build_loop_map(fusion);
        map.select_concrete(fusion);
        map.self_mapping = map.find_self_mapping(fusion);
        map
    }

    /// Producer-consumer axis pairs established by one tensor expression.
    fn paired_axes(fusion: &Fusion, expr: ExprRef) -> Vec<(IdRef, IdRef)> {
        let expr = fusion.expr(expr);
        let kind = &expr.kind;
        let mut pairs = Vec::new();
        for (input_pos, producer) in expr.tensor_inputs().enumerate() {
            let p_axes = fusion.no_reductions(fusion.tv(producer).logical_domain());
            for consumer in &expr.outputs {
                let c_axes = fusion.tv(*consumer).maybe_root_domain();
                match kind {
                    OpKind::Broadcast { is_new } => {
                        let kept = c_axes.iter().zip(is_new).filter(|(_, new)| !**new).map(|(id, _)| *id);
                        pairs.extend(p_axes.iter().copied().zip(kept));
                    }
                    OpKind::Squeeze { is_squeezed } => {
                        let kept = p_axes.iter().zip(is_squeezed).filter(|(_, s)| !**s).map(|(id, _)| *id);
                        pairs.extend(kept.zip(c_axes.iter().copied()));
                    }
                    OpKind::Permute { new2old } => {
                        pairs.extend(new2old.iter().zip(c_axes).filter_map(|(old, c)| Some((*p_axes.get(*old)?, *c))));
                    }
                    OpKind::Matmul | OpKind::Linear => {
                        // Only the row axis of the lhs and the column axis of the rhs survive.
                        let (p_pos, c_pos) = match (kind, input_pos) {
                            (_, 0) => (0, 0),
                            (OpKind::Matmul, _) => (1, 1),
                            _ => (0, 1),
                        };
                        if let (Some(p), Some(c)) = (p_axes.get(p_pos), c_axes.get(c_pos)) {
                            pairs.push((*p, *c));
                        }
                    }
                    OpKind::Cat { axis } | OpKind::IndexSelect { axis } => {
                        if input_pos == 0 || matches!(kind, OpKind::Cat { .. }) {
                            let skip = *axis;
                            pairs.extend(
                                p_axes.iter().zip(c_axes).enumerate().filter(|(i, _)| *i != skip).map(|(_, (p, c))| (*p, *c)),
                            );
                        }
                    }
                    OpKind::SdpaFwd | OpKind::SdpaBwd => {
                        if input_pos == 0 && p_axes.len() == c_axes.len() {
                            pairs.extend(p_axes.iter().copied().zip(c_axes.iter().copied()));
                        }
                    }
                    _ => {
                        if p_axes.len() == c_axes.len() {
                            pairs.extend(p_axes.iter().copied().zip(c_axes.iter().copied()));
                        }
                    }
                }
            }
        }
        pairs
    }

    fn map_pair(&mut self, fusion: &Fusion, a: IdRef, b: IdRef) {
        self.permissive.union(a, b);
        if fusion.id(a).is_broadcast() == fusion.id(b).is_broadcast() {
            self.exact.union(a, b);
        }
    }

    /// Maps outputs of transforms whose inputs are mapped, until nothing changes.
    fn propagate(&mut self, fusion: &Fusion) {
        let id_exprs: Vec<_> = fusion.id_expr_refs().map(|e| fusion.id_expr(e).clone()).collect();
        loop {
            let mut changed = false;
            for (i, a) in id_exprs.iter().enumerate() {
                for b in &id_exprs[i + 1..] {
                    for sets in [&mut self.exact, &mut self.permissive] {
                        if Self::equivalent(sets, a, b) {
                            for (x, y) in a.outputs().into_iter().zip(b.outputs()) {
                                changed |= sets.union(x, y);
                            }
                        }
                    }
                }
                // A merge with a broadcast iterates exactly like its other input.
                if let IdExpr::Merge { outer, inner, output } = a {
                    let other = match (fusion.id(*outer).is_broadcast(), fusion.id(*inner).is_broadcast()) {
                        (true, false) => Some(*inner),
                        (false, true) => Some(*outer),
                        _ => None,
                    };
                    if let Some(other) = other {
                        changed |= self.permissive.union(other, *output);
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn equivalent(sets: &DisjointSets, a: &IdExpr, b: &IdExpr) -> bool {
        let inputs_mapped = || a.inputs().into_iter().zip(b.inputs()).all(|(x, y)| sets.same(x, y));
        match (a, b) {
            (
                IdExpr::Split { factor: fa, inner_split: ia, .. },
                IdExpr::Split { factor: fb, inner_split: ib, .. },
            ) => fa == fb && ia == ib && inputs_mapped(),
            (IdExpr::Merge { .. }, IdExpr::Merge { .. }) => inputs_mapped(),
            (IdExpr::Resize { left: la, right: ra, .. }, IdExpr::Resize { left: lb, right: rb, .. }) => {
                la == lb && ra == rb && inputs_mapped()
            }
            _ => false,
        }
    }

    /// Inlined producer loop axes share the loop of the consumer axis they map to.
    fn build_loop_map(&mut self, fusion: &Fusion) {
        for producer in fusion.all_tvs() {
            let ca = fusion.tv(producer).compute_at_pos;
            if ca == 0 {
                continue;
            }
            for consumer in fusion.consumers_of(producer) {
                for p_id in &fusion.tv(producer).loop_domain()[..ca] {
                    let mapped = fusion.tv(consumer).loop_domain().iter().find(|c| self.permissive.same(*p_id, **c));
                    if let Some(c_id) = mapped {
                        trace!(producer = %producer, consumer = %consumer, p_id = %p_id, c_id = %c_id, "loop mapped");
                        self.loop_map.union(*p_id, *c_id);
                    }
                }
            }
        }
    }

    fn sets(&self, mode: IdMappingMode) -> &DisjointSets {
        match mode {
            IdMappingMode::Exact => &self.exact,
            IdMappingMode::Permissive => &self.permissive,
            IdMappingMode::Loop => &self.loop_map,
        }
    }

    /// Axes that belong to a tensor of the live graph.
    fn live_ids(fusion: &Fusion) -> HashSet<IdRef> {
        let mut live = HashSet::new();
        for tv in fusion.all_tvs() {
            let view = fusion.tv(tv);
            let mut ends: Vec<IdRef> = view.loop_domain().to_vec();
            ends.extend_from_slice(view.logical_domain());
            ends.extend_from_slice(view.maybe_allocation_domain());
            live.extend(fusion.ids_between(view.maybe_root_domain(), &ends));
            live.extend(ends);
        }
        live
    }

    fn select_concrete(&mut self, fusion: &Fusion) {
        let live = Self::live_ids(fusion);
        let mut sorted: Vec<IdRef> = live.iter().copied().collect();
        sorted.sort();
        for mode in [IdMappingMode::Exact, IdMappingMode::Permissive, IdMappingMode::Loop] {
            let mut members: HashMap<IdRef, Vec<IdRef>> = HashMap::new();
            for id in &sorted {
                members.entry(self.sets(mode).find(*id)).or_default().push(*id);
            }
            for (root, ids) in members {
                // Prefer a concrete extent, then a parallelized axis, then the oldest axis.
                let concrete = ids.iter().copied().min_by_key(|id| {
                    let axis = fusion.id(*id);
                    (axis.is_broadcast(), axis.parallel_type == ParallelType::Serial, *id)
                });
                if let Some(concrete) = concrete {
                    self.concrete.insert((mode, root), concrete);
                }
                self.members.insert((mode, root), ids);
            }
        }
    }

    fn find_self_mapping(&self, fusion: &Fusion) -> Option<(TvRef, IdRef, IdRef)> {
        for tv in fusion.all_tvs() {
            let logical = fusion.tv(tv).logical_domain();
            for (i, a) in logical.iter().enumerate() {
                if let Some(b) = logical[i + 1..].iter().find(|b| self.exact.same(*a, **b)) {
                    return Some((tv, *a, *b));
                }
            }
        }
        None
    }

    pub fn are_mapped(&self, a: IdRef, b: IdRef, mode: IdMappingMode) -> bool {
        self.sets(mode).same(a, b)
    }

    /// Representative of `id`'s set; `id` itself when nothing else is mapped to it.
    pub fn concrete_mapped_id(&self, id: IdRef, mode: IdMappingMode) -> IdRef {
        let root = self.sets(mode).find(id);
        self.concrete.get(&(mode, root)).copied().unwrap_or(id)
    }

    /// Live axes mapped to `id`.
    pub fn disjoint_set(&self, id: IdRef, mode: IdMappingMode) -> &[IdRef] {
        let root = self.sets(mode).find(id);
        self.members.get(&(mode, root)).map(Vec::as_slice).unwrap_or_default()
    }

    /// Two axes of one tensor that are exactly mapped to each other.
    pub fn has_self_mapping(&self) -> Option<(TvRef, IdRef, IdRef)> {
        self.self_mapping
    }
}
