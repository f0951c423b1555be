//! Reference-tensor selection over the permissive axis map.

use std::collections::HashSet;

use fusor_ir::{ComputeAtMap, Fusion, IdMappingMode, IdRef, TvRef};

/// Non-reduction, non-broadcast axes of `tv`'s root domain.
pub fn n_root_dims(fusion: &Fusion, tv: TvRef) -> usize {
    fusion
        .tv(tv)
        .maybe_root_domain()
        .iter()
        .filter(|id| {
            let axis = fusion.id(**id);
            !axis.is_reduction() && !axis.is_broadcast()
        })
        .count()
}

/// Permissive axis map of a fusion, queried for reference-tensor decisions.
#[derive(Debug, Clone)]
pub struct DomainMap {
    ca_map: ComputeAtMap,
}

impl DomainMap {
    pub fn new(fusion: &Fusion) -> Self {
        Self { ca_map: ComputeAtMap::build(fusion) }
    }

    pub fn ca_map(&self) -> &ComputeAtMap {
        &self.ca_map
    }

    /// For each of `axes` (reference axes), the axis itself plus the root
    /// axes of `reference` it was reshaped from.
    pub fn coverage(fusion: &Fusion, reference: TvRef, axes: &[IdRef]) -> Vec<Vec<IdRef>> {
        let root = fusion.tv(reference).maybe_root_domain();
        axes.iter()
            .map(|axis| {
                let ancestors = fusion.ids_between(root, &[*axis]);
                let mut covered = vec![*axis];
                covered.extend(root.iter().copied().filter(|r| r != axis && ancestors.contains(r)));
                covered
            })
            .collect()
    }

    /// First reference position whose coverage `id` is permissively mapped to.
    pub fn mapped_position(&self, coverage: &[Vec<IdRef>], id: IdRef) -> Option<usize> {
        coverage.iter().position(|covered| covered.iter().any(|c| self.ca_map.are_mapped(id, *c, IdMappingMode::Permissive)))
    }

    /// Every concrete axis of every used input reaches some axis of `tv`.
    pub fn is_valid_reference(&self, fusion: &Fusion, tv: TvRef) -> bool {
        let view = fusion.tv(tv);
        let mut targets: HashSet<IdRef> = fusion.ids_between(view.maybe_root_domain(), view.logical_domain());
        targets.extend(view.maybe_root_domain().iter().copied());
        targets.extend(view.logical_domain().iter().copied());

        fusion.inputs().iter().filter(|input| !fusion.consumers_of(**input).is_empty()).all(|input| {
            fusion.tv(*input).logical_domain().iter().all(|id| {
                let axis = fusion.id(*id);
                axis.is_broadcast()
                    || axis.is_reduction()
                    || targets.iter().any(|t| self.ca_map.are_mapped(*id, *t, IdMappingMode::Permissive))
            })
        })
    }

    /// Output with the most concrete root axes among the valid references
    /// that are not also inputs. A nonzero `minimum_num_axes` additionally
    /// requires more logical axes than that; ties keep the first output.
    pub fn find_reference_tensor_view(&self, fusion: &Fusion, minimum_num_axes: usize) -> Option<TvRef> {
        let mut best: Option<(TvRef, usize)> = None;
        for out in fusion.outputs() {
            let too_small = minimum_num_axes > 0 && fusion.tv(*out).logical_domain().len() <= minimum_num_axes;
            if fusion.is_input(*out) || too_small || !self.is_valid_reference(fusion, *out) {
                continue;
            }
            let n_dims = n_root_dims(fusion, *out);
            if best.is_none_or(|(_, most)| n_dims > most) {
                best = Some((*out, n_dims));
            }
        }
        best.map(|(tv, _)| tv)
    }
}
