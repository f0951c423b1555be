//! Transpose feasibility analysis.
//!
//! No transpose scheduler is registered; the pointwise scheduler only needs
//! to know whether a fusion *would* be a transpose candidate, and if so
//! defers to the transpose run-time verdict.

use std::collections::BTreeSet;

use fusor_ir::{Fusion, TvRef};

use crate::domain_map::DomainMap;
use crate::error::Result;
use crate::runtime_info::SchedulerRuntimeInfo;
use crate::summary::{HeuristicSummary, entry};
use crate::utils::{has_view_ops, inputs_and_outputs, maybe_logical_reorder_as_allocation_map};

/// Reference position of each input and output's innermost allocated axis.
fn inner_dim_groups(fusion: &Fusion, domain_map: &DomainMap, reference: TvRef) -> BTreeSet<usize> {
    let axes = fusion.tv(reference).logical_domain().to_vec();
    let coverage = DomainMap::coverage(fusion, reference, &axes);
    inputs_and_outputs(fusion)
        .into_iter()
        .filter_map(|tv| {
            let inner = fusion.tv(tv).maybe_allocation_domain().iter().rev().copied().find(|id| {
                let axis = fusion.id(*id);
                !axis.is_broadcast() && !axis.is_reduction()
            })?;
            domain_map.mapped_position(&coverage, inner)
        })
        .collect()
}

/// A fusion is a transpose candidate when its inputs and outputs fall into
/// at least two groups with different innermost reference axes.
pub fn can_schedule_transpose(fusion: &Fusion) -> bool {
    if fusion.outputs().is_empty() || fusion.has_op(|kind| kind.is_reduction()) {
        return false;
    }
    let domain_map = DomainMap::new(fusion);
    let Some(reference) = domain_map.find_reference_tensor_view(fusion, 0) else {
        return false;
    };
    inner_dim_groups(fusion, &domain_map, reference).len() >= 2
}

/// Why the transpose scheduler would not take this fusion at run time.
///
/// Reads the shared domain map, reference and reorder-map entries, so that a
/// pointwise summary recorded after this call can replay them.
pub fn runtime_reject_reason(
    fusion: &Fusion,
    runtime_info: &SchedulerRuntimeInfo,
    mut summary: Option<&mut HeuristicSummary>,
) -> Result<Option<String>> {
    let domain_map = HeuristicSummary::entry::<entry::DomainMap>(summary.as_deref_mut(), || Ok(DomainMap::new(fusion)))?;
    let references = HeuristicSummary::entry::<entry::ReferenceTensors>(summary.as_deref_mut(), || {
        Ok(domain_map.find_reference_tensor_view(fusion, 0).into_iter().collect())
    })?;
    let Some(reference) = references.first().copied() else {
        return Ok(Some("cannot find reference tensor".to_string()));
    };
    HeuristicSummary::entry::<entry::LogicalReorderMap>(summary, || {
        Ok(if has_view_ops(fusion) {
            Default::default()
        } else {
            maybe_logical_reorder_as_allocation_map(fusion, reference)
        })
    })?;

    let logical = fusion.tv(reference).logical_domain();
    let warp_size = runtime_info.device.warp_size;
    for pos in inner_dim_groups(fusion, &domain_map, reference) {
        let extent = runtime_info.evaluator().evaluate_int(&fusion.id(logical[pos]).extent)?;
        if extent < warp_size {
            return Ok(Some(format!("inner dimension of extent {extent} is smaller than a warp")));
        }
    }
    Ok(Some("transpose scheduler is not registered".to_string()))
}
