//! Heuristic cache of one fusion.
//!
//! Two levels, both backed by papaya's lock-free HashMap:
//!
//! - one replay-mode [`HeuristicSummary`] per heuristic, recorded the first
//!   time the heuristic runs on the fusion;
//! - parameters per `(heuristic, shape class)`, where the shape class is the
//!   index type plus every input's sizes, strides and pointer alignment.
//!
//! A new shape class replays the recorded summary, so only the
//! argument-dependent part of the heuristic runs again.
//!
//! # Thread Safety
//!
//! Lookups and inserts are thread-safe. Two threads missing on the same key
//! both compute; the first insert wins and both receive the same entry.

use std::sync::Arc;

use fusor_dtype::IndexType;
use fusor_ir::{Fusion, TensorArg};
use papaya::{Compute, HashMap, Operation};
use tracing::{debug, trace};

use crate::error::Result;
use crate::heuristic::ScheduleHeuristic;
use crate::params::HeuristicParams;
use crate::registry::SchedulerRegistry;
use crate::runtime_info::{SchedulerRuntimeInfo, alignment_of};
use crate::summary::HeuristicSummary;

/// Argument properties the heuristics depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeClass {
    pub index_type: IndexType,
    /// `(sizes, strides, pointer alignment)` per input.
    pub inputs: Vec<(Vec<i64>, Vec<i64>, usize)>,
}

impl ShapeClass {
    pub fn new(index_type: IndexType, args: &[TensorArg]) -> Self {
        let inputs =
            args.iter().map(|arg| (arg.sizes.clone(), arg.strides.clone(), alignment_of(arg.data_ptr))).collect();
        Self { index_type, inputs }
    }
}

/// Summary and parameters computed for one shape class.
#[derive(Debug)]
pub struct CachedHeuristics {
    pub summary: Arc<HeuristicSummary>,
    pub params: HeuristicParams,
}

#[derive(Debug, Default)]
pub struct HeuristicCache {
    summaries: HashMap<ScheduleHeuristic, Arc<HeuristicSummary>>,
    entries: HashMap<(ScheduleHeuristic, ShapeClass), Arc<CachedHeuristics>>,
}

impl HeuristicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters of `heuristic` for `fusion` with `args`, computed at most
    /// once per shape class.
    pub fn get_or_compute(
        &self,
        registry: &SchedulerRegistry,
        heuristic: ScheduleHeuristic,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
        args: &[TensorArg],
    ) -> Result<Arc<CachedHeuristics>> {
        let key = (heuristic, ShapeClass::new(runtime_info.index_type(), args));
        let guard = self.entries.guard();
        if let Some(cached) = self.entries.get(&key, &guard) {
            trace!(heuristic = %heuristic, "heuristic cache hit");
            return Ok(Arc::clone(cached));
        }

        let summary = self.summary(registry, heuristic, fusion, runtime_info)?;
        let mut replay = HeuristicSummary::clone(&summary);
        let entry = registry.make_entry(heuristic, fusion, runtime_info, Some(&mut replay))?;
        debug!(heuristic = %heuristic, params = %entry.params, "cached heuristics");
        let computed = Arc::new(CachedHeuristics { summary, params: entry.params });

        match self.entries.compute(
            key,
            |existing| match existing {
                Some((_, cached)) => Operation::Abort(Arc::clone(cached)),
                None => Operation::Insert(Arc::clone(&computed)),
            },
            &guard,
        ) {
            Compute::Inserted(_, cached) => Ok(Arc::clone(cached)),
            Compute::Aborted(cached) => Ok(cached),
            _ => Ok(computed),
        }
    }

    /// Recorded summary of `heuristic`, recording it on first use.
    pub fn summary(
        &self,
        registry: &SchedulerRegistry,
        heuristic: ScheduleHeuristic,
        fusion: &Fusion,
        runtime_info: &SchedulerRuntimeInfo,
    ) -> Result<Arc<HeuristicSummary>> {
        let guard = self.summaries.guard();
        if let Some(summary) = self.summaries.get(&heuristic, &guard) {
            return Ok(Arc::clone(summary));
        }
        let recorded = Arc::new(HeuristicSummary::new(registry, heuristic, fusion, runtime_info)?);
        trace!(heuristic = %heuristic, entries = recorded.len(), "recorded summary");
        Ok(Arc::clone(self.summaries.get_or_insert(heuristic, recorded, &guard)))
    }

    /// Number of cached parameter sets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.pin().clear();
        self.summaries.pin().clear();
    }
}
