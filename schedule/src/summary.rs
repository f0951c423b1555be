//! Memoized compile-time analyses of one fusion shape.
//!
//! A [`HeuristicSummary`] is filled once in recording mode: the first access
//! of each entry computes and stores it. After [`HeuristicSummary::finish`]
//! validates that every entry the heuristic needs is present, the summary is
//! in replay mode, where entries are only read. Replaying a fusion of the
//! same shape class therefore never repeats the analyses.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use fusor_ir::TvRef;
use snafu::ensure;
use tracing::trace;

use crate::error::*;
use crate::heuristic::ScheduleHeuristic;

/// Kinds of memoized analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumIter, strum::AsRefStr, strum::Display)]
pub enum EntryType {
    DomainMap,
    ReferenceTensors,
    VectorizableInputsAndOutputs,
    TvToContigInnerSizeMaps,
    BroadcastMultiples,
    CanScheduleTranspose,
    LogicalReorderMap,
    ReductionTvs,
    UnrollableInputsAndOutputs,
    PersistentBufferInfo,
    ScopePersistentFactorInfo,
}

/// Typed key of one summary entry.
pub trait SummaryEntry {
    const TYPE: EntryType;
    type Data: Any + Send + Sync;
}

/// Buffers a persistent scheduler keeps resident across the reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentBufferInfo {
    pub persistent_buffers: Vec<TvRef>,
}

pub mod entry {
    //! Marker types naming each [`EntryType`] and the data it stores.

    use std::collections::HashMap;

    use fusor_ir::{TvRef, Val};

    macro_rules! summary_entries {
        ($($name:ident => $data:ty),* $(,)?) => {
            $(
                #[derive(Debug)]
                pub struct $name;

                impl super::SummaryEntry for $name {
                    const TYPE: super::EntryType = super::EntryType::$name;
                    type Data = $data;
                }
            )*
        };
    }

    summary_entries! {
        DomainMap => crate::domain_map::DomainMap,
        ReferenceTensors => Vec<TvRef>,
        VectorizableInputsAndOutputs => Vec<TvRef>,
        TvToContigInnerSizeMaps => Vec<HashMap<TvRef, Val>>,
        BroadcastMultiples => crate::utils::BroadcastMultipleInformation,
        CanScheduleTranspose => bool,
        LogicalReorderMap => HashMap<usize, usize>,
        ReductionTvs => Vec<TvRef>,
        UnrollableInputsAndOutputs => Vec<TvRef>,
        PersistentBufferInfo => super::PersistentBufferInfo,
        ScopePersistentFactorInfo => HashMap<TvRef, i64>,
    }
}

#[derive(Debug, Clone)]
pub struct HeuristicSummary {
    heuristic: ScheduleHeuristic,
    recording: bool,
    entries: HashMap<EntryType, Arc<dyn Any + Send + Sync>>,
    computed: usize,
}

impl HeuristicSummary {
    /// Empty summary in recording mode.
    pub fn recording(heuristic: ScheduleHeuristic) -> Self {
        Self { heuristic, recording: true, entries: HashMap::new(), computed: 0 }
    }

    pub fn heuristic(&self) -> ScheduleHeuristic {
        self.heuristic
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// How many entries were computed rather than read back.
    pub fn computed_entries(&self) -> usize {
        self.computed
    }

    pub fn contains(&self, entry: EntryType) -> bool {
        self.entries.contains_key(&entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get<E: SummaryEntry>(&self) -> Option<Arc<E::Data>> {
        let data = Arc::clone(self.entries.get(&E::TYPE)?);
        data.downcast::<E::Data>().ok()
    }

    pub(crate) fn insert<E: SummaryEntry>(&mut self, data: E::Data) -> Arc<E::Data> {
        let data = Arc::new(data);
        self.entries.insert(E::TYPE, data.clone());
        data
    }

    /// Reads entry `E`, computing it with `make` when there is no summary or
    /// when recording. In replay mode a missing entry is an error.
    pub fn entry<E: SummaryEntry>(
        summary: Option<&mut Self>,
        make: impl FnOnce() -> Result<E::Data>,
    ) -> Result<Arc<E::Data>> {
        let Some(summary) = summary else {
            return make().map(Arc::new);
        };
        if let Some(data) = summary.get::<E>() {
            return Ok(data);
        }
        ensure!(summary.recording, SummaryReplayMissSnafu { heuristic: summary.heuristic, entry: E::TYPE });
        trace!(heuristic = %summary.heuristic, entry = %E::TYPE, "computing summary entry");
        summary.computed += 1;
        Ok(summary.insert::<E>(make()?))
    }

    /// Validates the recorded entries and switches to replay mode.
    pub fn finish(&mut self) -> Result<()> {
        self.validate()?;
        self.recording = false;
        Ok(())
    }

    fn require(&self, entry: EntryType) -> Result<()> {
        ensure!(self.contains(entry), MissingSummaryEntrySnafu { heuristic: self.heuristic, entry });
        Ok(())
    }

    /// Checks that every entry the heuristic replays from was recorded.
    pub fn validate(&self) -> Result<()> {
        match self.heuristic {
            ScheduleHeuristic::ExprEval
            | ScheduleHeuristic::NoOp
            | ScheduleHeuristic::Matmul
            | ScheduleHeuristic::Transpose => {}
            ScheduleHeuristic::PointWise => {
                for entry in [
                    EntryType::DomainMap,
                    EntryType::ReferenceTensors,
                    EntryType::VectorizableInputsAndOutputs,
                    EntryType::TvToContigInnerSizeMaps,
                    EntryType::BroadcastMultiples,
                    EntryType::CanScheduleTranspose,
                ] {
                    self.require(entry)?;
                }
                if self.get::<entry::CanScheduleTranspose>().is_some_and(|feasible| *feasible) {
                    self.require(EntryType::LogicalReorderMap)?;
                }
            }
            ScheduleHeuristic::Reduction => self.require_reduction_entries()?,
            ScheduleHeuristic::InnerPersistent
            | ScheduleHeuristic::OuterPersistent
            | ScheduleHeuristic::InnerOuterPersistent => {
                self.require_reduction_entries()?;
                self.require(EntryType::PersistentBufferInfo)?;
                let has_buffers =
                    self.get::<entry::PersistentBufferInfo>().is_some_and(|info| !info.persistent_buffers.is_empty());
                if has_buffers {
                    self.require(EntryType::ScopePersistentFactorInfo)?;
                }
            }
        }
        Ok(())
    }

    fn require_reduction_entries(&self) -> Result<()> {
        for entry in [
            EntryType::ReductionTvs,
            EntryType::VectorizableInputsAndOutputs,
            EntryType::TvToContigInnerSizeMaps,
            EntryType::UnrollableInputsAndOutputs,
        ] {
            self.require(entry)?;
        }
        Ok(())
    }
}
