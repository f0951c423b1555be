//! Heuristic summary record/replay tests.

use crate::error::Error;
use crate::heuristic::ScheduleHeuristic;
use crate::pointwise::get_pointwise_heuristics;
use crate::registry::SchedulerRegistry;
use crate::summary::{EntryType, HeuristicSummary, entry};
use crate::test::helpers::*;

#[test]
fn test_recorded_summary_is_complete() {
    let (fusion, _) = outer_broadcast_add();
    let info = runtime_info(&fusion, &[&[1024, 1024], &[1024]]);
    let summary = HeuristicSummary::new(&SchedulerRegistry::new(), ScheduleHeuristic::PointWise, &fusion, &info).unwrap();

    assert!(!summary.is_recording());
    assert_eq!(summary.computed_entries(), summary.len());
    for entry in [
        EntryType::DomainMap,
        EntryType::ReferenceTensors,
        EntryType::VectorizableInputsAndOutputs,
        EntryType::TvToContigInnerSizeMaps,
        EntryType::BroadcastMultiples,
        EntryType::CanScheduleTranspose,
        EntryType::LogicalReorderMap,
    ] {
        assert!(summary.contains(entry), "{entry} was not recorded");
    }
    summary.validate().unwrap();
}

#[test]
fn test_replay_matches_fresh_computation() {
    let (fusion, _) = outer_broadcast_add();
    let info = runtime_info(&fusion, &[&[1024, 1024], &[1024]]);
    let summary = HeuristicSummary::new(&SchedulerRegistry::new(), ScheduleHeuristic::PointWise, &fusion, &info).unwrap();
    let recorded = summary.computed_entries();

    // A different shape of the same fusion replays the analyses.
    let other = runtime_info(&fusion, &[&[8192, 256], &[256]]);
    let mut replay = summary.clone();
    let replayed = get_pointwise_heuristics(&fusion, &other, Some(&mut replay)).unwrap();
    let fresh = get_pointwise_heuristics(&fusion, &other, None).unwrap();

    assert_eq!(replayed, fresh);
    assert_eq!(replay.computed_entries(), recorded);
}

#[test]
fn test_degenerate_shape_still_records_everything() {
    let (fusion, _) = elementwise_add();
    let info = runtime_info(&fusion, &[&[0, 8], &[0, 8]]);
    let summary = HeuristicSummary::new(&SchedulerRegistry::new(), ScheduleHeuristic::PointWise, &fusion, &info).unwrap();
    summary.validate().unwrap();
}

#[test]
fn test_empty_pointwise_summary_is_invalid() {
    let summary = HeuristicSummary::recording(ScheduleHeuristic::PointWise);
    let err = summary.validate().unwrap_err();
    assert!(matches!(
        err,
        Error::MissingSummaryEntry { heuristic: ScheduleHeuristic::PointWise, entry: EntryType::DomainMap }
    ));
}

#[test]
fn test_kernel_free_summaries_need_no_entries() {
    for heuristic in [ScheduleHeuristic::ExprEval, ScheduleHeuristic::NoOp] {
        HeuristicSummary::recording(heuristic).validate().unwrap();
    }
}

#[test]
fn test_persistent_summary_requires_buffer_info() {
    let mut summary = HeuristicSummary::recording(ScheduleHeuristic::InnerPersistent);
    HeuristicSummary::entry::<entry::ReductionTvs>(Some(&mut summary), || Ok(Vec::new())).unwrap();
    HeuristicSummary::entry::<entry::VectorizableInputsAndOutputs>(Some(&mut summary), || Ok(Vec::new())).unwrap();
    HeuristicSummary::entry::<entry::TvToContigInnerSizeMaps>(Some(&mut summary), || Ok(Vec::new())).unwrap();
    HeuristicSummary::entry::<entry::UnrollableInputsAndOutputs>(Some(&mut summary), || Ok(Vec::new())).unwrap();
    assert!(matches!(
        summary.validate().unwrap_err(),
        Error::MissingSummaryEntry { entry: EntryType::PersistentBufferInfo, .. }
    ));

    HeuristicSummary::entry::<entry::PersistentBufferInfo>(Some(&mut summary), || Ok(Default::default())).unwrap();
    summary.finish().unwrap();
    assert!(!summary.is_recording());
}

#[test]
fn test_replay_miss_is_an_error() {
    let mut summary = HeuristicSummary::recording(ScheduleHeuristic::ExprEval);
    summary.finish().unwrap();
    let err = HeuristicSummary::entry::<entry::CanScheduleTranspose>(Some(&mut summary), || Ok(true)).unwrap_err();
    assert!(matches!(err, Error::SummaryReplayMiss { entry: EntryType::CanScheduleTranspose, .. }));
}

#[test]
fn test_entry_is_computed_once() {
    let mut summary = HeuristicSummary::recording(ScheduleHeuristic::PointWise);
    let first = HeuristicSummary::entry::<entry::CanScheduleTranspose>(Some(&mut summary), || Ok(true)).unwrap();
    let second = HeuristicSummary::entry::<entry::CanScheduleTranspose>(Some(&mut summary), || Ok(false)).unwrap();
    assert!(*first && *second);
    assert_eq!(summary.computed_entries(), 1);
}

#[test]
fn test_entry_without_summary_always_computes() {
    let value = HeuristicSummary::entry::<entry::CanScheduleTranspose>(None, || Ok(false)).unwrap();
    assert!(!*value);
}
