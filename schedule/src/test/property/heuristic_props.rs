//! Pointwise heuristic invariants.

use fusor_ir::ParallelType;
use proptest::prelude::*;

use crate::heuristic::ScheduleHeuristic;
use crate::pointwise::get_pointwise_heuristics;
use crate::registry::SchedulerRegistry;
use crate::summary::HeuristicSummary;
use crate::test::helpers::*;

fn extent() -> impl Strategy<Value = i64> {
    prop_oneof![1i64..64, 64i64..4096, Just(1024), Just(8192)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn heuristics_are_deterministic(outer in extent(), inner in extent()) {
        let (fusion, _) = outer_broadcast_add();
        let info = runtime_info(&fusion, &[&[outer, inner], &[inner]]);
        let first = get_pointwise_heuristics(&fusion, &info, None).unwrap();
        let second = get_pointwise_heuristics(&fusion, &info, None).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn launch_fits_the_block(outer in extent(), inner in extent()) {
        let (fusion, _) = outer_broadcast_add();
        let info = runtime_info(&fusion, &[&[outer, inner], &[inner]]);
        let params = get_pointwise_heuristics(&fusion, &info, None).unwrap();

        prop_assert!(params.unroll_factor >= 1);
        prop_assert!(params.break_point <= 1);
        let tidx = params.launch.get(ParallelType::TIDx).unwrap_or(1);
        let tidy = params.launch.get(ParallelType::TIDy).unwrap_or(1);
        prop_assert!(tidx * tidy <= info.pointwise.threads_per_block);
        prop_assert_eq!(params.split_block, params.launch.get(ParallelType::TIDy).is_some());
        if params.vectorize {
            prop_assert!((params.unroll_factor as u64).is_power_of_two());
            prop_assert_eq!(inner % params.unroll_factor, 0);
        }
    }

    #[test]
    fn replay_equals_fresh(
        (outer, inner) in (extent(), extent()),
        (other_outer, other_inner) in (extent(), extent()),
    ) {
        let (fusion, _) = outer_broadcast_add();
        let registry = SchedulerRegistry::new();
        let info = runtime_info(&fusion, &[&[outer, inner], &[inner]]);
        let summary = HeuristicSummary::new(&registry, ScheduleHeuristic::PointWise, &fusion, &info).unwrap();

        let other = runtime_info(&fusion, &[&[other_outer, other_inner], &[other_inner]]);
        let mut replay = summary.clone();
        let replayed = get_pointwise_heuristics(&fusion, &other, Some(&mut replay)).unwrap();
        let fresh = get_pointwise_heuristics(&fusion, &other, None).unwrap();
        prop_assert_eq!(replayed, fresh);
        prop_assert_eq!(replay.computed_entries(), summary.computed_entries());
    }
}
