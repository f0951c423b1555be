//! Heuristic proposal invariants.

use proptest::prelude::*;

use crate::heuristic::ScheduleHeuristic;
use crate::registry::SchedulerRegistry;
use crate::test::helpers::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn proposal_is_deterministic(outer in 0i64..256, inner in 0i64..256) {
        let (fusion, _) = elementwise_add();
        let registry = SchedulerRegistry::new();
        let info = runtime_info(&fusion, &[&[outer, inner], &[outer, inner]]);
        let first = registry.propose_heuristics(&fusion, &info).unwrap();
        let second = registry.propose_heuristics(&fusion, &info).unwrap();
        prop_assert_eq!(first, second);

        let expected = if outer == 0 || inner == 0 { ScheduleHeuristic::NoOp } else { ScheduleHeuristic::PointWise };
        prop_assert_eq!(first, Some(expected));
    }
}
