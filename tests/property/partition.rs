//! Property-based tests for batch partitioning and bisection

use proptest::prelude::*;
use scribe::generation::{partition, Batch};
use scribe::tokens::{heuristic_tokens, TokenBudget};
use scribe::types::JobId;

fn ids(n: usize) -> Vec<JobId> {
    (0..n).map(|i| JobId::new(format!("job-{}", i))).collect()
}

// Repeatedly bisect until every piece has one job, as a run of overflows would.
fn bisect_fully(batch: Batch) -> Vec<Batch> {
    match batch.split() {
        Some((left, right)) => {
            let mut out = bisect_fully(left);
            out.extend(bisect_fully(right));
            out
        }
        None => vec![batch],
    }
}

/// Partition preserves every id exactly once, in order, within the size bound
#[test]
fn test_partition_preserves_jobs_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(0usize..200, 1usize..12), |(count, max)| {
            let job_ids = ids(count);
            let batches = partition(&job_ids, max);

            let flattened: Vec<JobId> = batches
                .iter()
                .flat_map(|b| b.job_ids.iter().cloned())
                .collect();
            prop_assert_eq!(&flattened, &job_ids);
            prop_assert_eq!(batches.len(), count.div_ceil(max));
            prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= max));
            // only the last batch may be short
            for batch in batches.iter().rev().skip(1) {
                prop_assert_eq!(batch.len(), max);
            }
            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.origin, i + 1);
                prop_assert_eq!(batch.depth, 0);
            }
            Ok(())
        })
        .unwrap();
}

proptest! {
    #[test]
    fn split_halves_are_ceil_then_floor(count in 2usize..64) {
        let batch = Batch { origin: 4, depth: 1, job_ids: ids(count) };
        let (left, right) = batch.split().unwrap();

        prop_assert_eq!(left.len(), count.div_ceil(2));
        prop_assert_eq!(right.len(), count / 2);
        prop_assert_eq!(left.origin, 4);
        prop_assert_eq!(right.depth, 2);

        let mut rejoined = left.job_ids.clone();
        rejoined.extend(right.job_ids.iter().cloned());
        prop_assert_eq!(rejoined, batch.job_ids);
    }

    #[test]
    fn full_bisection_reaches_single_jobs(count in 1usize..48) {
        let batch = Batch { origin: 1, depth: 0, job_ids: ids(count) };
        let pieces = bisect_fully(batch.clone());

        prop_assert_eq!(pieces.len(), count);
        prop_assert!(pieces.iter().all(|p| p.len() == 1 && p.split().is_none()));
        let order: Vec<JobId> = pieces.into_iter().flat_map(|p| p.job_ids).collect();
        prop_assert_eq!(order, batch.job_ids);
    }

    #[test]
    fn heuristic_tokens_round_up(text in ".{0,400}") {
        let chars = text.chars().count();
        let tokens = heuristic_tokens(&text);
        prop_assert_eq!(tokens, chars.div_ceil(4));
    }

    #[test]
    fn budget_checks_are_monotonic(a in 0usize..100_000, b in 0usize..100_000) {
        let budget = TokenBudget::default();
        let rank = |tokens: usize| match budget.check(tokens) {
            scribe::tokens::BudgetCheck::WithinBudget => 0,
            scribe::tokens::BudgetCheck::NearLimit { .. } => 1,
            scribe::tokens::BudgetCheck::OverLimit { .. } => 2,
        };
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(rank(low) <= rank(high));
    }
}
