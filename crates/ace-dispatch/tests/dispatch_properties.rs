//! Property tests for strategy selection and chunk planning.

use ace_dispatch::{
    split, Capabilities, Category, ChunkConfig, ChunkOverride, ChunkOverrides, ChunkPlanner,
    StrategySelector, ThresholdTable, Thresholds,
};
use proptest::prelude::*;

fn category() -> impl proptest::strategy::Strategy<Value = Category> {
    prop::sample::select(Category::ALL.to_vec())
}

fn capabilities() -> impl proptest::strategy::Strategy<Value = Capabilities> {
    (any::<bool>(), any::<bool>()).prop_map(|(accelerated, parallel)| Capabilities {
        accelerated,
        parallel,
    })
}

proptest! {
    /// A larger input never gets a cheaper strategy.
    #[test]
    fn prop_strategy_is_monotonic_in_size(
        cat in category(),
        caps in capabilities(),
        a in 0usize..5_000_000,
        b in 0usize..5_000_000,
    ) {
        let selector = StrategySelector::default();
        let (small, large) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(selector.select(cat, large, caps) >= selector.select(cat, small, caps));
    }

    /// Monotonicity holds for any valid table, not just the defaults.
    #[test]
    fn prop_monotonic_for_custom_tables(
        accel in 0usize..10_000,
        gap in 0usize..10_000,
        caps in capabilities(),
        sizes in prop::collection::vec(0usize..30_000, 2..20),
    ) {
        let table = ThresholdTable::from_entries([
            (Category::ElementWise, Thresholds::new(accel, accel + gap)),
        ]).unwrap();
        let selector = StrategySelector::new(table);
        let mut sizes = sizes;
        sizes.sort_unstable();
        let picks: Vec<_> = sizes
            .iter()
            .map(|&s| selector.select(Category::ElementWise, s, caps))
            .collect();
        prop_assert!(picks.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Chunks cover `[0, size)` with no gaps and no overlaps.
    #[test]
    fn prop_chunks_cover_exactly(
        cat in category(),
        size in 1usize..200_000,
        workers in 1usize..64,
        min_batch in 1usize..10_000,
        max_batches in 1usize..128,
    ) {
        let mut overrides = ChunkOverrides::default();
        *overrides.slot_mut(cat) = Some(ChunkOverride {
            min_batch: Some(min_batch),
            max_batches: Some(max_batches),
        });
        let planner = ChunkPlanner::with_overrides(&overrides).unwrap();
        let chunks = planner.chunks(cat, size, workers);

        prop_assert!(!chunks.is_empty());
        prop_assert!(chunks.len() <= workers.min(max_batches).max(1));
        prop_assert_eq!(chunks[0].start, 0);
        prop_assert_eq!(chunks.last().unwrap().end, size);
        for pair in chunks.windows(2) {
            prop_assert_eq!(pair[0].end, pair[1].start);
        }
        for chunk in &chunks {
            prop_assert!(chunk.start < chunk.end);
        }
        if size / min_batch >= 1 {
            prop_assert!(chunks.len() <= size / min_batch);
        }
    }

    /// Splitting into any count still covers the range.
    #[test]
    fn prop_split_covers(size in 1usize..10_000, count in 1usize..100) {
        let chunks = split(size, count);
        let covered: usize = chunks.iter().map(|c| c.len()).sum();
        prop_assert_eq!(covered, size);
        prop_assert!(chunks.len() <= count);
    }
}

#[test]
fn test_default_chunk_configs() {
    let planner = ChunkPlanner::default();
    assert_eq!(planner.config(Category::MatrixMultiply), ChunkConfig::new(1, 64));
    assert_eq!(planner.config(Category::Reduction).min_batch, 8_192);
}
