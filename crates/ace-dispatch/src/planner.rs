//! Chunk planning for the parallel path.
//!
//! A parallel run splits the operation along one dimension (elements for
//! vector operations, rows for matrix operations) into contiguous, disjoint,
//! non-empty ranges. The number of chunks is bounded by the workers
//! available, by a per-category cap, and by a minimum batch below which the
//! per-task overhead would dominate.

use crate::category::{Category, PerCategory};
use crate::strategy::Strategy;
use crate::{DispatchError, DispatchResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Chunking limits for one category, in split units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Never make a chunk smaller than this many units.
    pub min_batch: usize,
    /// Never make more than this many chunks.
    pub max_batches: usize,
}

impl ChunkConfig {
    /// Create a chunk configuration.
    #[must_use]
    pub const fn new(min_batch: usize, max_batches: usize) -> Self {
        Self {
            min_batch,
            max_batches,
        }
    }

    fn validate(self, category: Category) -> DispatchResult<Self> {
        if self.min_batch == 0 {
            return Err(DispatchError::InvalidChunkConfig {
                category,
                reason: "min_batch must be at least 1",
            });
        }
        if self.max_batches == 0 {
            return Err(DispatchError::InvalidChunkConfig {
                category,
                reason: "max_batches must be at least 1",
            });
        }
        Ok(self)
    }
}

/// Partial override of one category's chunking limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkOverride {
    /// Replacement minimum batch.
    pub min_batch: Option<usize>,
    /// Replacement chunk cap.
    pub max_batches: Option<usize>,
}

/// Chunk overrides for every category.
pub type ChunkOverrides = PerCategory<ChunkOverride>;

/// The shape of one invocation, as far as dispatch is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    /// Operation category.
    pub category: Category,
    /// Size compared against thresholds.
    pub size: usize,
    /// Length of the dimension a parallel run is split along.
    pub units: usize,
}

impl Workload {
    /// A workload whose split dimension is known.
    #[must_use]
    pub const fn with_units(category: Category, size: usize, units: usize) -> Self {
        Self {
            category,
            size,
            units,
        }
    }

    /// A workload described by size alone.
    ///
    /// Matrix categories assume square operands: the split dimension of a
    /// multiply is `cbrt(size)` and of a transpose `sqrt(size)`.
    #[must_use]
    pub fn from_size(category: Category, size: usize) -> Self {
        let units = match category {
            Category::ElementWise | Category::Reduction | Category::DotProduct => size,
            Category::MatrixMultiply => integer_root(size, 3),
            Category::Transpose => integer_root(size, 2),
        };
        Self {
            category,
            size,
            units,
        }
    }
}

fn integer_root(value: usize, degree: u32) -> usize {
    if value == 0 {
        return 0;
    }
    let mut root = (value as f64).powf(1.0 / f64::from(degree)).round() as usize;
    while root > 1 && root.saturating_pow(degree) > value {
        root -= 1;
    }
    while (root + 1).saturating_pow(degree) <= value {
        root += 1;
    }
    root.max(1)
}

/// What a dispatch would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// The workload planned for.
    pub workload: Workload,
    /// Chosen strategy.
    pub strategy: Strategy,
    /// Threads that would take part: 1 unless the strategy is Parallel.
    pub workers: usize,
    /// Ranges of the split dimension, one per task.
    pub chunks: Vec<Range<usize>>,
}

impl ExecutionPlan {
    /// Number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Per-category chunking tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlanner {
    configs: FxHashMap<Category, ChunkConfig>,
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        let configs = [
            // 8192 f64 values is 64 KiB per operand, about one L2 slice.
            (Category::ElementWise, ChunkConfig::new(8_192, 64)),
            (Category::Reduction, ChunkConfig::new(8_192, 64)),
            (Category::DotProduct, ChunkConfig::new(8_192, 64)),
            // Rows of the result.
            (Category::MatrixMultiply, ChunkConfig::new(1, 64)),
            // Rows of the result.
            (Category::Transpose, ChunkConfig::new(16, 64)),
        ];
        Self {
            configs: configs.into_iter().collect(),
        }
    }
}

impl ChunkPlanner {
    /// Fallback for a category missing from the table.
    pub const FALLBACK: ChunkConfig = ChunkConfig::new(8_192, 16);

    /// The default tables with `overrides` applied on top.
    pub fn with_overrides(overrides: &ChunkOverrides) -> DispatchResult<Self> {
        let mut planner = Self::default();
        for (category, o) in overrides.iter() {
            let base = planner.config(category);
            let merged = ChunkConfig {
                min_batch: o.min_batch.unwrap_or(base.min_batch),
                max_batches: o.max_batches.unwrap_or(base.max_batches),
            };
            planner.configs.insert(category, merged.validate(category)?);
        }
        Ok(planner)
    }

    /// Limits for `category`.
    #[must_use]
    pub fn config(&self, category: Category) -> ChunkConfig {
        self.configs
            .get(&category)
            .copied()
            .unwrap_or(Self::FALLBACK)
    }

    /// Number of chunks for `units` of `category` on `workers` threads.
    ///
    /// Always at least 1, and at most `min(workers, max_batches,
    /// units / min_batch)` when that bound is positive.
    #[must_use]
    pub fn chunk_count(&self, category: Category, units: usize, workers: usize) -> usize {
        let cfg = self.config(category);
        workers
            .min(cfg.max_batches)
            .min(units / cfg.min_batch.max(1))
            .max(1)
    }

    /// Chunk ranges for `units` of `category` on `workers` threads.
    #[must_use]
    pub fn chunks(&self, category: Category, units: usize, workers: usize) -> Vec<Range<usize>> {
        split(units, self.chunk_count(category, units, workers))
    }

    /// Build the plan for `workload` under an already chosen strategy.
    #[must_use]
    pub fn plan(&self, workload: Workload, strategy: Strategy, workers: usize) -> ExecutionPlan {
        let (workers, chunks) = match strategy {
            Strategy::Parallel => {
                let chunks = self.chunks(workload.category, workload.units, workers);
                (chunks.len().min(workers).max(1), chunks)
            }
            Strategy::Scalar | Strategy::Accelerated => (1, split(workload.units, 1)),
        };
        ExecutionPlan {
            workload,
            strategy,
            workers,
            chunks,
        }
    }
}

/// Split `[0, units)` into `count` contiguous ranges of `ceil(units / count)`.
///
/// Ranges that would start at or past `units` are dropped, so every range
/// returned is non-empty and together they cover `[0, units)` exactly.
#[must_use]
pub fn split(units: usize, count: usize) -> Vec<Range<usize>> {
    let count = count.max(1);
    let step = units.div_ceil(count);
    (0..count)
        .map(|i| i * step..((i + 1) * step).min(units))
        .filter(|r| r.start < units)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_even() {
        assert_eq!(split(8, 4), vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_split_uneven() {
        assert_eq!(split(10, 3), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_split_drops_ranges_past_end() {
        // ceil(5 / 4) = 2 -> 0..2, 2..4, 4..5, and 6..5 is dropped.
        assert_eq!(split(5, 4), vec![0..2, 2..4, 4..5]);
        assert_eq!(split(2, 8), vec![0..1, 1..2]);
    }

    #[test]
    fn test_split_empty() {
        assert!(split(0, 3).is_empty());
    }

    #[test]
    fn test_chunk_count_bounds() {
        let planner = ChunkPlanner::default();
        // Below the minimum batch: one chunk.
        assert_eq!(planner.chunk_count(Category::ElementWise, 100, 8), 1);
        // Limited by batches of 8192.
        assert_eq!(planner.chunk_count(Category::ElementWise, 20_000, 8), 2);
        // Limited by workers.
        assert_eq!(planner.chunk_count(Category::ElementWise, 1_000_000, 4), 4);
        // Matrix multiply splits by rows.
        assert_eq!(planner.chunk_count(Category::MatrixMultiply, 2, 2), 2);
    }

    #[test]
    fn test_max_batches_cap() {
        let mut overrides = ChunkOverrides::default();
        overrides.reduction = Some(ChunkOverride {
            min_batch: Some(1),
            max_batches: Some(3),
        });
        let planner = ChunkPlanner::with_overrides(&overrides).unwrap();
        assert_eq!(planner.chunk_count(Category::Reduction, 1_000, 16), 3);
    }

    #[test]
    fn test_zero_min_batch_rejected() {
        let mut overrides = ChunkOverrides::default();
        overrides.transpose = Some(ChunkOverride {
            min_batch: Some(0),
            max_batches: None,
        });
        assert!(matches!(
            ChunkPlanner::with_overrides(&overrides),
            Err(DispatchError::InvalidChunkConfig { category: Category::Transpose, .. })
        ));
    }

    #[test]
    fn test_workload_from_size() {
        assert_eq!(Workload::from_size(Category::MatrixMultiply, 8).units, 2);
        assert_eq!(Workload::from_size(Category::MatrixMultiply, 1_000_000).units, 100);
        assert_eq!(Workload::from_size(Category::Transpose, 10_000).units, 100);
        assert_eq!(Workload::from_size(Category::Transpose, 10).units, 3);
        assert_eq!(Workload::from_size(Category::Reduction, 77).units, 77);
    }

    #[test]
    fn test_plan_for_non_parallel() {
        let planner = ChunkPlanner::default();
        let plan = planner.plan(
            Workload::from_size(Category::DotProduct, 500),
            Strategy::Accelerated,
            8,
        );
        assert_eq!(plan.workers, 1);
        assert_eq!(plan.chunks, vec![0..500]);
    }

    #[test]
    fn test_plan_for_parallel() {
        let planner = ChunkPlanner::default();
        let plan = planner.plan(
            Workload::from_size(Category::ElementWise, 100_000),
            Strategy::Parallel,
            4,
        );
        assert_eq!(plan.workers, 4);
        assert_eq!(plan.chunk_count(), 4);
        assert_eq!(plan.chunks[0], 0..25_000);
    }
}
