//! Dispatch decisions for adaptive numeric kernels.
//!
//! This crate decides *how* a kernel runs, never *what* it computes:
//!
//! - [`StrategySelector`] maps `(category, size)` to Scalar, Accelerated or
//!   Parallel using a [`ThresholdTable`] and the current [`Capabilities`].
//! - [`ChunkPlanner`] splits a parallel run into contiguous, disjoint ranges.
//! - [`Dispatcher`] combines both into an [`ExecutionPlan`].
//!
//! # Example
//!
//! ```ignore
//! use ace_dispatch::{Capabilities, Category, Dispatcher, Workload};
//!
//! let dispatcher = Dispatcher::default();
//! let plan = dispatcher.plan(
//!     Workload::from_size(Category::Reduction, 1_000_000),
//!     Capabilities::ALL,
//!     8,
//!     None,
//! );
//! println!("{} over {} chunks", plan.strategy, plan.chunk_count());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod category;
pub mod planner;
pub mod strategy;
pub mod thresholds;

pub use category::{Category, PerCategory};
pub use planner::{split, ChunkConfig, ChunkOverride, ChunkOverrides, ChunkPlanner, ExecutionPlan, Workload};
pub use strategy::{Capabilities, Strategy, StrategySelector};
pub use thresholds::{
    apply_env_thresholds, ThresholdOverride, ThresholdOverrides, ThresholdTable, Thresholds,
};

use thiserror::Error;

/// Result type for dispatch configuration.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised while building dispatch tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A category's accelerated threshold exceeds its parallel threshold.
    #[error("{category}: accelerated threshold {accelerated} exceeds parallel threshold {parallel}")]
    InvalidThresholds {
        /// Offending category.
        category: Category,
        /// Configured accelerated threshold.
        accelerated: usize,
        /// Configured parallel threshold.
        parallel: usize,
    },

    /// A chunking limit is out of range.
    #[error("{category}: {reason}")]
    InvalidChunkConfig {
        /// Offending category.
        category: Category,
        /// What is wrong.
        reason: &'static str,
    },

    /// A category name could not be parsed.
    #[error("unknown operation category `{0}`")]
    UnknownCategory(String),

    /// A strategy name could not be parsed.
    #[error("unknown strategy `{0}`")]
    UnknownStrategy(String),
}

/// Strategy selection plus chunk planning.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    selector: StrategySelector,
    planner: ChunkPlanner,
}

impl Dispatcher {
    /// Combine a selector and a planner.
    #[must_use]
    pub fn new(selector: StrategySelector, planner: ChunkPlanner) -> Self {
        Self { selector, planner }
    }

    /// Build both tables from overrides on top of the defaults.
    pub fn with_overrides(
        thresholds: &ThresholdOverrides,
        chunking: &ChunkOverrides,
    ) -> DispatchResult<Self> {
        Ok(Self::new(
            StrategySelector::new(ThresholdTable::with_overrides(thresholds)?),
            ChunkPlanner::with_overrides(chunking)?,
        ))
    }

    /// The strategy selector.
    #[must_use]
    pub fn selector(&self) -> &StrategySelector {
        &self.selector
    }

    /// The chunk planner.
    #[must_use]
    pub fn planner(&self) -> &ChunkPlanner {
        &self.planner
    }

    /// Choose a strategy for `workload` and plan its chunks.
    #[must_use]
    pub fn plan(
        &self,
        workload: Workload,
        caps: Capabilities,
        workers: usize,
        force: Option<Strategy>,
    ) -> ExecutionPlan {
        let strategy = self
            .selector
            .resolve(workload.category, workload.size, caps, force);
        let plan = self.planner.plan(workload, strategy, workers);
        tracing::trace!(
            category = %workload.category,
            size = workload.size,
            strategy = %plan.strategy,
            chunks = plan.chunk_count(),
            "dispatch: planned"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_plans_parallel_matmul_by_rows() {
        let dispatcher = Dispatcher::default();
        let plan = dispatcher.plan(
            Workload::with_units(Category::MatrixMultiply, 8, 2),
            Capabilities::ALL,
            2,
            Some(Strategy::Parallel),
        );
        assert_eq!(plan.strategy, Strategy::Parallel);
        assert_eq!(plan.chunks, vec![0..1, 1..2]);
        assert_eq!(plan.workers, 2);
    }

    #[test]
    fn test_dispatcher_rejects_bad_overrides() {
        let mut thresholds = ThresholdOverrides::default();
        thresholds.reduction = Some(ThresholdOverride {
            accelerated: Some(10),
            parallel: Some(5),
        });
        let err = Dispatcher::with_overrides(&thresholds, &ChunkOverrides::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "reduction: accelerated threshold 10 exceeds parallel threshold 5"
        );
    }
}
