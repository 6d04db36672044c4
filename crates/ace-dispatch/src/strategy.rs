//! Strategy selection.

use crate::category::Category;
use crate::thresholds::ThresholdTable;
use crate::DispatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution path for one invocation.
///
/// Ordered by cost of setup: `Scalar < Accelerated < Parallel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Plain kernel on the calling thread.
    Scalar,
    /// Accelerated kernel over foreign linear memory, on the calling thread.
    Accelerated,
    /// Chunks of the input spread over the worker pool.
    Parallel,
}

impl Strategy {
    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Accelerated => "accelerated",
            Self::Parallel => "parallel",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scalar" | "native" => Ok(Self::Scalar),
            "accelerated" | "accel" | "wasm" => Ok(Self::Accelerated),
            "parallel" => Ok(Self::Parallel),
            _ => Err(DispatchError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Which non-scalar paths are available right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The accelerated module is loaded.
    pub accelerated: bool,
    /// A worker pool with shared memory is available.
    pub parallel: bool,
}

impl Capabilities {
    /// Only the scalar path.
    pub const SCALAR_ONLY: Self = Self {
        accelerated: false,
        parallel: false,
    };

    /// Every path.
    pub const ALL: Self = Self {
        accelerated: true,
        parallel: true,
    };

    /// Whether `strategy` can run with these capabilities.
    #[must_use]
    pub const fn supports(self, strategy: Strategy) -> bool {
        match strategy {
            Strategy::Scalar => true,
            Strategy::Accelerated => self.accelerated,
            Strategy::Parallel => self.parallel,
        }
    }
}

/// Picks a strategy from a category, a size and the current capabilities.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    table: ThresholdTable,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(ThresholdTable::default())
    }
}

impl StrategySelector {
    /// Create a selector over a validated table.
    #[must_use]
    pub fn new(table: ThresholdTable) -> Self {
        Self { table }
    }

    /// The threshold table.
    #[must_use]
    pub fn table(&self) -> &ThresholdTable {
        &self.table
    }

    /// Select the strategy for `size` units of `category`.
    ///
    /// Parallel wins once `size` reaches the parallel threshold and a pool
    /// is available; otherwise Accelerated once `size` reaches the
    /// accelerated threshold and the module is loaded; otherwise Scalar.
    #[must_use]
    pub fn select(&self, category: Category, size: usize, caps: Capabilities) -> Strategy {
        let t = self.table.get(category);
        if size >= t.parallel && caps.parallel {
            Strategy::Parallel
        } else if size >= t.accelerated && caps.accelerated {
            Strategy::Accelerated
        } else {
            Strategy::Scalar
        }
    }

    /// Like [`select`](Self::select), but honoring a forced strategy.
    ///
    /// A forced strategy whose capability is missing degrades to Scalar.
    #[must_use]
    pub fn resolve(
        &self,
        category: Category,
        size: usize,
        caps: Capabilities,
        force: Option<Strategy>,
    ) -> Strategy {
        match force {
            Some(forced) if caps.supports(forced) => forced,
            Some(forced) => {
                tracing::debug!(%category, %forced, "forced strategy unavailable, using scalar");
                Strategy::Scalar
            }
            None => self.select(category, size, caps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thresholds::Thresholds;

    fn selector() -> StrategySelector {
        StrategySelector::new(
            ThresholdTable::from_entries([(Category::ElementWise, Thresholds::new(100, 1_000))])
                .unwrap(),
        )
    }

    #[test]
    fn test_select_by_size() {
        let s = selector();
        let c = Category::ElementWise;
        assert_eq!(s.select(c, 99, Capabilities::ALL), Strategy::Scalar);
        assert_eq!(s.select(c, 100, Capabilities::ALL), Strategy::Accelerated);
        assert_eq!(s.select(c, 999, Capabilities::ALL), Strategy::Accelerated);
        assert_eq!(s.select(c, 1_000, Capabilities::ALL), Strategy::Parallel);
    }

    #[test]
    fn test_missing_capabilities_fall_back() {
        let s = selector();
        let c = Category::ElementWise;
        let no_accel = Capabilities {
            accelerated: false,
            parallel: true,
        };
        assert_eq!(s.select(c, 500, no_accel), Strategy::Scalar);
        assert_eq!(s.select(c, 5_000, no_accel), Strategy::Parallel);

        let no_pool = Capabilities {
            accelerated: true,
            parallel: false,
        };
        assert_eq!(s.select(c, 5_000, no_pool), Strategy::Accelerated);
        assert_eq!(s.select(c, 5_000, Capabilities::SCALAR_ONLY), Strategy::Scalar);
    }

    #[test]
    fn test_unknown_category_uses_conservative_thresholds() {
        let s = selector();
        let c = Category::Transpose;
        assert_eq!(s.select(c, 9_999, Capabilities::ALL), Strategy::Scalar);
        assert_eq!(s.select(c, 10_000, Capabilities::ALL), Strategy::Accelerated);
        assert_eq!(s.select(c, 1_000_000, Capabilities::ALL), Strategy::Parallel);
    }

    #[test]
    fn test_forced_strategy() {
        let s = selector();
        let c = Category::ElementWise;
        assert_eq!(
            s.resolve(c, 1, Capabilities::ALL, Some(Strategy::Parallel)),
            Strategy::Parallel
        );
        assert_eq!(
            s.resolve(c, 1, Capabilities::SCALAR_ONLY, Some(Strategy::Accelerated)),
            Strategy::Scalar
        );
        assert_eq!(
            s.resolve(c, 5_000, Capabilities::ALL, None),
            Strategy::Parallel
        );
    }

    #[test]
    fn test_strategy_order() {
        assert!(Strategy::Scalar < Strategy::Accelerated);
        assert!(Strategy::Accelerated < Strategy::Parallel);
        assert_eq!("accel".parse::<Strategy>().unwrap(), Strategy::Accelerated);
    }
}
