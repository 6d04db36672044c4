//! Per-category size thresholds.
//!
//! The numbers are profiled crossover points: below `accelerated`, the cost
//! of copying operands into foreign memory outweighs the faster kernel;
//! below `parallel`, cross-thread coordination outweighs the extra cores.

use crate::category::{Category, PerCategory};
use crate::{DispatchError, DispatchResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Size thresholds for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Smallest size worth running on the accelerated module.
    pub accelerated: usize,
    /// Smallest size worth splitting across workers.
    pub parallel: usize,
}

impl Thresholds {
    /// Thresholds used for a category missing from the table.
    pub const CONSERVATIVE: Self = Self {
        accelerated: 10_000,
        parallel: 1_000_000,
    };

    /// Create a threshold pair.
    #[must_use]
    pub const fn new(accelerated: usize, parallel: usize) -> Self {
        Self {
            accelerated,
            parallel,
        }
    }

    fn validate(self, category: Category) -> DispatchResult<Self> {
        if self.accelerated > self.parallel {
            return Err(DispatchError::InvalidThresholds {
                category,
                accelerated: self.accelerated,
                parallel: self.parallel,
            });
        }
        Ok(self)
    }
}

/// Partial override of one category's thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOverride {
    /// Replacement accelerated threshold.
    pub accelerated: Option<usize>,
    /// Replacement parallel threshold.
    pub parallel: Option<usize>,
}

/// Threshold overrides for every category.
pub type ThresholdOverrides = PerCategory<ThresholdOverride>;

/// Validated mapping from category to thresholds.
///
/// Immutable once built. Every entry satisfies `accelerated <= parallel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdTable {
    entries: FxHashMap<Category, Thresholds>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        let entries = [
            (Category::ElementWise, Thresholds::new(1_000, 100_000)),
            (Category::Reduction, Thresholds::new(1_000, 100_000)),
            (Category::DotProduct, Thresholds::new(1_000, 100_000)),
            // Size is m * k * n, roughly 16^3 and 100^3.
            (Category::MatrixMultiply, Thresholds::new(4_096, 1_000_000)),
            (Category::Transpose, Thresholds::new(10_000, 250_000)),
        ];
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl ThresholdTable {
    /// A table with no entries; every lookup yields [`Thresholds::CONSERVATIVE`].
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    /// Build a table from explicit entries.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (Category, Thresholds)>,
    ) -> DispatchResult<Self> {
        let entries = entries
            .into_iter()
            .map(|(c, t)| t.validate(c).map(|t| (c, t)))
            .collect::<DispatchResult<_>>()?;
        Ok(Self { entries })
    }

    /// The default table with `overrides` applied on top.
    pub fn with_overrides(overrides: &ThresholdOverrides) -> DispatchResult<Self> {
        let mut table = Self::default();
        for (category, o) in overrides.iter() {
            let base = table.get(category);
            let merged = Thresholds {
                accelerated: o.accelerated.unwrap_or(base.accelerated),
                parallel: o.parallel.unwrap_or(base.parallel),
            };
            table.entries.insert(category, merged.validate(category)?);
        }
        Ok(table)
    }

    /// Thresholds for `category`.
    #[must_use]
    pub fn get(&self, category: Category) -> Thresholds {
        self.entries
            .get(&category)
            .copied()
            .unwrap_or(Thresholds::CONSERVATIVE)
    }
}

/// Read `ACE_<CATEGORY>_ACCEL_MIN` and `ACE_<CATEGORY>_PARALLEL_MIN` into
/// `overrides`.
///
/// `lookup` maps a variable name to its value. Unparseable values are
/// ignored with a warning.
pub fn apply_env_thresholds<F>(overrides: &mut ThresholdOverrides, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for category in Category::ALL {
        let accel_key = format!("ACE_{}_ACCEL_MIN", category.env_key());
        let parallel_key = format!("ACE_{}_PARALLEL_MIN", category.env_key());
        let accelerated = parse_usize(&accel_key, lookup(&accel_key));
        let parallel = parse_usize(&parallel_key, lookup(&parallel_key));
        if accelerated.is_none() && parallel.is_none() {
            continue;
        }

        let slot = overrides.slot_mut(category).get_or_insert_with(Default::default);
        if accelerated.is_some() {
            slot.accelerated = accelerated;
        }
        if parallel.is_some() {
            slot.parallel = parallel;
        }
    }
}

pub(crate) fn parse_usize(key: &str, value: Option<String>) -> Option<usize> {
    let value = value?;
    match value.trim().replace('_', "").parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring non-numeric override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_ordered() {
        let table = ThresholdTable::default();
        for c in Category::ALL {
            let t = table.get(c);
            assert!(t.accelerated <= t.parallel, "{c}");
        }
    }

    #[test]
    fn test_missing_category_is_conservative() {
        let table = ThresholdTable::from_entries([(
            Category::Reduction,
            Thresholds::new(10, 20),
        )])
        .unwrap();
        assert_eq!(table.get(Category::Reduction), Thresholds::new(10, 20));
        assert_eq!(table.get(Category::Transpose), Thresholds::CONSERVATIVE);
        assert_eq!(ThresholdTable::empty().get(Category::DotProduct), Thresholds::CONSERVATIVE);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let err = ThresholdTable::from_entries([(Category::DotProduct, Thresholds::new(50, 10))])
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::InvalidThresholds {
                category: Category::DotProduct,
                accelerated: 50,
                parallel: 10
            }
        );
    }

    #[test]
    fn test_partial_override_merges_with_default() {
        let mut overrides = ThresholdOverrides::default();
        overrides.element_wise = Some(ThresholdOverride {
            accelerated: None,
            parallel: Some(50_000),
        });
        let table = ThresholdTable::with_overrides(&overrides).unwrap();
        assert_eq!(table.get(Category::ElementWise), Thresholds::new(1_000, 50_000));
    }

    #[test]
    fn test_override_that_inverts_is_rejected() {
        let mut overrides = ThresholdOverrides::default();
        overrides.transpose = Some(ThresholdOverride {
            accelerated: Some(500_000),
            parallel: None,
        });
        assert!(ThresholdTable::with_overrides(&overrides).is_err());
    }

    #[test]
    fn test_env_thresholds() {
        let vars = |key: &str| match key {
            "ACE_MATMUL_PARALLEL_MIN" => Some("2_000_000".to_string()),
            "ACE_DOT_ACCEL_MIN" => Some("64".to_string()),
            "ACE_REDUCTION_ACCEL_MIN" => Some("lots".to_string()),
            _ => None,
        };
        let mut overrides = ThresholdOverrides::default();
        apply_env_thresholds(&mut overrides, vars);

        assert_eq!(
            overrides.matrix_multiply,
            Some(ThresholdOverride {
                accelerated: None,
                parallel: Some(2_000_000)
            })
        );
        assert_eq!(overrides.dot_product.unwrap().accelerated, Some(64));
        assert_eq!(overrides.reduction, None);
    }

    #[test]
    fn test_overrides_from_toml() {
        let overrides: ThresholdOverrides = toml::from_str(
            r#"
            [matrix_multiply]
            accelerated = 512

            [reduction]
            accelerated = 100
            parallel = 1000
            "#,
        )
        .unwrap();
        let table = ThresholdTable::with_overrides(&overrides).unwrap();
        assert_eq!(table.get(Category::MatrixMultiply).accelerated, 512);
        assert_eq!(table.get(Category::Reduction), Thresholds::new(100, 1000));
    }
}
