//! Operation categories.

use crate::DispatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of a numeric operation.
///
/// Categories key the threshold and chunking tables. Each category also
/// fixes what "size" means for selection and which dimension a parallel run
/// is split along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Per-element arithmetic; size is the element count.
    ElementWise,
    /// Reduction to one scalar; size is the element count.
    Reduction,
    /// Inner product of two vectors; size is the vector length.
    DotProduct,
    /// `m x k` times `k x n`; size is `m * k * n`, split along rows of the result.
    MatrixMultiply,
    /// Matrix transpose; size is `rows * cols`, split along source rows.
    Transpose,
}

impl Category {
    /// Every category, in table order.
    pub const ALL: [Self; 5] = [
        Self::ElementWise,
        Self::Reduction,
        Self::DotProduct,
        Self::MatrixMultiply,
        Self::Transpose,
    ];

    /// Stable lowercase name, as used in configuration files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ElementWise => "element_wise",
            Self::Reduction => "reduction",
            Self::DotProduct => "dot_product",
            Self::MatrixMultiply => "matrix_multiply",
            Self::Transpose => "transpose",
        }
    }

    /// Uppercase infix used in environment variable names.
    #[must_use]
    pub const fn env_key(self) -> &'static str {
        match self {
            Self::ElementWise => "ELEMENTWISE",
            Self::Reduction => "REDUCTION",
            Self::DotProduct => "DOT",
            Self::MatrixMultiply => "MATMUL",
            Self::Transpose => "TRANSPOSE",
        }
    }

    /// Whether partial results of chunks must be combined.
    #[must_use]
    pub const fn is_reduction(self) -> bool {
        matches!(self, Self::Reduction | Self::DotProduct)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "element_wise" | "elementwise" | "add" | "map" => Ok(Self::ElementWise),
            "reduction" | "sum" | "reduce" => Ok(Self::Reduction),
            "dot_product" | "dot" => Ok(Self::DotProduct),
            "matrix_multiply" | "matmul" | "multiply" => Ok(Self::MatrixMultiply),
            "transpose" => Ok(Self::Transpose),
            _ => Err(DispatchError::UnknownCategory(s.to_string())),
        }
    }
}

/// One optional value per category.
///
/// Used for configuration overrides, where a missing category means "keep
/// the default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerCategory<T> {
    /// Value for [`Category::ElementWise`].
    pub element_wise: Option<T>,
    /// Value for [`Category::Reduction`].
    pub reduction: Option<T>,
    /// Value for [`Category::DotProduct`].
    pub dot_product: Option<T>,
    /// Value for [`Category::MatrixMultiply`].
    pub matrix_multiply: Option<T>,
    /// Value for [`Category::Transpose`].
    pub transpose: Option<T>,
}

impl<T> Default for PerCategory<T> {
    fn default() -> Self {
        Self {
            element_wise: None,
            reduction: None,
            dot_product: None,
            matrix_multiply: None,
            transpose: None,
        }
    }
}

impl<T> PerCategory<T> {
    /// Value for `category`, if set.
    #[must_use]
    pub fn get(&self, category: Category) -> Option<&T> {
        match category {
            Category::ElementWise => self.element_wise.as_ref(),
            Category::Reduction => self.reduction.as_ref(),
            Category::DotProduct => self.dot_product.as_ref(),
            Category::MatrixMultiply => self.matrix_multiply.as_ref(),
            Category::Transpose => self.transpose.as_ref(),
        }
    }

    /// Mutable slot for `category`.
    pub fn slot_mut(&mut self, category: Category) -> &mut Option<T> {
        match category {
            Category::ElementWise => &mut self.element_wise,
            Category::Reduction => &mut self.reduction,
            Category::DotProduct => &mut self.dot_product,
            Category::MatrixMultiply => &mut self.matrix_multiply,
            Category::Transpose => &mut self.transpose,
        }
    }

    /// Set values, in category order.
    pub fn iter(&self) -> impl Iterator<Item = (Category, &T)> + '_ {
        Category::ALL
            .into_iter()
            .filter_map(move |c| self.get(c).map(|v| (c, v)))
    }
}
