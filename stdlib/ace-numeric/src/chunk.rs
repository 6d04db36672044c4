//! Chunk tasks sent to the worker pool.
//!
//! A task names its operation with a [`ReduceOp`] or [`MapOp`] value and
//! carries its data in a [`ReduceTask`] or [`MapTask`]; no closure crosses
//! the pool boundary. Map operations take their output chunk by value, so a
//! writing operation cannot be scheduled without somewhere to write.

use crate::scalar::ScalarKernels;
use crate::shared::{Operands, OutputChunk};
use ace_rts_pool::Kernel;
use ace_wasm::BinaryOp;
use std::ops::Range;
use std::sync::Arc;

// ============================================================================
// Reductions
// ============================================================================

/// Operation returning one partial scalar per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Partial sum of operand 0 over the chunk.
    Sum,
    /// Partial inner product of operands 0 and 1 over the chunk.
    Dot,
}

/// Data for one reduction chunk.
pub struct ReduceTask {
    /// Kernels to run.
    pub kernels: Arc<dyn ScalarKernels>,
    /// Shared operands of the invocation.
    pub operands: Operands,
    /// Range of the operands this task covers.
    pub units: Range<usize>,
}

impl Kernel for ReduceOp {
    type Input = ReduceTask;
    type Output = f64;

    fn call(self, task: ReduceTask) -> f64 {
        let ReduceTask {
            kernels,
            operands,
            units,
        } = task;
        match self {
            Self::Sum => kernels.sum(&operands.get(0)[units]),
            Self::Dot => kernels.dot(&operands.get(0)[units.clone()], &operands.get(1)[units]),
        }
    }
}

// ============================================================================
// Maps
// ============================================================================

/// Operation writing its part of the result into an output chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapOp {
    /// Element-wise `op` of operands 0 and 1.
    Binary(BinaryOp),
    /// Operand 0 times a scalar.
    Scale(f64),
    /// Rows of `operand 0 (m x k) * operand 1 (k x n)`.
    MatMul {
        /// Shared dimension.
        k: usize,
        /// Columns of the result.
        n: usize,
    },
    /// Rows of the transpose of operand 0 (`rows x cols`).
    Transpose {
        /// Rows of the source.
        rows: usize,
        /// Columns of the source.
        cols: usize,
    },
}

/// Data for one map chunk.
pub struct MapTask {
    /// Kernels to run.
    pub kernels: Arc<dyn ScalarKernels>,
    /// Shared operands of the invocation.
    pub operands: Operands,
    /// Range of the split dimension this task covers.
    pub units: Range<usize>,
    /// The slice of the result this task owns.
    pub output: OutputChunk,
}

impl Kernel for MapOp {
    type Input = MapTask;
    type Output = ();

    fn call(self, task: MapTask) {
        let MapTask {
            kernels,
            operands,
            units,
            mut output,
        } = task;
        let out = output.as_mut_slice();
        match self {
            Self::Binary(op) => kernels.binary(
                op,
                &operands.get(0)[units.clone()],
                &operands.get(1)[units],
                out,
            ),
            Self::Scale(s) => kernels.scale(&operands.get(0)[units], s, out),
            Self::MatMul { k, n } => {
                kernels.matmul_rows(operands.get(0), operands.get(1), k, n, units, out);
            }
            Self::Transpose { rows, cols } => {
                kernels.transpose_rows(operands.get(0), rows, cols, units, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::PureScalar;
    use crate::shared::SharedRegion;

    #[test]
    fn test_partial_sum() {
        let task = ReduceTask {
            kernels: Arc::new(PureScalar),
            operands: Operands::new(&[&[1.0, 2.0, 3.0, 4.0]]),
            units: 1..3,
        };
        assert_eq!(ReduceOp::Sum.call(task), 5.0);
    }

    #[test]
    fn test_partial_dot() {
        let task = ReduceTask {
            kernels: Arc::new(PureScalar),
            operands: Operands::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]),
            units: 0..2,
        };
        assert_eq!(ReduceOp::Dot.call(task), 14.0);
    }

    #[test]
    fn test_matmul_chunk_writes_its_rows() {
        let region = SharedRegion::new(&[&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0]], 4);
        let (operands, chunks, collector) = region.split(&[0..2, 2..4]).unwrap();
        for (row, output) in chunks.into_iter().enumerate() {
            let task = MapTask {
                kernels: Arc::new(PureScalar),
                operands: operands.clone(),
                units: row..row + 1,
                output,
            };
            MapOp::MatMul { k: 2, n: 2 }.call(task);
        }
        assert_eq!(collector.finish().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_every_chunk_is_written() {
        let region = SharedRegion::new(&[&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]], 3);
        let (operands, chunks, collector) = region.split(&[0..1, 1..3]).unwrap();
        for (units, output) in [0..1, 1..3].into_iter().zip(chunks) {
            let task = MapTask {
                kernels: Arc::new(PureScalar),
                operands: operands.clone(),
                units,
                output,
            };
            MapOp::Binary(BinaryOp::Add).call(task);
        }
        assert_eq!(collector.finish().unwrap(), vec![11.0, 22.0, 33.0]);
    }
}
