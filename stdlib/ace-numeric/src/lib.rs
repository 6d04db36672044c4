//! # ACE Numeric
//!
//! Adaptive execution of numeric kernels.
//!
//! Every operation on an [`Engine`] picks one of three strategies from the
//! operation's category and input size:
//!
//! - **Scalar**: the [`ScalarKernels`] provider runs on the calling thread.
//! - **Accelerated**: operands are staged into the accelerated module's linear
//!   memory through a pooled arena and the module's kernel runs on them.
//! - **Parallel**: operands are copied once into a [`SharedRegion`], the work
//!   is split into chunks and each chunk runs on the worker pool. Element-wise
//!   chunks write straight into disjoint slices of the result; reductions
//!   return partial scalars that are added in chunk order.
//!
//! A missing or broken accelerated module is never an error: the engine
//! logs it and runs without that capability.
//!
//! ## Example
//!
//! ```ignore
//! use ace_numeric::{Engine, EngineConfig, ExecOptions, Shape};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let c = futures::executor::block_on(engine.multiply(
//!     &[1.0, 2.0, 3.0, 4.0],
//!     Shape::new(2, 2),
//!     &[5.0, 6.0, 7.0, 8.0],
//!     Shape::new(2, 2),
//!     ExecOptions::AUTO,
//! ))?;
//! assert_eq!(c, vec![19.0, 22.0, 43.0, 50.0]);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod chunk;
pub mod config;
pub mod engine;
pub mod scalar;
pub mod shared;

pub use chunk::{MapOp, MapTask, ReduceOp, ReduceTask};
pub use config::{AcceleratedConfig, EngineConfig};
pub use engine::{Engine, ExecOptions, Normalization, Shape};
pub use scalar::{PureScalar, ScalarKernels};
pub use shared::{Operands, OutputChunk, OutputCollector, SharedRegion};

pub use ace_dispatch::{Category, ExecutionPlan, Strategy};

use ace_dispatch::DispatchError;
use ace_rts_arena::AllocError;
use ace_rts_pool::PoolError;
use ace_wasm::WasmError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The worker pool was shut down before the operation finished.
    #[error("worker pool terminated")]
    PoolTerminated,

    /// A worker running part of the operation died.
    #[error("worker {worker_id} faulted: {message}")]
    WorkerFault {
        /// Slot of the faulted worker.
        worker_id: usize,
        /// Description of the fault.
        message: String,
    },

    /// A kernel panicked inside a worker.
    #[error("kernel panicked: {message}")]
    TaskPanicked {
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The worker pool's queue is full.
    #[error("worker pool queue is full ({capacity} tasks)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Any other worker pool failure.
    #[error(transparent)]
    Pool(PoolError),

    /// The accelerated module could not provide memory.
    #[error("allocation failure: {0}")]
    AllocationFailure(AllocError),

    /// An accelerated kernel failed after the module was loaded.
    #[error("accelerated kernel failed: {0}")]
    Accelerated(WasmError),

    /// Operand dimensions are incompatible.
    #[error("{op}: shape mismatch: {detail}")]
    ShapeMismatch {
        /// Operation that was called.
        op: &'static str,
        /// What does not fit.
        detail: String,
    },

    /// A statistic was requested over no values.
    #[error("{op}: input is empty")]
    EmptyInput {
        /// Operation that was called.
        op: &'static str,
    },

    /// Chunk tasks settled but still hold parts of the result.
    #[error("{op}: parallel result still shared with a chunk task")]
    Incomplete {
        /// Operation that was called.
        op: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Terminated => Self::PoolTerminated,
            PoolError::WorkerFault { worker_id, message } => Self::WorkerFault { worker_id, message },
            PoolError::TaskPanicked { message } => Self::TaskPanicked { message },
            PoolError::QueueFull { capacity } => Self::QueueFull { capacity },
            other => Self::Pool(other),
        }
    }
}

impl From<AllocError> for EngineError {
    fn from(err: AllocError) -> Self {
        Self::AllocationFailure(err)
    }
}

impl From<WasmError> for EngineError {
    fn from(err: WasmError) -> Self {
        match err {
            WasmError::Alloc(alloc) => Self::AllocationFailure(alloc),
            other => Self::Accelerated(other),
        }
    }
}

impl From<DispatchError> for EngineError {
    fn from(err: DispatchError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_map_to_engine_taxonomy() {
        assert_eq!(EngineError::from(PoolError::Terminated), EngineError::PoolTerminated);
        assert!(matches!(
            EngineError::from(PoolError::QueueFull { capacity: 4 }),
            EngineError::QueueFull { capacity: 4 }
        ));
        assert!(matches!(
            EngineError::from(PoolError::Exhausted),
            EngineError::Pool(PoolError::Exhausted)
        ));
    }

    #[test]
    fn test_wasm_alloc_error_is_allocation_failure() {
        let err = EngineError::from(WasmError::Alloc(AllocError::OutOfMemory { requested: 8 }));
        assert_eq!(
            err,
            EngineError::AllocationFailure(AllocError::OutOfMemory { requested: 8 })
        );
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::ShapeMismatch {
            op: "multiply",
            detail: "2x3 * 2x2".to_string(),
        };
        assert_eq!(err.to_string(), "multiply: shape mismatch: 2x3 * 2x2");
        assert_eq!(
            EngineError::EmptyInput { op: "mean" }.to_string(),
            "mean: input is empty"
        );
    }
}
