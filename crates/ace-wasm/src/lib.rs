//! # Accelerated Module
//!
//! Compiles, instantiates and calls the accelerated kernel module.
//!
//! The module is a WebAssembly binary (or text) exporting:
//!
//! - a linear `memory`;
//! - the allocator contract `__new(size, class_id) -> ptr`, `__pin(ptr) -> ptr`,
//!   `__unpin(ptr)` and `__collect()`;
//! - f64 kernels taking byte offsets into that memory plus element counts:
//!   `sum_f64`, `dot_f64`, `add_f64`, `sub_f64`, `mul_f64`, `scale_f64`,
//!   `matmul_f64` and `transpose_f64`.
//!
//! It imports `env.abort(msg, file, line, col)` and `env.seed() -> f64`.
//! A module with this surface is bundled and used when no path is configured.
//!
//! ## Loading
//!
//! [`ModuleLoader`] compiles at most once: concurrent callers of
//! [`ModuleLoader::precompile`] or [`ModuleLoader::load`] wait for and share
//! the same compilation. Every failure (missing file, invalid module, missing
//! export, instantiation error) is logged and reported as "unavailable" by
//! [`ModuleLoader::load`], never raised.
//!
//! ```ignore
//! use ace_wasm::{ModuleLoader, LoaderConfig};
//!
//! let loader = ModuleLoader::new(&LoaderConfig::default())?;
//! if let Some(mut instance) = loader.load() {
//!     let p = instance.alloc_f64(&[1.0, 2.0, 3.0])?;
//!     assert_eq!(instance.sum_f64(p, 3)?, 6.0);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod instance;
pub mod loader;

pub use instance::{AbortInfo, AcceleratedInstance, BinaryOp, KernelExport};
pub use loader::{
    LoaderConfig, ModuleLoader, ModuleSource, BUNDLED_KERNELS_WAT, DEFAULT_MAX_MEMORY_PAGES,
};

use ace_rts_arena::AllocError;
use thiserror::Error;

/// WebAssembly page size in bytes.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Errors from loading or calling the accelerated module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WasmError {
    /// The wasmtime engine could not be configured.
    #[error("failed to create wasm engine: {0}")]
    Engine(String),

    /// The module could not be read or compiled.
    #[error("failed to compile module from {source_name}: {message}")]
    Compile {
        /// Where the module came from.
        source_name: String,
        /// Compiler diagnostic.
        message: String,
    },

    /// Linking or instantiation failed.
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),

    /// A required export is missing or has the wrong signature.
    #[error("module export `{name}` unusable: {message}")]
    MissingExport {
        /// Export name.
        name: &'static str,
        /// Lookup failure.
        message: String,
    },

    /// A kernel trapped.
    #[error("kernel `{kernel}` trapped: {message}")]
    Trap {
        /// Export that trapped.
        kernel: &'static str,
        /// Trap description.
        message: String,
    },

    /// A read or write fell outside linear memory.
    #[error("access of {len} bytes at offset {offset:#x} is out of bounds")]
    OutOfBounds {
        /// Start of the access.
        offset: u32,
        /// Length of the access in bytes.
        len: usize,
    },

    /// The module's allocator failed.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Result type for accelerated module operations.
pub type WasmResult<T> = Result<T, WasmError>;
