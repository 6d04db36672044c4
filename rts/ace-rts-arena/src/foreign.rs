//! The allocation contract of a foreign linear memory runtime.
//!
//! The accelerated module owns its own heap inside its linear memory. The
//! arena never touches that heap directly; it only asks the runtime for
//! blocks and tells it when a block may be reclaimed. Everything the arena
//! needs from the runtime is captured by [`ForeignAllocator`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for allocation operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors that can occur while allocating foreign memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The foreign runtime could not satisfy the request.
    #[error("out of linear memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Requested allocation size.
        requested: usize,
    },

    /// The request cannot be expressed in the runtime's 32-bit address space.
    #[error("allocation of {requested} bytes exceeds the 32-bit linear address space")]
    TooLarge {
        /// Requested allocation size.
        requested: usize,
    },

    /// The runtime rejected a pin request for a block it handed out.
    #[error("failed to pin block at offset {offset:#x}: {message}")]
    PinFailed {
        /// Offset of the block.
        offset: u32,
        /// Runtime-provided reason.
        message: String,
    },

    /// The runtime itself failed (trap, missing export, ...).
    #[error("foreign runtime error: {0}")]
    Runtime(String),
}

/// Runtime class of a block, passed through to the foreign allocator.
///
/// The discriminant is the class id the runtime stores in its block header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeTag {
    /// Untyped bytes.
    Bytes = 0,
    /// Contiguous `f64` elements.
    F64Array = 1,
    /// Contiguous `f32` elements.
    F32Array = 2,
    /// Contiguous `i32` elements.
    I32Array = 3,
}

impl TypeTag {
    /// The class id handed to the foreign allocator.
    #[inline]
    #[must_use]
    pub const fn class_id(self) -> u32 {
        self as u32
    }

    /// Size in bytes of one element of this class.
    #[inline]
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::Bytes => 1,
            Self::F64Array => 8,
            Self::F32Array | Self::I32Array => 4,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bytes => "bytes",
            Self::F64Array => "f64[]",
            Self::F32Array => "f32[]",
            Self::I32Array => "i32[]",
        };
        f.write_str(name)
    }
}

/// Memory management exports of a foreign runtime.
///
/// Offsets are byte offsets into the runtime's linear memory. A freshly
/// allocated block is owned by the runtime's collector until pinned; an
/// unpinned block may be reclaimed at any time after the call returns.
pub trait ForeignAllocator {
    /// Allocate `size` bytes of class `tag` and return the block's offset.
    fn allocate(&mut self, size: usize, tag: TypeTag) -> AllocResult<u32>;

    /// Keep the block at `offset` alive until it is unpinned.
    fn pin(&mut self, offset: u32) -> AllocResult<()>;

    /// Hand the block at `offset` back to the runtime.
    fn unpin(&mut self, offset: u32);

    /// Run a full collection of unpinned blocks.
    fn collect(&mut self);
}

impl<A: ForeignAllocator + ?Sized> ForeignAllocator for &mut A {
    fn allocate(&mut self, size: usize, tag: TypeTag) -> AllocResult<u32> {
        (**self).allocate(size, tag)
    }

    fn pin(&mut self, offset: u32) -> AllocResult<()> {
        (**self).pin(offset)
    }

    fn unpin(&mut self, offset: u32) {
        (**self).unpin(offset);
    }

    fn collect(&mut self) {
        (**self).collect();
    }
}

/// Running totals of foreign allocator traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Blocks requested from the runtime.
    pub fresh_allocations: usize,
    /// Requests served from an idle pooled entry.
    pub reuses: usize,
    /// Requests above the pooling threshold.
    pub bypassed: usize,
    /// Idle entries unpinned to keep the pool bounded.
    pub evictions: usize,
    /// Requests the runtime could not satisfy.
    pub failed_allocations: usize,
}

impl AllocStats {
    /// Create new empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fresh_allocations: 0,
            reuses: 0,
            bypassed: 0,
            evictions: 0,
            failed_allocations: 0,
        }
    }
}

/// Align a size up to the given power-of-two alignment.
#[inline]
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_ids_are_stable() {
        assert_eq!(TypeTag::Bytes.class_id(), 0);
        assert_eq!(TypeTag::F64Array.class_id(), 1);
        assert_eq!(TypeTag::F32Array.class_id(), 2);
        assert_eq!(TypeTag::I32Array.class_id(), 3);
    }

    #[test]
    fn test_element_sizes() {
        assert_eq!(TypeTag::F64Array.element_size(), 8);
        assert_eq!(TypeTag::F32Array.element_size(), 4);
        assert_eq!(TypeTag::Bytes.element_size(), 1);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
    }

    #[test]
    fn test_error_display() {
        let err = AllocError::OutOfMemory { requested: 64 };
        assert_eq!(
            err.to_string(),
            "out of linear memory: failed to allocate 64 bytes"
        );
    }
}
