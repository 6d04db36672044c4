//! An in-process stand-in for a foreign runtime heap.
//!
//! [`HostHeap`] implements [`ForeignAllocator`] with a fixed capacity and a
//! bump cursor. It records every pin and unpin so that the arena's pooling
//! decisions can be observed without instantiating a real module.

use crate::foreign::{align_up, AllocError, AllocResult, ForeignAllocator, TypeTag};
use rustc_hash::FxHashMap;

/// Alignment of every block handed out by the host heap.
pub const HOST_BLOCK_ALIGN: usize = 16;

/// Metadata of a live host block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBlock {
    /// Size in bytes.
    pub size: usize,
    /// Runtime class.
    pub tag: TypeTag,
    /// Whether the block is currently pinned.
    pub pinned: bool,
}

/// Bump-allocated heap living in host memory.
#[derive(Debug)]
pub struct HostHeap {
    capacity: usize,
    cursor: usize,
    blocks: FxHashMap<u32, HostBlock>,
    unpinned: Vec<u32>,
    collections: usize,
}

impl HostHeap {
    /// Create a heap that can hand out up to `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            // Offset 0 is reserved so that a zero offset never names a block.
            cursor: HOST_BLOCK_ALIGN,
            blocks: FxHashMap::default(),
            unpinned: Vec::new(),
            collections: 0,
        }
    }

    /// Number of blocks the heap still considers live.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Look up a live block.
    #[must_use]
    pub fn block(&self, offset: u32) -> Option<HostBlock> {
        self.blocks.get(&offset).copied()
    }

    /// Offsets that were unpinned, in call order.
    #[must_use]
    pub fn unpinned(&self) -> &[u32] {
        &self.unpinned
    }

    /// Number of collections requested.
    #[must_use]
    pub fn collections(&self) -> usize {
        self.collections
    }

    /// Bytes handed out so far, including alignment padding.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor
    }
}

impl ForeignAllocator for HostHeap {
    fn allocate(&mut self, size: usize, tag: TypeTag) -> AllocResult<u32> {
        let start = align_up(self.cursor, HOST_BLOCK_ALIGN);
        let end = start
            .checked_add(size.max(1))
            .ok_or(AllocError::TooLarge { requested: size })?;
        if end > self.capacity {
            return Err(AllocError::OutOfMemory { requested: size });
        }
        let offset = u32::try_from(start).map_err(|_| AllocError::TooLarge { requested: size })?;

        self.cursor = end;
        self.blocks.insert(
            offset,
            HostBlock {
                size,
                tag,
                pinned: false,
            },
        );
        Ok(offset)
    }

    fn pin(&mut self, offset: u32) -> AllocResult<()> {
        match self.blocks.get_mut(&offset) {
            Some(block) => {
                block.pinned = true;
                Ok(())
            }
            None => Err(AllocError::PinFailed {
                offset,
                message: "no such block".to_string(),
            }),
        }
    }

    fn unpin(&mut self, offset: u32) {
        self.blocks.remove(&offset);
        self.unpinned.push(offset);
    }

    fn collect(&mut self) {
        self.collections += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_heap_alignment() {
        let mut heap = HostHeap::new(4096);
        let a = heap.allocate(3, TypeTag::Bytes).unwrap();
        let b = heap.allocate(8, TypeTag::F64Array).unwrap();
        assert_eq!(a as usize % HOST_BLOCK_ALIGN, 0);
        assert_eq!(b as usize % HOST_BLOCK_ALIGN, 0);
        assert!(b > a);
    }

    #[test]
    fn test_host_heap_exhaustion() {
        let mut heap = HostHeap::new(128);
        assert!(heap.allocate(64, TypeTag::Bytes).is_ok());
        let err = heap.allocate(128, TypeTag::Bytes).unwrap_err();
        assert_eq!(err, AllocError::OutOfMemory { requested: 128 });
    }

    #[test]
    fn test_pin_and_unpin() {
        let mut heap = HostHeap::new(1024);
        let off = heap.allocate(32, TypeTag::F64Array).unwrap();
        heap.pin(off).unwrap();
        assert!(heap.block(off).unwrap().pinned);

        heap.unpin(off);
        assert!(heap.block(off).is_none());
        assert_eq!(heap.unpinned(), &[off]);
        assert!(heap.pin(off).is_err());
    }
}
