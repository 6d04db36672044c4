//! Pooled allocator over a foreign linear memory region.
//!
//! The accelerated kernels read their operands from, and write their results
//! into, a linear memory owned by a separate runtime. Asking that runtime for
//! a block is far more expensive than the arithmetic on a small array, so the
//! arena keeps released blocks resident and hands them out again to later
//! requests of a similar size.
//!
//! # Pooling rules
//!
//! - An idle entry is reused only when its tag matches and its size lies in
//!   `[requested, 2 * requested]`. Among the candidates the smallest wins.
//! - Requests above [`ArenaConfig::pooling_threshold`] are never pooled:
//!   they are fresh-allocated and unpinned as soon as they are released.
//! - At most [`ArenaConfig::max_pool_entries`] idle entries stay resident.
//!   Releasing past that cap unpins the least recently released entry.
//!
//! The arena holds no reference to the runtime. Every call that may talk to
//! the runtime takes the [`ForeignAllocator`] explicitly, which keeps the
//! arena usable from whichever thread currently owns the runtime instance.
//!
//! # Scoped use
//!
//! ```ignore
//! use ace_rts_arena::{with_scope, HostHeap, MemoryArena, TypeTag};
//!
//! let mut heap = HostHeap::new(1 << 20);
//! let mut arena = MemoryArena::default();
//! with_scope(&mut arena, &mut heap, |scope| {
//!     let input = scope.allocate(800, TypeTag::F64Array)?;
//!     let output = scope.allocate(800, TypeTag::F64Array)?;
//!     run_kernel(scope.foreign(), input, output);
//!     Ok(())
//! })?;
//! // Both blocks are back in the pool here, even if `run_kernel` failed.
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod foreign;
pub mod host;

pub use foreign::{align_up, AllocError, AllocResult, AllocStats, ForeignAllocator, TypeTag};
pub use host::HostHeap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Default size above which allocations bypass the pool (1 MiB).
pub const DEFAULT_POOLING_THRESHOLD: usize = 1024 * 1024;

/// Default number of idle entries kept resident.
pub const DEFAULT_MAX_POOL_ENTRIES: usize = 64;

/// Arena tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Requests larger than this many bytes are never pooled.
    pub pooling_threshold: usize,
    /// Maximum number of idle entries kept resident.
    pub max_pool_entries: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            pooling_threshold: DEFAULT_POOLING_THRESHOLD,
            max_pool_entries: DEFAULT_MAX_POOL_ENTRIES,
        }
    }
}

/// One reusable region inside the foreign memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEntry {
    /// Offset of the block in the foreign memory.
    pub offset: u32,
    /// Size in bytes the block was allocated with.
    pub size: usize,
    /// Runtime class of the block.
    pub tag: TypeTag,
    /// Whether a caller currently holds the block.
    pub in_use: bool,
    released_at: u64,
}

/// Per-tag occupancy of the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    /// Tracked blocks of this tag.
    pub count: usize,
    /// Tracked blocks currently handed out.
    pub in_use_count: usize,
    /// Bytes covered by tracked blocks.
    pub total_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct Unpooled {
    size: usize,
    tag: TypeTag,
}

/// Size-class pool over a foreign allocator.
///
/// # Invariants
///
/// - Every offset in `entries` or `unpooled` is pinned in the runtime.
/// - An offset is never tracked in both maps.
/// - A reused entry satisfies `requested <= entry.size <= 2 * requested`.
#[derive(Debug, Default)]
pub struct MemoryArena {
    config: ArenaConfig,
    entries: FxHashMap<u32, PoolEntry>,
    unpooled: FxHashMap<u32, Unpooled>,
    clock: u64,
    stats: AllocStats,
}

impl MemoryArena {
    /// Create an arena with the given configuration.
    #[must_use]
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// The arena's configuration.
    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Allocate `size` bytes of class `tag`, reusing an idle entry if one fits.
    ///
    /// Zero-sized requests are treated as one byte so that every offset
    /// handed out names a distinct block.
    pub fn allocate<A>(&mut self, alloc: &mut A, size: usize, tag: TypeTag) -> AllocResult<u32>
    where
        A: ForeignAllocator + ?Sized,
    {
        let size = size.max(1);

        if size > self.config.pooling_threshold {
            let offset = self.fresh(alloc, size, tag)?;
            self.unpooled.insert(offset, Unpooled { size, tag });
            self.stats.bypassed += 1;
            tracing::debug!(offset, size, %tag, "arena: unpooled allocation");
            return Ok(offset);
        }

        if let Some(offset) = self.best_fit(size, tag) {
            if let Some(entry) = self.entries.get_mut(&offset) {
                entry.in_use = true;
            }
            self.stats.reuses += 1;
            return Ok(offset);
        }

        let offset = self.fresh(alloc, size, tag)?;
        self.entries.insert(
            offset,
            PoolEntry {
                offset,
                size,
                tag,
                in_use: true,
                released_at: 0,
            },
        );
        Ok(offset)
    }

    /// Give a block back.
    ///
    /// A pooled block stays resident and becomes eligible for reuse. Any
    /// other offset is unpinned immediately.
    pub fn release<A>(&mut self, alloc: &mut A, offset: u32)
    where
        A: ForeignAllocator + ?Sized,
    {
        self.clock += 1;

        if let Some(entry) = self.entries.get_mut(&offset) {
            if !entry.in_use {
                tracing::warn!(offset, "arena: double release ignored");
                return;
            }
            entry.in_use = false;
            entry.released_at = self.clock;
            self.evict_excess(alloc);
            return;
        }

        self.unpooled.remove(&offset);
        alloc.unpin(offset);
    }

    /// Unpin every tracked block, clear the pool and ask the runtime to collect.
    pub fn reset<A>(&mut self, alloc: &mut A)
    where
        A: ForeignAllocator + ?Sized,
    {
        let mut offsets: Vec<u32> = self
            .entries
            .keys()
            .chain(self.unpooled.keys())
            .copied()
            .collect();
        // Highest first, so a bump-style runtime heap can roll back.
        offsets.sort_unstable_by(|a, b| b.cmp(a));
        for offset in &offsets {
            alloc.unpin(*offset);
        }
        self.entries.clear();
        self.unpooled.clear();
        alloc.collect();
        tracing::debug!(released = offsets.len(), "arena: reset");
    }

    /// Occupancy per type tag, covering pooled and live unpooled blocks.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<TypeTag, TagStats> {
        let mut out: BTreeMap<TypeTag, TagStats> = BTreeMap::new();
        for entry in self.entries.values() {
            let s = out.entry(entry.tag).or_default();
            s.count += 1;
            s.total_bytes += entry.size;
            if entry.in_use {
                s.in_use_count += 1;
            }
        }
        for block in self.unpooled.values() {
            let s = out.entry(block.tag).or_default();
            s.count += 1;
            s.in_use_count += 1;
            s.total_bytes += block.size;
        }
        out
    }

    /// Running allocator traffic counters.
    #[must_use]
    pub fn counters(&self) -> AllocStats {
        self.stats
    }

    /// Look up a pooled entry.
    #[must_use]
    pub fn entry(&self, offset: u32) -> Option<&PoolEntry> {
        self.entries.get(&offset)
    }

    /// Number of pooled entries, idle or not.
    #[must_use]
    pub fn pooled_len(&self) -> usize {
        self.entries.len()
    }

    /// Number of idle pooled entries.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.entries.values().filter(|e| !e.in_use).count()
    }

    fn fresh<A>(&mut self, alloc: &mut A, size: usize, tag: TypeTag) -> AllocResult<u32>
    where
        A: ForeignAllocator + ?Sized,
    {
        let offset = match alloc.allocate(size, tag) {
            Ok(offset) => offset,
            Err(err) => {
                self.stats.failed_allocations += 1;
                tracing::debug!(size, %tag, error = %err, "arena: foreign allocation failed");
                return Err(err);
            }
        };
        if let Err(err) = alloc.pin(offset) {
            self.stats.failed_allocations += 1;
            alloc.unpin(offset);
            return Err(err);
        }
        self.stats.fresh_allocations += 1;
        Ok(offset)
    }

    fn best_fit(&self, size: usize, tag: TypeTag) -> Option<u32> {
        let upper = size.saturating_mul(2);
        self.entries
            .values()
            .filter(|e| !e.in_use && e.tag == tag && e.size >= size && e.size <= upper)
            .min_by_key(|e| (e.size, e.offset))
            .map(|e| e.offset)
    }

    fn evict_excess<A>(&mut self, alloc: &mut A)
    where
        A: ForeignAllocator + ?Sized,
    {
        while self.idle_len() > self.config.max_pool_entries {
            let Some(victim) = self
                .entries
                .values()
                .filter(|e| !e.in_use)
                .min_by_key(|e| e.released_at)
                .map(|e| e.offset)
            else {
                break;
            };
            self.entries.remove(&victim);
            alloc.unpin(victim);
            self.stats.evictions += 1;
            tracing::debug!(offset = victim, "arena: evicted idle entry");
        }
    }
}

// ============================================================================
// Scoped allocation
// ============================================================================

/// Allocations that are released together when the scope ends.
///
/// Blocks are released in reverse allocation order on drop, so a kernel
/// failure between allocation and release cannot leak pool entries.
pub struct ArenaScope<'a, A: ForeignAllocator> {
    arena: &'a mut MemoryArena,
    alloc: &'a mut A,
    live: SmallVec<[u32; 4]>,
}

impl<'a, A: ForeignAllocator> ArenaScope<'a, A> {
    /// Open a scope over an arena and the allocator it draws from.
    pub fn new(arena: &'a mut MemoryArena, alloc: &'a mut A) -> Self {
        Self {
            arena,
            alloc,
            live: SmallVec::new(),
        }
    }

    /// Allocate a block owned by this scope.
    pub fn allocate(&mut self, size: usize, tag: TypeTag) -> AllocResult<u32> {
        let offset = self.arena.allocate(&mut *self.alloc, size, tag)?;
        self.live.push(offset);
        Ok(offset)
    }

    /// The foreign runtime, for reading, writing and invoking kernels.
    pub fn foreign(&mut self) -> &mut A {
        &mut *self.alloc
    }

    /// The underlying arena.
    #[must_use]
    pub fn arena(&self) -> &MemoryArena {
        self.arena
    }

    /// Offsets currently owned by the scope, in allocation order.
    #[must_use]
    pub fn live(&self) -> &[u32] {
        &self.live
    }
}

impl<A: ForeignAllocator> Drop for ArenaScope<'_, A> {
    fn drop(&mut self) {
        while let Some(offset) = self.live.pop() {
            self.arena.release(&mut *self.alloc, offset);
        }
    }
}

/// Run `f` inside an [`ArenaScope`], releasing its blocks on every exit path.
pub fn with_scope<A, R, F>(arena: &mut MemoryArena, alloc: &mut A, f: F) -> R
where
    A: ForeignAllocator,
    F: FnOnce(&mut ArenaScope<'_, A>) -> R,
{
    let mut scope = ArenaScope::new(arena, alloc);
    f(&mut scope)
}
