//! Property tests for the arena's reuse policy.

use ace_rts_arena::{ArenaConfig, HostHeap, MemoryArena, TypeTag};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize, TypeTag),
    Release(usize),
}

fn tag_strategy() -> impl Strategy<Value = TypeTag> {
    prop_oneof![Just(TypeTag::Bytes), Just(TypeTag::F64Array), Just(TypeTag::I32Array)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..4096, tag_strategy()).prop_map(|(size, tag)| Op::Allocate(size, tag)),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn prop_reused_entries_respect_bound(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut arena = MemoryArena::new(ArenaConfig {
            pooling_threshold: 2048,
            max_pool_entries: 8,
        });
        let mut heap = HostHeap::new(64 * 1024 * 1024);
        let mut live: Vec<u32> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size, tag) => {
                    let reuses = arena.counters().reuses;
                    let offset = arena.allocate(&mut heap, size, tag).unwrap();
                    prop_assert!(!live.contains(&offset));

                    if arena.counters().reuses > reuses {
                        let entry = arena.entry(offset).unwrap();
                        prop_assert!(entry.size >= size);
                        prop_assert!(entry.size <= 2 * size);
                        prop_assert_eq!(entry.tag, tag);
                    }
                    live.push(offset);
                }
                Op::Release(pick) => {
                    if !live.is_empty() {
                        let offset = live.swap_remove(pick % live.len());
                        arena.release(&mut heap, offset);
                    }
                }
            }
            prop_assert!(arena.idle_len() <= 8);
        }
    }

    #[test]
    fn prop_stats_account_for_live_blocks(sizes in prop::collection::vec(1usize..10_000, 1..50)) {
        let mut arena = MemoryArena::new(ArenaConfig {
            pooling_threshold: 4096,
            max_pool_entries: 64,
        });
        let mut heap = HostHeap::new(64 * 1024 * 1024);

        for size in &sizes {
            arena.allocate(&mut heap, *size, TypeTag::F64Array).unwrap();
        }
        let stats = arena.stats()[&TypeTag::F64Array];
        prop_assert_eq!(stats.count, sizes.len());
        prop_assert_eq!(stats.in_use_count, sizes.len());
        prop_assert_eq!(stats.total_bytes, sizes.iter().sum::<usize>());
    }
}
