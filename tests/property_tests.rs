//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use index_sync::{IndexSyncConfig, Priority, PriorityJobQueue, SyncStatus, ROOT_PRIORITY};
use proptest::prelude::*;
use std::sync::Arc;

// =============================================================================
// Queue Model
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Push(u8, Priority),
    SetPriority(u8, Priority),
    Pop,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..12, -5i64..5).prop_map(|(id, p)| Op::Push(id, p)),
        1 => (0u8..12, -5i64..5).prop_map(|(id, p)| Op::SetPriority(id, p)),
        2 => Just(Op::Pop),
    ]
}

/// Reference model: linear scan over `(id, priority, seq)`.
#[derive(Default)]
struct Model {
    entries: Vec<(String, Priority, u64)>,
    next_seq: u64,
}

impl Model {
    fn push(&mut self, id: &str, priority: Priority) -> bool {
        if self.entries.iter().any(|(e, _, _)| e == id) {
            return false;
        }
        self.entries.push((id.to_string(), priority, self.next_seq));
        self.next_seq += 1;
        true
    }

    fn set_priority(&mut self, id: &str, priority: Priority) -> bool {
        match self.entries.iter_mut().find(|(e, _, _)| e == id) {
            Some(entry) => {
                entry.1 = priority;
                true
            }
            None => false,
        }
    }

    fn pop(&mut self) -> Option<String> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(i, _)| i)?;
        Some(self.entries.remove(best).0)
    }
}

proptest! {
    /// Any sequence of operations pops in the same order as the model
    #[test]
    fn queue_matches_model(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let queue = PriorityJobQueue::new();
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Push(id, p) => {
                    let id = format!("doc-{}", id);
                    prop_assert_eq!(queue.push(&id, p), model.push(&id, p));
                }
                Op::SetPriority(id, p) => {
                    let id = format!("doc-{}", id);
                    prop_assert_eq!(queue.set_priority(&id, p), model.set_priority(&id, p));
                }
                Op::Pop => {
                    prop_assert_eq!(queue.try_pop(None), model.pop());
                }
            }
            prop_assert_eq!(queue.len(), model.entries.len());
        }

        // Drain what is left
        while let Some(expected) = model.pop() {
            prop_assert_eq!(queue.try_pop(None), Some(expected));
        }
        prop_assert!(queue.is_empty());
    }

    /// Equal priorities come out in insertion order
    #[test]
    fn queue_ties_are_fifo(count in 1usize..50, priority in -100i64..100) {
        let queue = PriorityJobQueue::new();
        for i in 0..count {
            queue.push(&format!("doc-{}", i), priority);
        }
        for i in 0..count {
            prop_assert_eq!(queue.try_pop(None), Some(format!("doc-{}", i)));
        }
    }

    /// An id is never queued twice, whatever the priorities pushed
    #[test]
    fn queue_never_duplicates(pushes in prop::collection::vec((0u8..5, any::<i64>()), 0..100)) {
        let queue = PriorityJobQueue::new();
        for (id, p) in &pushes {
            queue.push(&format!("doc-{}", id), *p);
        }
        let mut popped = Vec::new();
        while let Some(id) = queue.try_pop(None) {
            prop_assert!(!popped.contains(&id), "{} popped twice", id);
            popped.push(id);
        }
        let mut distinct: Vec<u8> = pushes.iter().map(|(id, _)| *id).collect();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(popped.len(), distinct.len());
    }

    /// A minimum priority never releases a job below it
    #[test]
    fn queue_respects_minimum(
        priorities in prop::collection::vec(-10i64..10, 1..30),
        min in -10i64..10,
    ) {
        let queue = PriorityJobQueue::new();
        for (i, p) in priorities.iter().enumerate() {
            queue.push(&format!("doc-{}", i), *p);
        }
        let eligible = priorities.iter().filter(|p| **p >= min).count();
        let mut released = 0;
        while queue.try_pop(Some(min)).is_some() {
            released += 1;
        }
        prop_assert_eq!(released, eligible);
        prop_assert_eq!(queue.len(), priorities.len() - eligible);
    }
}

// =============================================================================
// Priority Boost Properties
// =============================================================================

proptest! {
    /// Overlapping boosts accumulate and dropping them restores the base priority
    #[test]
    fn boosts_accumulate_and_revert(
        base in -10i64..10,
        deltas in prop::collection::vec(-50i64..50, 1..10),
        drop_order in prop::collection::vec(any::<prop::sample::Index>(), 10),
    ) {
        let mut config = IndexSyncConfig::for_testing("workspace");
        config.priorities.insert("doc".to_string(), base);
        let status = Arc::new(SyncStatus::new(&config));

        let mut boosts: Vec<_> = deltas.iter().map(|d| status.add_priority("doc", *d)).collect();
        prop_assert_eq!(status.priority_of("doc"), base + deltas.iter().sum::<i64>());

        for index in drop_order {
            if boosts.is_empty() {
                break;
            }
            let boost = boosts.remove(index.index(boosts.len()));
            drop(boost);
        }
        drop(boosts);

        prop_assert_eq!(status.priority_of("doc"), base);
    }

    /// Boosting the root never moves it
    #[test]
    fn root_boost_is_noop(delta in any::<i64>()) {
        let config = IndexSyncConfig::for_testing("workspace");
        let status = Arc::new(SyncStatus::new(&config));
        let _boost = status.add_priority("workspace", delta);
        prop_assert_eq!(status.priority_of("workspace"), ROOT_PRIORITY);
    }
}
