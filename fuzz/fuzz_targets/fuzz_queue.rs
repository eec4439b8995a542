//! Fuzz target for the job queue.
//!
//! Drives `PriorityJobQueue` with arbitrary push / set_priority / pop
//! sequences and checks that no id is ever pending twice.

#![no_main]

use index_sync::PriorityJobQueue;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|ops: Vec<(u8, u8, i64)>| {
    let queue = PriorityJobQueue::new();

    for (op, id, priority) in ops {
        let id = format!("doc-{}", id % 32);
        match op % 4 {
            0 | 1 => {
                queue.push(&id, priority);
            }
            2 => {
                queue.set_priority(&id, priority);
            }
            _ => {
                let _ = queue.try_pop(Some(priority));
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    while let Some(id) = queue.try_pop(None) {
        assert!(seen.insert(id), "job popped twice");
    }
});
