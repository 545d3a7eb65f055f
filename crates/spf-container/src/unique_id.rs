//! Process-wide unique id allocator.
//!
//! Containers draw ids for buffers and messages from one shared allocator.
//! Ids are never zero; after `u32::MAX` the counter wraps to 1.

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic id source shared by all containers of a process.
#[derive(Debug)]
pub struct UniqueIdAllocator {
    next: AtomicU32,
}

impl Default for UniqueIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl UniqueIdAllocator {
    /// Allocator whose first id is 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Allocator whose first id is `first` (0 is bumped to 1).
    pub const fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(if first == 0 { 1 } else { first }),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> u32 {
        let prev = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(if cur == u32::MAX { 1 } else { cur + 1 })
            });
        // The closure never returns None
        match prev {
            Ok(id) | Err(id) => id,
        }
    }
}
