//! # Trim Candidate List
//!
//! Dense, index-addressed ordering of the allocations an engine may
//! evict. Removal leaves a tombstone so the other entries keep their
//! index; every allocation stores its own index as its trim position.
//!
//! ```text
//!   before remove(B):  [ A | B | C | D ]   live = 4
//!   after  remove(B):  [ A | _ | C | D ]   live = 3
//!   after  remove(D):  [ A | _ | C ]       trailing tombstones popped
//!   after  compact():  [ A | C ]           positions rewritten
//! ```
//!
//! Compaction is amortized: it only runs when at least half of the
//! container is tombstones.

use crate::memory::Allocation;
use gfxmem_shared::{EngineId, TRIM_LIST_UNUSED_POSITION};
use std::sync::Arc;

/// Eviction ordering for one engine.
///
/// # Invariant
///
/// For every allocation `a` in the list, `a.trim_position(engine)` is its
/// index. Allocations not in the list report `None`.
#[derive(Debug)]
pub struct TrimCandidateList {
    engine: EngineId,
    entries: Vec<Option<Arc<Allocation>>>,
    live: usize,
}

impl TrimCandidateList {
    /// Creates an empty list for `engine`.
    #[must_use]
    pub const fn new(engine: EngineId) -> Self {
        Self { engine, entries: Vec::new(), live: 0 }
    }

    /// Container size, tombstones included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the container holds nothing, not even tombstones.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Non-tombstone entries.
    #[inline]
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live
    }

    /// Entry at `index`; `None` for tombstones and out-of-range indices.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Allocation>> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    /// Appends `allocation` unless it is already a candidate.
    pub fn add(&mut self, allocation: &Arc<Allocation>) {
        if allocation.trim_position(self.engine).is_some() {
            return;
        }
        allocation.set_trim_position(self.engine, self.entries.len());
        self.entries.push(Some(Arc::clone(allocation)));
        self.live += 1;
    }

    /// Removes `allocation`, leaving a tombstone.
    ///
    /// Removing the last entry also pops every trailing tombstone.
    pub fn remove(&mut self, allocation: &Allocation) {
        let Some(position) = allocation.trim_position(self.engine) else {
            return;
        };
        let matches = self
            .get(position)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), allocation));
        debug_assert!(matches, "trim position out of sync");
        if !matches {
            return;
        }

        self.entries[position] = None;
        self.live -= 1;
        allocation.set_trim_position(self.engine, TRIM_LIST_UNUSED_POSITION);

        if position + 1 == self.entries.len() {
            while matches!(self.entries.last(), Some(None)) {
                self.entries.pop();
            }
        }
    }

    /// True when tombstones make up at least half of the container.
    #[inline]
    #[must_use]
    pub fn should_compact(&self) -> bool {
        2 * self.live <= self.entries.len()
    }

    /// Drops every tombstone, preserving order and rewriting positions.
    pub fn compact(&mut self) {
        self.entries.retain(Option::is_some);
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(allocation) = entry {
                allocation.set_trim_position(self.engine, index);
            }
        }
        debug_assert_eq!(self.entries.len(), self.live);
    }

    /// Live entries in eviction order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.entries.iter().flatten()
    }
}
