//! # 32-bit Heap
//!
//! GPU virtual address range below 4 GiB for allocations referenced by
//! 32-bit offsets. Created lazily on the first request that needs it and
//! kept for the life of the process.

use gfxmem_shared::{align_up, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// First-fit range allocator over `[base, base + size)`.
///
/// # Thread Safety
///
/// The free map is behind a mutex; reservations are short.
#[derive(Debug)]
pub struct Heap32 {
    base: u64,
    size: u64,
    /// Free ranges: start -> length. Never adjacent (coalesced on free).
    free: Mutex<BTreeMap<u64, u64>>,
}

impl Heap32 {
    /// Creates a heap with the whole range free.
    #[must_use]
    pub fn new(base: u64, size: u64) -> Self {
        let mut free = BTreeMap::new();
        free.insert(base, size);
        tracing::debug!("32-bit heap created at {:#x} (+{:#x})", base, size);
        Self { base, size, free: Mutex::new(free) }
    }

    /// First address of the heap.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Heap size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Reserves `size` bytes at `alignment` (at least page alignment).
    ///
    /// # Returns
    ///
    /// The GPU address, or `None` if no free range fits.
    pub fn reserve(&self, size: u64, alignment: u64) -> Option<u64> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let alignment = alignment.max(PAGE_SIZE);
        let mut free = self.free.lock();

        let (start, len, address) = free.iter().find_map(|(&start, &len)| {
            let address = align_up(start, alignment);
            (address + size <= start + len).then_some((start, len, address))
        })?;

        free.remove(&start);
        if address > start {
            free.insert(start, address - start);
        }
        let tail = address + size;
        if tail < start + len {
            free.insert(tail, start + len - tail);
        }
        Some(address)
    }

    /// Returns `[address, address + size)` to the heap.
    pub fn free(&self, address: u64, size: u64) {
        let size = align_up(size.max(1), PAGE_SIZE);
        let mut free = self.free.lock();
        let mut start = address;
        let mut end = address + size;

        if let Some((&prev_start, &prev_len)) = free.range(..start).next_back() {
            if prev_start + prev_len == start {
                free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_len) = free.remove(&end) {
            end += next_len;
        }
        free.insert(start, end - start);
    }

    /// Free bytes remaining.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.free.lock().values().sum()
    }
}
