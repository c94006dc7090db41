//! # Frame Reference Counts
//!
//! One `u16` per managed frame, counting how many mappings (or other owners)
//! hold it. The storage is provided by the caller, typically a static array
//! sized with [`MAX_FRAMES`], and bound to the allocator's frame range at
//! initialization.
//!
//! All counts sit behind a single lock. The lock does not mask interrupts:
//! callers disable them around every operation, as the allocator does, so a
//! free from an interrupt handler cannot deadlock its own hart. The allocator
//! never holds it together with a free-list lock.

use kernel_info::memory::{KERNBASE, PAGE_SIZE, PHYSTOP};
use kernel_sync::SpinLock;
use kernel_vmem::addresses::{PhysicalPage, Size4K};

/// Upper bound on frames in RAM; enough storage for any allocator range on
/// the reference board.
#[allow(clippy::cast_possible_truncation)]
pub const MAX_FRAMES: usize = ((PHYSTOP - KERNBASE) / PAGE_SIZE) as usize;

/// Per-frame reference counts over caller storage.
pub struct RefCountTable<'m> {
    first: PhysicalPage<Size4K>,
    frames: usize,
    counts: SpinLock<&'m mut [u16]>,
}

impl<'m> RefCountTable<'m> {
    /// Wrap `storage`; one slot per frame.
    ///
    /// The table covers nothing until [`bind`](Self::bind) is called.
    pub const fn new(storage: &'m mut [u16]) -> Self {
        Self {
            first: PhysicalPage::from_ppn(0),
            frames: 0,
            counts: SpinLock::new("refcnt", storage),
        }
    }

    /// Cover `frames` frames starting at `first`, all with count zero.
    ///
    /// # Panics
    /// If the storage has fewer than `frames` slots.
    pub fn bind(&mut self, first: PhysicalPage<Size4K>, frames: usize) {
        let counts = self.counts.get_mut();
        assert!(
            counts.len() >= frames,
            "refcount: {} slots for {frames} frames",
            counts.len()
        );
        counts[..frames].fill(0);
        self.first = first;
        self.frames = frames;
    }

    /// Number of frames covered.
    #[inline]
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, frame: PhysicalPage<Size4K>) -> usize {
        let index = frame.ppn().wrapping_sub(self.first.ppn()) as usize;
        assert!(index < self.frames, "refcount: {frame} outside table");
        index
    }

    /// Current count of `frame`.
    ///
    /// # Panics
    /// If `frame` is not covered.
    #[must_use]
    pub fn get(&self, frame: PhysicalPage<Size4K>) -> u32 {
        let i = self.slot(frame);
        self.counts.with_lock(|c| u32::from(c[i]))
    }

    /// Set the count of a freshly allocated frame to one.
    ///
    /// # Panics
    /// If `frame` is not covered.
    pub fn reset(&self, frame: PhysicalPage<Size4K>) {
        let i = self.slot(frame);
        self.counts.with_lock(|c| c[i] = 1);
    }

    /// Add a reference, returning the new count.
    ///
    /// # Panics
    /// If `frame` is free (count zero) or the count would overflow.
    pub fn retain(&self, frame: PhysicalPage<Size4K>) -> u32 {
        let i = self.slot(frame);
        self.counts.with_lock(|c| {
            assert!(c[i] != 0, "refcount: retain of free frame {frame}");
            c[i] = c[i]
                .checked_add(1)
                .unwrap_or_else(|| panic!("refcount: overflow on {frame}"));
            u32::from(c[i])
        })
    }

    /// Drop a reference, returning the remaining count.
    ///
    /// # Panics
    /// If `frame` has no references left.
    pub fn release(&self, frame: PhysicalPage<Size4K>) -> u32 {
        let i = self.slot(frame);
        self.counts.with_lock(|c| {
            assert!(c[i] != 0, "free_4k: {frame} has no references");
            c[i] -= 1;
            u32::from(c[i])
        })
    }
}
