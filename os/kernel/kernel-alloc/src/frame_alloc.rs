//! # Per-Core Physical Frame Allocator
//!
//! Hands out the 4 KiB frames between the end of the kernel image and the top
//! of RAM. Each core owns a free list behind its own [`SpinLock`]; a core
//! whose list ran dry borrows a single frame from another core's list.
//!
//! ```text
//!  kernel_end        first                                      phys_top
//!      │ (rounded up) │                                             │
//!      ▼              ▼                                             ▼
//!  ────┬──────────────┬───────────────┬───────────────┬─────────────┐
//!      │   padding    │  list 0 ...   │  list 1 ...   │ list n-1 .. │
//!  ────┴──────────────┴───────────────┴───────────────┴─────────────┘
//! ```
//!
//! ## Junk fill
//! Allocated frames are filled with [`ALLOC_JUNK`], freed frames with
//! [`FREE_JUNK`] (except the first eight bytes, which carry the list link),
//! so stale or uninitialized use shows up quickly.
//!
//! ## Lock discipline
//! - Interrupts stay disabled from reading the core id until the list
//!   operation is done, so the core cannot change in between.
//! - At most one list lock is held at any time, including while borrowing.
//! - Junk fills happen outside every lock.
//! - Every lock, including the reference-count lock and the list locks
//!   taken for statistics, is held with interrupts disabled, so an
//!   interrupt handler freeing a frame cannot spin on a lock its own hart
//!   holds.
//! - The reference-count lock is never held together with a list lock.

use crate::free_list::FrameList;
use crate::refcount::RefCountTable;
use kernel_info::memory::{NCPU, PAGE_SIZE};
use kernel_sync::{Hart, IrqGuard, SpinLock};
use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K, page_round_up};
use kernel_vmem::{FrameAlloc, PhysMapper, fill_frame};
use log::{debug, trace};

/// Byte pattern of a freshly allocated frame.
pub const ALLOC_JUNK: u8 = 0x05;

/// Byte pattern of a freed frame (beyond the list link).
pub const FREE_JUNK: u8 = 0x01;

/// Which lists an empty core tries, in order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BorrowOrder {
    /// Start at the next core and wrap around.
    #[default]
    NextNeighbor,
    /// Start at core 0.
    FromZero,
}

/// Allocator shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameAllocConfig {
    /// Number of free lists, `1..=NCPU`. Cores with higher ids share the
    /// lists modulo this count; `1` gives a single global list.
    pub cpus: usize,
    /// Donor order when a core's own list is empty.
    pub borrow: BorrowOrder,
}

impl FrameAllocConfig {
    /// One list per core.
    #[must_use]
    pub const fn per_cpu(cpus: usize) -> Self {
        Self {
            cpus,
            borrow: BorrowOrder::NextNeighbor,
        }
    }

    /// A single list shared by all cores.
    #[must_use]
    pub const fn global() -> Self {
        Self::per_cpu(1)
    }

    #[must_use]
    pub const fn with_borrow(mut self, borrow: BorrowOrder) -> Self {
        self.borrow = borrow;
        self
    }
}

impl Default for FrameAllocConfig {
    fn default() -> Self {
        Self::per_cpu(NCPU)
    }
}

/// Physical frame allocator with one free list per core.
///
/// `M` reaches frames to write links and junk; `H` tells which core is
/// running.
pub struct PerCpuFrameAlloc<'m, M: PhysMapper, H: Hart> {
    mapper: &'m M,
    hart: &'m H,
    kernel_end: PhysicalAddress,
    phys_top: PhysicalAddress,
    first: PhysicalPage<Size4K>,
    frames: usize,
    lists: [SpinLock<FrameList>; NCPU],
    cpus: usize,
    borrow: BorrowOrder,
    refs: Option<RefCountTable<'m>>,
}

impl<'m, M: PhysMapper, H: Hart> PerCpuFrameAlloc<'m, M, H> {
    /// Take ownership of every frame in `[round_up(kernel_end), phys_top)`
    /// and split them into `config.cpus` contiguous runs, one per list.
    ///
    /// With `refs`, frames are reference counted: [`retain_4k`](FrameAlloc::retain_4k)
    /// works and `free_4k` only recycles a frame once its count drops to zero.
    ///
    /// # Panics
    /// - If `config.cpus` is not in `1..=NCPU`.
    /// - If `phys_top` is not page-aligned or below `kernel_end`.
    /// - If `refs` is too small for the range.
    pub fn init(
        mapper: &'m M,
        hart: &'m H,
        kernel_end: PhysicalAddress,
        phys_top: PhysicalAddress,
        config: FrameAllocConfig,
        mut refs: Option<RefCountTable<'m>>,
    ) -> Self {
        assert!(
            (1..=NCPU).contains(&config.cpus),
            "frame_alloc: {} lists, at most {NCPU} supported",
            config.cpus
        );
        assert!(
            phys_top.is_aligned::<Size4K>(),
            "frame_alloc: top {phys_top} not page aligned"
        );

        let first = PhysicalAddress::new(page_round_up::<Size4K>(kernel_end.as_u64()));
        assert!(
            first <= phys_top,
            "frame_alloc: kernel end {kernel_end} above top {phys_top}"
        );
        let frames = frame_count(first, phys_top);
        let first = first.page();
        if let Some(refs) = refs.as_mut() {
            refs.bind(first, frames);
        }

        let mut lists: [SpinLock<FrameList>; NCPU] =
            core::array::from_fn(|_| SpinLock::new("kmem", FrameList::new()));
        let per_list = frames.div_ceil(config.cpus).max(1);
        for (i, frame) in (0..frames).map(|i| nth_frame(first, i)).enumerate() {
            let list = (i / per_list).min(config.cpus - 1);
            unsafe {
                fill_frame(mapper, frame, FREE_JUNK);
                lists[list].get_mut().push(mapper, frame);
            }
        }

        debug!(
            "frame_alloc: {frames} frames in {first}..{phys_top} over {} list(s), ~{per_list} each, refcounts {}",
            config.cpus,
            if refs.is_some() { "on" } else { "off" }
        );

        Self {
            mapper,
            hart,
            kernel_end,
            phys_top,
            first,
            frames,
            lists,
            cpus: config.cpus,
            borrow: config.borrow,
            refs,
        }
    }

    /// Number of frames under management (free or not).
    #[inline]
    #[must_use]
    pub const fn managed_frames(&self) -> usize {
        self.frames
    }

    /// Lowest managed frame.
    #[inline]
    #[must_use]
    pub const fn first_frame(&self) -> PhysicalPage<Size4K> {
        self.first
    }

    /// Number of free lists in use.
    #[inline]
    #[must_use]
    pub const fn lists(&self) -> usize {
        self.cpus
    }

    /// Free frames over all lists.
    ///
    /// Locks one list at a time, so under concurrent use this is a snapshot.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        let _irq = IrqGuard::new(self.hart);
        self.lists[..self.cpus].iter().map(|l| l.lock().len()).sum()
    }

    /// Free frames on list `cpu`.
    ///
    /// # Panics
    /// If `cpu` is not a list index.
    #[must_use]
    pub fn free_frames_on(&self, cpu: usize) -> usize {
        assert!(cpu < self.cpus, "frame_alloc: no list {cpu}");
        let _irq = IrqGuard::new(self.hart);
        self.lists[cpu].lock().len()
    }

    /// Reference count of `frame`, or `None` without counting.
    #[must_use]
    pub fn ref_count(&self, frame: PhysicalPage<Size4K>) -> Option<u32> {
        self.with_refs(|r| r.get(frame))
    }

    /// Run `f` on the reference counts with interrupts disabled.
    fn with_refs<R>(&self, f: impl FnOnce(&RefCountTable<'m>) -> R) -> Option<R> {
        let refs = self.refs.as_ref()?;
        let _irq = IrqGuard::new(self.hart);
        Some(f(refs))
    }

    /// Take one frame from some other core's list.
    fn borrow_frame(&self, cpu: usize) -> Option<PhysicalPage<Size4K>> {
        for step in 0..self.cpus {
            let donor = match self.borrow {
                BorrowOrder::NextNeighbor => (cpu + 1 + step) % self.cpus,
                BorrowOrder::FromZero => step,
            };
            if donor == cpu {
                continue;
            }
            let taken = self.lists[donor].lock().pop(self.mapper);
            if let Some(frame) = taken {
                trace!("frame_alloc: list {cpu} borrowed {frame} from list {donor}");
                return Some(frame);
            }
        }
        None
    }
}

impl<M: PhysMapper, H: Hart> FrameAlloc for PerCpuFrameAlloc<'_, M, H> {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let irq = IrqGuard::new(self.hart);
        let cpu = irq.hart_id() % self.cpus;
        let local = self.lists[cpu].lock().pop(self.mapper);
        let frame = match local {
            Some(frame) => frame,
            None => self.borrow_frame(cpu)?,
        };
        drop(irq);

        unsafe { fill_frame(self.mapper, frame, ALLOC_JUNK) };
        self.with_refs(|r| r.reset(frame));
        Some(frame)
    }

    /// # Panics
    /// - If `frame` is not page-aligned.
    /// - If `frame` lies below the kernel end or at/above the top of RAM.
    /// - With reference counting, if the frame has no references left.
    fn free_4k(&self, frame: PhysicalAddress) {
        let Some(page) = PhysicalPage::<Size4K>::from_aligned(frame) else {
            panic!("free_4k: {frame} not page aligned");
        };
        assert!(
            frame >= self.kernel_end && frame < self.phys_top,
            "free_4k: {frame} outside managed memory"
        );

        if self.with_refs(|r| r.release(page)).is_some_and(|left| left > 0) {
            return;
        }

        unsafe { fill_frame(self.mapper, page, FREE_JUNK) };
        let irq = IrqGuard::new(self.hart);
        let cpu = irq.hart_id() % self.cpus;
        unsafe { self.lists[cpu].lock().push(self.mapper, page) };
    }

    fn retain_4k(&self, frame: PhysicalPage<Size4K>) -> Option<u32> {
        self.with_refs(|r| r.retain(frame))
    }

    fn ref_count_4k(&self, frame: PhysicalPage<Size4K>) -> Option<u32> {
        self.ref_count(frame)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn frame_count(first: PhysicalAddress, top: PhysicalAddress) -> usize {
    ((top.as_u64() - first.as_u64()) / PAGE_SIZE) as usize
}

const fn nth_frame(first: PhysicalPage<Size4K>, i: usize) -> PhysicalPage<Size4K> {
    PhysicalPage::from_ppn(first.ppn() + i as u64)
}
