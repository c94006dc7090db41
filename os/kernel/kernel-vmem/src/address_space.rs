//! # Address Space (Sv39, three levels)
//!
//! A handle over one root table frame plus the [`PhysMapper`] used to reach
//! table frames. All structural operations go through a software walk that
//! mirrors what the MMU does in hardware.
//!
//! ## Highlights
//!
//! - [`AddressSpace::walk`] / [`AddressSpace::walk_or_create`] to reach the
//!   leaf entry slot for a virtual address.
//! - [`AddressSpace::map_pages`] to install leaf mappings over a range.
//! - [`AddressSpace::unmap_pages`] to clear leaves, optionally freeing frames.
//! - [`AddressSpace::prune`] to drop interior tables that became empty.
//! - [`AddressSpace::free_walk`] to free the table structure itself.
//! - [`AddressSpace::translate`] for user-accessible lookups.
//!
//! ## Fatal conditions
//!
//! Mapping over a valid entry, unmapping something that is not mapped,
//! walking at or beyond `MAXVA` and freeing a table that still holds leaves
//! all `panic!`: they mean a page-table invariant is already broken.
//!
//! ## Safety
//!
//! - Mutating the active space requires TLB maintenance (`sfence.vma`) by
//!   the caller.
//! - Callers must not mutate one space from two cores at the same time.

use crate::info::MAXVA;
use crate::page_entry_bits::{EntryKind, PageTableEntry, PteFlags};
use crate::page_table::{Level, PageTable, TableIndex};
use crate::{FrameAlloc, MapError, PhysMapper, fill_frame, get_table};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, page_round_down,
};

/// `satp.MODE` value selecting Sv39 translation.
const SATP_SV39: u64 = 8 << 60;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// The root table frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a root table.
    ///
    /// Returns `None` if no frame is available.
    pub fn new<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &A) -> Option<Self> {
        let root = alloc.alloc_4k()?;
        unsafe { fill_frame(mapper, root, 0) };
        Some(Self { root, mapper })
    }

    /// Wrap an existing root table frame.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the root table.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// The `satp` value that selects this space with Sv39 translation.
    #[inline]
    #[must_use]
    pub const fn satp(&self) -> u64 {
        SATP_SV39 | self.root.ppn()
    }

    /// Make this space the hart's translation root.
    ///
    /// Fences before the switch so earlier table writes are visible to the
    /// walker, and after it to drop stale TLB entries.
    ///
    /// # Safety
    /// The code being executed and the current stack must be mapped at the
    /// same addresses in this space.
    #[cfg(target_arch = "riscv64")]
    #[inline]
    pub unsafe fn activate(&self) {
        let satp = self.satp();
        unsafe {
            core::arch::asm!(
                "sfence.vma zero, zero",
                "csrw satp, {}",
                "sfence.vma zero, zero",
                in(reg) satp,
                options(nostack)
            );
        }
    }

    #[inline]
    fn table(&self, frame: PhysicalPage<Size4K>) -> &'m mut PageTable {
        unsafe { get_table(self.mapper, frame) }
    }

    /// Walk from the root to the leaf slot for `va`, asking `grow` for a
    /// frame whenever an interior table is missing.
    fn descend(
        &self,
        va: VirtualAddress,
        mut grow: impl FnMut() -> Option<PhysicalPage<Size4K>>,
    ) -> Option<&'m mut PageTableEntry> {
        assert!(
            va.as_u64() < MAXVA,
            "walk: virtual address {va} beyond MAXVA"
        );

        let mut frame = self.root;
        for level in [Level::L2, Level::L1] {
            let slot = self.table(frame).get_mut(level.index(va));
            frame = match slot.kind() {
                EntryKind::Table(next) => next,
                EntryKind::Invalid => {
                    let next = grow()?;
                    unsafe { fill_frame(self.mapper, next, 0) };
                    *slot = PageTableEntry::table(next);
                    next
                }
                EntryKind::Leaf(..) => panic!("walk: superpage leaf at {level:?} for {va}"),
            };
        }
        Some(self.table(frame).get_mut(Level::L0.index(va)))
    }

    /// The leaf entry slot for `va`, or `None` if an interior table is missing.
    ///
    /// # Panics
    /// If `va >= MAXVA`.
    pub fn walk(&self, va: VirtualAddress) -> Option<&'m mut PageTableEntry> {
        self.descend(va, || None)
    }

    /// The leaf entry slot for `va`, allocating and zeroing missing interior
    /// tables from `alloc`. New links are valid with no permissions.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table frame could not be allocated.
    /// Tables created before the failure stay linked.
    ///
    /// # Panics
    /// If `va >= MAXVA`.
    pub fn walk_or_create<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
    ) -> Result<&'m mut PageTableEntry, MapError> {
        self.descend(va, || alloc.alloc_4k())
            .ok_or(MapError::OutOfMemory)
    }

    /// Map `[va, va + size)` to consecutive frames starting at `pa` with
    /// `perm` (plus `V`). The range is widened to whole pages.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table frame could not be allocated;
    /// pages mapped before the failure stay mapped.
    ///
    /// # Panics
    /// - If `size` is zero.
    /// - If `perm` has none of `R`/`W`/`X`.
    /// - If any target page is already mapped (`"map_pages: remap"`).
    pub fn map_pages<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        perm: PteFlags,
    ) -> Result<(), MapError> {
        assert!(size != 0, "map_pages: size");
        assert!(
            perm.intersects(PteFlags::ACCESS),
            "map_pages: {perm:?} has no access permission"
        );

        let mut a = VirtualAddress::new(page_round_down::<Size4K>(va.as_u64()));
        let last = VirtualAddress::new(page_round_down::<Size4K>(va.as_u64() + size - 1));
        let mut frame = PhysicalPage::<Size4K>::from_addr(pa);
        loop {
            let pte = self.walk_or_create(alloc, a)?;
            assert!(!pte.valid(), "map_pages: remap at {a}");
            *pte = PageTableEntry::leaf(frame, perm);
            if a == last {
                return Ok(());
            }
            a += Size4K::SIZE;
            frame = PhysicalPage::from_ppn(frame.ppn() + 1);
        }
    }

    /// Clear `npages` leaf mappings starting at `va`, handing each frame back
    /// to `alloc` first when `release` is set.
    ///
    /// Interior tables are left in place; see [`prune`](Self::prune).
    ///
    /// # Panics
    /// - If `va` is not page-aligned.
    /// - If any page has no table, is invalid, or is an interior link.
    pub fn unmap_pages<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        npages: u64,
        release: bool,
    ) {
        assert!(va.is_aligned::<Size4K>(), "unmap_pages: {va} not aligned");

        for i in 0..npages {
            let a = va + i * Size4K::SIZE;
            let Some(pte) = self.walk(a) else {
                panic!("unmap_pages: no table for {a}");
            };
            match pte.kind() {
                EntryKind::Invalid => panic!("unmap_pages: {a} not mapped"),
                EntryKind::Table(_) => panic!("unmap_pages: {a} not a leaf"),
                EntryKind::Leaf(frame, _) => {
                    if release {
                        alloc.free_4k(frame.base());
                    }
                    *pte = PageTableEntry::new();
                }
            }
        }
    }

    /// Free interior tables below the root whose region overlaps
    /// `[start, end)` and that no longer hold any valid entry.
    ///
    /// Tables with live entries outside the range are kept. The root is never
    /// freed.
    pub fn prune<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        let end = end.as_u64().min(MAXVA);
        if start.as_u64() >= end {
            return;
        }
        self.prune_table(alloc, self.root, Level::L2, 0, start.as_u64(), end);
    }

    /// Returns whether `frame` (a table at `level` covering VAs from `base`)
    /// is empty after pruning its children.
    #[allow(clippy::cast_possible_truncation)]
    fn prune_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        frame: PhysicalPage<Size4K>,
        level: Level,
        base: u64,
        start: u64,
        end: u64,
    ) -> bool {
        let table = self.table(frame);
        let Some(child_level) = level.next() else {
            return table.is_empty();
        };

        let span = level.entry_span();
        let lo = start.max(base);
        let hi = end.min(base + span * 512) - 1;
        let first = level.index(VirtualAddress::new(lo));
        let last = level.index(VirtualAddress::new(hi));
        for i in first.as_usize()..=last.as_usize() {
            let idx = TableIndex::new(i as u16);
            if let EntryKind::Table(child) = table.get(idx).kind() {
                let child_base = base + i as u64 * span;
                if self.prune_table(alloc, child, child_level, child_base, start, end) {
                    table.set(idx, PageTableEntry::new());
                    alloc.free_4k(child.base());
                }
            }
        }
        table.is_empty()
    }

    /// Free every table frame of this space, root included.
    ///
    /// # Panics
    /// If any leaf mapping is still present (`"free_walk: leaf"`); unmap all
    /// data pages first.
    pub fn free_walk<A: FrameAlloc + ?Sized>(self, alloc: &A) {
        self.free_table(alloc, self.root);
    }

    fn free_table<A: FrameAlloc + ?Sized>(&self, alloc: &A, frame: PhysicalPage<Size4K>) {
        let table = self.table(frame);
        for i in 0..512 {
            let idx = TableIndex::new(i);
            match table.get(idx).kind() {
                EntryKind::Invalid => {}
                EntryKind::Table(child) => {
                    self.free_table(alloc, child);
                    table.set(idx, PageTableEntry::new());
                }
                EntryKind::Leaf(..) => panic!("free_walk: leaf at index {i}"),
            }
        }
        alloc.free_4k(frame.base());
    }

    /// Frame backing the user page at `va`.
    ///
    /// `None` if `va >= MAXVA`, if nothing is mapped, or if the mapping is not
    /// user-accessible: kernel-only pages are never reachable this way.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        if va.as_u64() >= MAXVA {
            return None;
        }
        let pte = self.walk(va)?;
        match pte.kind() {
            EntryKind::Leaf(frame, flags) if flags.contains(PteFlags::U) => Some(frame),
            _ => None,
        }
    }

    /// Like [`translate`](Self::translate), keeping the in-page offset.
    #[must_use]
    pub fn resolve(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(va)
            .map(|frame| frame.join(va.offset::<Size4K>()))
    }

    /// Drop user access to the page at `va`; used for the guard page below a
    /// user stack.
    ///
    /// # Panics
    /// If no table covers `va`.
    pub fn clear_user(&self, va: VirtualAddress) {
        let Some(pte) = self.walk(va) else {
            panic!("clear_user: no table for {va}");
        };
        pte.set_user(false);
    }
}
