//! # User Address Spaces
//!
//! [`UserSpace`] owns a process page table and manages the user image that
//! lives at `[0, size)`: seeding the first process, growing and shrinking
//! the heap, duplicating for fork (eagerly or copy-on-write) and tearing
//! everything down again.
//!
//! The current size is tracked by the caller and passed in; this layer only
//! knows which pages are mapped.
//!
//! ## Failure model
//! - Running out of frames is recoverable. Every operation that allocates
//!   undoes its partial work before returning [`VmmError::OutOfMemory`], so
//!   the space, and the allocator's free count, look exactly as before.
//! - Holes or foreign entries where the user image must be mapped mean the
//!   caller's bookkeeping is broken; those `panic!`.
//!
//! ## TLB
//! Nothing here flushes. Callers changing the active space must issue
//! `sfence.vma` afterwards.

use core::fmt;
use kernel_info::memory::{MAXVA, PAGE_SIZE, TRAMPOLINE, TRAPFRAME};
use kernel_vmem::addresses::{PhysicalPage, Size4K, VirtualAddress, page_round_up};
use kernel_vmem::{
    AddressSpace, EntryKind, FrameAlloc, MapError, PageTableEntry, PhysMapper, PteFlags,
    fill_frame, frame_bytes,
};
use log::{trace, warn};

/// A process page table plus the allocator its frames come from.
pub struct UserSpace<'m, M: PhysMapper, A: FrameAlloc + ?Sized> {
    aspace: AddressSpace<'m, M>,
    alloc: &'m A,
}

impl<M: PhysMapper, A: FrameAlloc + ?Sized> fmt::Debug for UserSpace<'_, M, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSpace")
            .field("root", &self.aspace.root_page())
            .finish_non_exhaustive()
    }
}

impl<'m, M: PhysMapper, A: FrameAlloc + ?Sized> UserSpace<'m, M, A> {
    /// An empty space: a zeroed root table and nothing else.
    ///
    /// Returns `None` if no frame is available.
    pub fn create(mapper: &'m M, alloc: &'m A) -> Option<Self> {
        let aspace = AddressSpace::new(mapper, alloc)?;
        Some(Self { aspace, alloc })
    }

    /// The underlying table walker.
    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.aspace
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.aspace.root_page()
    }

    /// `satp` value selecting this space.
    #[inline]
    #[must_use]
    pub const fn satp(&self) -> u64 {
        self.aspace.satp()
    }

    /// Frame behind the user page containing `va`, if user-accessible.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        self.aspace.translate(va)
    }

    /// Load the first process image at address 0: one zeroed page, mapped
    /// `R|W|X|U`, starting with `image`.
    ///
    /// # Panics
    /// If `image` is a page or longer, or memory runs out.
    pub fn seed_initial(&self, image: &[u8]) {
        assert!(
            (image.len() as u64) < PAGE_SIZE,
            "seed_initial: image of {} bytes exceeds one page",
            image.len()
        );
        let Some(frame) = self.alloc.alloc_4k() else {
            panic!("seed_initial: out of memory");
        };
        let bytes = unsafe { frame_bytes(self.aspace.mapper(), frame) };
        bytes.fill(0);
        bytes[..image.len()].copy_from_slice(image);

        let perm = PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U;
        if self
            .aspace
            .map_pages(self.alloc, VirtualAddress::zero(), PAGE_SIZE, frame.base(), perm)
            .is_err()
        {
            panic!("seed_initial: out of memory");
        }
    }

    /// Grow the image from `old_size` to `new_size` with zeroed pages mapped
    /// `R|U|xperm`. Returns the new size.
    ///
    /// A `new_size` below `old_size` is a no-op returning `old_size`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`]; every page and table added by this call has
    /// been released again.
    pub fn grow(&self, old_size: u64, new_size: u64, xperm: PteFlags) -> Result<u64, VmmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        let perm = PteFlags::R | PteFlags::U | xperm;
        let start = page_round_up::<Size4K>(old_size);
        let mut a = start;
        while a < new_size {
            if let Err(e) = self.map_zeroed(VirtualAddress::new(a), perm) {
                warn!("grow: {old_size:#x} -> {new_size:#x} failed at {a:#x}, rolling back");
                self.release_pages(start, a, a + PAGE_SIZE);
                return Err(e);
            }
            a += PAGE_SIZE;
        }
        Ok(new_size)
    }

    /// Shrink the image from `old_size` to `new_size`, freeing whole pages
    /// no longer covered and any table left empty. Returns the new size.
    ///
    /// A `new_size` at or above `old_size` is a no-op returning `old_size`.
    ///
    /// # Panics
    /// If a page in the released range is not mapped.
    pub fn shrink(&self, old_size: u64, new_size: u64) -> u64 {
        if new_size >= old_size {
            return old_size;
        }
        let lo = page_round_up::<Size4K>(new_size);
        let hi = page_round_up::<Size4K>(old_size);
        if lo < hi {
            self.release_pages(lo, hi, hi);
        }
        new_size
    }

    /// Copy the image `[0, size)` into `child`, page by page, into fresh
    /// frames with the same permissions.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`]; pages already copied into `child` are
    /// unmapped and freed again.
    ///
    /// # Panics
    /// If a page of the source image is missing.
    pub fn copy_into(&self, child: &Self, size: u64) -> Result<(), VmmError> {
        let mut va = 0;
        while va < size {
            let (frame, flags, _) = self.present_page(va, "copy_into");
            // A private copy needs no copy-on-write marker.
            let flags = if flags.contains(PteFlags::COW) {
                (flags - PteFlags::COW) | PteFlags::W
            } else {
                flags
            };
            if let Err(e) = child.map_copy(VirtualAddress::new(va), frame, flags) {
                warn!("copy_into: failed at {va:#x} of {size:#x}, rolling back");
                child.release_pages(0, va, va + PAGE_SIZE);
                return Err(e);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// A new space holding a private copy of `[0, size)`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`]; nothing of the new space survives.
    pub fn duplicate(&self, size: u64) -> Result<Self, VmmError> {
        let child = Self::create(self.aspace.mapper(), self.alloc).ok_or(VmmError::OutOfMemory)?;
        if let Err(e) = self.copy_into(&child, size) {
            child.aspace.free_walk(self.alloc);
            return Err(e);
        }
        Ok(child)
    }

    /// A new space sharing the frames of `[0, size)` with this one.
    ///
    /// Writable pages lose `W` and gain the `COW` marker in both spaces; each
    /// shared frame gains a reference. The first write to such a page faults
    /// and is handled by [`resolve_cow_fault`](Self::resolve_cow_fault).
    ///
    /// # Errors
    /// - [`VmmError::SharingUnsupported`] if the allocator does not count
    ///   references; checked before anything changes.
    /// - [`VmmError::OutOfMemory`]; the child is torn down and the parent's
    ///   pages get their write permission back.
    ///
    /// # Panics
    /// If a page of the source image is missing.
    pub fn duplicate_cow(&self, size: u64) -> Result<Self, VmmError> {
        if self.alloc.ref_count_4k(self.aspace.root_page()).is_none() {
            return Err(VmmError::SharingUnsupported);
        }
        let child = Self::create(self.aspace.mapper(), self.alloc).ok_or(VmmError::OutOfMemory)?;

        let mut va = 0;
        while va < size {
            let (frame, flags, pte) = self.present_page(va, "duplicate_cow");
            let shared = if flags.intersects(PteFlags::W | PteFlags::COW) {
                (flags - PteFlags::W) | PteFlags::COW
            } else {
                flags
            };
            let mapped = child.aspace.map_pages(
                self.alloc,
                VirtualAddress::new(va),
                PAGE_SIZE,
                frame.base(),
                shared,
            );
            if let Err(e) = mapped {
                warn!("duplicate_cow: failed at {va:#x} of {size:#x}, rolling back");
                child.release_pages(0, va, va + PAGE_SIZE);
                child.aspace.free_walk(self.alloc);
                self.restore_sole_owners(va);
                return Err(e.into());
            }
            self.alloc.retain_4k(frame);
            *pte = pte.with_flags(shared);
            va += PAGE_SIZE;
        }
        Ok(child)
    }

    /// Make the copy-on-write page containing `va` writable for this space.
    ///
    /// If the frame is still shared, its content is copied into a fresh
    /// frame and this space's reference to the old one is dropped. If this
    /// space is the last owner, `W` is simply restored.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if `va` has no user mapping.
    /// - [`VmmError::NotCopyOnWrite`] if the page is not marked `COW`
    ///   (a genuine protection fault).
    /// - [`VmmError::OutOfMemory`] if the copy could not be allocated; the
    ///   page stays shared.
    /// - [`VmmError::SharingUnsupported`] if the allocator does not count
    ///   references.
    pub fn resolve_cow_fault(&self, va: VirtualAddress) -> Result<(), VmmError> {
        if va.as_u64() >= MAXVA {
            return Err(VmmError::NotMapped { va });
        }
        let page = va.page::<Size4K>().base();
        let Some(pte) = self.aspace.walk(page) else {
            return Err(VmmError::NotMapped { va });
        };
        let EntryKind::Leaf(frame, flags) = pte.kind() else {
            return Err(VmmError::NotMapped { va });
        };
        if !flags.contains(PteFlags::U) {
            return Err(VmmError::NotMapped { va });
        }
        if !flags.contains(PteFlags::COW) {
            return Err(VmmError::NotCopyOnWrite { va });
        }

        let writable = (flags - PteFlags::COW) | PteFlags::W;
        match self.alloc.ref_count_4k(frame) {
            None => Err(VmmError::SharingUnsupported),
            Some(1) => {
                *pte = pte.with_flags(writable);
                Ok(())
            }
            Some(_) => {
                let copy = self.private_copy(pte, frame, writable)?;
                trace!("cow: {page} now private in {copy}");
                Ok(())
            }
        }
    }

    /// Give the leaf at `pte` a frame of its own if `frame` is shared with
    /// another space, keeping its flags. Returns the frame now mapped.
    ///
    /// Read-only pages are shared by [`duplicate_cow`](Self::duplicate_cow)
    /// without the `COW` marker; the kernel must not write through them.
    pub(crate) fn unshare(
        &self,
        pte: &mut PageTableEntry,
        frame: PhysicalPage<Size4K>,
        flags: PteFlags,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        match self.alloc.ref_count_4k(frame) {
            Some(n) if n > 1 => self.private_copy(pte, frame, flags),
            _ => Ok(frame),
        }
    }

    /// Drop user access to the page at `va` (stack guard page).
    ///
    /// # Panics
    /// If no table covers `va`.
    pub fn clear_user(&self, va: VirtualAddress) {
        self.aspace.clear_user(va);
    }

    /// Map the shared trampoline page at [`TRAMPOLINE`] (`R|X`) and this
    /// process's trap frame at [`TRAPFRAME`] (`R|W`), both kernel-only.
    ///
    /// Neither frame is owned by the space; see
    /// [`unmap_trampoline`](Self::unmap_trampoline).
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`]; nothing stays mapped.
    pub fn map_trampoline(
        &self,
        trampoline: PhysicalPage<Size4K>,
        trapframe: PhysicalPage<Size4K>,
    ) -> Result<(), VmmError> {
        let tramp_va = VirtualAddress::new(TRAMPOLINE);
        let frame_va = VirtualAddress::new(TRAPFRAME);
        let end = VirtualAddress::new(MAXVA);

        let mapped = self.aspace.map_pages(
            self.alloc,
            tramp_va,
            PAGE_SIZE,
            trampoline.base(),
            PteFlags::R | PteFlags::X,
        );
        if let Err(e) = mapped {
            self.aspace.prune(self.alloc, tramp_va, end);
            return Err(e.into());
        }

        let mapped = self.aspace.map_pages(
            self.alloc,
            frame_va,
            PAGE_SIZE,
            trapframe.base(),
            PteFlags::R | PteFlags::W,
        );
        if let Err(e) = mapped {
            self.aspace.unmap_pages(self.alloc, tramp_va, 1, false);
            self.aspace.prune(self.alloc, frame_va, end);
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove the trampoline and trap frame mappings without freeing either
    /// frame.
    ///
    /// # Panics
    /// If they are not mapped.
    pub fn unmap_trampoline(&self) {
        let frame_va = VirtualAddress::new(TRAPFRAME);
        self.aspace.unmap_pages(self.alloc, frame_va, 2, false);
        self.aspace.prune(self.alloc, frame_va, VirtualAddress::new(MAXVA));
    }

    /// Free the user image `[0, size)` and every table frame.
    ///
    /// # Panics
    /// If a page of the image is missing, or anything outside it is still
    /// mapped (unmap the trampoline first).
    pub fn destroy(self, size: u64) {
        if size > 0 {
            let pages = page_round_up::<Size4K>(size) / PAGE_SIZE;
            self.aspace
                .unmap_pages(self.alloc, VirtualAddress::zero(), pages, true);
        }
        self.aspace.free_walk(self.alloc);
    }

    /// Allocate a zeroed frame and map it at `va`.
    fn map_zeroed(&self, va: VirtualAddress, perm: PteFlags) -> Result<(), VmmError> {
        let frame = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        unsafe { fill_frame(self.aspace.mapper(), frame, 0) };
        self.map_owned(va, frame, perm)
    }

    /// Allocate a frame holding a copy of `src` and map it at `va`.
    fn map_copy(
        &self,
        va: VirtualAddress,
        src: PhysicalPage<Size4K>,
        perm: PteFlags,
    ) -> Result<(), VmmError> {
        let frame = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        self.copy_frame(src, frame);
        self.map_owned(va, frame, perm)
    }

    /// Map a frame this call owns; it is freed again if mapping fails.
    fn map_owned(
        &self,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        perm: PteFlags,
    ) -> Result<(), VmmError> {
        if let Err(e) = self
            .aspace
            .map_pages(self.alloc, va, PAGE_SIZE, frame.base(), perm)
        {
            self.alloc.free_4k(frame.base());
            return Err(e.into());
        }
        Ok(())
    }

    /// Point `pte` at a fresh copy of `frame` with `flags` and drop this
    /// space's reference to `frame`.
    fn private_copy(
        &self,
        pte: &mut PageTableEntry,
        frame: PhysicalPage<Size4K>,
        flags: PteFlags,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let copy = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        self.copy_frame(frame, copy);
        *pte = PageTableEntry::leaf(copy, flags);
        self.alloc.free_4k(frame.base());
        Ok(copy)
    }

    fn copy_frame(&self, src: PhysicalPage<Size4K>, dst: PhysicalPage<Size4K>) {
        let mapper = self.aspace.mapper();
        let from = unsafe { frame_bytes(mapper, src) };
        let to = unsafe { frame_bytes(mapper, dst) };
        to.copy_from_slice(from);
    }

    /// Unmap and free the pages in `[from, to)`, then free tables in
    /// `[from, prune_to)` that became empty.
    fn release_pages(&self, from: u64, to: u64, prune_to: u64) {
        if to > from {
            self.aspace.unmap_pages(
                self.alloc,
                VirtualAddress::new(from),
                (to - from) / PAGE_SIZE,
                true,
            );
        }
        self.aspace.prune(
            self.alloc,
            VirtualAddress::new(from),
            VirtualAddress::new(prune_to),
        );
    }

    /// The leaf for image page `va`, which must be present.
    fn present_page(
        &self,
        va: u64,
        op: &str,
    ) -> (PhysicalPage<Size4K>, PteFlags, &'m mut PageTableEntry) {
        let Some(pte) = self.aspace.walk(VirtualAddress::new(va)) else {
            panic!("{op}: pte should exist at {va:#x}");
        };
        match pte.kind() {
            EntryKind::Leaf(frame, flags) => (frame, flags, pte),
            _ => panic!("{op}: page not present at {va:#x}"),
        }
    }

    /// Give `W` back to copy-on-write pages in `[0, end)` that nobody else
    /// shares any more.
    fn restore_sole_owners(&self, end: u64) {
        let mut va = 0;
        while va < end {
            let (frame, flags, pte) = self.present_page(va, "duplicate_cow");
            if flags.contains(PteFlags::COW) && self.alloc.ref_count_4k(frame) == Some(1) {
                *pte = pte.with_flags((flags - PteFlags::COW) | PteFlags::W);
            }
            va += PAGE_SIZE;
        }
    }
}

/// Recoverable address-space failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no user mapping at {va}")]
    NotMapped { va: VirtualAddress },
    #[error("page at {va} is not copy-on-write")]
    NotCopyOnWrite { va: VirtualAddress },
    #[error("frame allocator does not count references")]
    SharingUnsupported,
}

impl From<MapError> for VmmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}
