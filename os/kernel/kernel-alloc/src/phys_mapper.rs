//! # Direct-Mapped PhysMapper
//!
//! The kernel page table maps all of RAM at its physical address
//! (`KERNBASE..PHYSTOP`, see [`kvm`](crate::kvm)), so once paging is on, a
//! physical address *is* a usable kernel pointer. Before paging is on it is
//! trivially the same.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::DirectPhysMapper;
//! use kernel_vmem::{PageTable, PhysMapper};
//! use kernel_vmem::addresses::PhysicalAddress;
//!
//! let pa = PhysicalAddress::new(0x8020_0000);
//! unsafe {
//!     let table: &mut PageTable = DirectPhysMapper.phys_to_mut(pa);
//!     table.zero();
//! }
//! ```

use kernel_vmem::PhysMapper;
use kernel_vmem::addresses::PhysicalAddress;

/// [`PhysMapper`] for identity-mapped memory.
///
/// # Safety
/// - The physical range touched must be mapped at the same virtual address
///   (always true for RAM in the kernel table) and writable.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectPhysMapper;

impl PhysMapper for DirectPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = core::ptr::with_exposed_provenance_mut::<T>(pa.as_u64() as usize);
        // SAFETY: Caller guarantees `pa` is identity-mapped, aligned for `T` and unaliased.
        unsafe { &mut *ptr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::addresses::{PhysicalPage, Size4K, VirtualAddress};
    use kernel_vmem::{AddressSpace, FrameAlloc, PageTable, PteFlags};
    use std::cell::RefCell;

    /// Host allocations standing in for frames; addresses are host addresses.
    struct HostFrames {
        frames: RefCell<Vec<Box<PageTable>>>,
    }

    impl FrameAlloc for HostFrames {
        fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
            let table = Box::new(PageTable::zeroed());
            let pa = PhysicalAddress::from_ptr(&raw const *table);
            self.frames.borrow_mut().push(table);
            Some(pa.page())
        }

        fn free_4k(&self, _frame: PhysicalAddress) {}
    }

    #[test]
    fn identity_mapping_reaches_host_memory() {
        let mut word = Box::new(0u64);
        let pa = PhysicalAddress::from_ptr(&raw const *word);
        unsafe { *DirectPhysMapper.phys_to_mut::<u64>(pa) = 0xfeed };
        assert_eq!(*word, 0xfeed);
        *word = 1;
        assert_eq!(unsafe { *DirectPhysMapper.phys_to_mut::<u64>(pa) }, 1);
    }

    #[test]
    fn address_space_over_direct_mapper() {
        let alloc = HostFrames {
            frames: RefCell::new(Vec::new()),
        };
        let space = AddressSpace::new(&DirectPhysMapper, &alloc).unwrap();
        let data = alloc.alloc_4k().unwrap();

        let va = VirtualAddress::new(0x40_0000);
        space
            .map_pages(&alloc, va, 4096, data.base(), PteFlags::R | PteFlags::U)
            .unwrap();
        assert_eq!(space.translate(va + 0x10), Some(data));
        // root, middle and leaf tables plus the data frame
        assert_eq!(alloc.frames.borrow().len(), 4);
    }
}
