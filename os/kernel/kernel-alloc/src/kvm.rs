//! # Kernel Page Table
//!
//! Builds the single page table all harts run the kernel on:
//!
//! ```text
//! VA == PA (direct map)                       high addresses
//! ┌────────────────────┬───────┐              ┌───────────────────┬───────┐
//! │ UART0, VIRTIO0     │ R W   │              │ kernel stacks     │ R W   │
//! │ PLIC (4 MiB)       │ R W   │              │  (guard pages)    │       │
//! │ KERNBASE..etext    │ R X   │              │ TRAMPOLINE        │ R X   │
//! │ etext..PHYSTOP     │ R W   │              └───────────────────┴───────┘
//! └────────────────────┴───────┘
//! ```
//!
//! Nothing is user-accessible. Failure to build is fatal: there is no kernel
//! to return to without this table.

use kernel_info::memory::{
    KERNBASE, NPROC, PAGE_SIZE, PHYSTOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0, kstack,
};
use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, PteFlags};
use log::debug;

/// Where the kernel's pieces live in physical memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub uart: PhysicalAddress,
    pub virtio: PhysicalAddress,
    pub plic: PhysicalAddress,
    pub plic_size: u64,
    /// Start of the kernel image; text begins here.
    pub kernel_base: PhysicalAddress,
    /// End of kernel text (`etext`), page-aligned.
    pub text_end: PhysicalAddress,
    /// End of RAM.
    pub phys_top: PhysicalAddress,
    /// Frame holding the trap trampoline code.
    pub trampoline: PhysicalPage<Size4K>,
    /// Number of kernel stacks to allocate and map.
    pub kernel_stacks: usize,
}

impl KernelLayout {
    /// The QEMU `virt` board, given the linker-provided text end and
    /// trampoline frame.
    #[must_use]
    pub const fn qemu_virt(text_end: PhysicalAddress, trampoline: PhysicalPage<Size4K>) -> Self {
        Self {
            uart: PhysicalAddress::new(UART0),
            virtio: PhysicalAddress::new(VIRTIO0),
            plic: PhysicalAddress::new(PLIC),
            plic_size: PLIC_SIZE,
            kernel_base: PhysicalAddress::new(KERNBASE),
            text_end,
            phys_top: PhysicalAddress::new(PHYSTOP),
            trampoline,
            kernel_stacks: NPROC,
        }
    }
}

/// The kernel's page table.
pub struct KernelPageTable<'m, M: PhysMapper> {
    aspace: AddressSpace<'m, M>,
}

impl<'m, M: PhysMapper> KernelPageTable<'m, M> {
    /// Allocate and fill the kernel table for `layout`, including one kernel
    /// stack per process slot at [`kstack`]. Neighbouring stacks are
    /// separated by an unmapped guard page.
    ///
    /// # Panics
    /// If memory runs out or a region overlaps an earlier one.
    pub fn build<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &A, layout: &KernelLayout) -> Self {
        let Some(aspace) = AddressSpace::new(mapper, alloc) else {
            panic!("kvm: out of memory for the root table");
        };
        let table = Self { aspace };

        let rw = PteFlags::R | PteFlags::W;
        let rx = PteFlags::R | PteFlags::X;
        table.identity(alloc, layout.uart, PAGE_SIZE, rw);
        table.identity(alloc, layout.virtio, PAGE_SIZE, rw);
        table.identity(alloc, layout.plic, layout.plic_size, rw);
        table.identity(
            alloc,
            layout.kernel_base,
            layout.text_end.as_u64() - layout.kernel_base.as_u64(),
            rx,
        );
        table.identity(
            alloc,
            layout.text_end,
            layout.phys_top.as_u64() - layout.text_end.as_u64(),
            rw,
        );
        table.map(
            alloc,
            VirtualAddress::new(TRAMPOLINE),
            PAGE_SIZE,
            layout.trampoline.base(),
            rx,
        );
        table.map_stacks(alloc, layout.kernel_stacks);

        debug!(
            "kvm: kernel table at {} ({} stacks, RAM up to {})",
            table.aspace.root_page(),
            layout.kernel_stacks,
            layout.phys_top
        );
        table
    }

    fn map<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        perm: PteFlags,
    ) {
        if self.aspace.map_pages(alloc, va, size, pa, perm).is_err() {
            panic!("kvm: out of memory mapping {va}");
        }
    }

    fn identity<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        pa: PhysicalAddress,
        size: u64,
        perm: PteFlags,
    ) {
        if size > 0 {
            self.map(alloc, VirtualAddress::new(pa.as_u64()), size, pa, perm);
        }
    }

    fn map_stacks<A: FrameAlloc + ?Sized>(&self, alloc: &A, count: usize) {
        for slot in 0..count {
            let Some(frame) = alloc.alloc_4k() else {
                panic!("kvm: out of memory for kernel stack {slot}");
            };
            self.map(
                alloc,
                VirtualAddress::new(kstack(slot)),
                PAGE_SIZE,
                frame.base(),
                PteFlags::R | PteFlags::W,
            );
        }
    }

    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.aspace
    }

    /// `satp` value selecting the kernel table.
    #[inline]
    #[must_use]
    pub const fn satp(&self) -> u64 {
        self.aspace.satp()
    }

    /// Switch the calling hart to the kernel table and flush its TLB.
    ///
    /// # Safety
    /// The running code and stack must be mapped in this table at their
    /// current addresses (the direct map guarantees this during boot).
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate(&self) {
        unsafe { self.aspace.activate() }
    }
}
