//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K};

/// Size of a frame and of a page, in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Number of page-table entries per table frame.
pub const PTES_PER_TABLE: usize = 512;

/// Maximum number of harts (execution cores) the kernel supports.
pub const NCPU: usize = 8;

/// Maximum number of processes, one kernel stack slot each.
pub const NPROC: usize = 64;

/// QEMU `virt` UART registers.
pub const UART0: u64 = 0x1000_0000;

/// QEMU `virt` virtio MMIO disk interface.
pub const VIRTIO0: u64 = 0x1000_1000;

/// Platform-level interrupt controller.
pub const PLIC: u64 = 0x0c00_0000;

/// Size of the PLIC register window the kernel maps.
pub const PLIC_SIZE: u64 = 0x40_0000;

/// Where the boot loader places the kernel image (and where RAM starts).
pub const KERNBASE: u64 = 0x8000_0000;

/// Amount of RAM the kernel uses.
pub const RAM_SIZE: u64 = 128 * 1024 * 1024;

/// Exclusive upper bound of the physical memory handed to the frame allocator.
pub const PHYSTOP: u64 = KERNBASE + RAM_SIZE;

/// One beyond the highest usable virtual address.
///
/// Sv39 translates 39 bits; the top bit is left unused so that addresses
/// never need sign extension.
pub const MAXVA: u64 = 1 << (9 + 9 + 9 + 12 - 1);

/// The trampoline page, mapped at the same virtual address in the kernel
/// table and every user table.
pub const TRAMPOLINE: u64 = MAXVA - PAGE_SIZE;

/// The per-process trap frame, just below the trampoline in user tables.
pub const TRAPFRAME: u64 = TRAMPOLINE - PAGE_SIZE;

/// Virtual address of the kernel stack of process slot `slot`.
///
/// Each stack is one page, followed (downwards) by an unmapped guard page.
#[inline]
#[must_use]
pub const fn kstack(slot: usize) -> u64 {
    TRAMPOLINE - (slot as u64 + 1) * 2 * PAGE_SIZE
}

const _: () = {
    assert!(PHYSTOP.is_multiple_of(PAGE_SIZE));
    assert!(KERNBASE.is_multiple_of(PAGE_SIZE));
    assert!(PLIC + PLIC_SIZE <= UART0);
    assert!(VIRTIO0 + PAGE_SIZE <= KERNBASE);
    assert!(PHYSTOP < MAXVA);
    assert!(kstack(NPROC - 1) > PHYSTOP);
    assert!(NCPU > 0 && NPROC > 0);
};
