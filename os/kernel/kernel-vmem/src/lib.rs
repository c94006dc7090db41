//! # Virtual Memory Support
//!
//! RISC-V Sv39 paging for the kernel: entry encoding, table frames and the
//! software walker that builds and tears down address spaces.
//!
//! ## What you get
//! - An [`AddressSpace`] handle over a root table frame with `walk`,
//!   `map_pages`, `unmap_pages`, `prune`, `free_walk` and `translate`.
//! - The Sv39 [`PageTableEntry`] and its [`PteFlags`].
//! - A 4 KiB-aligned [`PageTable`] and per-level index helpers.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## Sv39 Virtual Address → Physical Address Walk
//!
//! A 64-bit virtual address is split into five fields:
//!
//! ```text
//! | 63‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  zero |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! Each 9-bit field indexes a table of 512 eight-byte entries:
//!
//! ```text
//!  satp → L2 table → L1 table → L0 table → 4 KiB frame
//! ```
//!
//! ### Leaf vs. non-leaf entries
//!
//! - A valid entry with **none** of `R`/`W`/`X` set points to the next table.
//! - A valid entry with any of them set is a **leaf** and maps data.
//!
//! The kernel only creates leaves at L0. Bits 39..63 must be zero; the walker
//! additionally refuses everything at or above [`MAXVA`](info::MAXVA).

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
mod page_table;

pub use crate::address_space::AddressSpace;
pub use crate::page_entry_bits::{EntryKind, PageTableEntry, PteFlags};
pub use crate::page_table::{Level, PageTable, TableIndex};
pub use kernel_memory_addresses as addresses;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Recoverable failure while installing a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// A page-table frame could not be allocated.
    #[error("out of memory while allocating a page-table frame")]
    OutOfMemory,
}

/// Source and sink of physical 4 KiB frames.
///
/// Implementations are shared between cores, hence `&self`.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when memory is exhausted.
    ///
    /// The content is unspecified; callers that need zeroes must clear it.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;

    /// Give back one reference to the frame at `frame`.
    ///
    /// Implementations reject addresses that are not the base of a frame they
    /// manage.
    fn free_4k(&self, frame: PhysicalAddress);

    /// Record an additional mapping of an allocated frame.
    ///
    /// Returns the new reference count, or `None` if this allocator does not
    /// count references (and therefore cannot share frames).
    fn retain_4k(&self, _frame: PhysicalPage<Size4K>) -> Option<u32> {
        None
    }

    /// Current reference count of `frame`, or `None` if not counted.
    fn ref_count_4k(&self, _frame: PhysicalPage<Size4K>) -> Option<u32> {
        None
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
///
/// The kernel direct-maps RAM, so its mapper is the identity; tests back
/// "physical memory" with host buffers.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current address space for `'a`.
    /// - `T` must match the bytes at `pa`, and no other live reference may
    ///   alias them mutably.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// A frame viewed as a page table.
///
/// # Safety
/// - `frame` must hold a page table (or be about to be initialized as one).
#[inline]
pub(crate) unsafe fn get_table<'a, M: PhysMapper>(
    m: &M,
    frame: PhysicalPage<Size4K>,
) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}

/// A frame viewed as raw bytes.
///
/// # Safety
/// - No other live reference may point into `frame`.
#[inline]
pub unsafe fn frame_bytes<'a, M: PhysMapper>(
    m: &M,
    frame: PhysicalPage<Size4K>,
) -> &'a mut [u8; 4096] {
    unsafe { m.phys_to_mut::<[u8; 4096]>(frame.base()) }
}

/// Fill every byte of `frame` with `byte`.
///
/// # Safety
/// - `frame` must be owned by the caller (not mapped or referenced elsewhere).
#[inline]
pub unsafe fn fill_frame<M: PhysMapper>(m: &M, frame: PhysicalPage<Size4K>, byte: u8) {
    unsafe { frame_bytes(m, frame) }.fill(byte);
}
