//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frames, process address spaces and the kernel page table for
//! an Sv39 RISC-V kernel. Page-table mechanics live in `kernel-vmem`; this
//! crate decides *which* frames go *where*.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   User spaces (vmm, uaccess)     Kernel table (kvm) │
//! │    • grow / shrink / duplicate    • direct map      │
//! │    • copy-on-write faults         • kernel stacks   │
//! │    • kernel ⇄ user copies         • trampoline      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  kernel_vmem::AddressSpace
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper (phys_mapper)          │
//! │    • physical address → kernel pointer (identity)   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │         Per-core Frame Allocator (frame_alloc)      │
//! │    • one locked free list per core, borrowing       │
//! │    • intrusive links inside free frames             │
//! │    • optional reference counts (refcount)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot sequence
//!
//! ```rust,ignore
//! let alloc = PerCpuFrameAlloc::init(
//!     &DirectPhysMapper, &RiscvHart, kernel_end, PhysicalAddress::new(PHYSTOP),
//!     FrameAllocConfig::default(), Some(RefCountTable::new(refs_storage)),
//! );
//! let kernel = KernelPageTable::build(&DirectPhysMapper, &alloc, &KernelLayout::qemu_virt(etext, trampoline));
//! unsafe { kernel.activate() }; // on every hart
//! ```
//!
//! ## Errors
//!
//! Exhaustion is reported as `Result`/`Option` and fully rolled back;
//! broken invariants (double free, remap, unmapping a hole) `panic!`.
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade: `debug` for initialization,
//! `trace` for borrowing and copy-on-write breaks, `warn` for rollbacks.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
mod free_list;
pub mod kvm;
pub mod phys_mapper;
pub mod refcount;
pub mod uaccess;
pub mod vmm;

pub use crate::frame_alloc::{BorrowOrder, FrameAllocConfig, PerCpuFrameAlloc};
pub use crate::kvm::{KernelLayout, KernelPageTable};
pub use crate::phys_mapper::DirectPhysMapper;
pub use crate::refcount::RefCountTable;
pub use crate::uaccess::CopyError;
pub use crate::vmm::{UserSpace, VmmError};
