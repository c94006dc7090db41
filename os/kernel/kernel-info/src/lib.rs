//! # Kernel Memory Layout
//!
//! Compile-time description of the machine the kernel runs on: the physical
//! memory map of the QEMU `virt` board and the Sv39 virtual layout shared by
//! the kernel page table and every user address space.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │        (unused / ROM)           │
//! PLIC        ├─────────────────────────────────┤ 0x0c00_0000
//!             │  Interrupt controller (4 MiB)   │
//! UART0       ├─────────────────────────────────┤ 0x1000_0000
//! VIRTIO0     ├─────────────────────────────────┤ 0x1000_1000
//!             │             ...                 │
//! KERNBASE    ├─────────────────────────────────┤ 0x8000_0000
//!             │   Kernel text (RX), data (RW)   │
//!  end        ├─────────────────────────────────┤
//!             │   Frames managed by allocator   │
//! PHYSTOP     └─────────────────────────────────┘ 0x8800_0000
//! ```
//!
//! The kernel direct-maps everything in this picture (virtual == physical).
//!
//! ## Virtual Layout (top of every address space)
//!
//! ```text
//! MAXVA       ┌─────────────────────────────────┐ 1 << 38
//! TRAMPOLINE  ├─────────────────────────────────┤ MAXVA - 4 KiB (shared, R|X)
//! TRAPFRAME   ├─────────────────────────────────┤ user spaces only
//! kstack(0)   ├─────────────────────────────────┤ kernel table only,
//!             │  stack / guard / stack / ...    │ one slot per process
//!             └─────────────────────────────────┘
//! ```
//!
//! Sv39 can translate 39 bits, but `MAXVA` is one bit lower so that the
//! topmost address never needs sign extension.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
