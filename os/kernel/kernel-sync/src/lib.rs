//! # Kernel synchronization primitives
//!
//! - [`SpinLock`]: a short-section mutual exclusion lock.
//! - [`irq::Hart`] / [`irq::IrqGuard`]: the executing core and a guard that
//!   keeps interrupts off while its identity matters.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{Hart, IrqGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
