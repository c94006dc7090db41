//! Per-hart interrupt state.
//!
//! Code that needs to know *which* core it runs on (to pick a per-core lock,
//! for example) must read the core id with interrupts disabled; otherwise a
//! timer interrupt could reschedule the thread onto another hart between the
//! read and the use. [`IrqGuard`] provides that window.

/// The executing hart, as seen by kernel code.
///
/// The kernel uses [`RiscvHart`] on hardware; tests supply their own
/// implementation so ordinary threads can pose as cores.
pub trait Hart {
    /// Index of the executing hart.
    ///
    /// Only stable while interrupts are disabled.
    fn id(&self) -> usize;

    /// Whether device interrupts are currently enabled on this hart.
    fn interrupts_enabled(&self) -> bool;

    /// Disable device interrupts on this hart.
    fn disable_interrupts(&self);

    /// Enable device interrupts on this hart.
    fn enable_interrupts(&self);
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Guards nest: each one snapshots the state it found and only re-enables
/// interrupts if they were enabled when it was created, so the outermost
/// guard decides.
///
/// ```
/// use core::cell::Cell;
/// use kernel_sync::irq::{Hart, IrqGuard};
///
/// struct Fake(Cell<bool>);
/// impl Hart for Fake {
///     fn id(&self) -> usize { 0 }
///     fn interrupts_enabled(&self) -> bool { self.0.get() }
///     fn disable_interrupts(&self) { self.0.set(false) }
///     fn enable_interrupts(&self) { self.0.set(true) }
/// }
///
/// let hart = Fake(Cell::new(true));
/// {
///     let _outer = IrqGuard::new(&hart);
///     {
///         let _inner = IrqGuard::new(&hart);
///     }
///     assert!(!hart.interrupts_enabled());
/// }
/// assert!(hart.interrupts_enabled());
/// ```
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard<'h, H: Hart + ?Sized> {
    hart: &'h H,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'h, H: Hart + ?Sized> IrqGuard<'h, H> {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    pub fn new(hart: &'h H) -> Self {
        let were_enabled = hart.interrupts_enabled();
        if were_enabled {
            hart.disable_interrupts();
        }
        Self { hart, were_enabled }
    }

    /// The executing hart's id, stable for the guard's lifetime.
    #[inline]
    #[must_use]
    pub fn hart_id(&self) -> usize {
        self.hart.id()
    }
}

impl<H: Hart + ?Sized> Drop for IrqGuard<'_, H> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.hart.enable_interrupts();
        }
    }
}

/// The hart executing the kernel on RISC-V.
///
/// Assumes the boot code stores `mhartid` in `tp` and that kernel code never
/// clobbers it.
#[cfg(target_arch = "riscv64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RiscvHart;

#[cfg(target_arch = "riscv64")]
impl RiscvHart {
    /// Supervisor interrupt enable bit in `sstatus`.
    const SSTATUS_SIE: usize = 1 << 1;
}

#[cfg(target_arch = "riscv64")]
impl Hart for RiscvHart {
    #[inline]
    fn id(&self) -> usize {
        let tp: usize;
        unsafe { core::arch::asm!("mv {}, tp", out(reg) tp, options(nomem, nostack, preserves_flags)) }
        tp
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        let sstatus: usize;
        unsafe { core::arch::asm!("csrr {}, sstatus", out(reg) sstatus, options(nomem, nostack)) }
        sstatus & Self::SSTATUS_SIE != 0
    }

    #[inline]
    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("csrc sstatus, {}", in(reg) Self::SSTATUS_SIE, options(nostack)) }
    }

    #[inline]
    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("csrs sstatus, {}", in(reg) Self::SSTATUS_SIE, options(nostack)) }
    }
}
