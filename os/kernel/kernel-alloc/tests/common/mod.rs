#![allow(dead_code)]

use kernel_alloc::frame_alloc::{FrameAllocConfig, PerCpuFrameAlloc};
use kernel_alloc::refcount::RefCountTable;
use kernel_info::memory::KERNBASE;
use kernel_sync::Hart;
use kernel_vmem::PhysMapper;
use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use std::cell::{Cell, UnsafeCell};

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; 4096]>);

/// Host-backed "RAM": frame `i` lives at physical `KERNBASE + i * 4096`.
pub struct TestRam {
    frames: Box<[Frame]>,
}

// Frames are only touched through `PhysMapper`, whose callers own them.
unsafe impl Sync for TestRam {}

impl TestRam {
    pub const BASE: u64 = KERNBASE;

    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames).map(|_| Frame(UnsafeCell::new([0; 4096]))).collect(),
        }
    }

    pub fn frame(&self, i: usize) -> PhysicalPage<Size4K> {
        PhysicalAddress::new(Self::BASE + i as u64 * 4096).page()
    }

    /// One past the last frame.
    pub fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(Self::BASE + self.frames.len() as u64 * 4096)
    }

    /// Snapshot of a frame's bytes.
    pub fn bytes(&self, frame: PhysicalPage<Size4K>) -> [u8; 4096] {
        unsafe { *self.phys_to_mut::<[u8; 4096]>(frame.base()) }
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let rel = pa.as_u64() - Self::BASE;
        let idx = usize::try_from(rel >> 12).unwrap();
        let off = usize::try_from(rel & 0xfff).unwrap();
        assert!(off + size_of::<T>() <= 4096, "access crosses frame end");
        unsafe { &mut *self.frames[idx].0.get().cast::<u8>().add(off).cast::<T>() }
    }
}

thread_local! {
    static HART_ID: Cell<usize> = const { Cell::new(0) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(true) };
    static DISABLES: Cell<usize> = const { Cell::new(0) };
}

/// Each test thread pretends to be one hart.
pub struct TestHart;

impl TestHart {
    /// Run the calling thread as hart `id`.
    pub fn become_hart(id: usize) {
        HART_ID.with(|h| h.set(id));
    }

    /// How often the calling thread has switched interrupts off.
    pub fn disables() -> usize {
        DISABLES.with(Cell::get)
    }
}

impl Hart for TestHart {
    fn id(&self) -> usize {
        assert!(
            !INTERRUPTS.with(Cell::get),
            "hart id read with interrupts enabled"
        );
        HART_ID.with(Cell::get)
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS.with(Cell::get)
    }

    fn disable_interrupts(&self) {
        DISABLES.with(|d| d.set(d.get() + 1));
        INTERRUPTS.with(|i| i.set(false));
    }

    fn enable_interrupts(&self) {
        INTERRUPTS.with(|i| i.set(true));
    }
}

pub type TestAlloc<'m> = PerCpuFrameAlloc<'m, TestRam, TestHart>;

pub static HART: TestHart = TestHart;

/// Allocator over `ram`, with the first `reserved` frames standing in for
/// the kernel image.
pub fn allocator<'m>(
    ram: &'m TestRam,
    reserved: usize,
    config: FrameAllocConfig,
    refs: Option<RefCountTable<'m>>,
) -> TestAlloc<'m> {
    PerCpuFrameAlloc::init(
        ram,
        &HART,
        ram.frame(reserved).base(),
        ram.end(),
        config,
        refs,
    )
}
