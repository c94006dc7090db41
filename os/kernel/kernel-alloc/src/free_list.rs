//! # Intrusive Frame List
//!
//! A LIFO stack of free 4 KiB frames that stores its links *inside* the
//! frames themselves: the first eight bytes of every listed frame hold the
//! physical address of the next one (`0` terminates the list).
//!
//! ```text
//! head ──► ┌──────────┐     ┌──────────┐     ┌──────────┐
//!          │ next ────┼────►│ next ────┼────►│ next = 0 │
//!          │ 01 01 .. │     │ 01 01 .. │     │ 01 01 .. │
//!          └──────────┘     └──────────┘     └──────────┘
//! ```
//!
//! The list is not synchronized; owners wrap it in a lock.

use kernel_vmem::PhysMapper;
use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Link word at the start of a free frame.
#[repr(C)]
struct FreeLink {
    next: u64,
}

/// Singly linked list of free frames.
#[derive(Debug, Default)]
pub struct FrameList {
    head: Option<PhysicalPage<Size4K>>,
    len: usize,
}

impl FrameList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of frames on the list.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Put `frame` on top of the list.
    ///
    /// # Safety
    /// - `frame` must be writable through `mapper` and owned by the caller:
    ///   not mapped, not referenced and not already listed.
    /// - `frame` must not be physical page zero.
    pub unsafe fn push<M: PhysMapper>(&mut self, mapper: &M, frame: PhysicalPage<Size4K>) {
        let link = unsafe { mapper.phys_to_mut::<FreeLink>(frame.base()) };
        link.next = self.head.map_or(0, |next| next.base().as_u64());
        self.head = Some(frame);
        self.len += 1;
    }

    /// Take the most recently pushed frame.
    pub fn pop<M: PhysMapper>(&mut self, mapper: &M) -> Option<PhysicalPage<Size4K>> {
        let frame = self.head?;
        // SAFETY: listed frames are owned by the list and start with a link.
        let next = unsafe { mapper.phys_to_mut::<FreeLink>(frame.base()) }.next;
        self.head = (next != 0).then(|| PhysicalAddress::new(next).page());
        self.len -= 1;
        Some(frame)
    }
}
