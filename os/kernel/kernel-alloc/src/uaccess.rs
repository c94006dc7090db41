//! # Copying Between Kernel and User Memory
//!
//! The kernel never dereferences user addresses directly. Each transfer is
//! split at page boundaries; every page is translated through the user
//! table and touched through its physical frame.
//!
//! Only pages mapped with `U` are reachable, so a user pointer can never be
//! used to read or write kernel-only mappings such as the trampoline or a
//! stack guard page.

use crate::vmm::{UserSpace, VmmError};
use kernel_info::memory::{MAXVA, PAGE_SIZE};
use kernel_vmem::addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{EntryKind, FrameAlloc, PhysMapper, PteFlags, frame_bytes};

#[allow(clippy::cast_possible_truncation)]
const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Why a user copy failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CopyError {
    /// No user-accessible page at `va`.
    #[error("bad user address {va}")]
    BadAddress { va: VirtualAddress },
    /// No NUL within the first `max` bytes.
    #[error("string not terminated within {max} bytes")]
    Unterminated { max: usize },
    /// A shared page could not be made private.
    #[error("out of memory")]
    OutOfMemory,
}

impl<M: PhysMapper, A: FrameAlloc + ?Sized> UserSpace<'_, M, A> {
    /// Copy `src` to user address `dst`.
    ///
    /// Any user page may be written, as the kernel acts on the user's
    /// behalf. Pages shared with another space (copy-on-write or not) are
    /// made private first.
    ///
    /// # Errors
    /// - [`CopyError::BadAddress`] for the first page without a user
    ///   mapping; earlier pages have already been written.
    /// - [`CopyError::OutOfMemory`] if a shared page could not be copied.
    pub fn copy_out(&self, dst: VirtualAddress, src: &[u8]) -> Result<(), CopyError> {
        let mapper = self.address_space().mapper();
        let mut dst = dst;
        let mut src = src;
        while !src.is_empty() {
            let (page, offset) = dst.split::<Size4K>();
            let frame = self.writable_frame(dst)?;
            let offset = offset.as_usize();
            let n = src.len().min(PAGE_BYTES - offset);
            let bytes = unsafe { frame_bytes(mapper, frame) };
            bytes[offset..offset + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            dst = page.base() + PAGE_SIZE;
        }
        Ok(())
    }

    /// Fill `dst` from user address `src`.
    ///
    /// # Errors
    /// [`CopyError::BadAddress`] for the first page without a user mapping.
    pub fn copy_in(&self, dst: &mut [u8], src: VirtualAddress) -> Result<(), CopyError> {
        let mapper = self.address_space().mapper();
        let mut src = src;
        let mut done = 0;
        while done < dst.len() {
            let (page, offset) = src.split::<Size4K>();
            let frame = self
                .translate(page.base())
                .ok_or(CopyError::BadAddress { va: src })?;
            let offset = offset.as_usize();
            let n = (dst.len() - done).min(PAGE_BYTES - offset);
            let bytes = unsafe { frame_bytes(mapper, frame) };
            dst[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
            done += n;
            src = page.base() + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from user address `src` into `dst`,
    /// reading at most `max` bytes (and never more than `dst.len()`).
    ///
    /// On success `dst` holds the string including its NUL; the returned
    /// length excludes it.
    ///
    /// # Errors
    /// - [`CopyError::Unterminated`] if no NUL was found within the limit.
    /// - [`CopyError::BadAddress`] if the string runs into an unmapped page
    ///   first.
    pub fn copy_in_string(
        &self,
        dst: &mut [u8],
        src: VirtualAddress,
        max: usize,
    ) -> Result<usize, CopyError> {
        let mapper = self.address_space().mapper();
        let max = max.min(dst.len());
        let mut src = src;
        let mut copied = 0;
        while copied < max {
            let (page, offset) = src.split::<Size4K>();
            let frame = self
                .translate(page.base())
                .ok_or(CopyError::BadAddress { va: src })?;
            let offset = offset.as_usize();
            let n = (max - copied).min(PAGE_BYTES - offset);
            let bytes = unsafe { frame_bytes(mapper, frame) };
            for &b in &bytes[offset..offset + n] {
                dst[copied] = b;
                if b == 0 {
                    return Ok(copied);
                }
                copied += 1;
            }
            src = page.base() + PAGE_SIZE;
        }
        Err(CopyError::Unterminated { max })
    }

    /// Frame behind the user page at `va`, private to this space.
    fn writable_frame(&self, va: VirtualAddress) -> Result<PhysicalPage<Size4K>, CopyError> {
        if va.as_u64() >= MAXVA {
            return Err(CopyError::BadAddress { va });
        }
        let Some(pte) = self.address_space().walk(va) else {
            return Err(CopyError::BadAddress { va });
        };
        let EntryKind::Leaf(frame, flags) = pte.kind() else {
            return Err(CopyError::BadAddress { va });
        };
        if !flags.contains(PteFlags::U) {
            return Err(CopyError::BadAddress { va });
        }
        if flags.contains(PteFlags::COW) {
            self.resolve_cow_fault(va).map_err(|e| match e {
                VmmError::OutOfMemory => CopyError::OutOfMemory,
                _ => CopyError::BadAddress { va },
            })?;
            return self.translate(va).ok_or(CopyError::BadAddress { va });
        }
        self.unshare(pte, frame, flags).map_err(|_| CopyError::OutOfMemory)
    }
}
