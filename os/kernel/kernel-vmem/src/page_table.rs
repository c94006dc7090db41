//! # Sv39 Page Table
//!
//! - [`Level`]: which of the three table levels a walk is at.
//! - [`TableIndex`]: 9-bit index into one table, derived from a virtual address.
//! - [`PageTable`]: one 4 KiB-aligned frame of 512 [`PageTableEntry`]s.

use crate::page_entry_bits::PageTableEntry;
use kernel_info::memory::PTES_PER_TABLE;
use kernel_memory_addresses::VirtualAddress;

/// Page-table level, counted from the leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// Leaf tables; entries map 4 KiB pages (VA bits `[20:12]`).
    L0 = 0,
    /// Middle tables (VA bits `[29:21]`).
    L1 = 1,
    /// The root table (VA bits `[38:30]`).
    L2 = 2,
}

impl Level {
    /// Bit position of this level's index within a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * self as u32
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` at the leaf level.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L2 => Some(Self::L1),
            Self::L1 => Some(Self::L0),
            Self::L0 => None,
        }
    }

    /// Index into a table at this level for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1ff) as u16)
    }
}

/// Index into a [`PageTable`]; range is `0..512`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < PTES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One page-table frame: 512 entries, 4 KiB-aligned.
#[doc(alias = "pagetable_t")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PTES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A table with every entry invalid.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); PTES_PER_TABLE],
        }
    }

    /// Invalidate every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn get_mut(&mut self, i: TableIndex) -> &mut PageTableEntry {
        &mut self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// `true` if no entry is valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.valid())
    }

    /// Entries with their indices.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (TableIndex::new(i as u16), *e))
    }
}
