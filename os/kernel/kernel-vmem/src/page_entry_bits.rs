use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

bitflags::bitflags! {
    /// Permission and status bits of an Sv39 page-table entry (bits 0..=9).
    ///
    /// Callers of the mapping functions pass combinations of `R`, `W`, `X`
    /// and `U`; `V` is added by the mapping code itself.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u16 {
        /// Entry is valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible from user mode.
        const U = 1 << 4;
        /// Global mapping.
        const G = 1 << 5;
        /// Accessed (set by hardware or software).
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
        /// Software: frame is shared copy-on-write; `W` was dropped on purpose.
        const COW = 1 << 8;
        /// Software: unused.
        const RSW1 = 1 << 9;
    }
}

impl PteFlags {
    /// Any of these makes a valid entry a leaf.
    pub const ACCESS: Self = Self::R.union(Self::W).union(Self::X);
}

/// A single Sv39 page-table entry.
///
/// ### Bit layout
///
/// | Bits   | Name | Meaning |
/// |--------|------|---------|
/// | 0      | `V`  | Valid |
/// | 1..=3  | `R W X` | Access permissions; all clear means "points to next table" |
/// | 4      | `U`  | User accessible |
/// | 5      | `G`  | Global |
/// | 6, 7   | `A D`| Accessed, dirty |
/// | 8, 9   | RSW  | Software; bit 8 marks copy-on-write |
/// | 10..=53| PPN  | Physical page number |
/// | 54..=63| –    | Reserved, zero |
///
/// Whether a valid entry is a leaf or a link to the next level is derived
/// from the permission bits only (see [`EntryKind`]); there is no separate
/// node type, so the encoding stays bit-compatible with the hardware walker.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub valid: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub copy_on_write: bool,
    #[bits(1)]
    __rsw1: u8,

    /// Physical page number of the target frame.
    #[bits(44)]
    ppn: u64,

    #[bits(10)]
    __reserved: u16,
}

/// What a [`PageTableEntry`] means, decoded from its `V`/`R`/`W`/`X` bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// `V` clear.
    Invalid,
    /// `V` set, no access bits: link to the next-level table.
    Table(PhysicalPage<Size4K>),
    /// `V` set with at least one of `R`/`W`/`X`: translation to a data frame.
    Leaf(PhysicalPage<Size4K>, PteFlags),
}

impl PageTableEntry {
    /// Mask of the flag bits within the raw entry.
    const FLAG_MASK: u64 = 0x3ff;

    /// Link to a next-level table (valid, no permissions).
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalPage<Size4K>) -> Self {
        Self::new().with_valid(true).with_ppn(frame.ppn())
    }

    /// Leaf translation to `frame` with `flags` (`V` is implied).
    ///
    /// Debug-asserts that `flags` carries an access permission; without one the
    /// entry would decode as a table link.
    #[inline]
    #[must_use]
    pub fn leaf(frame: PhysicalPage<Size4K>, flags: PteFlags) -> Self {
        debug_assert!(flags.intersects(PteFlags::ACCESS), "leaf without R/W/X");
        Self::new()
            .with_ppn(frame.ppn())
            .with_flags(flags | PteFlags::V)
    }

    /// Target frame, regardless of validity.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_ppn(self.ppn())
    }

    /// Flag bits 0..=9.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate((self.into_bits() & Self::FLAG_MASK) as u16)
    }

    /// Replace flag bits 0..=9, keeping the frame.
    #[inline]
    #[must_use]
    pub const fn with_flags(self, flags: PteFlags) -> Self {
        Self::from_bits((self.into_bits() & !Self::FLAG_MASK) | flags.bits() as u64)
    }

    /// Valid with at least one access permission.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.valid() && self.flags().intersects(PteFlags::ACCESS)
    }

    /// Valid without access permissions.
    #[inline]
    #[must_use]
    pub const fn is_table(self) -> bool {
        self.valid() && !self.flags().intersects(PteFlags::ACCESS)
    }

    #[inline]
    #[must_use]
    pub const fn kind(self) -> EntryKind {
        if !self.valid() {
            EntryKind::Invalid
        } else if self.is_leaf() {
            EntryKind::Leaf(self.frame(), self.flags())
        } else {
            EntryKind::Table(self.frame())
        }
    }
}
