use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::PAGE_SHIFT;

/// Number of entries in one page table page.
pub const PTES_PER_TABLE: u64 = 512;

/// Mask selecting the canonical 36 bits of a linear page number under
/// 4-level paging (48-bit linear addresses).
pub const LPN_CANONICAL_MASK: u64 = (1 << 36) - 1;

/// The levels in the 4-level page table hierarchy, numbered the way the
/// patch engine counts them: level 1 is the leaf table, level 4 the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum PageTableLevel {
    /// Page Table - the leaf level, pointing directly to 4KB pages.
    L1 = 1,

    /// Page Directory.
    L2 = 2,

    /// Page Directory Pointer Table.
    L3 = 3,

    /// Page Map Level 4 - the root under 4-level paging.
    L4 = 4,
}

impl PageTableLevel {
    /// Returns the next lower level, or `None` at the leaf.
    pub fn down(self) -> Option<Self> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
            Self::L4 => Some(Self::L3),
        }
    }

    /// All levels from the root down to the leaf.
    pub const TOP_DOWN: [PageTableLevel; 4] = [Self::L4, Self::L3, Self::L2, Self::L1];

    /// Constructs a level from its numeric value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            3 => Some(Self::L3),
            4 => Some(Self::L4),
            _ => None,
        }
    }
}

bitflags! {
    /// Flag bits of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Present.
        const PRESENT = 1 << 0;
        /// Writeable.
        const RW = 1 << 1;
        /// User accessible.
        const US = 1 << 2;
        /// Accessed.
        const ACCESSED = 1 << 5;
        /// Dirty.
        const DIRTY = 1 << 6;
        /// Large page (PS), at levels 2 and 3.
        const LARGE = 1 << 7;
        /// Global, at the leaf level.
        const GLOBAL = 1 << 8;
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Mask selecting the page-frame address bits.
    pub const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Builds an entry mapping the given machine page number with the given
    /// flags.
    pub fn new(mpn: u64, flags: PteFlags) -> Self {
        Self((mpn << PAGE_SHIFT) | flags.bits())
    }

    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Checks if the entry maps a large page.
    pub fn large(self) -> bool {
        self.0 & PteFlags::LARGE.bits() != 0
    }

    /// Extracts the machine page number.
    pub fn pfn(self) -> u64 {
        (self.0 & Self::PFN_MASK) >> PAGE_SHIFT
    }

    /// Extracts the machine address of the page this entry points to.
    pub fn table_address(self) -> u64 {
        self.0 & Self::PFN_MASK
    }

    /// Returns the flag bits of the entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("large", &self.large())
            .field("pfn", &format_args!("0x{:x}", self.pfn()))
            .finish()
    }
}

/// Index of the PTE at `level` when translating `lpn`, taken over the full
/// hierarchy: the 36 canonical LPN bits shifted so that the 9-bit table
/// index of `level` lands at the bottom, with all higher-level indices
/// still above it.
///
/// Two LPNs share a page table at `level` exactly when their global indices
/// at `level + 1` match; the patch table is deduplicated on this value.
pub fn pte_global_index(lpn: u64, level: PageTableLevel) -> u64 {
    (lpn & LPN_CANONICAL_MASK) >> ((level as u64 - 1) * 9)
}

/// Index of the PTE within its page table at `level` when translating
/// `lpn`.
pub fn pte_index(lpn: u64, level: PageTableLevel) -> u64 {
    pte_global_index(lpn, level) & (PTES_PER_TABLE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_index_nests() {
        let lpn = 0xFFFF_FFFF_FCA00u64 & LPN_CANONICAL_MASK;
        for level in [PageTableLevel::L4, PageTableLevel::L3, PageTableLevel::L2] {
            let down = level.down().unwrap();
            assert_eq!(pte_global_index(lpn, down) >> 9, pte_global_index(lpn, level));
        }
    }

    #[test]
    fn table_index_is_nine_bits() {
        for level in PageTableLevel::TOP_DOWN {
            assert!(pte_index(u64::MAX, level) < PTES_PER_TABLE);
        }
    }

    #[test]
    fn entry_round_trip() {
        let pte = PageTableEntry::new(0x1234, PteFlags::PRESENT | PteFlags::RW);
        assert!(pte.present());
        assert_eq!(pte.pfn(), 0x1234);
        assert_eq!(pte.table_address(), 0x1234 << PAGE_SHIFT);
    }
}
