use ptewatch_core::{PAGE_SHIFT, Pfn, Va};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table (PT) - the lowest level, pointing directly to 4KB pages.
    Pt,

    /// Page Directory (PD) - can point to PTs or 2MB large pages.
    Pd,

    /// Page Directory Pointer Table (PDPT) - can point to PDs or 1GB large
    /// pages.
    Pdpt,

    /// Page Map Level 4 (PML4) - the highest level in 4-level paging.
    Pml4,
}

impl PageTableLevel {
    /// Levels visited by a descent, root first.
    pub const DESCENT: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Returns the bit position of the lowest address bit indexing this
    /// level.
    pub fn shift(self) -> u64 {
        match self {
            Self::Pt => PAGE_SHIFT,
            Self::Pd => 21,
            Self::Pdpt => 30,
            Self::Pml4 => 39,
        }
    }

    /// Returns the number of bytes of address space covered by one entry
    /// at this level.
    pub fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Returns the index of the entry translating `va` at this level.
    pub fn index(self, va: Va) -> u64 {
        (va.0 >> self.shift()) & 0x1ff
    }

    /// Returns the first address covered by the entry following the one
    /// that translates `va`.
    ///
    /// Saturates at the top of the address space.
    pub fn next_boundary(self, va: Va) -> Va {
        Va((va.0 | (self.span() - 1)).saturating_add(1))
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const PRESENT: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const ACCESSED: u64 = 1 << 5;
    const DIRTY: u64 = 1 << 6;
    const LARGE: u64 = 1 << 7;

    const PFN_BITS: u64 = 40;
    const PFN_MASK: u64 = ((1 << Self::PFN_BITS) - 1) << PAGE_SHIFT;

    /// Creates a present, writable user entry pointing at `pfn`.
    pub fn table(pfn: Pfn) -> Self {
        Self(((pfn.0 << PAGE_SHIFT) & Self::PFN_MASK) | Self::PRESENT | Self::WRITE | Self::USER)
    }

    /// Checks if the entry is entirely zero (never populated).
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        self.0 & Self::USER != 0
    }

    /// Checks if the page has been accessed.
    pub fn accessed(self) -> bool {
        self.0 & Self::ACCESSED != 0
    }

    /// Checks if the page has been written to.
    pub fn dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    /// Checks if this entry refers to a large page.
    pub fn large(self) -> bool {
        self.0 & Self::LARGE != 0
    }

    /// Returns a copy of the entry with the accessed flag set.
    pub fn with_accessed(self) -> Self {
        Self(self.0 | Self::ACCESSED)
    }

    /// Returns a copy of the entry with the accessed flag cleared.
    pub fn with_accessed_cleared(self) -> Self {
        Self(self.0 & !Self::ACCESSED)
    }

    /// Returns a copy of the entry with the large page flag set.
    pub fn with_large(self) -> Self {
        Self(self.0 | Self::LARGE)
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Pfn {
        Pfn((self.0 & Self::PFN_MASK) >> PAGE_SHIFT)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("pfn", &self.pfn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessed_flag_round_trip() {
        let entry = PageTableEntry::table(Pfn(0x1234));
        assert!(entry.present());
        assert!(!entry.accessed());

        let touched = entry.with_accessed();
        assert!(touched.accessed());
        assert_eq!(touched.pfn(), Pfn(0x1234));
        assert_eq!(touched.with_accessed_cleared(), entry);
    }

    #[test]
    fn level_indices() {
        let va = Va(0x0000_7f12_3456_7000);
        assert_eq!(PageTableLevel::Pml4.index(va), 0xfe);
        assert_eq!(PageTableLevel::Pdpt.index(va), 0x48);
        assert_eq!(PageTableLevel::Pd.index(va), 0x1a2);
        assert_eq!(PageTableLevel::Pt.index(va), 0x167);
    }

    #[test]
    fn next_boundary() {
        assert_eq!(PageTableLevel::Pt.next_boundary(Va(0x1234)), Va(0x2000));
        assert_eq!(PageTableLevel::Pd.next_boundary(Va(0x1234)), Va(0x20_0000));
        assert_eq!(PageTableLevel::Pml4.next_boundary(Va(u64::MAX)), Va(u64::MAX));
    }
}
