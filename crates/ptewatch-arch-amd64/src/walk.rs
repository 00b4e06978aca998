use ptewatch_core::{AccessError, AddressRange, PAGE_SIZE, Pa, Pfn, Va};
use smallvec::SmallVec;

use crate::{PageTableEntry, PageTableLevel};

/// Source of translation table entries.
///
/// Implemented by whatever gives access to the physical memory holding the
/// target's page tables.
pub trait TableReader {
    /// Reads the entry stored at the physical address `pa`.
    fn read_entry(&self, pa: Pa) -> Result<PageTableEntry, AccessError>;
}

/// Returns the physical address of the entry translating `va` in the table
/// at `table`.
pub fn entry_address(table: Pfn, level: PageTableLevel, va: Va) -> Pa {
    table.pa() + level.index(va) * size_of::<PageTableEntry>() as u64
}

/// A single entry in the page table hierarchy during virtual address
/// translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The level of the page table hierarchy this entry belongs to.
    pub level: PageTableLevel,

    /// The entry itself.
    pub entry: PageTableEntry,

    /// The physical address where this entry is located in memory.
    pub entry_address: Pa,
}

/// Collection of translation entries visited by one descent.
pub type TranslationEntries = SmallVec<[TranslationEntry; 4]>;

/// Descends from `root` to the entries translating `va`.
///
/// The descent stops at the first entry that is not present or maps a large
/// page; the returned path ends with that entry.
pub fn translation(
    reader: &impl TableReader,
    root: Pfn,
    va: Va,
) -> Result<TranslationEntries, AccessError> {
    let mut entries = TranslationEntries::new();
    let mut table = root;

    for level in PageTableLevel::DESCENT {
        let entry_address = entry_address(table, level, va);
        let entry = reader.read_entry(entry_address)?;

        entries.push(TranslationEntry {
            level,
            entry,
            entry_address,
        });

        if !entry.present() || entry.large() {
            break;
        }

        table = entry.pfn();
    }

    Ok(entries)
}

/// Handle to a present lowest-level entry mapping one 4KB page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    /// Base virtual address of the page.
    pub va: Va,

    /// The entry value at the time of the walk.
    pub entry: PageTableEntry,

    /// The physical address where the entry is stored.
    pub entry_address: Pa,
}

impl LeafEntry {
    /// Checks if the hardware marked the page as accessed.
    pub fn accessed(&self) -> bool {
        self.entry.accessed()
    }

    /// Returns the entry value with the accessed flag reset.
    pub fn with_accessed_cleared(&self) -> PageTableEntry {
        self.entry.with_accessed_cleared()
    }

    /// Returns the physical frame backing the page.
    pub fn pfn(&self) -> Pfn {
        self.entry.pfn()
    }
}

/// Iterator over the present leaf entries of a virtual address range.
///
/// Each step is an independent descent from the root. An intermediate entry
/// that is absent or maps a large page means nothing is walkable below it;
/// the walk jumps to the next boundary of that level without reporting an
/// error. A failing table read is reported once and ends the walk.
pub struct PageWalk<'a, R>
where
    R: TableReader,
{
    reader: &'a R,
    root: Pfn,
    cursor: Va,
    end: Va,
}

impl<'a, R> PageWalk<'a, R>
where
    R: TableReader,
{
    /// Creates a walk over `range` of the hierarchy rooted at `root`.
    pub fn new(reader: &'a R, root: Pfn, range: AddressRange) -> Self {
        Self {
            reader,
            root,
            cursor: range.start(),
            end: range.end(),
        }
    }

    fn descend(&self, va: Va) -> Result<Result<LeafEntry, Va>, AccessError> {
        let mut table = self.root;

        for level in [
            PageTableLevel::Pml4,
            PageTableLevel::Pdpt,
            PageTableLevel::Pd,
        ] {
            let entry = self.reader.read_entry(entry_address(table, level, va))?;

            if !entry.present() {
                return Ok(Err(level.next_boundary(va)));
            }

            if entry.large() {
                tracing::trace!(%va, ?level, "large or malformed entry, skipping");
                return Ok(Err(level.next_boundary(va)));
            }

            table = entry.pfn();
        }

        let entry_address = entry_address(table, PageTableLevel::Pt, va);
        let entry = self.reader.read_entry(entry_address)?;

        if !entry.present() {
            return Ok(Err(PageTableLevel::Pt.next_boundary(va)));
        }

        Ok(Ok(LeafEntry {
            va,
            entry,
            entry_address,
        }))
    }
}

impl<R> Iterator for PageWalk<'_, R>
where
    R: TableReader,
{
    type Item = Result<LeafEntry, AccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.end {
            let va = self.cursor;

            match self.descend(va) {
                Ok(Ok(leaf)) => {
                    self.cursor = Va(va.0.saturating_add(PAGE_SIZE));
                    return Some(Ok(leaf));
                }
                Ok(Err(next)) => self.cursor = next,
                Err(err) => {
                    self.cursor = self.end;
                    return Some(Err(err));
                }
            }
        }

        None
    }
}
