use std::{
    fs::File,
    os::unix::fs::FileExt as _,
    path::{Path, PathBuf},
};

use ptewatch_core::{AddressRange, PAGE_SIZE, Pfn, Pid, Va};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// An entry of `/proc/<pid>/pagemap`.
///
/// See `Documentation/admin-guide/mm/pagemap.rst`.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PagemapEntry(pub u64);

impl PagemapEntry {
    const PRESENT: u64 = 1 << 63;
    const SWAPPED: u64 = 1 << 62;
    const PFN_MASK: u64 = (1 << 55) - 1;

    /// Checks if the page is resident in physical memory.
    pub fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Checks if the page is swapped out.
    pub fn swapped(self) -> bool {
        self.0 & Self::SWAPPED != 0
    }

    /// Returns the physical frame of a present page.
    ///
    /// Zero when the reader lacks `CAP_SYS_ADMIN`.
    pub fn pfn(self) -> Pfn {
        Pfn(self.0 & Self::PFN_MASK)
    }
}

impl std::fmt::Debug for PagemapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PagemapEntry")
            .field("present", &self.present())
            .field("swapped", &self.swapped())
            .field("pfn", &self.pfn())
            .finish()
    }
}

/// Open handle to the virtual-to-physical map of a process.
pub struct Pagemap {
    file: File,
    path: PathBuf,
}

impl Pagemap {
    /// Size of one entry in bytes.
    pub const ENTRY_SIZE: u64 = size_of::<PagemapEntry>() as u64;

    /// Opens `<proc_root>/<pid>/pagemap`.
    pub fn open(proc_root: &Path, pid: Pid) -> std::io::Result<Self> {
        let path = proc_root.join(pid.to_string()).join("pagemap");
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }

    /// Returns the path of the opened file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the entries of every page of `range`, in address order.
    ///
    /// Entries are read [`CHUNK_ENTRIES`] at a time, so memory use does not
    /// depend on the size of the range. Iteration ends after the first
    /// failed read.
    pub fn entries(&self, range: AddressRange) -> PagemapEntries<'_> {
        PagemapEntries {
            pagemap: self,
            next: range.start(),
            end: range.end(),
            chunk: [PagemapEntry::default(); CHUNK_ENTRIES],
            filled: 0,
            index: 0,
        }
    }
}

/// Number of entries fetched by one read.
pub const CHUNK_ENTRIES: usize = 512;

/// Iterator over the entries of a range, see [`Pagemap::entries`].
pub struct PagemapEntries<'a> {
    pagemap: &'a Pagemap,
    next: Va,
    end: Va,
    chunk: [PagemapEntry; CHUNK_ENTRIES],
    filled: usize,
    index: usize,
}

impl PagemapEntries<'_> {
    fn refill(&mut self) -> std::io::Result<()> {
        let pages = ((self.end.0 - self.next.0) / PAGE_SIZE).min(CHUNK_ENTRIES as u64) as usize;
        let offset = self.next.0 / PAGE_SIZE * Pagemap::ENTRY_SIZE;

        self.pagemap
            .file
            .read_exact_at(self.chunk[..pages].as_mut_bytes(), offset)?;

        self.filled = pages;
        self.index = 0;
        Ok(())
    }
}

impl Iterator for PagemapEntries<'_> {
    type Item = std::io::Result<(Va, PagemapEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }

        if self.index == self.filled
            && let Err(err) = self.refill()
        {
            self.next = self.end;
            return Some(Err(err));
        }

        let entry = self.chunk[self.index];
        let va = self.next;

        self.index += 1;
        self.next += PAGE_SIZE;
        Some(Ok((va, entry)))
    }
}
