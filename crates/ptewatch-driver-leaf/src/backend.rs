use std::time::Duration;

use ptewatch_arch_amd64::PageWalk;
use ptewatch_core::{
    AccessError, AccessedPage, AddressRange, DEFAULT_SCAN_CAPACITY, PageTableAccess, Pfn, Pid,
    ScanResult,
};

use crate::TranslationHost;

/// Per-process accessed-bit backend.
///
/// Every request resolves the target, takes its region lock in read mode and
/// walks the translation tables of each mapped region intersecting the
/// requested range.
pub struct LeafFlagBackend<Host>
where
    Host: TranslationHost,
{
    host: Host,
    capacity: usize,
    lock_timeout: Duration,
}

impl<Host> LeafFlagBackend<Host>
where
    Host: TranslationHost,
{
    /// Default bound on waiting for an address space lock.
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

    /// Creates a new backend over `host`.
    pub fn new(host: Host) -> Self {
        Self {
            host,
            capacity: DEFAULT_SCAN_CAPACITY,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets the maximum number of entries returned by one scan.
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Sets the bound on waiting for an address space lock.
    pub fn with_lock_timeout(self, lock_timeout: Duration) -> Self {
        Self {
            lock_timeout,
            ..self
        }
    }

    /// Returns the host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    fn clear_regions(
        &self,
        root: Pfn,
        regions: impl Iterator<Item = AddressRange>,
        cleared: &mut usize,
    ) -> Result<(), AccessError> {
        for region in regions {
            for leaf in PageWalk::new(&self.host, root, region) {
                let leaf = leaf?;

                // Not atomic with respect to the target; a concurrent access
                // between the read and the write is lost.
                if leaf.accessed() {
                    self.host
                        .write_entry(leaf.entry_address, leaf.with_accessed_cleared())?;
                    *cleared += 1;
                }
            }
        }

        Ok(())
    }
}

impl<Host> PageTableAccess for LeafFlagBackend<Host>
where
    Host: TranslationHost,
{
    fn clear(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError> {
        let space = self.host.address_space(pid)?;
        let regions = space.read_regions(self.lock_timeout)?;

        if range.is_empty() {
            return Ok(());
        }

        let mut cleared = 0usize;
        let walked = self.clear_regions(space.root(), regions.intersecting(range), &mut cleared);

        // Entries written before a failure must not stay cached.
        if walked.is_ok() || cleared > 0 {
            self.host.flush_tlb(&space, range);
        }

        walked?;

        tracing::trace!(%pid, %range, cleared, "accessed bits cleared");
        Ok(())
    }

    fn scan(&self, pid: Pid, range: AddressRange) -> Result<ScanResult, AccessError> {
        let space = self.host.address_space(pid)?;
        let regions = space.read_regions(self.lock_timeout)?;

        let mut result = ScanResult::with_capacity(self.capacity);

        'regions: for region in regions.intersecting(range) {
            for leaf in PageWalk::new(&self.host, space.root(), region) {
                let leaf = leaf?;

                if leaf.accessed() && !result.push(AccessedPage::new(leaf.va)) {
                    break 'regions;
                }
            }
        }

        tracing::trace!(%pid, %range, accessed = result.len(), "range scanned");
        Ok(result)
    }
}
