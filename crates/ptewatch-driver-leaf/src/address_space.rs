use std::{
    collections::BTreeMap,
    sync::{
        RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ptewatch_core::{AccessError, AddressRange, Pfn, Pid, Va};

/// Ordered index of the mapped regions of an address space.
///
/// Regions never overlap. Lookups of the regions intersecting a range cost
/// one tree search, independent of the size of unmapped gaps.
#[derive(Debug, Default)]
pub struct RegionIndex {
    regions: BTreeMap<Va, AddressRange>,
}

impl RegionIndex {
    /// Inserts a region.
    ///
    /// Overlapping regions are rejected.
    pub fn insert(&mut self, region: AddressRange) -> Result<(), AccessError> {
        if region.is_empty() {
            return Ok(());
        }

        if self.intersecting(region).next().is_some() {
            return Err(AccessError::InvalidArgument("region overlaps an existing mapping"));
        }

        self.regions.insert(region.start(), region);
        Ok(())
    }

    /// Removes the region starting at `start`.
    pub fn remove(&mut self, start: Va) -> Option<AddressRange> {
        self.regions.remove(&start)
    }

    /// Returns the number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Checks if there are no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns the parts of the mapped regions that fall inside `range`, in
    /// address order.
    pub fn intersecting(&self, range: AddressRange) -> impl Iterator<Item = AddressRange> + '_ {
        // The region containing `range.start()` may begin before it.
        let first = self
            .regions
            .range(..=range.start())
            .next_back()
            .map(|(&start, _)| start)
            .unwrap_or(range.start());

        self.regions
            .range(first..range.end())
            .filter_map(move |(_, region)| region.intersect(&range))
    }
}

/// The memory-management context of one target process.
///
/// Holds the root of the translation hierarchy and the mapped regions. The
/// region index is guarded by a reader-writer lock; walkers take it in read
/// mode with a bounded wait.
#[derive(Debug)]
pub struct AddressSpace {
    pid: Pid,
    root: Pfn,
    regions: RwLock<RegionIndex>,
    exiting: AtomicBool,
}

impl AddressSpace {
    /// Creates a new address space rooted at `root`.
    pub fn new(pid: Pid, root: Pfn) -> Self {
        Self {
            pid,
            root,
            regions: RwLock::new(RegionIndex::default()),
            exiting: AtomicBool::new(false),
        }
    }

    /// Returns the owning process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns the frame of the top-level table.
    pub fn root(&self) -> Pfn {
        self.root
    }

    /// Checks if the address space is being torn down.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Marks the address space as being torn down.
    ///
    /// Pending and future lock acquisitions fail with
    /// [`AccessError::InvalidState`].
    pub fn begin_exit(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    /// Acquires the region index in read mode, waiting at most `timeout`.
    pub fn read_regions(
        &self,
        timeout: Duration,
    ) -> Result<RwLockReadGuard<'_, RegionIndex>, AccessError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_exiting() {
                return Err(AccessError::InvalidState(self.pid));
            }

            match self.regions.try_read() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Poisoned(_)) => return Err(AccessError::InvalidState(self.pid)),
            }

            if Instant::now() >= deadline {
                tracing::warn!(pid = %self.pid, ?timeout, "address space lock not acquired");
                return Err(AccessError::InvalidState(self.pid));
            }

            std::thread::yield_now();
        }
    }

    /// Acquires the region index in write mode.
    pub fn write_regions(&self) -> Result<RwLockWriteGuard<'_, RegionIndex>, AccessError> {
        self.regions
            .write()
            .map_err(|_| AccessError::InvalidState(self.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(start, end).unwrap()
    }

    #[test]
    fn intersecting_clips_to_range() {
        let mut index = RegionIndex::default();
        index.insert(range(0x1000, 0x4000)).unwrap();
        index.insert(range(0x10000, 0x12000)).unwrap();
        index.insert(range(0x7f00_0000_0000, 0x7f00_0000_1000)).unwrap();

        let found = index.intersecting(range(0x3000, 0x11000)).collect::<Vec<_>>();
        assert_eq!(found, vec![range(0x3000, 0x4000), range(0x10000, 0x11000)]);

        assert_eq!(index.intersecting(range(0x5000, 0x9000)).count(), 0);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut index = RegionIndex::default();
        index.insert(range(0x1000, 0x4000)).unwrap();

        assert!(index.insert(range(0x3000, 0x5000)).is_err());
        assert!(index.insert(range(0x4000, 0x5000)).is_ok());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn exiting_space_refuses_readers() {
        let space = AddressSpace::new(Pid(7), Pfn(1));
        assert!(space.read_regions(Duration::from_millis(1)).is_ok());

        space.begin_exit();
        assert!(matches!(
            space.read_regions(Duration::from_millis(1)),
            Err(AccessError::InvalidState(Pid(7)))
        ));
    }

    #[test]
    fn contended_lock_times_out() {
        let space = AddressSpace::new(Pid(7), Pfn(1));
        let _writer = space.write_regions().unwrap();

        assert!(matches!(
            space.read_regions(Duration::from_millis(5)),
            Err(AccessError::InvalidState(_))
        ));
    }
}
