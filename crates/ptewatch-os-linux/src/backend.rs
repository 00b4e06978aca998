use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use ptewatch_core::{
    AccessError, AccessedPage, AddressRange, DEFAULT_SCAN_CAPACITY, PageTableAccess, Pid,
    ScanResult, Va,
};

use crate::{IDLE_BITMAP_PATH, IdleBitmap, IdleSnapshot, LinuxError, Pagemap, clip, read_maps};

/// First address above the user half of the address space.
///
/// Idle page tracking only covers user memory.
pub const USER_SPLIT: Va = Va(0x0000_8000_0000_0000);

/// Default procfs mount point.
pub const PROC_ROOT: &str = "/proc";

/// System-wide idle page backend.
///
/// Arming marks every physical frame idle; sampling snapshots the idle
/// bitmap and reports the pages of the target whose frames lost the idle
/// flag. Clearing is global: it affects every process on the system.
pub struct IdleFrameBackend {
    bitmap: IdleBitmap,
    proc_root: PathBuf,
    capacity: usize,
}

impl IdleFrameBackend {
    /// Creates a backend over the default bitmap and procfs locations.
    pub fn new() -> Result<Self, AccessError> {
        Self::with_paths(IDLE_BITMAP_PATH, PROC_ROOT)
    }

    /// Creates a backend over the given bitmap and procfs locations.
    ///
    /// Failure to open the bitmap is fatal.
    pub fn with_paths(
        bitmap: impl AsRef<Path>,
        proc_root: impl Into<PathBuf>,
    ) -> Result<Self, AccessError> {
        Ok(Self::with_bitmap(IdleBitmap::open(bitmap)?, proc_root))
    }

    /// Creates a backend over an already opened bitmap.
    pub fn with_bitmap(bitmap: IdleBitmap, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            bitmap,
            proc_root: proc_root.into(),
            capacity: DEFAULT_SCAN_CAPACITY,
        }
    }

    /// Sets the maximum number of entries returned by one scan.
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    fn ensure_exists(&self, pid: Pid) -> Result<(), AccessError> {
        match self.proc_root.join(pid.to_string()).try_exists() {
            Ok(true) => Ok(()),
            Ok(false) => Err(AccessError::NotFound(pid)),
            Err(err) => Err(AccessError::Io(err)),
        }
    }

    fn arm(&self, pid: Pid) -> Result<(), AccessError> {
        self.ensure_exists(pid)?;
        self.bitmap.set_all_idle()?;
        Ok(())
    }

    /// Scans `range` against an existing snapshot.
    pub fn scan_snapshot(
        &self,
        snapshot: &IdleSnapshot,
        pid: Pid,
        range: AddressRange,
    ) -> Result<ScanResult, AccessError> {
        let mut result = ScanResult::with_capacity(self.capacity);

        let user = AddressRange::covering(0u64, USER_SPLIT.0);
        let Some(range) = range.intersect(&user) else {
            return Ok(result);
        };

        let maps = read_maps(&self.proc_root, pid).map_err(|err| match err {
            LinuxError::Io(err) if err.kind() == ErrorKind::NotFound => AccessError::NotFound(pid),
            err => err.into(),
        })?;

        let pagemap = Pagemap::open(&self.proc_root, pid).map_err(|err| match err.kind() {
            ErrorKind::NotFound => AccessError::NotFound(pid),
            _ => AccessError::Io(err),
        })?;

        'maps: for (entry, region) in clip(&maps, range) {
            let label = entry.label();

            for page in pagemap.entries(region) {
                let (current, page) = match page {
                    Ok(page) => page,
                    Err(err) => {
                        tracing::warn!(%pid, %region, %err, "pagemap read failed, skipping mapping");
                        continue 'maps;
                    }
                };

                if !page.present() {
                    continue;
                }

                // Zero without CAP_SYS_ADMIN.
                let pfn = page.pfn();
                if pfn.0 == 0 {
                    continue;
                }

                match snapshot.is_idle(pfn) {
                    Some(true) => {}
                    Some(false) => {
                        let page = AccessedPage::new(current).with_frame(pfn, label.clone());
                        if !result.push(page) {
                            break 'maps;
                        }
                    }
                    None => {
                        tracing::warn!(
                            %pid,
                            va = %current,
                            %pfn,
                            frames = snapshot.frames(),
                            "frame beyond idle bitmap snapshot"
                        );
                    }
                }
            }
        }

        Ok(result)
    }
}

impl PageTableAccess for IdleFrameBackend {
    fn clear(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError> {
        if range.is_empty() {
            return Ok(());
        }

        self.arm(pid)
    }

    fn scan(&self, pid: Pid, range: AddressRange) -> Result<ScanResult, AccessError> {
        if range.is_empty() {
            return Ok(ScanResult::with_capacity(self.capacity));
        }

        let snapshot = self.bitmap.snapshot()?;
        self.scan_snapshot(&snapshot, pid, range)
    }

    fn clear_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AddressRange>, AccessError> {
        let ranges = ranges
            .iter()
            .copied()
            .filter(|range| !range.is_empty())
            .collect::<Vec<_>>();

        if ranges.is_empty() {
            return Ok(ranges);
        }

        // The bitmap is global; one pass arms every range.
        match self.arm(pid) {
            Ok(()) => Ok(ranges),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!(%pid, %err, "arming idle bitmap failed, skipping epoch ranges");
                Ok(Vec::new())
            }
        }
    }

    fn scan_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AccessedPage>, AccessError> {
        let mut pages = Vec::new();

        if ranges.iter().all(AddressRange::is_empty) {
            return Ok(pages);
        }

        let snapshot = match self.bitmap.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(%pid, %err, "idle bitmap snapshot failed");
                return Ok(pages);
            }
        };

        for &range in ranges {
            match self.scan_snapshot(&snapshot, pid, range) {
                Ok(result) => pages.extend(result.into_pages()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::warn!(%pid, %range, %err, "scan failed, skipping range"),
            }
        }

        Ok(pages)
    }
}
