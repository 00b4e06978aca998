use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AccessError, AddressRange, Pfn, Va};

/// Default number of entries a single scan may return.
pub const DEFAULT_SCAN_CAPACITY: usize = 4096;

/// A process identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub i32);

impl From<i32> for Pid {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Pid> for i32 {
    fn from(value: Pid) -> Self {
        value.0
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page found accessed since the last clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessedPage {
    /// Base virtual address of the page.
    pub va: Va,

    /// Physical frame backing the page, when the backend reports it.
    pub frame: Option<Pfn>,

    /// Path (or pseudo-name) of the mapping the page belongs to, when the
    /// backend reports it.
    pub mapping: Option<Arc<str>>,
}

impl AccessedPage {
    /// Creates an entry carrying only the virtual address.
    pub fn new(va: Va) -> Self {
        Self {
            va,
            frame: None,
            mapping: None,
        }
    }

    /// Attaches the backing frame and its mapping.
    pub fn with_frame(self, frame: Pfn, mapping: Arc<str>) -> Self {
        Self {
            frame: Some(frame),
            mapping: Some(mapping),
            ..self
        }
    }
}

/// Bounded, ordered result of a scan.
///
/// Once `capacity` entries have been collected, further pages are dropped
/// and the result is marked as truncated. Truncation is never an error.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pages: Vec<AccessedPage>,
    capacity: usize,
    truncated: bool,
}

impl Default for ScanResult {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SCAN_CAPACITY)
    }
}

impl ScanResult {
    /// Creates an empty result holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pages: Vec::new(),
            capacity,
            truncated: false,
        }
    }

    /// Appends a page.
    ///
    /// Returns `false` once the result is full; the caller should stop
    /// walking. The first rejected page logs a warning.
    pub fn push(&mut self, page: AccessedPage) -> bool {
        if self.pages.len() >= self.capacity {
            if !self.truncated {
                tracing::warn!(
                    capacity = self.capacity,
                    va = %page.va,
                    "scan result capacity reached, truncating"
                );
            }

            self.truncated = true;
            return false;
        }

        self.pages.push(page);
        true
    }

    /// Returns the collected pages.
    pub fn pages(&self) -> &[AccessedPage] {
        &self.pages
    }

    /// Consumes the result and returns the collected pages.
    pub fn into_pages(self) -> Vec<AccessedPage> {
        self.pages
    }

    /// Returns the number of collected pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Checks if no page was collected.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks if pages were dropped because the capacity was reached.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Returns the virtual addresses of the collected pages.
    pub fn addresses(&self) -> Vec<Va> {
        self.pages.iter().map(|page| page.va).collect()
    }
}

/// Capability to clear and scan per-page access indicators of a target.
///
/// Implementations are interchangeable: a deployment picks one backend and
/// the epoch protocol above it does not change.
pub trait PageTableAccess {
    /// Resets the access indicator of every mapped page in `range`.
    fn clear(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError>;

    /// Returns the pages in `range` accessed since the last clear.
    fn scan(&self, pid: Pid, range: AddressRange) -> Result<ScanResult, AccessError>;

    /// Clears every range of an epoch and returns the ranges that were
    /// cleared.
    ///
    /// Errors affecting a single range are logged and that range is left
    /// out of the result; it must not be scanned for this epoch. Fatal
    /// errors are returned.
    fn clear_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AddressRange>, AccessError> {
        let mut cleared = Vec::with_capacity(ranges.len());

        for &range in ranges {
            match self.clear(pid, range) {
                Ok(()) => cleared.push(range),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::warn!(%pid, %range, %err, "clear failed, skipping range"),
            }
        }

        Ok(cleared)
    }

    /// Scans every range of an epoch and concatenates the results.
    ///
    /// Errors affecting a single range are logged and that range is
    /// skipped. Fatal errors are returned.
    fn scan_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AccessedPage>, AccessError> {
        let mut pages = Vec::new();

        for &range in ranges {
            match self.scan(pid, range) {
                Ok(result) => pages.extend(result.into_pages()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::warn!(%pid, %range, %err, "scan failed, skipping range"),
            }
        }

        Ok(pages)
    }
}

impl<T> PageTableAccess for &T
where
    T: PageTableAccess + ?Sized,
{
    fn clear(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError> {
        (**self).clear(pid, range)
    }

    fn scan(&self, pid: Pid, range: AddressRange) -> Result<ScanResult, AccessError> {
        (**self).scan(pid, range)
    }

    fn clear_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AddressRange>, AccessError> {
        (**self).clear_ranges(pid, ranges)
    }

    fn scan_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AccessedPage>, AccessError> {
        (**self).scan_ranges(pid, ranges)
    }
}

impl<T> PageTableAccess for Arc<T>
where
    T: PageTableAccess + ?Sized,
{
    fn clear(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError> {
        (**self).clear(pid, range)
    }

    fn scan(&self, pid: Pid, range: AddressRange) -> Result<ScanResult, AccessError> {
        (**self).scan(pid, range)
    }

    fn clear_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AddressRange>, AccessError> {
        (**self).clear_ranges(pid, ranges)
    }

    fn scan_ranges(
        &self,
        pid: Pid,
        ranges: &[AddressRange],
    ) -> Result<Vec<AccessedPage>, AccessError> {
        (**self).scan_ranges(pid, ranges)
    }
}
