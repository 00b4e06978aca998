use serde::{Deserialize, Serialize};

use crate::{AccessError, PAGE_SIZE, Va};

/// A page-aligned, half-open range of virtual addresses.
///
/// `start` is inclusive and `end` exclusive. A range with `start == end` is
/// empty and every operation on it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    start: Va,
    end: Va,
}

impl AddressRange {
    /// Creates a new range.
    ///
    /// Both bounds must be page aligned and `start` must not exceed `end`.
    pub fn new(start: impl Into<Va>, end: impl Into<Va>) -> Result<Self, AccessError> {
        let start = start.into();
        let end = end.into();

        if !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(AccessError::InvalidArgument("range is not page aligned"));
        }

        if start > end {
            return Err(AccessError::InvalidArgument("range start exceeds end"));
        }

        Ok(Self { start, end })
    }

    /// Creates the smallest page-aligned range covering `[address, address + length)`.
    pub fn covering(address: impl Into<Va>, length: u64) -> Self {
        let address = address.into();
        let end = Va(address.0.saturating_add(length));

        Self {
            start: address.align_down(),
            end: end.align_up(),
        }
    }

    /// Returns the inclusive start of the range.
    pub fn start(&self) -> Va {
        self.start
    }

    /// Returns the exclusive end of the range.
    pub fn end(&self) -> Va {
        self.end
    }

    /// Returns the length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Checks if the range contains no pages.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns the number of pages in the range.
    pub fn pages(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    /// Returns the overlap of two ranges, if any.
    pub fn intersect(&self, other: &AddressRange) -> Option<AddressRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);

        (start < end).then_some(AddressRange { start, end })
    }

    /// Iterates over the base address of every page in the range.
    pub fn page_addresses(&self) -> impl Iterator<Item = Va> + use<> {
        let start = self.start.0;
        (0..self.pages()).map(move |index| Va(start + index * PAGE_SIZE))
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}-{:x}", self.start, self.end)
    }
}
