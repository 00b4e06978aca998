//! Core types for page access tracking.
//!
//! This crate defines the vocabulary shared by every other crate of the
//! workspace: address newtypes, page-aligned ranges, bounded scan results
//! and the [`PageTableAccess`] capability implemented by the backends.

mod access;
mod address;
mod error;
mod range;

pub use self::{
    access::{AccessedPage, DEFAULT_SCAN_CAPACITY, PageTableAccess, Pid, ScanResult},
    address::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, Pa, Pfn, Va},
    error::AccessError,
    range::AddressRange,
};
