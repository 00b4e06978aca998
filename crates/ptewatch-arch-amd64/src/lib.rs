//! AMD64 translation table definitions.
//!
//! Covers 4-level paging with 4KB pages. Large pages are recognised only so
//! that walks can skip them.

mod paging;
mod walk;

pub use self::{
    paging::{PageTableEntry, PageTableLevel},
    walk::{
        LeafEntry, PageWalk, TableReader, TranslationEntries, TranslationEntry, entry_address,
        translation,
    },
};
