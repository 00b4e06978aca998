//! Linux procfs and idle page tracking support.
//!
//! Provides parsers for `/proc/<pid>/maps` and `/proc/<pid>/pagemap`, access
//! to the idle page bitmap (`/sys/kernel/mm/page_idle/bitmap`, Linux 4.3+)
//! and the [`IdleFrameBackend`] built on top of them.

mod backend;
mod error;
mod idle;
mod maps;
mod pagemap;

pub use self::{
    backend::{IdleFrameBackend, PROC_ROOT, USER_SPLIT},
    error::LinuxError,
    idle::{IDLE_BITMAP_PATH, IdleBitmap, IdleSnapshot, MAX_SNAPSHOT_SIZE},
    maps::{ANONYMOUS_LABEL, MapEntry, MapPermissions, clip, parse_maps, read_maps},
    pagemap::{CHUNK_ENTRIES, Pagemap, PagemapEntries, PagemapEntry},
};
