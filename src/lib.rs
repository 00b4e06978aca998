//! Epoch-synchronized page access tracking for Linux processes.
//!
//! A target process brackets each unit of work with a handshake. On the
//! first handshake the observer resets the access indicators of the pages
//! of interest; on the second it collects the pages that were touched in
//! between and logs them, tagged with the epoch index.
//!
//! The workspace is split into:
//!
//! - the crate root: address types, ranges and the [`PageTableAccess`]
//!   capability.
//! - `arch`: x86-64 page table entries and the translation walk.
//! - `driver::leaf`: the backend clearing and testing accessed flags of
//!   leaf page table entries.
//! - `os::linux`: memory maps, pagemap and the idle page bitmap backend.
//! - `channel`: the byte-oriented control channel in front of a backend.
//! - `epoch`: the handshake-driven coordinator and its log.

#[cfg(all(feature = "channel", feature = "epoch", feature = "os-linux"))]
mod config;

#[cfg(all(feature = "channel", feature = "epoch", feature = "os-linux"))]
pub use self::config::{BackendKind, ConfigError, ObserverConfig, RangeMode};
pub use ptewatch_core::{
    AccessError, AccessedPage, AddressRange, DEFAULT_SCAN_CAPACITY, PAGE_MASK,
    PAGE_SHIFT, PAGE_SIZE, Pa, PageTableAccess, Pfn, Pid, ScanResult, Va,
};
#[cfg(feature = "channel")]
pub use ptewatch_channel as channel;
#[cfg(feature = "epoch")]
pub use ptewatch_epoch as epoch;

/// Architecture-specific types.
pub mod arch {
    #[cfg(feature = "arch-amd64")]
    pub use ptewatch_arch_amd64 as amd64;
}

/// Page access backends.
pub mod driver {
    #[cfg(feature = "driver-leaf")]
    pub use ptewatch_driver_leaf as leaf;
}

/// OS-specific types.
pub mod os {
    #[cfg(feature = "os-linux")]
    pub use ptewatch_os_linux as linux;
}
