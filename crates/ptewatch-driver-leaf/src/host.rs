use std::sync::Arc;

use ptewatch_arch_amd64::{PageTableEntry, TableReader};
use ptewatch_core::{AccessError, AddressRange, Pa, Pid};

use crate::AddressSpace;

/// Privileged environment the leaf-flag backend runs in.
///
/// A host resolves processes to their memory-management context and gives
/// read-write access to the physical memory holding translation tables. It
/// also invalidates cached translations after entries change.
pub trait TranslationHost: TableReader {
    /// Resolves a process to its address space.
    ///
    /// Fails with [`AccessError::NotFound`] if the process does not exist and
    /// with [`AccessError::InvalidState`] if it has no address space.
    fn address_space(&self, pid: Pid) -> Result<Arc<AddressSpace>, AccessError>;

    /// Stores `entry` at the physical address `pa`.
    fn write_entry(&self, pa: Pa, entry: PageTableEntry) -> Result<(), AccessError>;

    /// Invalidates cached translations of `range` in `space`.
    fn flush_tlb(&self, space: &AddressSpace, range: AddressRange);
}
