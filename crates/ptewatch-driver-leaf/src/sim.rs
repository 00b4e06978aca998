//! In-memory translation host.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ptewatch_arch_amd64::{PageTableEntry, PageTableLevel, TableReader, entry_address, translation};
use ptewatch_core::{AccessError, AddressRange, Pa, Pfn, Pid, Va};

use crate::{AddressSpace, TranslationHost};

const FIRST_FRAME: u64 = 0x100;

#[derive(Default)]
struct State {
    entries: HashMap<Pa, PageTableEntry>,
    spaces: HashMap<Pid, Arc<AddressSpace>>,
    next_frame: u64,
    flushes: Vec<(Pid, AddressRange)>,
}

impl State {
    fn allocate(&mut self) -> Pfn {
        let pfn = Pfn(FIRST_FRAME + self.next_frame);
        self.next_frame += 1;
        pfn
    }

    fn entry(&self, pa: Pa) -> PageTableEntry {
        self.entries.get(&pa).copied().unwrap_or_default()
    }

    /// Builds the intermediate tables for `va` and installs a leaf.
    fn install(&mut self, root: Pfn, va: Va) {
        let mut table = root;

        for level in [
            PageTableLevel::Pml4,
            PageTableLevel::Pdpt,
            PageTableLevel::Pd,
        ] {
            let pa = entry_address(table, level, va);
            let entry = self.entry(pa);

            table = if entry.present() {
                entry.pfn()
            } else {
                let next = self.allocate();
                self.entries.insert(pa, PageTableEntry::table(next));
                next
            };
        }

        let pa = entry_address(table, PageTableLevel::Pt, va);
        if !self.entry(pa).present() {
            let frame = self.allocate();
            self.entries.insert(pa, PageTableEntry::table(frame));
        }
    }

    fn leaf(&self, root: Pfn, va: Va) -> Result<Option<Pa>, AccessError> {
        let path = translation(self, root, va)?;

        Ok(path
            .last()
            .filter(|entry| entry.level == PageTableLevel::Pt)
            .map(|entry| entry.entry_address))
    }
}

impl TableReader for State {
    fn read_entry(&self, pa: Pa) -> Result<PageTableEntry, AccessError> {
        Ok(self.entry(pa))
    }
}

/// A translation host backed by process-local memory.
///
/// Processes, their mappings and hardware accesses are driven explicitly,
/// which makes the leaf-flag backend testable without privileges.
#[derive(Default)]
pub struct SimulatedHost {
    state: Mutex<State>,
}

impl SimulatedHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn space(&self, pid: Pid) -> Result<Arc<AddressSpace>, AccessError> {
        self.state()
            .spaces
            .get(&pid)
            .cloned()
            .ok_or(AccessError::NotFound(pid))
    }

    /// Creates a process with an empty address space.
    pub fn spawn(&self, pid: Pid) -> Arc<AddressSpace> {
        let mut state = self.state();
        let root = state.allocate();
        let space = Arc::new(AddressSpace::new(pid, root));
        state.spaces.insert(pid, space.clone());
        space
    }

    /// Removes a process.
    pub fn kill(&self, pid: Pid) {
        self.state().spaces.remove(&pid);
    }

    /// Maps every page of `range` in the address space of `pid`.
    pub fn map(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError> {
        let space = self.space(pid)?;
        space.write_regions()?.insert(range)?;

        let mut state = self.state();
        for va in range.page_addresses() {
            state.install(space.root(), va);
        }

        Ok(())
    }

    /// Emulates a hardware access to `va`, setting the accessed flag on
    /// every entry of its translation.
    pub fn touch(&self, pid: Pid, va: Va) -> Result<(), AccessError> {
        let space = self.space(pid)?;
        let mut state = self.state();

        let path = translation(&*state, space.root(), va.align_down())?;
        match path.last() {
            Some(last) if last.level == PageTableLevel::Pt && last.entry.present() => {}
            _ => return Err(AccessError::InvalidArgument("address is not mapped")),
        }

        for entry in path {
            state
                .entries
                .insert(entry.entry_address, entry.entry.with_accessed());
        }

        Ok(())
    }

    /// Emulates the eviction of the page at `va`.
    ///
    /// The leaf keeps its remaining bits, like a swap entry does.
    pub fn evict(&self, pid: Pid, va: Va) -> Result<(), AccessError> {
        let space = self.space(pid)?;
        let mut state = self.state();

        let pa = state
            .leaf(space.root(), va.align_down())?
            .ok_or(AccessError::InvalidArgument("address is not mapped"))?;

        let entry = state.entry(pa);
        state.entries.insert(pa, PageTableEntry(entry.0 & !1));
        Ok(())
    }

    /// Returns the leaf entry translating `va`, if the page is mapped.
    pub fn leaf_entry(&self, pid: Pid, va: Va) -> Result<Option<PageTableEntry>, AccessError> {
        let space = self.space(pid)?;
        let state = self.state();

        Ok(state
            .leaf(space.root(), va.align_down())?
            .map(|pa| state.entry(pa)))
    }

    /// Returns the ranges invalidated so far, in order.
    pub fn flushes(&self) -> Vec<(Pid, AddressRange)> {
        self.state().flushes.clone()
    }
}

impl TableReader for SimulatedHost {
    fn read_entry(&self, pa: Pa) -> Result<PageTableEntry, AccessError> {
        Ok(self.state().entry(pa))
    }
}

impl TranslationHost for SimulatedHost {
    fn address_space(&self, pid: Pid) -> Result<Arc<AddressSpace>, AccessError> {
        self.space(pid)
    }

    fn write_entry(&self, pa: Pa, entry: PageTableEntry) -> Result<(), AccessError> {
        self.state().entries.insert(pa, entry);
        Ok(())
    }

    fn flush_tlb(&self, space: &AddressSpace, range: AddressRange) {
        self.state().flushes.push((space.pid(), range));
    }
}
