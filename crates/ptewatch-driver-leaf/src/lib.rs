//! Accessed-bit backend operating on the translation tables of a process.
//!
//! The backend locates the leaf entries mapping a virtual range and reads or
//! resets their accessed flag. It does not touch physical memory directly;
//! a [`TranslationHost`] provides table access, process lookup and TLB
//! invalidation.

mod address_space;
mod backend;
mod host;
#[cfg(any(test, feature = "sim"))]
mod sim;

pub use self::{
    address_space::{AddressSpace, RegionIndex},
    backend::LeafFlagBackend,
    host::TranslationHost,
};
#[cfg(any(test, feature = "sim"))]
pub use self::sim::SimulatedHost;

#[cfg(test)]
mod backend_tests;
