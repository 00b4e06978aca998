//! Epoch protocol bracketing a target's unit of work.
//!
//! The target announces each unit of work with a handshake. The
//! [`EpochCoordinator`] arms an epoch on one handshake, clearing the access
//! indicators of the ranges supplied by a [`RangeSource`], and samples it on
//! the next, writing every accessed page to an [`EpochLog`]. Both
//! transitions are acknowledged, so exactly one unit of work happens
//! between them.
//!
//! Handshakes arrive as `SIGUSR1` through a [`HandshakeListener`]; the
//! signal handler only raises a flag, all work happens on the
//! coordinator's thread.

mod coordinator;
mod error;
mod listener;
mod log;
mod ranges;
mod target;

pub use self::{
    coordinator::{DEFAULT_POLL_INTERVAL, EpochCoordinator, EpochState, RunSummary},
    error::{CoordinatorError, RangeError},
    listener::{HandshakeListener, HandshakeSource},
    log::EpochLog,
    ranges::{
        DEFAULT_ADDRESS_LIST, FixedRanges, LoadPolicy, MapSelector, MappedRanges, RangeSource,
    },
    target::{ProcessTarget, Target},
};
