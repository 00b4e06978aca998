//! Byte-oriented control channel for page access backends.
//!
//! A privileged backend is exposed through two endpoints, one clearing and
//! one scanning. Each request is a fixed 24-byte [`AccessRequest`]; scan
//! results are read back as consecutive 8-byte virtual addresses. Errors
//! travel as `errno` values.
//!
//! [`ControlSession`] is the serving side, [`ChannelClient`] the observer
//! side. The client implements [`PageTableAccess`] itself, so the epoch
//! protocol runs unchanged over an in-process backend or a kernel-resident
//! one.
//!
//! [`PageTableAccess`]: ptewatch_core::PageTableAccess

mod client;
mod endpoint;
mod error;
mod request;
mod session;

pub use self::{
    client::ChannelClient,
    endpoint::{
        ControlEndpoint, DEFAULT_CLEAR_PATH, DEFAULT_SCAN_PATH, DeviceEndpoint, LocalEndpoint,
    },
    error::ChannelError,
    request::{AccessRequest, errno, from_io_error, to_io_error},
    session::{ControlSession, EndpointKind},
};
