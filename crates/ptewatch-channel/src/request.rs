use ptewatch_core::{AccessError, AddressRange, Pa, Pid, Va};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ChannelError;

/// A clear or scan request as written to a control endpoint.
///
/// Native endian, laid out like the C structure
/// `{ pid_t pid; unsigned long start; unsigned long end; }` on x86-64,
/// including the padding after `pid`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AccessRequest {
    pid: i32,
    reserved: u32,
    start: u64,
    end: u64,
}

impl AccessRequest {
    /// Size of a request on the wire.
    pub const SIZE: usize = size_of::<Self>();

    /// Creates a new request for `range` of `pid`.
    pub fn new(pid: Pid, range: AddressRange) -> Self {
        Self {
            pid: pid.0,
            reserved: 0,
            start: range.start().0,
            end: range.end().0,
        }
    }

    /// Decodes a request from exactly [`Self::SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ChannelError> {
        Self::read_from_bytes(bytes).map_err(|_| ChannelError::RequestSize(bytes.len()))
    }

    /// Returns the target process.
    pub fn pid(&self) -> Pid {
        Pid(self.pid)
    }

    /// Returns the requested range.
    ///
    /// Unaligned or inverted bounds are rejected.
    pub fn range(&self) -> Result<AddressRange, AccessError> {
        AddressRange::new(Va(self.start), Va(self.end))
    }
}

/// Returns the `errno` value carrying `err` across the channel.
pub fn errno(err: &AccessError) -> i32 {
    match err {
        AccessError::NotFound(_) => libc::ESRCH,
        AccessError::InvalidState(_) => libc::ENXIO,
        AccessError::InvalidArgument(_) => libc::EINVAL,
        AccessError::Fault(_) => libc::EFAULT,
        AccessError::Unavailable { .. } => libc::ENODEV,
        AccessError::OutOfMemory(_) => libc::ENOMEM,
        AccessError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Encodes `err` as an I/O error carrying its `errno` value.
pub fn to_io_error(err: &AccessError) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno(err))
}

/// Decodes an I/O error returned by an endpoint for a request about `pid`.
///
/// A fault reported by the endpoint carries no address.
pub fn from_io_error(err: std::io::Error, pid: Pid) -> AccessError {
    match err.raw_os_error() {
        Some(libc::ESRCH) => AccessError::NotFound(pid),
        Some(libc::ENXIO) => AccessError::InvalidState(pid),
        Some(libc::EINVAL) => AccessError::InvalidArgument("request rejected by control endpoint"),
        Some(libc::EFAULT) => AccessError::Fault(Pa(0)),
        Some(libc::ENOMEM) => AccessError::OutOfMemory(0),
        Some(libc::ENODEV) => AccessError::unavailable("control endpoint", err),
        _ => AccessError::Io(err),
    }
}
