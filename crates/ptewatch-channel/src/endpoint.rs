use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use ptewatch_core::PageTableAccess;

use crate::{ChannelError, ControlSession, EndpointKind};

/// Default path of the clear endpoint.
pub const DEFAULT_CLEAR_PATH: &str = "/proc/clear_accessed_bits";

/// Default path of the scan endpoint.
pub const DEFAULT_SCAN_PATH: &str = "/proc/read_accessed";

/// Something a [`ChannelClient`](crate::ChannelClient) can open handles on.
pub trait ControlEndpoint {
    /// An open handle.
    type Handle: Read + Write;

    /// Opens a handle of the given kind.
    fn open(&self, kind: EndpointKind) -> Result<Self::Handle, ChannelError>;
}

/// Endpoint backed by a pair of device or procfs files.
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    clear_path: PathBuf,
    scan_path: PathBuf,
}

impl Default for DeviceEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_CLEAR_PATH, DEFAULT_SCAN_PATH)
    }
}

impl DeviceEndpoint {
    /// Creates a new endpoint over the given files.
    pub fn new(clear_path: impl Into<PathBuf>, scan_path: impl Into<PathBuf>) -> Self {
        Self {
            clear_path: clear_path.into(),
            scan_path: scan_path.into(),
        }
    }

    /// Returns the file serving `kind`.
    pub fn path(&self, kind: EndpointKind) -> &Path {
        match kind {
            EndpointKind::Clear => &self.clear_path,
            EndpointKind::Scan => &self.scan_path,
        }
    }
}

impl ControlEndpoint for DeviceEndpoint {
    type Handle = File;

    fn open(&self, kind: EndpointKind) -> Result<Self::Handle, ChannelError> {
        let path = self.path(kind);

        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ChannelError::Unavailable {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Endpoint serving requests in-process.
///
/// Every handle is a fresh [`ControlSession`] over a clone of the backend.
#[derive(Debug, Clone)]
pub struct LocalEndpoint<Access>
where
    Access: PageTableAccess + Clone,
{
    access: Access,
}

impl<Access> LocalEndpoint<Access>
where
    Access: PageTableAccess + Clone,
{
    /// Creates a new endpoint over `access`.
    pub fn new(access: Access) -> Self {
        Self { access }
    }
}

impl<Access> ControlEndpoint for LocalEndpoint<Access>
where
    Access: PageTableAccess + Clone,
{
    type Handle = ControlSession<Access>;

    fn open(&self, kind: EndpointKind) -> Result<Self::Handle, ChannelError> {
        Ok(ControlSession::new(kind, self.access.clone()))
    }
}
