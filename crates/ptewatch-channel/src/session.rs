use std::io::{Read, Write};

use ptewatch_core::{AccessError, PageTableAccess};

use crate::{AccessRequest, to_io_error};

/// The operation served by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Requests reset access indicators.
    Clear,

    /// Requests collect accessed pages; results are read back.
    Scan,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clear => f.write_str("clear"),
            Self::Scan => f.write_str("scan"),
        }
    }
}

/// Server side of one open endpoint handle.
///
/// A write carries one [`AccessRequest`] and is served synchronously by the
/// backend. On a scan session the results are kept in the session and read
/// back as consecutive native-endian 8-byte addresses. Once the results are
/// fully drained, a read returns 0 and the next read starts over.
pub struct ControlSession<Access>
where
    Access: PageTableAccess,
{
    kind: EndpointKind,
    access: Access,
    results: Vec<u8>,
    offset: usize,
}

impl<Access> ControlSession<Access>
where
    Access: PageTableAccess,
{
    /// Creates a new session over `access`.
    pub fn new(kind: EndpointKind, access: Access) -> Self {
        Self {
            kind,
            access,
            results: Vec::new(),
            offset: 0,
        }
    }

    /// Returns the kind of the session.
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Returns the number of result bytes not yet read.
    pub fn pending(&self) -> usize {
        self.results.len() - self.offset
    }

    fn serve(&mut self, request: AccessRequest) -> Result<(), AccessError> {
        let pid = request.pid();
        let range = request.range()?;

        match self.kind {
            EndpointKind::Clear => self.access.clear(pid, range),
            EndpointKind::Scan => {
                let result = self.access.scan(pid, range)?;

                self.results.clear();
                self.offset = 0;
                for page in result.pages() {
                    self.results.extend_from_slice(&page.va.0.to_ne_bytes());
                }

                Ok(())
            }
        }
    }
}

impl<Access> Write for ControlSession<Access>
where
    Access: PageTableAccess,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let request = AccessRequest::parse(buf)
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;

        match self.serve(request) {
            Ok(()) => Ok(buf.len()),
            Err(err) => {
                tracing::debug!(kind = %self.kind, pid = %request.pid(), %err, "request failed");
                Err(to_io_error(&err))
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<Access> Read for ControlSession<Access>
where
    Access: PageTableAccess,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.kind == EndpointKind::Clear {
            return Ok(0);
        }

        if self.offset >= self.results.len() {
            self.offset = 0;
            return Ok(0);
        }

        let length = buf.len().min(self.results.len() - self.offset);
        buf[..length].copy_from_slice(&self.results[self.offset..self.offset + length]);
        self.offset += length;

        Ok(length)
    }
}
