use std::{
    io::{ErrorKind, Read as _, Write as _},
    sync::{Mutex, MutexGuard, PoisonError},
};

use ptewatch_core::{
    AccessError, AccessedPage, AddressRange, DEFAULT_SCAN_CAPACITY, PageTableAccess, Pid,
    ScanResult, Va,
};
use zerocopy::IntoBytes as _;

use crate::{AccessRequest, ChannelError, ControlEndpoint, EndpointKind, from_io_error};

/// Bytes requested per read of scan results.
const READ_CHUNK_SIZE: usize = 4096;

/// Observer side of a control channel.
///
/// Both endpoints are opened when the client is created, so an unavailable
/// endpoint is detected before the first epoch.
///
/// The clear handle is kept for the lifetime of the client. Every scan
/// opens a fresh handle: a device serves results from the file position of
/// the handle and never rewinds it, so a reused handle would resume reading
/// where the previous scan stopped.
pub struct ChannelClient<Endpoint>
where
    Endpoint: ControlEndpoint,
{
    endpoint: Endpoint,
    clear: Mutex<Endpoint::Handle>,
    capacity: usize,
}

impl<Endpoint> ChannelClient<Endpoint>
where
    Endpoint: ControlEndpoint,
{
    /// Opens the handles of `endpoint`.
    pub fn open(endpoint: Endpoint) -> Result<Self, ChannelError> {
        let clear = endpoint.open(EndpointKind::Clear)?;
        drop(endpoint.open(EndpointKind::Scan)?);

        Ok(Self {
            endpoint,
            clear: Mutex::new(clear),
            capacity: DEFAULT_SCAN_CAPACITY,
        })
    }

    /// Sets the maximum number of entries returned by one scan.
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    fn lock(handle: &Mutex<Endpoint::Handle>) -> MutexGuard<'_, Endpoint::Handle> {
        handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(
        handle: &mut Endpoint::Handle,
        pid: Pid,
        range: AddressRange,
    ) -> Result<(), AccessError> {
        let request = AccessRequest::new(pid, range);

        let written = handle
            .write(request.as_bytes())
            .map_err(|err| from_io_error(err, pid))?;

        if written != AccessRequest::SIZE {
            return Err(ChannelError::RequestSize(written).into());
        }

        Ok(())
    }

    fn receive(handle: &mut Endpoint::Handle, pid: Pid) -> Result<Vec<u8>, AccessError> {
        let mut response = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match handle.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(from_io_error(err, pid)),
            }
        }

        if response.len() % size_of::<u64>() != 0 {
            return Err(ChannelError::ResponseSize(response.len()).into());
        }

        Ok(response)
    }
}

impl<Endpoint> PageTableAccess for ChannelClient<Endpoint>
where
    Endpoint: ControlEndpoint,
{
    fn clear(&self, pid: Pid, range: AddressRange) -> Result<(), AccessError> {
        if range.is_empty() {
            return Ok(());
        }

        let mut handle = Self::lock(&self.clear);
        Self::send(&mut handle, pid, range)?;

        tracing::trace!(%pid, %range, "clear request sent");
        Ok(())
    }

    fn scan(&self, pid: Pid, range: AddressRange) -> Result<ScanResult, AccessError> {
        let mut result = ScanResult::with_capacity(self.capacity);

        if range.is_empty() {
            return Ok(result);
        }

        let mut handle = self.endpoint.open(EndpointKind::Scan)?;
        Self::send(&mut handle, pid, range)?;
        let response = Self::receive(&mut handle, pid)?;

        for bytes in response.chunks_exact(size_of::<u64>()) {
            let mut va = [0u8; 8];
            va.copy_from_slice(bytes);

            if !result.push(AccessedPage::new(Va(u64::from_ne_bytes(va)))) {
                break;
            }
        }

        tracing::trace!(%pid, %range, accessed = result.len(), "scan response received");
        Ok(result)
    }
}
