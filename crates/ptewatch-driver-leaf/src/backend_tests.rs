use std::{
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ptewatch_arch_amd64::{PageTableEntry, TableReader};
use ptewatch_core::{AccessError, AddressRange, Pa, PageTableAccess, Pid, Va};

use crate::{AddressSpace, LeafFlagBackend, SimulatedHost, TranslationHost};

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const PID: Pid = Pid(4242);

fn range(start: u64, end: u64) -> AddressRange {
    AddressRange::new(start, end).unwrap()
}

fn backend_with(mapped: &[AddressRange]) -> LeafFlagBackend<SimulatedHost> {
    let host = SimulatedHost::new();
    host.spawn(PID);

    for &region in mapped {
        host.map(PID, region).unwrap();
    }

    LeafFlagBackend::new(host)
}

/// Log output shared with a test subscriber.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `f` and returns its result along with the warnings it logged.
fn with_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let captured = Captured::default();
    let writer = captured.clone();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let value = tracing::subscriber::with_default(subscriber, f);
    let output = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
    (value, output)
}

///////////////////////////////////////////////////////////////////////////////
// Failing Host
///////////////////////////////////////////////////////////////////////////////

/// Simulated host whose entry writes fail once a budget is spent.
struct FailingWrites {
    inner: SimulatedHost,
    remaining: AtomicUsize,
}

impl FailingWrites {
    fn new(inner: SimulatedHost, writes: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(writes),
        }
    }
}

impl TableReader for FailingWrites {
    fn read_entry(&self, pa: Pa) -> Result<PageTableEntry, AccessError> {
        self.inner.read_entry(pa)
    }
}

impl TranslationHost for FailingWrites {
    fn address_space(&self, pid: Pid) -> Result<Arc<AddressSpace>, AccessError> {
        self.inner.address_space(pid)
    }

    fn write_entry(&self, pa: Pa, entry: PageTableEntry) -> Result<(), AccessError> {
        let spent = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        match spent {
            Ok(_) => self.inner.write_entry(pa, entry),
            Err(_) => Err(AccessError::Fault(pa)),
        }
    }

    fn flush_tlb(&self, space: &AddressSpace, range: AddressRange) {
        self.inner.flush_tlb(space, range)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Scan
///////////////////////////////////////////////////////////////////////////////

#[test]
fn scan_reports_touched_pages_only() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x4000)]);
    backend.clear(PID, range(0x1000, 0x4000))?;

    backend.host().touch(PID, Va(0x2010))?;

    let result = backend.scan(PID, range(0x1000, 0x4000))?;
    assert_eq!(result.addresses(), vec![Va(0x2000)]);
    assert!(!result.truncated());

    Ok(())
}

#[test]
fn scan_is_ascending_across_regions() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x3000), range(0x40_0000, 0x40_2000)]);

    for va in [0x40_1000, 0x1000, 0x40_0000] {
        backend.host().touch(PID, Va(va))?;
    }

    let result = backend.scan(PID, range(0, 0x80_0000))?;
    assert_eq!(
        result.addresses(),
        vec![Va(0x1000), Va(0x40_0000), Va(0x40_1000)]
    );

    Ok(())
}

#[test]
fn scan_is_read_only() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x2000)]);
    backend.host().touch(PID, Va(0x1000))?;

    let first = backend.scan(PID, range(0x1000, 0x2000))?;
    let second = backend.scan(PID, range(0x1000, 0x2000))?;
    assert_eq!(first.addresses(), second.addresses());
    assert_eq!(first.len(), 1);

    Ok(())
}

#[test]
fn scan_truncates_at_capacity() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x9000)]).with_capacity(3);

    for page in 1..9 {
        backend.host().touch(PID, Va(page * 0x1000))?;
    }

    let (result, warnings) = with_warnings(|| backend.scan(PID, range(0x1000, 0x9000)));
    let result = result?;
    assert_eq!(result.addresses(), vec![Va(0x1000), Va(0x2000), Va(0x3000)]);
    assert!(result.truncated());

    // One warning per truncated scan.
    assert_eq!(warnings.matches("capacity reached").count(), 1);

    Ok(())
}

#[test]
fn unmapped_range_is_empty() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x2000)]);
    backend.host().touch(PID, Va(0x1000))?;

    let result = backend.scan(PID, range(0x10_0000, 0x20_0000))?;
    assert!(result.is_empty());

    backend.clear(PID, range(0x10_0000, 0x20_0000))?;
    assert!(backend.host().leaf_entry(PID, Va(0x1000))?.unwrap().accessed());

    Ok(())
}

#[test]
fn empty_range_is_noop() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x2000)]);
    backend.host().touch(PID, Va(0x1000))?;

    backend.clear(PID, range(0x1000, 0x1000))?;
    assert!(backend.scan(PID, range(0x1000, 0x1000))?.is_empty());
    assert!(backend.host().flushes().is_empty());

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Clear
///////////////////////////////////////////////////////////////////////////////

#[test]
fn clear_then_scan_is_empty() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x5000)]);

    for page in 1..5 {
        backend.host().touch(PID, Va(page * 0x1000))?;
    }

    backend.clear(PID, range(0x1000, 0x5000))?;
    assert!(backend.scan(PID, range(0x1000, 0x5000))?.is_empty());

    Ok(())
}

#[test]
fn clear_is_idempotent() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x3000)]);
    backend.host().touch(PID, Va(0x1000))?;

    backend.clear(PID, range(0x1000, 0x3000))?;
    let after_first = backend.host().leaf_entry(PID, Va(0x1000))?;

    backend.clear(PID, range(0x1000, 0x3000))?;
    let after_second = backend.host().leaf_entry(PID, Va(0x1000))?;

    assert_eq!(after_first, after_second);
    assert!(backend.scan(PID, range(0x1000, 0x3000))?.is_empty());

    Ok(())
}

#[test]
fn clear_preserves_frames() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x2000)]);
    backend.host().touch(PID, Va(0x1000))?;

    let before = backend.host().leaf_entry(PID, Va(0x1000))?.unwrap();
    backend.clear(PID, range(0x1000, 0x2000))?;
    let after = backend.host().leaf_entry(PID, Va(0x1000))?.unwrap();

    assert_eq!(after, before.with_accessed_cleared());
    assert_eq!(after.pfn(), before.pfn());

    Ok(())
}

#[test]
fn clear_leaves_evicted_entries_alone() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x3000)]);
    backend.host().touch(PID, Va(0x1000))?;
    backend.host().touch(PID, Va(0x2000))?;
    backend.host().evict(PID, Va(0x2000))?;

    let evicted = backend.host().leaf_entry(PID, Va(0x2000))?;
    backend.clear(PID, range(0x1000, 0x3000))?;

    assert_eq!(backend.host().leaf_entry(PID, Va(0x2000))?, evicted);
    assert!(!backend.host().leaf_entry(PID, Va(0x1000))?.unwrap().accessed());

    Ok(())
}

#[test]
fn clear_flushes_range() -> Result<(), AccessError> {
    let backend = backend_with(&[range(0x1000, 0x3000)]);

    backend.clear(PID, range(0x1000, 0x3000))?;
    assert_eq!(backend.host().flushes(), vec![(PID, range(0x1000, 0x3000))]);

    Ok(())
}

#[test]
fn failed_clear_still_flushes_written_entries() -> Result<(), AccessError> {
    let host = SimulatedHost::new();
    host.spawn(PID);
    host.map(PID, range(0x1000, 0x4000))?;
    for page in 1..4 {
        host.touch(PID, Va(page * 0x1000))?;
    }

    let backend = LeafFlagBackend::new(FailingWrites::new(host, 1));
    assert!(matches!(
        backend.clear(PID, range(0x1000, 0x4000)),
        Err(AccessError::Fault(_))
    ));

    let host = &backend.host().inner;
    assert!(!host.leaf_entry(PID, Va(0x1000))?.unwrap().accessed());
    assert!(host.leaf_entry(PID, Va(0x2000))?.unwrap().accessed());
    assert_eq!(host.flushes(), vec![(PID, range(0x1000, 0x4000))]);

    Ok(())
}

#[test]
fn failed_clear_without_writes_skips_flush() -> Result<(), AccessError> {
    let host = SimulatedHost::new();
    host.spawn(PID);
    host.map(PID, range(0x1000, 0x2000))?;
    host.touch(PID, Va(0x1000))?;

    let backend = LeafFlagBackend::new(FailingWrites::new(host, 0));
    assert!(backend.clear(PID, range(0x1000, 0x2000)).is_err());
    assert!(backend.host().inner.flushes().is_empty());

    Ok(())
}

#[test]
fn epoch_sequence() -> Result<(), AccessError> {
    // Three mapped pages, only the middle one touched between clear and scan.
    let backend = backend_with(&[range(0x7000, 0xa000)]);
    let epoch = range(0x7000, 0xa000);

    for page in 7..10 {
        backend.host().touch(PID, Va(page * 0x1000))?;
    }

    backend.clear(PID, epoch)?;
    backend.host().touch(PID, Va(0x8000))?;

    assert_eq!(backend.scan(PID, epoch)?.addresses(), vec![Va(0x8000)]);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Errors
///////////////////////////////////////////////////////////////////////////////

#[test]
fn unknown_process() {
    let backend = backend_with(&[]);

    assert!(matches!(
        backend.scan(Pid(1), range(0x1000, 0x2000)),
        Err(AccessError::NotFound(Pid(1)))
    ));
    assert!(matches!(
        backend.clear(Pid(1), range(0x1000, 0x2000)),
        Err(AccessError::NotFound(Pid(1)))
    ));
}

#[test]
fn exiting_process() {
    let backend = backend_with(&[range(0x1000, 0x2000)]);
    backend.host().address_space(PID).unwrap().begin_exit();

    assert!(matches!(
        backend.scan(PID, range(0x1000, 0x2000)),
        Err(AccessError::InvalidState(PID))
    ));
}

#[test]
fn contended_lock_times_out() -> Result<(), AccessError> {
    let backend =
        backend_with(&[range(0x1000, 0x2000)]).with_lock_timeout(Duration::from_millis(5));

    let space = backend.host().address_space(PID)?;
    let _writer = space.write_regions()?;

    assert!(matches!(
        backend.clear(PID, range(0x1000, 0x2000)),
        Err(AccessError::InvalidState(PID))
    ));

    Ok(())
}

#[test]
fn contended_range_is_not_reported_cleared() -> Result<(), AccessError> {
    let backend =
        backend_with(&[range(0x1000, 0x4000)]).with_lock_timeout(Duration::from_millis(5));
    backend.host().touch(PID, Va(0x1000))?;

    let space = backend.host().address_space(PID)?;
    let writer = space.write_regions()?;
    assert!(backend.clear_ranges(PID, &[range(0x1000, 0x4000)])?.is_empty());
    drop(writer);

    // The stale bit survives, so the range must not be sampled this epoch.
    assert_eq!(
        backend.scan(PID, range(0x1000, 0x4000))?.addresses(),
        vec![Va(0x1000)]
    );

    Ok(())
}

#[test]
fn killed_process_is_not_found() {
    let backend = backend_with(&[range(0x1000, 0x2000)]);
    backend.host().kill(PID);

    let ranges = [range(0x1000, 0x2000)];
    assert!(backend.clear_ranges(PID, &ranges).unwrap().is_empty());
    assert!(backend.scan_ranges(PID, &ranges).unwrap().is_empty());
}
