use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::unix::fs::FileExt as _,
    path::{Path, PathBuf},
};

use ptewatch_core::{AccessError, Pfn};
use zerocopy::IntoBytes as _;

/// Default location of the idle page bitmap.
pub const IDLE_BITMAP_PATH: &str = "/sys/kernel/mm/page_idle/bitmap";

/// Largest snapshot taken, enough for 740 GiB of physical memory.
pub const MAX_SNAPSHOT_SIZE: usize = 20 * 1024 * 1024;

/// Bytes written per `write` when marking frames idle.
const SET_CHUNK_SIZE: usize = 4096;

/// The system-wide physical frame idle bitmap.
///
/// Bit `pfn % 64` of the 64-bit word `pfn / 64` is set when the frame has
/// not been accessed since it was last marked idle. The kernel only accepts
/// reads and writes of whole words.
pub struct IdleBitmap {
    file: File,
    path: PathBuf,
    limit: usize,
}

impl IdleBitmap {
    /// Opens the bitmap for reading and writing.
    ///
    /// Failure is reported as [`AccessError::Unavailable`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AccessError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| AccessError::unavailable(path, err))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            limit: MAX_SNAPSHOT_SIZE,
        })
    }

    /// Bounds the number of bytes written and snapshotted.
    ///
    /// Rounded down to a whole number of words.
    pub fn with_limit(self, limit: usize) -> Self {
        Self {
            limit: limit - limit % size_of::<u64>(),
            ..self
        }
    }

    /// Returns the path of the bitmap.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marks every frame idle.
    ///
    /// Writes all-ones until the kernel refuses more, which happens past the
    /// highest frame. Frames the kernel does not track are silently ignored
    /// by it. Returns the number of bytes written.
    pub fn set_all_idle(&self) -> Result<usize, AccessError> {
        let chunk = [0xff_u8; SET_CHUNK_SIZE];
        let mut written = 0;

        while written < self.limit {
            let length = SET_CHUNK_SIZE.min(self.limit - written);

            match self.file.write_at(&chunk[..length], written as u64) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if written == 0 => return Err(AccessError::Io(err)),
                Err(_) => break,
            }
        }

        tracing::trace!(written, "idle bitmap set");
        Ok(written)
    }

    /// Copies the bitmap into memory.
    ///
    /// The buffer is reserved fallibly; an allocation failure is reported as
    /// [`AccessError::OutOfMemory`].
    pub fn snapshot(&self) -> Result<IdleSnapshot, AccessError> {
        let capacity = self.limit / size_of::<u64>();

        let mut words = Vec::<u64>::new();
        words
            .try_reserve_exact(capacity)
            .map_err(|_| AccessError::OutOfMemory(self.limit))?;
        words.resize(capacity, 0);

        let buffer = words.as_mut_bytes();
        let mut filled = 0;

        while filled < buffer.len() {
            match self.file.read_at(&mut buffer[filled..], filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if filled == 0 => return Err(AccessError::Io(err)),
                Err(_) => break,
            }
        }

        words.truncate(filled / size_of::<u64>());

        tracing::trace!(bytes = filled, "idle bitmap snapshot taken");
        Ok(IdleSnapshot { words })
    }
}

/// In-memory copy of the idle bitmap.
#[derive(Debug, Clone, Default)]
pub struct IdleSnapshot {
    words: Vec<u64>,
}

impl IdleSnapshot {
    /// Creates a snapshot from raw bitmap words.
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }

    /// Returns the number of frames covered by the snapshot.
    pub fn frames(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    /// Checks if `pfn` was idle when the snapshot was taken.
    ///
    /// Returns `None` for frames beyond the snapshot.
    pub fn is_idle(&self, pfn: Pfn) -> Option<bool> {
        let word = self.words.get((pfn.0 / 64) as usize)?;
        Some(word & (1 << (pfn.0 % 64)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ptewatch-idle-{}-{name}",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn snapshot_lookup() {
        let snapshot = IdleSnapshot::from_words(vec![!0b100, u64::MAX]);

        assert_eq!(snapshot.frames(), 128);
        assert_eq!(snapshot.is_idle(Pfn(2)), Some(false));
        assert_eq!(snapshot.is_idle(Pfn(3)), Some(true));
        assert_eq!(snapshot.is_idle(Pfn(127)), Some(true));
        assert_eq!(snapshot.is_idle(Pfn(128)), None);
    }

    #[test]
    fn set_and_snapshot_file() -> Result<(), AccessError> {
        let path = fixture("set", &[0; 16]);
        let bitmap = IdleBitmap::open(&path)?.with_limit(64);

        assert_eq!(bitmap.set_all_idle()?, 64);

        let snapshot = bitmap.snapshot()?;
        assert_eq!(snapshot.frames(), 64 * 8);
        assert_eq!(snapshot.is_idle(Pfn(0)), Some(true));
        assert_eq!(snapshot.is_idle(Pfn(511)), Some(true));

        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn snapshot_stops_at_end_of_file() -> Result<(), AccessError> {
        let mut contents = vec![0xff; 8];
        contents.extend_from_slice(&0xfffe_u64.to_ne_bytes());
        let path = fixture("short", &contents);

        let snapshot = IdleBitmap::open(&path)?.snapshot()?;
        assert_eq!(snapshot.frames(), 128);
        assert_eq!(snapshot.is_idle(Pfn(64)), Some(false));
        assert_eq!(snapshot.is_idle(Pfn(65)), Some(true));

        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn missing_bitmap_is_fatal() {
        let err = IdleBitmap::open("/nonexistent/ptewatch/bitmap")
            .err()
            .unwrap();

        assert!(err.is_fatal());
    }
}
