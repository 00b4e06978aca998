use std::path::{Path, PathBuf};

use ptewatch_core::{AddressRange, Pid};
use ptewatch_os_linux::{MapEntry, USER_SPLIT, clip, read_maps};

use crate::RangeError;

/// Default location of the published address list.
pub const DEFAULT_ADDRESS_LIST: &str = "/dev/shm/addrs";

/// A fixed list of ranges read from a file of decimal addresses.
///
/// The file holds one unsigned decimal address per line. The `i`-th address
/// is paired with the `i`-th known length.
#[derive(Debug, Clone)]
pub struct FixedRanges {
    path: PathBuf,
    lengths: Vec<u64>,
}

impl FixedRanges {
    /// Creates a new list with one known length per address.
    pub fn new(path: impl Into<PathBuf>, lengths: Vec<u64>) -> Self {
        Self {
            path: path.into(),
            lengths,
        }
    }

    /// Creates a new list of tables, each `element_size * count` bytes long.
    pub fn from_tables(path: impl Into<PathBuf>, element_size: u64, counts: &[u64]) -> Self {
        let lengths = counts
            .iter()
            .map(|&count| count.saturating_mul(element_size))
            .collect();

        Self::new(path, lengths)
    }

    /// Returns the path of the list.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the known lengths.
    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    /// Reads the list and builds the ranges.
    pub fn load(&self) -> Result<Vec<AddressRange>, RangeError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| RangeError::Unreadable {
            path: self.path.clone(),
            source,
        })?;

        self.parse(&text)
    }

    /// Builds the ranges from the contents of a list.
    ///
    /// Each range covers `[address, address + length)` rounded outward to
    /// page boundaries. Blank lines are ignored.
    pub fn parse(&self, text: &str) -> Result<Vec<AddressRange>, RangeError> {
        let mut addresses = Vec::with_capacity(self.lengths.len());

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let address = line.parse::<u64>().map_err(|_| RangeError::Malformed {
                line: index + 1,
                text: line.to_owned(),
            })?;

            addresses.push(address);
        }

        if addresses.len() != self.lengths.len() {
            return Err(RangeError::Count {
                expected: self.lengths.len(),
                found: addresses.len(),
            });
        }

        Ok(addresses
            .into_iter()
            .zip(&self.lengths)
            .map(|(address, &length)| AddressRange::covering(address, length))
            .collect())
    }
}

/// When a fixed list is loaded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Before the run starts.
    #[default]
    Startup,

    /// On the first handshake, which announces that the list is published.
    FirstHandshake,
}

/// Predicate selecting entries of a memory map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapSelector {
    /// The process heap.
    Heap,

    /// Thread and main stacks.
    Stack,

    /// Mappings without a backing path.
    Anonymous,

    /// Mappings whose path contains the given text.
    Named(String),

    /// Every mapping.
    All,
}

impl MapSelector {
    /// Parses a selector name.
    ///
    /// `heap`, `stack`, `anon` and `all` name the predefined selectors; any
    /// other text selects mappings whose path contains it.
    pub fn parse(text: &str) -> Self {
        match text {
            "heap" => Self::Heap,
            "stack" => Self::Stack,
            "anon" | "anonymous" => Self::Anonymous,
            "all" => Self::All,
            other => Self::Named(other.to_owned()),
        }
    }

    /// Checks if `entry` is selected.
    pub fn matches(&self, entry: &MapEntry) -> bool {
        match self {
            Self::Heap => entry.is_heap(),
            Self::Stack => entry.is_stack(),
            Self::Anonymous => entry.is_anonymous(),
            Self::Named(name) => entry
                .path
                .as_deref()
                .is_some_and(|path| path.contains(name.as_str())),
            Self::All => true,
        }
    }
}

/// Ranges derived from the live memory map of the target.
#[derive(Debug, Clone)]
pub struct MappedRanges {
    proc_root: PathBuf,
    selectors: Vec<MapSelector>,
    scope: AddressRange,
}

impl MappedRanges {
    /// Creates a new source over `<proc_root>/<pid>/maps`.
    pub fn new(proc_root: impl Into<PathBuf>, selectors: Vec<MapSelector>) -> Self {
        Self {
            proc_root: proc_root.into(),
            selectors,
            scope: AddressRange::covering(0u64, USER_SPLIT.0),
        }
    }

    /// Restricts the ranges to `scope`.
    pub fn with_scope(self, scope: AddressRange) -> Self {
        Self { scope, ..self }
    }

    /// Reads the memory map of `pid` and returns the selected ranges.
    ///
    /// An unreadable or malformed map yields no ranges.
    pub fn resolve(&self, pid: Pid) -> Vec<AddressRange> {
        let maps = match read_maps(&self.proc_root, pid) {
            Ok(maps) => maps,
            Err(err) => {
                tracing::warn!(%pid, %err, "memory map unavailable, no ranges this epoch");
                return Vec::new();
            }
        };

        clip(&maps, self.scope)
            .filter(|(entry, _)| self.selectors.iter().any(|selector| selector.matches(entry)))
            .map(|(_, range)| range)
            .collect()
    }
}

/// Source of the address ranges armed each epoch.
#[derive(Debug, Clone)]
pub enum RangeSource {
    /// A fixed list, loaded once.
    Fixed {
        /// The list.
        list: FixedRanges,

        /// When the list is loaded.
        policy: LoadPolicy,

        /// The ranges, once loaded.
        loaded: Option<Vec<AddressRange>>,
    },

    /// Ranges re-derived from the memory map every epoch.
    Mapped(MappedRanges),
}

impl RangeSource {
    /// Creates a source over a fixed list.
    pub fn fixed(list: FixedRanges, policy: LoadPolicy) -> Self {
        Self::Fixed {
            list,
            policy,
            loaded: None,
        }
    }

    /// Creates a source over the memory map.
    pub fn mapped(mapped: MappedRanges) -> Self {
        Self::Mapped(mapped)
    }

    /// Checks if the source waits for the first handshake before loading.
    pub fn awaits_handshake(&self) -> bool {
        matches!(
            self,
            Self::Fixed {
                policy: LoadPolicy::FirstHandshake,
                loaded: None,
                ..
            }
        )
    }

    /// Loads a fixed list, if not loaded already.
    pub fn load(&mut self) -> Result<(), RangeError> {
        if let Self::Fixed { list, loaded, .. } = self
            && loaded.is_none()
        {
            let ranges = list.load()?;
            tracing::info!(path = %list.path().display(), count = ranges.len(), "address list loaded");
            *loaded = Some(ranges);
        }

        Ok(())
    }

    /// Returns the ranges of the next epoch of `pid`.
    pub fn ranges(&mut self, pid: Pid) -> Result<Vec<AddressRange>, RangeError> {
        self.load()?;

        match self {
            Self::Fixed { loaded, .. } => Ok(loaded.clone().unwrap_or_default()),
            Self::Mapped(mapped) => Ok(mapped.resolve(pid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use ptewatch_core::Va;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ptewatch-epoch-{}-{name}", std::process::id()))
    }

    #[test]
    fn fixed_ranges_round_outward() {
        let list = FixedRanges::new("unused", vec![0x100, 0x1000]);

        let ranges = list.parse("4097\n\n8192\n").unwrap();
        assert_eq!(
            ranges,
            vec![
                AddressRange::new(0x1000, 0x2000).unwrap(),
                AddressRange::new(0x2000, 0x3000).unwrap(),
            ]
        );
    }

    #[test]
    fn fixed_ranges_from_tables() {
        let list = FixedRanges::from_tables("unused", 64, &[1460, 3]);
        assert_eq!(list.lengths(), &[1460 * 64, 192]);

        let ranges = list.parse("65536\n131072\n").unwrap();
        assert_eq!(ranges[0].start(), Va(0x10000));
        assert_eq!(ranges[0].end(), Va(0x10000 + 0x17000));
        assert_eq!(ranges[1].pages(), 1);
    }

    #[test]
    fn fixed_ranges_errors() {
        let list = FixedRanges::new("unused", vec![64, 64]);

        assert!(matches!(
            list.parse("4096\n"),
            Err(RangeError::Count {
                expected: 2,
                found: 1
            })
        ));
        assert!(matches!(
            list.parse("4096\n0x2000\n"),
            Err(RangeError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            FixedRanges::new(temp_path("missing"), vec![]).load(),
            Err(RangeError::Unreadable { .. })
        ));
    }

    #[test]
    fn deferred_list_loads_once() -> Result<(), RangeError> {
        let path = temp_path("deferred");
        std::fs::write(&path, "4096\n").map_err(|source| RangeError::Unreadable {
            path: path.clone(),
            source,
        })?;

        let mut source = RangeSource::fixed(
            FixedRanges::new(&path, vec![8192]),
            LoadPolicy::FirstHandshake,
        );
        assert!(source.awaits_handshake());

        source.load()?;
        assert!(!source.awaits_handshake());

        // Later changes to the file are not picked up.
        let _ = std::fs::remove_file(&path);
        let ranges = source.ranges(Pid(1))?;
        assert_eq!(ranges, vec![AddressRange::new(0x1000, 0x3000).unwrap()]);

        Ok(())
    }

    #[test]
    fn mapped_ranges_select_and_scope() {
        let root = temp_path("maps");
        let process = root.join("77");
        std::fs::create_dir_all(&process).unwrap();
        std::fs::write(
            process.join("maps"),
            "\
00400000-00401000 r-xp 00000000 08:01 12 /usr/bin/target
01000000-01100000 rw-p 00000000 00:00 0  [heap]
7f0000000000-7f0000010000 rw-p 00000000 00:00 0
7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0  [stack]
",
        )
        .unwrap();

        let heap = MappedRanges::new(&root, vec![MapSelector::Heap, MapSelector::Stack]);
        assert_eq!(
            heap.resolve(Pid(77)),
            vec![
                AddressRange::new(0x0100_0000, 0x0110_0000).unwrap(),
                AddressRange::new(0x7ffc_0000_0000, 0x7ffc_0002_1000).unwrap(),
            ]
        );

        let scoped = MappedRanges::new(&root, vec![MapSelector::parse("all")])
            .with_scope(AddressRange::new(0x0100_0000, 0x0100_2000).unwrap());
        assert_eq!(
            scoped.resolve(Pid(77)),
            vec![AddressRange::new(0x0100_0000, 0x0100_2000).unwrap()]
        );

        let named = MappedRanges::new(&root, vec![MapSelector::parse("target")]);
        assert_eq!(named.resolve(Pid(77)).len(), 1);

        let anonymous = MappedRanges::new(&root, vec![MapSelector::parse("anon")]);
        assert_eq!(
            anonymous.resolve(Pid(77)),
            vec![AddressRange::new(0x7f00_0000_0000, 0x7f00_0001_0000).unwrap()]
        );

        // Unreadable map: no ranges, no error.
        assert!(heap.resolve(Pid(78)).is_empty());

        let _ = std::fs::remove_dir_all(root);
    }
}
