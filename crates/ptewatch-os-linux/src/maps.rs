use std::{path::Path, sync::Arc};

use ptewatch_core::{AddressRange, Pid};

use crate::LinuxError;

bitflags::bitflags! {
    /// Permissions of a memory mapping.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MapPermissions: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// The mapping is shared rather than private.
        const SHARED = 0b00001000;
    }
}

impl MapPermissions {
    fn parse(text: &str) -> Option<Self> {
        let &[r, w, x, s] = text.as_bytes() else {
            return None;
        };

        let mut result = Self::empty();
        for (byte, expected, flag) in [
            (r, b'r', Self::R),
            (w, b'w', Self::W),
            (x, b'x', Self::X),
            (s, b's', Self::SHARED),
        ] {
            if byte == expected {
                result |= flag;
            } else if byte != b'-' && !(flag == Self::SHARED && byte == b'p') {
                return None;
            }
        }

        Some(result)
    }
}

impl std::fmt::Display for MapPermissions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-', b'-', b'-', b'p'];

        if self.contains(MapPermissions::R) {
            result[0] = b'r';
        }
        if self.contains(MapPermissions::W) {
            result[1] = b'w';
        }
        if self.contains(MapPermissions::X) {
            result[2] = b'x';
        }
        if self.contains(MapPermissions::SHARED) {
            result[3] = b's';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}

/// Label used for mappings without a backing path.
pub const ANONYMOUS_LABEL: &str = "[anon]";

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// Virtual address range of the mapping.
    pub range: AddressRange,

    /// Access permissions.
    pub permissions: MapPermissions,

    /// Offset into the backing file.
    pub offset: u64,

    /// Inode of the backing file, zero if none.
    pub inode: u64,

    /// Backing path or pseudo-name (`[heap]`, `[stack]`, ...).
    pub path: Option<Arc<str>>,
}

impl MapEntry {
    /// Parses a single line.
    ///
    /// The format is `start-end perms offset dev inode [path]`. The path may
    /// contain spaces.
    pub fn parse(line: &str) -> Result<Self, &'static str> {
        let (bounds, rest) = next_field(line).ok_or("missing address range")?;
        let (perms, rest) = next_field(rest).ok_or("missing permissions")?;
        let (offset, rest) = next_field(rest).ok_or("missing offset")?;
        let (_dev, rest) = next_field(rest).ok_or("missing device")?;
        let (inode, rest) = next_field(rest).ok_or("missing inode")?;

        let (start, end) = bounds.split_once('-').ok_or("malformed address range")?;
        let start = u64::from_str_radix(start, 16).map_err(|_| "malformed start address")?;
        let end = u64::from_str_radix(end, 16).map_err(|_| "malformed end address")?;
        let range = AddressRange::new(start, end).map_err(|_| "invalid address range")?;

        let permissions = MapPermissions::parse(perms).ok_or("malformed permissions")?;
        let offset = u64::from_str_radix(offset, 16).map_err(|_| "malformed offset")?;
        let inode = inode.parse().map_err(|_| "malformed inode")?;

        let path = rest.trim();
        let path = (!path.is_empty()).then(|| Arc::from(path));

        Ok(Self {
            range,
            permissions,
            offset,
            inode,
            path,
        })
    }

    /// Checks if this is the process heap.
    pub fn is_heap(&self) -> bool {
        self.path.as_deref() == Some("[heap]")
    }

    /// Checks if this is a thread or main stack.
    pub fn is_stack(&self) -> bool {
        self.path
            .as_deref()
            .is_some_and(|path| path.starts_with("[stack"))
    }

    /// Checks if the mapping has no backing path.
    pub fn is_anonymous(&self) -> bool {
        self.path.is_none()
    }

    /// Returns the path, or [`ANONYMOUS_LABEL`] for anonymous mappings.
    pub fn label(&self) -> Arc<str> {
        match &self.path {
            Some(path) => path.clone(),
            None => Arc::from(ANONYMOUS_LABEL),
        }
    }
}

fn next_field(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }

    Some(match text.find(char::is_whitespace) {
        Some(index) => text.split_at(index),
        None => (text, ""),
    })
}

/// Parses the contents of a memory map.
pub fn parse_maps(data: &[u8]) -> Result<Vec<MapEntry>, LinuxError> {
    let mut result = Vec::new();
    let mut line_start = 0;

    let ends = memchr::memchr_iter(b'\n', data).chain(std::iter::once(data.len()));
    for (index, line_end) in ends.enumerate() {
        let line = &data[line_start..line_end];
        line_start = line_end + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let malformed = |reason| LinuxError::MalformedMap {
            line: index + 1,
            reason,
        };

        let line = std::str::from_utf8(line).map_err(|_| malformed("line is not valid UTF-8"))?;
        result.push(MapEntry::parse(line).map_err(malformed)?);
    }

    Ok(result)
}

/// Reads and parses `<proc_root>/<pid>/maps`.
pub fn read_maps(proc_root: &Path, pid: Pid) -> Result<Vec<MapEntry>, LinuxError> {
    let data = std::fs::read(proc_root.join(pid.to_string()).join("maps"))?;
    parse_maps(&data)
}

/// Returns the mappings intersecting `range`, clipped to it.
pub fn clip<'a>(
    entries: &'a [MapEntry],
    range: AddressRange,
) -> impl Iterator<Item = (&'a MapEntry, AddressRange)> + 'a {
    entries
        .iter()
        .filter_map(move |entry| Some((entry, entry.range.intersect(&range)?)))
}

#[cfg(test)]
mod tests {
    use ptewatch_core::Va;

    use super::*;

    const SAMPLE: &[u8] = b"\
55d0c8a00000-55d0c8a02000 r--p 00000000 08:01 1049 /usr/bin/cat
55d0c9f3e000-55d0c9f5f000 rw-p 00000000 00:00 0                          [heap]
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
7f1e2d5e0000-7f1e2d5e2000 rw-s 00000000 00:05 4711                       /dev/shm/my file
7ffd6a0f1000-7ffd6a112000 rw-p 00000000 00:00 0                          [stack]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0                  [vsyscall]
";

    #[test]
    fn parses_sample() {
        let entries = parse_maps(SAMPLE).unwrap();
        assert_eq!(entries.len(), 6);

        assert_eq!(entries[0].range.start(), Va(0x55d0_c8a0_0000));
        assert_eq!(entries[0].permissions, MapPermissions::R);
        assert_eq!(entries[0].inode, 1049);
        assert_eq!(entries[0].path.as_deref(), Some("/usr/bin/cat"));

        assert!(entries[1].is_heap());
        assert!(entries[2].is_anonymous());
        assert_eq!(&*entries[2].label(), ANONYMOUS_LABEL);
        assert_eq!(entries[3].path.as_deref(), Some("/dev/shm/my file"));
        assert!(entries[3].permissions.contains(MapPermissions::SHARED));
        assert!(entries[4].is_stack());
        assert_eq!(entries[5].permissions.to_string(), "--xp");
    }

    #[test]
    fn reports_malformed_line() {
        let data = b"1000-2000 rw-p 00000000 00:00 0\nnot a map line\n";

        match parse_maps(data) {
            Err(LinuxError::MalformedMap { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_permissions() {
        assert!(MapEntry::parse("1000-2000 rwzp 00000000 00:00 0").is_err());
        assert!(MapEntry::parse("1000-2000 rw 00000000 00:00 0").is_err());
    }

    #[test]
    fn clips_to_range() {
        let entries = parse_maps(SAMPLE).unwrap();
        let scope = AddressRange::new(0x55d0_c8a0_1000, 0x55d0_c9f4_0000).unwrap();

        let clipped = clip(&entries, scope)
            .map(|(_, range)| range)
            .collect::<Vec<_>>();

        assert_eq!(
            clipped,
            vec![
                AddressRange::new(0x55d0_c8a0_1000, 0x55d0_c8a0_2000).unwrap(),
                AddressRange::new(0x55d0_c9f3_e000, 0x55d0_c9f4_0000).unwrap(),
            ]
        );
    }
}
