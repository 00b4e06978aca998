use std::{path::PathBuf, str::FromStr, time::Duration};

use ptewatch_channel::{DEFAULT_CLEAR_PATH, DEFAULT_SCAN_PATH, DeviceEndpoint};
use ptewatch_core::{AccessError, DEFAULT_SCAN_CAPACITY};
use ptewatch_epoch::{
    DEFAULT_ADDRESS_LIST, DEFAULT_POLL_INTERVAL, FixedRanges, LoadPolicy, MapSelector,
    MappedRanges, RangeSource,
};
use ptewatch_os_linux::{IDLE_BITMAP_PATH, IdleFrameBackend, PROC_ROOT};

/// An error in the observer configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A variable holds a value that cannot be used.
    #[error("Invalid value {value:?} for {name}")]
    Invalid {
        /// Name of the variable.
        name: &'static str,

        /// The offending value.
        value: String,
    },
}

/// The backend serving clear and scan requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Per-process accessed flags, served through the control channel.
    #[default]
    Channel,

    /// The system-wide idle page bitmap.
    Idle,
}

impl FromStr for BackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" | "leaf" => Ok(Self::Channel),
            "idle" => Ok(Self::Idle),
            _ => Err(()),
        }
    }
}

/// How the ranges of every epoch are obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeMode {
    /// A fixed address list.
    Fixed {
        /// Path of the list.
        path: PathBuf,

        /// When the list is loaded.
        policy: LoadPolicy,
    },

    /// The memory map of the target, filtered by selectors.
    Mapped {
        /// Selected mappings.
        selectors: Vec<MapSelector>,
    },
}

impl Default for RangeMode {
    fn default() -> Self {
        Self::Fixed {
            path: PathBuf::from(DEFAULT_ADDRESS_LIST),
            policy: LoadPolicy::FirstHandshake,
        }
    }
}

/// Settings of an observation run.
///
/// Resolved once, from `PTEWATCH_*` environment variables:
///
/// | Variable                    | Default                              |
/// |-----------------------------|--------------------------------------|
/// | `PTEWATCH_BACKEND`          | `channel` (or `idle`)                |
/// | `PTEWATCH_CLEAR_PATH`       | `/proc/clear_accessed_bits`          |
/// | `PTEWATCH_SCAN_PATH`        | `/proc/read_accessed`                |
/// | `PTEWATCH_IDLE_BITMAP`      | `/sys/kernel/mm/page_idle/bitmap`    |
/// | `PTEWATCH_PROC_ROOT`        | `/proc`                              |
/// | `PTEWATCH_CAPACITY`         | `4096`                               |
/// | `PTEWATCH_POLL_INTERVAL_MS` | `10`                                 |
/// | `PTEWATCH_RANGES`           | `fixed` (or `mapped`)                |
/// | `PTEWATCH_ADDRESS_LIST`     | `/dev/shm/addrs`                     |
/// | `PTEWATCH_LOAD`             | `handshake` (or `startup`)           |
/// | `PTEWATCH_SELECTORS`        | `heap,stack`                         |
/// | `PTEWATCH_OUTPUT`           | standard output                      |
///
/// Empty variables count as unset.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// The backend.
    pub backend: BackendKind,

    /// Path of the clear endpoint.
    pub clear_path: PathBuf,

    /// Path of the scan endpoint.
    pub scan_path: PathBuf,

    /// Path of the idle page bitmap.
    pub bitmap_path: PathBuf,

    /// Root of the procfs hierarchy.
    pub proc_root: PathBuf,

    /// Maximum number of entries returned by one scan.
    pub capacity: usize,

    /// Interval between two checks for target termination.
    pub poll_interval: Duration,

    /// Source of the ranges.
    pub ranges: RangeMode,

    /// Path of the epoch log.
    pub output: Option<PathBuf>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            clear_path: PathBuf::from(DEFAULT_CLEAR_PATH),
            scan_path: PathBuf::from(DEFAULT_SCAN_PATH),
            bitmap_path: PathBuf::from(IDLE_BITMAP_PATH),
            proc_root: PathBuf::from(PROC_ROOT),
            capacity: DEFAULT_SCAN_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ranges: RangeMode::default(),
            output: None,
        }
    }
}

impl ObserverConfig {
    /// Resolves the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolves the configuration from a variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let mut config = Self::default();

        if let Some(backend) = vars.parse("PTEWATCH_BACKEND")? {
            config.backend = backend;
        }

        if let Some(path) = vars.get("PTEWATCH_CLEAR_PATH") {
            config.clear_path = path.into();
        }

        if let Some(path) = vars.get("PTEWATCH_SCAN_PATH") {
            config.scan_path = path.into();
        }

        if let Some(path) = vars.get("PTEWATCH_IDLE_BITMAP") {
            config.bitmap_path = path.into();
        }

        if let Some(path) = vars.get("PTEWATCH_PROC_ROOT") {
            config.proc_root = path.into();
        }

        if let Some(capacity) = vars.parse::<usize>("PTEWATCH_CAPACITY")? {
            if capacity == 0 {
                return Err(invalid("PTEWATCH_CAPACITY", "0"));
            }

            config.capacity = capacity;
        }

        if let Some(millis) = vars.parse("PTEWATCH_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(millis);
        }

        config.ranges = match vars.get("PTEWATCH_RANGES").as_deref() {
            None | Some("fixed") => {
                let path = vars
                    .get("PTEWATCH_ADDRESS_LIST")
                    .map_or_else(|| PathBuf::from(DEFAULT_ADDRESS_LIST), PathBuf::from);

                let policy = match vars.get("PTEWATCH_LOAD").as_deref() {
                    None | Some("handshake") => LoadPolicy::FirstHandshake,
                    Some("startup") => LoadPolicy::Startup,
                    Some(other) => return Err(invalid("PTEWATCH_LOAD", other)),
                };

                RangeMode::Fixed { path, policy }
            }
            Some("mapped") => {
                let selectors = vars
                    .get("PTEWATCH_SELECTORS")
                    .unwrap_or_else(|| String::from("heap,stack"))
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(MapSelector::parse)
                    .collect::<Vec<_>>();

                if selectors.is_empty() {
                    return Err(invalid("PTEWATCH_SELECTORS", ","));
                }

                RangeMode::Mapped { selectors }
            }
            Some(other) => return Err(invalid("PTEWATCH_RANGES", other)),
        };

        config.output = vars.get("PTEWATCH_OUTPUT").map(PathBuf::from);

        tracing::debug!(?config, "configuration resolved");
        Ok(config)
    }

    /// Returns the control channel endpoint.
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new(&self.clear_path, &self.scan_path)
    }

    /// Opens the idle page backend.
    pub fn idle_backend(&self) -> Result<IdleFrameBackend, AccessError> {
        IdleFrameBackend::with_paths(&self.bitmap_path, &self.proc_root)
            .map(|backend| backend.with_capacity(self.capacity))
    }

    /// Returns the range source.
    ///
    /// `lengths` pairs with the entries of a fixed list and is ignored for
    /// mapped ranges.
    pub fn range_source(&self, lengths: Vec<u64>) -> RangeSource {
        match &self.ranges {
            RangeMode::Fixed { path, policy } => {
                RangeSource::fixed(FixedRanges::new(path, lengths), *policy)
            }
            RangeMode::Mapped { selectors } => {
                RangeSource::mapped(MappedRanges::new(&self.proc_root, selectors.clone()))
            }
        }
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
    {
        match self.get(name) {
            Some(value) => match value.trim().parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => Err(invalid(name, &value)),
            },
            None => Ok(None),
        }
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_owned(),
    }
}
