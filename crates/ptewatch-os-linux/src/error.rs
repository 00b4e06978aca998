use ptewatch_core::AccessError;

/// Error types for Linux procfs operations.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// A line of a memory map could not be parsed.
    #[error("Malformed memory map at line {line}: {reason}")]
    MalformedMap {
        /// One-based line number.
        line: usize,

        /// What was wrong with the line.
        reason: &'static str,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<LinuxError> for AccessError {
    fn from(value: LinuxError) -> Self {
        match value {
            LinuxError::MalformedMap { reason, .. } => AccessError::InvalidArgument(reason),
            LinuxError::Io(err) => AccessError::Io(err),
        }
    }
}
