use std::path::PathBuf;

use ptewatch_core::AccessError;

/// An error that can occur when resolving the ranges of an epoch.
#[derive(thiserror::Error, Debug)]
pub enum RangeError {
    /// The address list could not be read.
    #[error("Address list {} unreadable: {source}", .path.display())]
    Unreadable {
        /// Path of the list.
        path: PathBuf,

        /// The underlying error.
        source: std::io::Error,
    },

    /// A line of the address list is not an unsigned decimal number.
    #[error("Malformed address at line {line}: {text:?}")]
    Malformed {
        /// One-based line number.
        line: usize,

        /// The offending text.
        text: String,
    },

    /// The address list does not have one entry per known length.
    #[error("Expected {expected} addresses, found {found}")]
    Count {
        /// Number of known lengths.
        expected: usize,

        /// Number of addresses read.
        found: usize,
    },
}

/// An error that ends an observation run.
#[derive(thiserror::Error, Debug)]
pub enum CoordinatorError {
    /// The ranges could not be resolved.
    #[error(transparent)]
    Ranges(#[from] RangeError),

    /// A backend operation failed fatally.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// The epoch log could not be written.
    #[error("Failed to write epoch log: {0}")]
    Log(#[source] std::io::Error),

    /// The target could not be notified.
    #[error("Failed to acknowledge target: {0}")]
    Acknowledge(#[source] std::io::Error),

    /// Signal handling could not be set up.
    #[error("Failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}
