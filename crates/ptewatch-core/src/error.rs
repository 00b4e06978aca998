use std::path::PathBuf;

use crate::{Pa, Pid};

/// An error that can occur when clearing or scanning access indicators.
#[derive(thiserror::Error, Debug)]
pub enum AccessError {
    /// No process with the given identifier exists.
    #[error("No such process: {0}")]
    NotFound(Pid),

    /// The process has no usable address space (e.g., it is exiting).
    #[error("Process {0} has no usable address space")]
    InvalidState(Pid),

    /// The request was malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Translation memory could not be accessed.
    #[error("Memory fault at {0}")]
    Fault(Pa),

    /// A required resource could not be opened.
    #[error("Resource {} unavailable: {source}", .path.display())]
    Unavailable {
        /// Path of the resource.
        path: PathBuf,

        /// The underlying error.
        source: std::io::Error,
    },

    /// A buffer could not be allocated.
    #[error("Unable to allocate {0} bytes")]
    OutOfMemory(usize),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AccessError {
    /// Creates a new unavailable resource error.
    pub fn unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Unavailable {
            path: path.into(),
            source,
        }
    }

    /// Checks if the error must abort the run rather than skip one range.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::OutOfMemory(_))
    }
}
