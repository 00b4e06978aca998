use std::path::PathBuf;

use ptewatch_core::AccessError;

/// An error that can occur on the control channel itself.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// A request of the wrong size was written.
    #[error("Request size {0} does not match the wire format")]
    RequestSize(usize),

    /// A response was not a whole number of addresses.
    #[error("Response size {0} is not a multiple of 8")]
    ResponseSize(usize),

    /// An endpoint could not be opened.
    #[error("Control endpoint {} unavailable: {source}", .path.display())]
    Unavailable {
        /// Path of the endpoint.
        path: PathBuf,

        /// The underlying error.
        source: std::io::Error,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for AccessError {
    fn from(value: ChannelError) -> Self {
        match value {
            ChannelError::RequestSize(_) => AccessError::InvalidArgument("malformed request"),
            ChannelError::ResponseSize(size) => AccessError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("response size {size} is not a multiple of 8"),
            )),
            ChannelError::Unavailable { path, source } => AccessError::unavailable(path, source),
            ChannelError::Io(err) => AccessError::Io(err),
        }
    }
}
